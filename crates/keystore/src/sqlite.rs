//! SQLite-KeyStore mit WAL-Modus

use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::info;
use tresor_core::config::SpeicherEinstellungen;
use tresor_core::UserId;

use crate::error::KeyStoreResult;
use crate::record::{Mutation, RecordKey, RecordKind};
use crate::store::KeyStore;

/// KeyStore auf Basis eines SQLite-Pools
#[derive(Debug, Clone)]
pub struct SqliteKeyStore {
    pool: SqlitePool,
}

fn jetzt() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

impl SqliteKeyStore {
    /// Oeffnet (oder erstellt) die Datenbank und fuehrt Migrationen aus
    pub async fn oeffnen(config: &SpeicherEinstellungen) -> KeyStoreResult<Self> {
        let opts = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .journal_mode(if config.wal {
                SqliteJournalMode::Wal
            } else {
                SqliteJournalMode::Delete
            });

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        info!(url = %config.url, wal = config.wal, "KeyStore geoeffnet");

        let store = Self { pool };
        store.migrationen_ausfuehren().await?;
        Ok(store)
    }

    /// Erstellt eine In-Memory-Datenbank fuer Tests
    pub async fn in_memory() -> KeyStoreResult<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            // In-Memory benoetigt mindestens 1 persistente Verbindung
            .min_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrationen_ausfuehren().await?;
        Ok(store)
    }

    /// Fuehrt alle ausstehenden Migrationen aus
    pub async fn migrationen_ausfuehren(&self) -> KeyStoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("KeyStore-Migrationen abgeschlossen");
        Ok(())
    }
}

const PUT_SQL: &str = "INSERT INTO key_records (account_id, kind, record_id, value, updated_at)
     VALUES (?, ?, ?, ?, ?)
     ON CONFLICT (account_id, kind, record_id)
     DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at";

const DELETE_SQL: &str =
    "DELETE FROM key_records WHERE account_id = ? AND kind = ? AND record_id = ?";

#[async_trait]
impl KeyStore for SqliteKeyStore {
    async fn get(&self, key: &RecordKey) -> KeyStoreResult<Option<Vec<u8>>> {
        let row = sqlx::query(
            "SELECT value FROM key_records WHERE account_id = ? AND kind = ? AND record_id = ?",
        )
        .bind(key.account.als_schluessel())
        .bind(key.kind.als_str())
        .bind(&key.id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.try_get::<Vec<u8>, _>("value")).transpose()?)
    }

    async fn put(&self, key: &RecordKey, value: Vec<u8>) -> KeyStoreResult<()> {
        sqlx::query(PUT_SQL)
            .bind(key.account.als_schluessel())
            .bind(key.kind.als_str())
            .bind(&key.id)
            .bind(value)
            .bind(jetzt())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &RecordKey) -> KeyStoreResult<bool> {
        let affected = sqlx::query(DELETE_SQL)
            .bind(key.account.als_schluessel())
            .bind(key.kind.als_str())
            .bind(&key.id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    async fn list(
        &self,
        account: UserId,
        kind: RecordKind,
    ) -> KeyStoreResult<Vec<(String, Vec<u8>)>> {
        let rows = sqlx::query(
            "SELECT record_id, value FROM key_records
             WHERE account_id = ? AND kind = ?
             ORDER BY record_id",
        )
        .bind(account.als_schluessel())
        .bind(kind.als_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| -> KeyStoreResult<(String, Vec<u8>)> {
                Ok((r.try_get("record_id")?, r.try_get("value")?))
            })
            .collect()
    }

    async fn apply(&self, batch: Vec<Mutation>) -> KeyStoreResult<()> {
        let anzahl = batch.len();
        let mut tx = self.pool.begin().await?;
        let zeitpunkt = jetzt();

        for mutation in batch {
            match mutation {
                Mutation::Put { key, value } => {
                    sqlx::query(PUT_SQL)
                        .bind(key.account.als_schluessel())
                        .bind(key.kind.als_str())
                        .bind(&key.id)
                        .bind(value)
                        .bind(&zeitpunkt)
                        .execute(&mut *tx)
                        .await?;
                }
                Mutation::Delete { key } => {
                    sqlx::query(DELETE_SQL)
                        .bind(key.account.als_schluessel())
                        .bind(key.kind.als_str())
                        .bind(&key.id)
                        .execute(&mut *tx)
                        .await?;
                }
                Mutation::DeleteKind { account, kind } => {
                    sqlx::query("DELETE FROM key_records WHERE account_id = ? AND kind = ?")
                        .bind(account.als_schluessel())
                        .bind(kind.als_str())
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        // Ohne commit rollt der Drop der Transaktion alles zurueck
        tx.commit().await?;
        tracing::debug!(mutationen = anzahl, "KeyStore-Batch geschrieben");
        Ok(())
    }
}
