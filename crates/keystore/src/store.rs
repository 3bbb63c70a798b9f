//! KeyStore-Trait
//!
//! Wird als `Arc<dyn KeyStore>` zwischen den Bausteinen geteilt, daher
//! `async_trait` statt nativer async-Funktionen im Trait.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tresor_core::UserId;

use crate::error::KeyStoreResult;
use crate::record::{Mutation, RecordKey, RecordKind};

/// Dauerhafte Ablage fuer Schluesselmaterial
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Liest einen Datensatz
    async fn get(&self, key: &RecordKey) -> KeyStoreResult<Option<Vec<u8>>>;

    /// Schreibt (oder ersetzt) einen Datensatz
    async fn put(&self, key: &RecordKey, value: Vec<u8>) -> KeyStoreResult<()>;

    /// Loescht einen Datensatz. Gibt `true` zurueck wenn er existierte.
    async fn delete(&self, key: &RecordKey) -> KeyStoreResult<bool>;

    /// Alle Datensaetze einer Art, sortiert nach ID
    async fn list(&self, account: UserId, kind: RecordKind)
        -> KeyStoreResult<Vec<(String, Vec<u8>)>>;

    /// Fuehrt alle Mutationen atomar aus (alles oder nichts)
    async fn apply(&self, batch: Vec<Mutation>) -> KeyStoreResult<()>;
}

/// JSON-Komfortfunktionen fuer jeden KeyStore
#[async_trait]
pub trait KeyStoreExt: KeyStore {
    async fn get_json<T: DeserializeOwned + Send>(
        &self,
        key: &RecordKey,
    ) -> KeyStoreResult<Option<T>> {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put_json<T: Serialize + Sync>(&self, key: &RecordKey, value: &T) -> KeyStoreResult<()> {
        self.put(key, serde_json::to_vec(value)?).await
    }

    async fn list_json<T: DeserializeOwned + Send>(
        &self,
        account: UserId,
        kind: RecordKind,
    ) -> KeyStoreResult<Vec<(String, T)>> {
        self.list(account, kind)
            .await?
            .into_iter()
            .map(|(id, bytes)| -> KeyStoreResult<(String, T)> {
                Ok((id, serde_json::from_slice(&bytes)?))
            })
            .collect()
    }
}

impl<S: KeyStore + ?Sized> KeyStoreExt for S {}
