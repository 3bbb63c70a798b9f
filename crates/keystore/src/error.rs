//! Fehlertypen fuer den KeyStore

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("SQLx-Fehler: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration-Fehler: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("JSON-Fehler: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Ungueltige Daten: {0}")]
    UngueltigeDaten(String),

    #[error("Interner KeyStore-Fehler: {0}")]
    Intern(String),
}

impl KeyStoreError {
    pub fn intern(msg: impl Into<String>) -> Self {
        Self::Intern(msg.into())
    }
}

pub type KeyStoreResult<T> = Result<T, KeyStoreError>;
