//! Fehlertypen der Sitzungsschicht

use thiserror::Error;
use tresor_core::{MessageId, UserId};
use tresor_crypto::CryptoError;
use tresor_keystore::KeyStoreError;
use tresor_protocol::ProtocolError;

use crate::transport::TransportError;

/// Fehler der Sitzungsschicht
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Ungueltiges Key-Bundle von {peer}: {grund}")]
    InvalidKeyBundle { peer: UserId, grund: String },

    #[error("Kein Schluesselmaterial: {0}")]
    SessionNotFound(String),

    #[error("Nachricht nicht entschluesselbar: {0}")]
    UndecryptableMessage(String),

    #[error("Falsche Passphrase")]
    WrongPassphrase,

    #[error("One-Time-Pre-Key {0} verbraucht oder unbekannt")]
    StaleOneTimePreKey(u32),

    #[error("Speicherfehler: {0}")]
    StorageFailure(#[from] KeyStoreError),

    #[error("Nachricht wurde bereits verarbeitet")]
    Duplicate,

    #[error("Kein lokales Schluesselmaterial, aber ein Backup vorhanden")]
    RestoreRequired,

    #[error("Konto ist nicht initialisiert (bootstrap fehlt)")]
    NotBootstrapped,

    #[error("Transportfehler: {0}")]
    Transport(#[from] TransportError),

    #[error("Bestaetigung {0} ohne offene Sendung")]
    UnexpectedAcknowledgement(MessageId),

    #[error("Vorgang abgebrochen")]
    Cancelled,

    #[error("Backup-Version {0} nicht unterstuetzt")]
    UnsupportedBackupVersion(u32),

    #[error("Backup beschaedigt: {0}")]
    CorruptBackup(String),

    #[error("Kein Backup beim Server hinterlegt")]
    BackupNotFound,

    #[error("Protokollfehler: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Kryptofehler: {0}")]
    Crypto(CryptoError),
}

impl From<CryptoError> for SessionError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::FalschePassphrase => Self::WrongPassphrase,
            CryptoError::BackupBeschaedigt(grund) => Self::CorruptBackup(grund),
            CryptoError::BackupVersion { erhalten, .. } => Self::UnsupportedBackupVersion(erhalten),
            CryptoError::Abgebrochen => Self::Cancelled,
            CryptoError::Duplikat { .. } => Self::Duplicate,
            CryptoError::PreKeyFehlt(id) => Self::StaleOneTimePreKey(id),
            CryptoError::FalscheSitzung | CryptoError::FalscheGeneration { .. } => {
                Self::SessionNotFound(e.to_string())
            }
            CryptoError::Entschluesselung(_)
            | CryptoError::SignaturVerifikation(_)
            | CryptoError::ZuVieleUebersprungen { .. }
            | CryptoError::UngueltigeDaten(_)
            | CryptoError::Serialisierung(_) => Self::UndecryptableMessage(e.to_string()),
            other => Self::Crypto(other),
        }
    }
}

impl SessionError {
    /// Ob ein erneuter Versuch (spaeter oder nach neuem Schluesselmaterial)
    /// sinnvoll ist. Alle anderen Fehler sind fuer den Benutzer bestimmt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SessionNotFound(_) | Self::StaleOneTimePreKey(_) | Self::StorageFailure(_) => {
                true
            }
            Self::Transport(e) => e.ist_voruebergehend(),
            _ => false,
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
