//! Fehlertypen fuer das Kryptografie-Subsystem

use thiserror::Error;

/// Fehler im Kryptografie-Subsystem
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Schluessel-Generierung fehlgeschlagen: {0}")]
    SchluesselGenerierung(String),

    #[error("Key-Exchange fehlgeschlagen: {0}")]
    KeyExchange(String),

    #[error("Verschluesselung fehlgeschlagen: {0}")]
    Verschluesselung(String),

    #[error("Entschluesselung fehlgeschlagen: {0}")]
    Entschluesselung(String),

    #[error("Signatur-Verifikation fehlgeschlagen: {0}")]
    SignaturVerifikation(String),

    #[error("Ungueltige Schluessel-Laenge: erwartet {erwartet}, erhalten {erhalten}")]
    UngueltigeSchluesselLaenge { erwartet: usize, erhalten: usize },

    #[error("Ungueltige Daten: {0}")]
    UngueltigeDaten(String),

    #[error("Key Derivation fehlgeschlagen: {0}")]
    KeyDerivation(String),

    #[error("Nachricht gehoert zu einer anderen Sitzung")]
    FalscheSitzung,

    #[error("Nachricht {zaehler} wurde bereits entschluesselt")]
    Duplikat { zaehler: u64 },

    #[error("Zu viele uebersprungene Nachrichten: {luecke} (Maximum {maximum})")]
    ZuVieleUebersprungen { luecke: u64, maximum: u64 },

    #[error("Sender-Key-Generation passt nicht: erwartet {erwartet}, erhalten {erhalten}")]
    FalscheGeneration { erwartet: u32, erhalten: u32 },

    #[error("Pre-Key {0} ist nicht (mehr) vorhanden")]
    PreKeyFehlt(u32),

    #[error("Falsche Passphrase oder manipuliertes Backup")]
    FalschePassphrase,

    #[error("Backup beschaedigt: {0}")]
    BackupBeschaedigt(String),

    #[error("Backup-Version {erhalten} nicht unterstuetzt (hoechste bekannte: {unterstuetzt})")]
    BackupVersion { erhalten: u32, unterstuetzt: u32 },

    #[error("Vorgang abgebrochen")]
    Abgebrochen,

    #[error("Serialisierung fehlgeschlagen: {0}")]
    Serialisierung(#[from] serde_json::Error),

    #[error("Base64-Dekodierung fehlgeschlagen: {0}")]
    Base64(#[from] base64::DecodeError),
}

pub type CryptoResult<T> = Result<T, CryptoError>;
