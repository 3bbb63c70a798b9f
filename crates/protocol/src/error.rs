//! Fehlertypen fuer die Wire-Formate

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Ungueltiges JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protokoll-Version {erhalten} nicht unterstuetzt (erwartet {unterstuetzt})")]
    Version { erhalten: u32, unterstuetzt: u32 },

    #[error("Ungueltiges Feld '{feld}': {grund}")]
    UngueltigesFeld { feld: &'static str, grund: String },
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
