//! Wire-Format des verschluesselten Schluessel-Backups
//!
//! ```json
//! { "version": 1, "salt": "…", "nonce": "…", "ciphertext": "…",
//!   "kdf": { "m_cost": 19456, "t_cost": 2, "p_cost": 1 } }
//! ```
//!
//! `kdf` ist optional. Fehlt das Feld, gelten die Standardparameter des
//! importierenden Clients.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolResult;

/// Hoechste bekannte Backup-Version
pub const BACKUP_VERSION: u32 = 1;

/// Argon2id-Parameter, mit denen ein Backup erstellt wurde
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParameter {
    pub m_cost: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

/// Verschluesseltes Backup, wie es beim Server hinterlegt wird
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBackupBlob {
    pub version: u32,
    #[serde(with = "crate::base64_serde")]
    pub salt: Vec<u8>,
    #[serde(with = "crate::base64_serde")]
    pub nonce: Vec<u8>,
    #[serde(with = "crate::base64_serde")]
    pub ciphertext: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kdf: Option<KdfParameter>,
}

impl KeyBackupBlob {
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parst das JSON. Die Version wird erst beim Import geprueft.
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimales_blob_ohne_kdf() {
        let json = r#"{"version":1,"salt":"AAAA","nonce":"AQID","ciphertext":"BAUG"}"#;
        let blob = KeyBackupBlob::from_json(json).unwrap();
        assert_eq!(blob.version, 1);
        assert_eq!(blob.nonce, vec![1, 2, 3]);
        assert!(blob.kdf.is_none());
        assert_eq!(blob.to_json().unwrap(), json);
    }

    #[test]
    fn kaputtes_base64_ist_fehler() {
        let json = r#"{"version":1,"salt":"!!","nonce":"AQID","ciphertext":"BAUG"}"#;
        assert!(KeyBackupBlob::from_json(json).is_err());
    }

    #[test]
    fn fehlendes_feld_ist_fehler() {
        assert!(KeyBackupBlob::from_json(r#"{"version":1,"salt":"AAAA"}"#).is_err());
    }
}
