//! Passphrasen-geschuetztes Backup von Identitaet und Signed-Pre-Key
//!
//! Schluessel = Argon2id(passphrase, salt(16)), Chiffre = AES-256-GCM mit
//! frischer Nonce(12). Die AAD bindet das Backup an seine Version, sodass
//! ein Herabstufen der Version die Authentifizierung bricht.
//!
//! Fehlerbilder beim Import:
//! - Auth-Tag passt nicht: `FalschePassphrase`
//! - Felder falsch lang oder Inhalt nicht lesbar: `BackupBeschaedigt`
//! - Unbekannte Version: `BackupVersion`

use argon2::{Algorithm, Argon2, Params, Version};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tresor_core::UserId;
use tresor_protocol::{KdfParameter, KeyBackupBlob, BACKUP_VERSION};
use zeroize::Zeroize;

use crate::aead;
use crate::error::{CryptoError, CryptoResult};
use crate::identity::IdentityRecord;
use crate::prekeys::SignedPreKey;
use crate::types::{NONCE_LAENGE, SCHLUESSEL_LAENGE};

/// Laenge des Argon2-Salts
pub const SALT_LAENGE: usize = 16;

/// Hoechstens um diesen Faktor duerfen die KDF-Kosten eines Blobs ueber
/// den eigenen liegen
pub const MAX_KOSTENFAKTOR: u32 = 4;

/// Inhalt eines Backups (Klartext, nur im Speicher)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedKeyMaterial {
    pub account: UserId,
    pub identity: IdentityRecord,
    pub signed_pre_key: SignedPreKey,
    pub exported_at: DateTime<Utc>,
}

/// Ver- und Entschluesselung von Backups
#[derive(Debug, Clone)]
pub struct KeyBackupCodec {
    kdf: KdfParameter,
}

fn aad_fuer(version: u32) -> Vec<u8> {
    let mut aad = b"tresor-backup-v".to_vec();
    aad.extend_from_slice(&version.to_be_bytes());
    aad
}

fn schluessel_ableiten(
    passphrase: &str,
    salt: &[u8],
    kdf: &KdfParameter,
) -> CryptoResult<[u8; SCHLUESSEL_LAENGE]> {
    let params = Params::new(kdf.m_cost, kdf.t_cost, kdf.p_cost, Some(SCHLUESSEL_LAENGE))
        .map_err(|e| CryptoError::KeyDerivation(format!("Argon2-Parameter ungueltig: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; SCHLUESSEL_LAENGE];
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

impl KeyBackupCodec {
    /// Erstellt einen Codec mit den Argon2id-Kosten fuer neue Backups
    pub fn new(m_cost: u32, t_cost: u32, p_cost: u32) -> CryptoResult<Self> {
        Params::new(m_cost, t_cost, p_cost, Some(SCHLUESSEL_LAENGE))
            .map_err(|e| CryptoError::KeyDerivation(format!("Argon2-Parameter ungueltig: {e}")))?;
        Ok(Self {
            kdf: KdfParameter {
                m_cost,
                t_cost,
                p_cost,
            },
        })
    }

    pub fn parameter(&self) -> KdfParameter {
        self.kdf
    }

    /// Obergrenze fuer KDF-Parameter aus einem (vom Server gelieferten) Blob
    pub fn obergrenze(&self) -> KdfParameter {
        KdfParameter {
            m_cost: self.kdf.m_cost.saturating_mul(MAX_KOSTENFAKTOR),
            t_cost: self.kdf.t_cost.saturating_mul(MAX_KOSTENFAKTOR),
            p_cost: self.kdf.p_cost.saturating_mul(MAX_KOSTENFAKTOR),
        }
    }

    fn kdf_fuer(&self, blob: &KeyBackupBlob) -> CryptoResult<KdfParameter> {
        let Some(kdf) = blob.kdf else {
            return Ok(self.kdf);
        };
        let grenze = self.obergrenze();
        if kdf.m_cost > grenze.m_cost || kdf.t_cost > grenze.t_cost || kdf.p_cost > grenze.p_cost {
            return Err(CryptoError::BackupBeschaedigt(format!(
                "KDF-Kosten m={} t={} p={} ueberschreiten die Grenze m={} t={} p={}",
                kdf.m_cost, kdf.t_cost, kdf.p_cost, grenze.m_cost, grenze.t_cost, grenze.p_cost
            )));
        }
        Ok(kdf)
    }

    /// Verschluesselt das Schluesselmaterial unter der Passphrase
    pub fn export(
        &self,
        material: &ExportedKeyMaterial,
        passphrase: &str,
    ) -> CryptoResult<KeyBackupBlob> {
        if passphrase.is_empty() {
            return Err(CryptoError::UngueltigeDaten("leere Passphrase".into()));
        }

        let mut salt = vec![0u8; SALT_LAENGE];
        let mut nonce = [0u8; NONCE_LAENGE];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce);

        let mut key = schluessel_ableiten(passphrase, &salt, &self.kdf)?;
        let mut plaintext = serde_json::to_vec(material)?;
        let ciphertext = aead::seal(&key, &nonce, &plaintext, &aad_fuer(BACKUP_VERSION));
        key.zeroize();
        plaintext.zeroize();

        tracing::debug!(
            account = %material.account,
            m_cost = self.kdf.m_cost,
            "Schluessel-Backup erstellt"
        );

        Ok(KeyBackupBlob {
            version: BACKUP_VERSION,
            salt,
            nonce: nonce.to_vec(),
            ciphertext: ciphertext?,
            kdf: Some(self.kdf),
        })
    }

    /// Entschluesselt ein Backup.
    ///
    /// Verwendet die im Blob hinterlegten KDF-Parameter, sonst die eigenen.
    /// Liegen die hinterlegten ueber `obergrenze()`, wird der Blob als
    /// beschaedigt abgelehnt, bevor Argon2 laeuft.
    pub fn import(&self, blob: &KeyBackupBlob, passphrase: &str) -> CryptoResult<ExportedKeyMaterial> {
        if blob.version == 0 || blob.version > BACKUP_VERSION {
            return Err(CryptoError::BackupVersion {
                erhalten: blob.version,
                unterstuetzt: BACKUP_VERSION,
            });
        }
        if blob.salt.len() != SALT_LAENGE {
            return Err(CryptoError::BackupBeschaedigt(format!(
                "Salt hat {} Bytes statt {SALT_LAENGE}",
                blob.salt.len()
            )));
        }
        let nonce: [u8; NONCE_LAENGE] = blob.nonce.as_slice().try_into().map_err(|_| {
            CryptoError::BackupBeschaedigt(format!(
                "Nonce hat {} Bytes statt {NONCE_LAENGE}",
                blob.nonce.len()
            ))
        })?;
        if blob.ciphertext.len() < aead::TAG_LAENGE {
            return Err(CryptoError::BackupBeschaedigt("Ciphertext zu kurz".into()));
        }

        let kdf = self.kdf_fuer(blob)?;
        let mut key = schluessel_ableiten(passphrase, &blob.salt, &kdf)?;
        let plaintext = aead::open(&key, &nonce, &blob.ciphertext, &aad_fuer(blob.version));
        key.zeroize();

        let mut plaintext = plaintext.map_err(|_| CryptoError::FalschePassphrase)?;
        let material = serde_json::from_slice::<ExportedKeyMaterial>(&plaintext)
            .map_err(|e| CryptoError::BackupBeschaedigt(e.to_string()));
        plaintext.zeroize();
        material
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
