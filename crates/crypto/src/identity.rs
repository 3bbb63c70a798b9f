//! Langzeit-Identitaetsschluessel (Ed25519 + X25519)
//!
//! Jedes Konto erhaelt auf einem Geraet genau ein Identitaets-Paar:
//! - Ed25519 zum Signieren des Signed-Pre-Keys und der Sender-Key-Nachrichten
//! - X25519 fuer die Diffie-Hellman-Schritte im X3DH-Handshake
//!
//! Beide Haelften werden unabhaengig erzeugt (keine Ed25519->X25519-Konvertierung).
//! Die oeffentlichen Schluessel liegen beim Server, die privaten verbleiben
//! beim Client und im verschluesselten Backup.

use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, CryptoResult};

/// Langzeit-Identitaet eines Kontos auf diesem Geraet
pub struct IdentityKeyPair {
    signing_key: SigningKey,
    agreement_key: StaticSecret,
    created_at: DateTime<Utc>,
}

/// Oeffentliche Identitaet (wird veroeffentlicht und in Bundles mitgeliefert)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityPublicKey {
    /// Ed25519 Verifying Key
    pub signing: [u8; 32],
    /// X25519 Public Key
    pub agreement: [u8; 32],
}

impl IdentityPublicKey {
    /// Kurzer, loggbarer Fingerprint (erste 9 Bytes von SHA-256, URL-sicheres Base64)
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.signing);
        hasher.update(self.agreement);
        let digest = hasher.finalize();
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&digest[..9])
    }

    /// X25519-Haelfte fuer DH
    pub fn agreement_key(&self) -> X25519PublicKey {
        X25519PublicKey::from(self.agreement)
    }

    /// Verifiziert eine Ed25519-Signatur dieser Identitaet
    pub fn verify(&self, data: &[u8], signature_bytes: &[u8]) -> bool {
        IdentityKeyPair::verify(data, signature_bytes, &self.signing)
    }
}

/// Persistierbare Form der Identitaet (private Haelften, wird beim Drop genullt)
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct IdentityRecord {
    signing: [u8; 32],
    agreement: [u8; 32],
    #[zeroize(skip)]
    created_at: DateTime<Utc>,
}

impl std::fmt::Debug for IdentityRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IdentityRecord {{ [REDACTED], created_at: {} }}", self.created_at)
    }
}

impl IdentityKeyPair {
    /// Generiert ein neues Identitaets-Paar
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
            agreement_key: StaticSecret::random_from_rng(OsRng),
            created_at: Utc::now(),
        }
    }

    /// Stellt eine Identitaet aus ihrer persistierten Form wieder her
    pub fn from_record(record: &IdentityRecord) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&record.signing),
            agreement_key: StaticSecret::from(record.agreement),
            created_at: record.created_at,
        }
    }

    /// Persistierbare Form (enthaelt private Schluessel)
    pub fn to_record(&self) -> IdentityRecord {
        IdentityRecord {
            signing: self.signing_key.to_bytes(),
            agreement: self.agreement_key.to_bytes(),
            created_at: self.created_at,
        }
    }

    /// Gibt die oeffentliche Identitaet zurueck
    pub fn public_key(&self) -> IdentityPublicKey {
        IdentityPublicKey {
            signing: self.signing_key.verifying_key().to_bytes(),
            agreement: X25519PublicKey::from(&self.agreement_key).to_bytes(),
        }
    }

    /// Erstellungszeitpunkt
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// X25519-Geheimnis fuer DH-Schritte
    pub(crate) fn agreement_secret(&self) -> &StaticSecret {
        &self.agreement_key
    }

    /// Signiert Daten mit dem privaten Schluessel
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.signing_key.sign(data).to_bytes().to_vec()
    }

    /// Verifiziert eine Signatur mit einem oeffentlichen Schluessel
    pub fn verify(data: &[u8], signature_bytes: &[u8], public_key_bytes: &[u8; 32]) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(public_key_bytes) else {
            return false;
        };
        let Ok(sig_array) = signature_bytes.try_into() else {
            return false;
        };
        let signature = Signature::from_bytes(sig_array);
        verifying_key.verify(data, &signature).is_ok()
    }

    /// Wie `verify`, aber als Result fuer den `?`-Operator
    pub fn verify_strict(
        data: &[u8],
        signature_bytes: &[u8],
        public_key_bytes: &[u8; 32],
    ) -> CryptoResult<()> {
        if Self::verify(data, signature_bytes, public_key_bytes) {
            Ok(())
        } else {
            Err(CryptoError::SignaturVerifikation(
                "Signatur passt nicht zum Identitaetsschluessel".to_string(),
            ))
        }
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "IdentityKeyPair {{ fingerprint: {} }}",
            self.public_key().fingerprint()
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
