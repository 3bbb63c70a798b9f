//! Signierte und One-Time-Pre-Keys sowie oeffentliche Key-Bundles
//!
//! Der Signed-Pre-Key lebt so lange wie die Identitaet. One-Time-Pre-Keys
//! werden bei jedem Bootstrap neu erzeugt und beim ersten Handshake
//! verbraucht.

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tresor_core::UserId;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, CryptoResult};
use crate::identity::{IdentityKeyPair, IdentityPublicKey};

/// Kennung eines Pre-Keys (monoton steigend pro Konto)
pub type PreKeyId = u32;

/// Mittelfristiger Pre-Key mit Signatur der Identitaet
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SignedPreKey {
    #[zeroize(skip)]
    id: PreKeyId,
    secret: [u8; 32],
    #[zeroize(skip)]
    public: [u8; 32],
    #[zeroize(skip)]
    signature: Vec<u8>,
    #[zeroize(skip)]
    created_at: DateTime<Utc>,
}

/// Oeffentliche Haelfte eines Signed-Pre-Keys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKeyPublic {
    pub id: PreKeyId,
    pub public: [u8; 32],
    pub signature: Vec<u8>,
}

impl SignedPreKey {
    /// Erzeugt einen neuen Signed-Pre-Key und signiert ihn mit der Identitaet
    pub fn generate(id: PreKeyId, identity: &IdentityKeyPair) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret).to_bytes();
        let signature = identity.sign(&public);
        Self {
            id,
            secret: secret.to_bytes(),
            public,
            signature,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> PreKeyId {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn secret(&self) -> StaticSecret {
        StaticSecret::from(self.secret)
    }

    /// Oeffentliche Haelfte zum Veroeffentlichen
    pub fn public_info(&self) -> SignedPreKeyPublic {
        SignedPreKeyPublic {
            id: self.id,
            public: self.public,
            signature: self.signature.clone(),
        }
    }

    /// Prueft, ob der Pre-Key von dieser Identitaet signiert wurde
    pub fn signed_by(&self, identity: &IdentityPublicKey) -> bool {
        identity.verify(&self.public, &self.signature)
    }
}

impl PartialEq for SignedPreKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && crate::types::konstante_zeit_gleich(&self.secret, &other.secret)
            && self.public == other.public
            && self.signature == other.signature
            && self.created_at == other.created_at
    }
}

impl std::fmt::Debug for SignedPreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedPreKey")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Einmal-Pre-Key (wird nach dem ersten Handshake geloescht)
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct OneTimePreKey {
    #[zeroize(skip)]
    id: PreKeyId,
    secret: [u8; 32],
    #[zeroize(skip)]
    public: [u8; 32],
}

/// Oeffentliche Haelfte eines One-Time-Pre-Keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKeyPublic {
    pub id: PreKeyId,
    pub public: [u8; 32],
}

impl OneTimePreKey {
    pub fn generate(id: PreKeyId) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret).to_bytes();
        Self {
            id,
            secret: secret.to_bytes(),
            public,
        }
    }

    /// Erzeugt `anzahl` Pre-Keys mit fortlaufenden IDs ab `start_id`
    pub fn generate_batch(start_id: PreKeyId, anzahl: usize) -> Vec<Self> {
        (0..anzahl)
            .map(|i| Self::generate(start_id.wrapping_add(i as PreKeyId)))
            .collect()
    }

    pub fn id(&self) -> PreKeyId {
        self.id
    }

    pub(crate) fn secret(&self) -> StaticSecret {
        StaticSecret::from(self.secret)
    }

    pub fn public_info(&self) -> OneTimePreKeyPublic {
        OneTimePreKeyPublic {
            id: self.id,
            public: self.public,
        }
    }
}

impl std::fmt::Debug for OneTimePreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OneTimePreKey")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Oeffentliches Key-Bundle eines Peers (vom Server abgerufen)
///
/// Enthaelt hoechstens einen One-Time-Pre-Key; der Server loescht ihn
/// beim Abruf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBundle {
    pub user_id: UserId,
    pub identity: IdentityPublicKey,
    pub signed_pre_key: SignedPreKeyPublic,
    pub one_time_pre_key: Option<OneTimePreKeyPublic>,
}

impl KeyBundle {
    /// Prueft die Signatur des Signed-Pre-Keys gegen die Identitaet
    pub fn verify(&self) -> CryptoResult<()> {
        IdentityKeyPair::verify_strict(
            &self.signed_pre_key.public,
            &self.signed_pre_key.signature,
            &self.identity.signing,
        )
        .map_err(|_| {
            CryptoError::SignaturVerifikation(format!(
                "Signed-Pre-Key {} von {} ungueltig signiert",
                self.signed_pre_key.id, self.user_id
            ))
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle_fuer(identity: &IdentityKeyPair, spk: &SignedPreKey) -> KeyBundle {
        KeyBundle {
            user_id: UserId::new(),
            identity: identity.public_key(),
            signed_pre_key: spk.public_info(),
            one_time_pre_key: None,
        }
    }

    #[test]
    fn signed_pre_key_ist_signiert() {
        let identity = IdentityKeyPair::generate();
        let spk = SignedPreKey::generate(1, &identity);
        assert!(spk.signed_by(&identity.public_key()));

        let fremd = IdentityKeyPair::generate();
        assert!(!spk.signed_by(&fremd.public_key()));
    }

    #[test]
    fn bundle_verifikation() {
        let identity = IdentityKeyPair::generate();
        let spk = SignedPreKey::generate(1, &identity);
        assert!(bundle_fuer(&identity, &spk).verify().is_ok());
    }

    #[test]
    fn manipuliertes_bundle_abgelehnt() {
        let identity = IdentityKeyPair::generate();
        let spk = SignedPreKey::generate(1, &identity);
        let mut bundle = bundle_fuer(&identity, &spk);
        bundle.signed_pre_key.public[0] ^= 0x01;
        assert!(matches!(
            bundle.verify(),
            Err(CryptoError::SignaturVerifikation(_))
        ));
    }

    #[test]
    fn batch_hat_fortlaufende_ids() {
        let batch = OneTimePreKey::generate_batch(10, 5);
        let ids: Vec<_> = batch.iter().map(|k| k.id()).collect();
        assert_eq!(ids, vec![10, 11, 12, 13, 14]);
        assert_ne!(batch[0].public_info().public, batch[1].public_info().public);
    }

    #[test]
    fn signed_pre_key_serde_roundtrip() {
        let identity = IdentityKeyPair::generate();
        let spk = SignedPreKey::generate(7, &identity);
        let json = serde_json::to_vec(&spk).unwrap();
        let decoded: SignedPreKey = serde_json::from_slice(&json).unwrap();
        assert_eq!(decoded, spk);
    }
}
