//! Symmetrische Hash-Ratchet fuer paarweise Sitzungen
//!
//! Aus dem Handshake-Geheimnis werden zwei Ketten abgeleitet:
//! Initiator->Responder und Responder->Initiator. Jede Nachricht
//! verbraucht ein Kettenglied:
//!
//! ```text
//! mk   = HMAC(chain, 0x01)
//! next = HMAC(chain, 0x02)
//! (aes_key, nonce) = HKDF(mk, info = "tresor-ratchet-msg")
//! aad  = associated_data || handshake_id || counter (u64 BE)
//! ```
//!
//! Nachrichten, die ausser der Reihe eintreffen, werden ueber gemerkte
//! Schluessel entschluesselt (maximal `MAX_UEBERSPRUNGEN` pro Sitzung).
//! Ein Zaehler, der schon verbraucht wurde und keinen gemerkten
//! Schluessel mehr hat, ist ein Replay.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::aead;
use crate::e2e::x3dh::{HandshakeSecret, PreKeyHeader};
use crate::error::{CryptoError, CryptoResult};
use crate::identity::IdentityPublicKey;
use crate::kdf::{hkdf_32, ketten_schritt, nachrichten_material};

/// Maximal gemerkte Schluessel fuer uebersprungene Nachrichten
pub const MAX_UEBERSPRUNGEN: u64 = 1000;

const INFO_I2R: &[u8] = b"tresor-chain-i2r";
const INFO_R2I: &[u8] = b"tresor-chain-r2i";
const INFO_NACHRICHT: &[u8] = b"tresor-ratchet-msg";

/// Rolle in der Sitzung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    Initiator,
    Responder,
}

/// Eine verschluesselte paarweise Nachricht
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetMessage {
    /// Identifiziert die Sitzung (ephemerer Schluessel des Initiators)
    pub handshake_id: [u8; 32],
    pub counter: u64,
    /// Gesetzt, solange der Initiator noch keine Antwort erhalten hat
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_key: Option<PreKeyHeader>,
    #[serde(with = "tresor_protocol::base64_serde")]
    pub ciphertext: Vec<u8>,
}

impl RatchetMessage {
    pub fn to_bytes(&self) -> CryptoResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Zustand einer paarweisen Sitzung
///
/// Wird als JSON im KeyStore persistiert. Alle Kettenschluessel werden
/// beim Drop genullt.
#[derive(Clone, Serialize, Deserialize)]
pub struct RatchetSession {
    role: SessionRole,
    handshake_id: [u8; 32],
    associated_data: Vec<u8>,
    remote_identity: IdentityPublicKey,
    sending_chain: [u8; 32],
    sending_counter: u64,
    receiving_chain: [u8; 32],
    receiving_counter: u64,
    skipped: BTreeMap<u64, [u8; 32]>,
    pending_pre_key: Option<PreKeyHeader>,
    received_any: bool,
    stale: bool,
    created_at: DateTime<Utc>,
}

impl RatchetSession {
    /// Initialisiert beide Ketten aus einem Handshake-Geheimnis
    pub fn from_handshake(
        secret: &HandshakeSecret,
        role: SessionRole,
        remote_identity: IdentityPublicKey,
        pending_pre_key: Option<PreKeyHeader>,
    ) -> CryptoResult<Self> {
        let handshake_id = secret.handshake_id();
        let i2r = hkdf_32(secret.secret(), &handshake_id, INFO_I2R)?;
        let r2i = hkdf_32(secret.secret(), &handshake_id, INFO_R2I)?;

        let (sending_chain, receiving_chain) = match role {
            SessionRole::Initiator => (i2r, r2i),
            SessionRole::Responder => (r2i, i2r),
        };

        Ok(Self {
            role,
            handshake_id,
            associated_data: secret.associated_data().to_vec(),
            remote_identity,
            sending_chain,
            sending_counter: 0,
            receiving_chain,
            receiving_counter: 0,
            skipped: BTreeMap::new(),
            pending_pre_key: match role {
                SessionRole::Initiator => pending_pre_key,
                SessionRole::Responder => None,
            },
            received_any: false,
            stale: false,
            created_at: Utc::now(),
        })
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn handshake_id(&self) -> [u8; 32] {
        self.handshake_id
    }

    pub fn remote_identity(&self) -> &IdentityPublicKey {
        &self.remote_identity
    }

    /// Ob vom Peer schon mindestens eine Nachricht entschluesselt wurde
    pub fn has_received(&self) -> bool {
        self.received_any
    }

    pub fn sending_counter(&self) -> u64 {
        self.sending_counter
    }

    pub fn pending_pre_key(&self) -> Option<&PreKeyHeader> {
        self.pending_pre_key.as_ref()
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Markiert die Sitzung als veraltet; `initiate` darf sie ersetzen
    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }

    fn aad(&self, counter: u64) -> Vec<u8> {
        let mut aad = Vec::with_capacity(self.associated_data.len() + 40);
        aad.extend_from_slice(&self.associated_data);
        aad.extend_from_slice(&self.handshake_id);
        aad.extend_from_slice(&counter.to_be_bytes());
        aad
    }

    /// Verschluesselt eine Nachricht und rueckt die Sende-Kette weiter
    pub fn encrypt(&mut self, plaintext: &[u8]) -> CryptoResult<RatchetMessage> {
        let (mut mk, next) = ketten_schritt(&self.sending_chain)?;
        let (mut key, nonce) = nachrichten_material(&mk, INFO_NACHRICHT)?;
        let counter = self.sending_counter;
        let ciphertext = aead::seal(&key, &nonce, plaintext, &self.aad(counter));
        mk.zeroize();
        key.zeroize();
        let ciphertext = ciphertext?;

        self.sending_chain = next;
        self.sending_counter += 1;

        Ok(RatchetMessage {
            handshake_id: self.handshake_id,
            counter,
            pre_key: self.pending_pre_key.clone(),
            ciphertext,
        })
    }

    /// Entschluesselt eine Nachricht.
    ///
    /// Der Zustand wird nur bei Erfolg uebernommen; ein Fehler laesst die
    /// Sitzung unveraendert.
    pub fn decrypt(&mut self, message: &RatchetMessage) -> CryptoResult<Vec<u8>> {
        if message.handshake_id != self.handshake_id {
            return Err(CryptoError::FalscheSitzung);
        }

        let mut working = self.clone();
        let mut mk = working.message_key_for(message.counter)?;
        let (mut key, nonce) = nachrichten_material(&mk, INFO_NACHRICHT)?;
        let plaintext = aead::open(&key, &nonce, &message.ciphertext, &working.aad(message.counter));
        mk.zeroize();
        key.zeroize();
        let plaintext = plaintext?;

        working.received_any = true;
        // Der Peer kennt die Sitzung, der Pre-Key-Kopf ist nicht mehr noetig
        working.pending_pre_key = None;
        *self = working;

        tracing::trace!(
            counter = message.counter,
            uebersprungen = self.skipped.len(),
            "Ratchet-Nachricht entschluesselt"
        );
        Ok(plaintext)
    }

    fn message_key_for(&mut self, counter: u64) -> CryptoResult<[u8; 32]> {
        if counter < self.receiving_counter {
            return self
                .skipped
                .remove(&counter)
                .ok_or(CryptoError::Duplikat { zaehler: counter });
        }

        let luecke = counter - self.receiving_counter;
        if luecke > MAX_UEBERSPRUNGEN {
            return Err(CryptoError::ZuVieleUebersprungen {
                luecke,
                maximum: MAX_UEBERSPRUNGEN,
            });
        }

        while self.receiving_counter < counter {
            let (mk, next) = ketten_schritt(&self.receiving_chain)?;
            self.skipped.insert(self.receiving_counter, mk);
            self.receiving_chain = next;
            self.receiving_counter += 1;
        }
        // Aelteste gemerkte Schluessel zuerst verdraengen
        while self.skipped.len() as u64 > MAX_UEBERSPRUNGEN {
            if let Some(mut verworfen) = self.skipped.pop_first().map(|(_, mk)| mk) {
                verworfen.zeroize();
            }
        }

        let (mk, next) = ketten_schritt(&self.receiving_chain)?;
        self.receiving_chain = next;
        self.receiving_counter += 1;
        Ok(mk)
    }
}

impl Drop for RatchetSession {
    fn drop(&mut self) {
        self.sending_chain.zeroize();
        self.receiving_chain.zeroize();
        self.skipped.values_mut().for_each(|mk| mk.zeroize());
    }
}

impl std::fmt::Debug for RatchetSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetSession")
            .field("role", &self.role)
            .field("peer", &self.remote_identity.fingerprint())
            .field("sending_counter", &self.sending_counter)
            .field("receiving_counter", &self.receiving_counter)
            .field("stale", &self.stale)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
