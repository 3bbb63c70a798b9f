//! Sender-Keys fuer Kanaele
//!
//! Jeder Sender besitzt pro Kanal eine symmetrische Kette. Die Kette wird
//! mit jeder Nachricht weitergedreht, die Nachrichten werden zusaetzlich
//! mit einem Ed25519-Schluessel des Senders signiert, damit Mitglieder
//! (die den Kettenschluessel ebenfalls kennen) keine Nachrichten im Namen
//! des Senders faelschen koennen.
//!
//! Bei jeder Mitgliedschaftsaenderung erzeugt der Sender eine neue
//! Generation mit frischer Kette und frischem Signaturschluessel.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tresor_core::{ChannelId, UserId};
use zeroize::Zeroize;

use crate::aead;
use crate::e2e::ratchet::MAX_UEBERSPRUNGEN;
use crate::error::{CryptoError, CryptoResult};
use crate::identity::IdentityKeyPair;
use crate::kdf::{ketten_schritt, nachrichten_material};

const INFO_NACHRICHT: &[u8] = b"tresor-sender-key-msg";

/// Verteilung eines Sender-Keys an ein Mitglied (wird paarweise verschluesselt)
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderKeyDistribution {
    pub channel_id: ChannelId,
    pub sender: UserId,
    pub generation: u32,
    /// Iteration, ab der `chain_key` gilt
    pub iteration: u32,
    pub chain_key: [u8; 32],
    pub signing_public: [u8; 32],
}

impl SenderKeyDistribution {
    pub fn to_bytes(&self) -> CryptoResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl Drop for SenderKeyDistribution {
    fn drop(&mut self) {
        self.chain_key.zeroize();
    }
}

impl std::fmt::Debug for SenderKeyDistribution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SenderKeyDistribution")
            .field("channel_id", &self.channel_id)
            .field("sender", &self.sender)
            .field("generation", &self.generation)
            .field("iteration", &self.iteration)
            .finish_non_exhaustive()
    }
}

/// Eine Kanalnachricht unter einem Sender-Key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderKeyMessage {
    pub channel_id: ChannelId,
    pub sender: UserId,
    pub generation: u32,
    pub iteration: u32,
    #[serde(with = "tresor_protocol::base64_serde")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "tresor_protocol::base64_serde")]
    pub signature: Vec<u8>,
}

impl SenderKeyMessage {
    fn signatur_daten(&self) -> Vec<u8> {
        signatur_daten(
            &self.channel_id,
            &self.sender,
            self.generation,
            self.iteration,
            &self.ciphertext,
        )
    }

    pub fn to_bytes(&self) -> CryptoResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

fn kopf(channel_id: &ChannelId, sender: &UserId, generation: u32, iteration: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(40);
    out.extend_from_slice(channel_id.inner().as_bytes());
    out.extend_from_slice(sender.inner().as_bytes());
    out.extend_from_slice(&generation.to_be_bytes());
    out.extend_from_slice(&iteration.to_be_bytes());
    out
}

fn signatur_daten(
    channel_id: &ChannelId,
    sender: &UserId,
    generation: u32,
    iteration: u32,
    ciphertext: &[u8],
) -> Vec<u8> {
    let mut out = kopf(channel_id, sender, generation, iteration);
    out.extend_from_slice(ciphertext);
    out
}

/// Zustand eines Sender-Keys (eigener oder empfangener)
#[derive(Clone, Serialize, Deserialize)]
pub struct SenderKeyState {
    channel_id: ChannelId,
    owner: UserId,
    generation: u32,
    chain_key: [u8; 32],
    iteration: u32,
    signing_public: [u8; 32],
    /// Nur beim eigenen Sender-Key gesetzt
    signing_secret: Option<[u8; 32]>,
    skipped: BTreeMap<u32, [u8; 32]>,
    created_at: DateTime<Utc>,
}

impl SenderKeyState {
    /// Erzeugt einen neuen eigenen Sender-Key
    pub fn generate(channel_id: ChannelId, owner: UserId, generation: u32) -> Self {
        let mut chain_key = [0u8; 32];
        OsRng.fill_bytes(&mut chain_key);
        let signing = SigningKey::generate(&mut OsRng);

        Self {
            channel_id,
            owner,
            generation,
            chain_key,
            iteration: 0,
            signing_public: signing.verifying_key().to_bytes(),
            signing_secret: Some(signing.to_bytes()),
            skipped: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Zustand eines anderen Senders aus seiner Verteilung
    pub fn from_distribution(dist: &SenderKeyDistribution) -> Self {
        Self {
            channel_id: dist.channel_id,
            owner: dist.sender,
            generation: dist.generation,
            chain_key: dist.chain_key,
            iteration: dist.iteration,
            signing_public: dist.signing_public,
            signing_secret: None,
            skipped: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Verteilung des aktuellen Kettenstands
    pub fn distribution(&self) -> SenderKeyDistribution {
        SenderKeyDistribution {
            channel_id: self.channel_id,
            sender: self.owner,
            generation: self.generation,
            iteration: self.iteration,
            chain_key: self.chain_key,
            signing_public: self.signing_public,
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn owner(&self) -> UserId {
        self.owner
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Gleiche Generation mit demselben Signaturschluessel
    pub fn passt_zu(&self, dist: &SenderKeyDistribution) -> bool {
        self.generation == dist.generation && self.signing_public == dist.signing_public
    }

    pub fn is_own(&self) -> bool {
        self.signing_secret.is_some()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Verschluesselt und signiert eine Kanalnachricht
    pub fn encrypt(&mut self, plaintext: &[u8]) -> CryptoResult<SenderKeyMessage> {
        let Some(secret) = self.signing_secret.as_ref() else {
            return Err(CryptoError::UngueltigeDaten(
                "fremder Sender-Key kann nicht senden".into(),
            ));
        };
        let signing = SigningKey::from_bytes(secret);

        let (mut mk, next) = ketten_schritt(&self.chain_key)?;
        let (mut key, nonce) = nachrichten_material(&mk, INFO_NACHRICHT)?;
        let iteration = self.iteration;
        let aad = kopf(&self.channel_id, &self.owner, self.generation, iteration);
        let ciphertext = aead::seal(&key, &nonce, plaintext, &aad);
        mk.zeroize();
        key.zeroize();
        let ciphertext = ciphertext?;

        let signature = signing
            .sign(&signatur_daten(
                &self.channel_id,
                &self.owner,
                self.generation,
                iteration,
                &ciphertext,
            ))
            .to_bytes()
            .to_vec();

        self.chain_key = next;
        self.iteration = self
            .iteration
            .checked_add(1)
            .ok_or_else(|| CryptoError::SchluesselGenerierung("Sender-Key erschoepft".into()))?;

        Ok(SenderKeyMessage {
            channel_id: self.channel_id,
            sender: self.owner,
            generation: self.generation,
            iteration,
            ciphertext,
            signature,
        })
    }

    /// Prueft Signatur und entschluesselt. Bei Fehlern bleibt der Zustand unveraendert.
    pub fn decrypt(&mut self, message: &SenderKeyMessage) -> CryptoResult<Vec<u8>> {
        if message.channel_id != self.channel_id || message.sender != self.owner {
            return Err(CryptoError::FalscheSitzung);
        }
        if message.generation != self.generation {
            return Err(CryptoError::FalscheGeneration {
                erwartet: self.generation,
                erhalten: message.generation,
            });
        }
        IdentityKeyPair::verify_strict(
            &message.signatur_daten(),
            &message.signature,
            &self.signing_public,
        )?;

        let mut working = self.clone();
        let mut mk = working.message_key_for(message.iteration)?;
        let (mut key, nonce) = nachrichten_material(&mk, INFO_NACHRICHT)?;
        let aad = kopf(
            &message.channel_id,
            &message.sender,
            message.generation,
            message.iteration,
        );
        let plaintext = aead::open(&key, &nonce, &message.ciphertext, &aad);
        mk.zeroize();
        key.zeroize();
        let plaintext = plaintext?;

        *self = working;
        Ok(plaintext)
    }

    fn message_key_for(&mut self, iteration: u32) -> CryptoResult<[u8; 32]> {
        if iteration < self.iteration {
            return self.skipped.remove(&iteration).ok_or(CryptoError::Duplikat {
                zaehler: u64::from(iteration),
            });
        }

        let luecke = u64::from(iteration - self.iteration);
        if luecke > MAX_UEBERSPRUNGEN {
            return Err(CryptoError::ZuVieleUebersprungen {
                luecke,
                maximum: MAX_UEBERSPRUNGEN,
            });
        }

        while self.iteration < iteration {
            let (mk, next) = ketten_schritt(&self.chain_key)?;
            self.skipped.insert(self.iteration, mk);
            self.chain_key = next;
            self.iteration += 1;
        }
        while self.skipped.len() as u64 > MAX_UEBERSPRUNGEN {
            if let Some((_, mut verworfen)) = self.skipped.pop_first() {
                verworfen.zeroize();
            }
        }

        let (mk, next) = ketten_schritt(&self.chain_key)?;
        self.chain_key = next;
        self.iteration = iteration.saturating_add(1);
        Ok(mk)
    }
}

impl Drop for SenderKeyState {
    fn drop(&mut self) {
        self.chain_key.zeroize();
        if let Some(secret) = self.signing_secret.as_mut() {
            secret.zeroize();
        }
        self.skipped.values_mut().for_each(|mk| mk.zeroize());
    }
}

impl std::fmt::Debug for SenderKeyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SenderKeyState")
            .field("channel_id", &self.channel_id)
            .field("owner", &self.owner)
            .field("generation", &self.generation)
            .field("iteration", &self.iteration)
            .field("own", &self.is_own())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
