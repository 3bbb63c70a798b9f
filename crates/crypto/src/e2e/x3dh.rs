//! X3DH-Handshake (Extended Triple Diffie-Hellman)
//!
//! ```text
//! DH1 = DH(IK_a,  SPK_b)
//! DH2 = DH(EK_a,  IK_b)
//! DH3 = DH(EK_a,  SPK_b)
//! DH4 = DH(EK_a,  OPK_b)      (nur wenn ein One-Time-Pre-Key im Bundle war)
//! SK  = HKDF(salt = 0^32, ikm = 0xFF^32 || DH1 || DH2 || DH3 [|| DH4])
//! AD  = IK_a.sign || IK_b.sign
//! ```
//!
//! Die Handshake-ID ist der ephemere oeffentliche Schluessel des Initiators.
//! Sie identifiziert die Sitzung auf beiden Seiten und macht Replays des
//! ersten Envelopes erkennbar.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, CryptoResult};
use crate::identity::{IdentityKeyPair, IdentityPublicKey};
use crate::kdf::hkdf_32;
use crate::prekeys::{KeyBundle, OneTimePreKey, PreKeyId, SignedPreKey};

const X3DH_INFO: &[u8] = b"tresor-x3dh-v1";

/// Kopf, den der Initiator seinen Nachrichten voranstellt, bis der
/// Responder geantwortet hat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyHeader {
    /// Identitaet des Initiators
    pub initiator: IdentityPublicKey,
    /// Ephemerer X25519-Schluessel des Initiators (= Handshake-ID)
    pub ephemeral: [u8; 32],
    /// Welcher Signed-Pre-Key des Responders verwendet wurde
    pub signed_pre_key_id: PreKeyId,
    /// Welcher One-Time-Pre-Key verwendet wurde (falls vorhanden)
    pub one_time_pre_key_id: Option<PreKeyId>,
}

/// Ergebnis eines Handshakes: gemeinsames Geheimnis + Kontext
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct HandshakeSecret {
    secret: [u8; 32],
    #[zeroize(skip)]
    associated_data: Vec<u8>,
    #[zeroize(skip)]
    handshake_id: [u8; 32],
}

impl HandshakeSecret {
    pub fn secret(&self) -> &[u8; 32] {
        &self.secret
    }

    pub fn associated_data(&self) -> &[u8] {
        &self.associated_data
    }

    pub fn handshake_id(&self) -> [u8; 32] {
        self.handshake_id
    }
}

impl std::fmt::Debug for HandshakeSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HandshakeSecret([REDACTED])")
    }
}

fn ableiten(
    dh_outputs: &[[u8; 32]],
    initiator: &IdentityPublicKey,
    responder: &IdentityPublicKey,
    handshake_id: [u8; 32],
) -> CryptoResult<HandshakeSecret> {
    let mut ikm = Vec::with_capacity(32 * (dh_outputs.len() + 1));
    ikm.extend_from_slice(&[0xFFu8; 32]);
    for dh in dh_outputs {
        ikm.extend_from_slice(dh);
    }

    let secret = hkdf_32(&ikm, &[0u8; 32], X3DH_INFO);
    ikm.zeroize();

    let mut associated_data = Vec::with_capacity(64);
    associated_data.extend_from_slice(&initiator.signing);
    associated_data.extend_from_slice(&responder.signing);

    Ok(HandshakeSecret {
        secret: secret?,
        associated_data,
        handshake_id,
    })
}

/// Initiator-Seite: leitet das Geheimnis aus dem Bundle des Peers ab.
///
/// Prueft zuerst die Signatur des Signed-Pre-Keys. Gibt das Geheimnis und
/// den Kopf fuer die erste Nachricht zurueck.
pub fn initiate(
    ours: &IdentityKeyPair,
    bundle: &KeyBundle,
) -> CryptoResult<(HandshakeSecret, PreKeyHeader)> {
    bundle.verify()?;

    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = X25519PublicKey::from(&ephemeral).to_bytes();

    let spk = X25519PublicKey::from(bundle.signed_pre_key.public);
    let peer_identity = bundle.identity.agreement_key();

    let mut dh = vec![
        ours.agreement_secret().diffie_hellman(&spk).to_bytes(),
        ephemeral.diffie_hellman(&peer_identity).to_bytes(),
        ephemeral.diffie_hellman(&spk).to_bytes(),
    ];
    if let Some(opk) = &bundle.one_time_pre_key {
        dh.push(
            ephemeral
                .diffie_hellman(&X25519PublicKey::from(opk.public))
                .to_bytes(),
        );
    }

    let secret = ableiten(&dh, &ours.public_key(), &bundle.identity, ephemeral_public);
    dh.iter_mut().for_each(|d| d.zeroize());

    let header = PreKeyHeader {
        initiator: ours.public_key(),
        ephemeral: ephemeral_public,
        signed_pre_key_id: bundle.signed_pre_key.id,
        one_time_pre_key_id: bundle.one_time_pre_key.map(|k| k.id),
    };

    Ok((secret?, header))
}

/// Responder-Seite: leitet dasselbe Geheimnis mit den eigenen privaten
/// Pre-Keys ab.
///
/// `one_time_pre_key` muss genau dann gesetzt sein, wenn der Kopf einen
/// One-Time-Pre-Key referenziert.
pub fn respond(
    ours: &IdentityKeyPair,
    signed_pre_key: &SignedPreKey,
    one_time_pre_key: Option<&OneTimePreKey>,
    header: &PreKeyHeader,
) -> CryptoResult<HandshakeSecret> {
    if header.signed_pre_key_id != signed_pre_key.id() {
        return Err(CryptoError::PreKeyFehlt(header.signed_pre_key_id));
    }

    let ephemeral = X25519PublicKey::from(header.ephemeral);
    let initiator_identity = header.initiator.agreement_key();
    let spk = signed_pre_key.secret();

    let mut dh = vec![
        spk.diffie_hellman(&initiator_identity).to_bytes(),
        ours.agreement_secret().diffie_hellman(&ephemeral).to_bytes(),
        spk.diffie_hellman(&ephemeral).to_bytes(),
    ];

    match (header.one_time_pre_key_id, one_time_pre_key) {
        (Some(id), Some(opk)) if opk.id() == id => {
            dh.push(opk.secret().diffie_hellman(&ephemeral).to_bytes());
        }
        (Some(id), _) => return Err(CryptoError::PreKeyFehlt(id)),
        (None, Some(opk)) => {
            return Err(CryptoError::KeyExchange(format!(
                "One-Time-Pre-Key {} angeboten, aber nicht referenziert",
                opk.id()
            )))
        }
        (None, None) => {}
    }

    let secret = ableiten(&dh, &header.initiator, &ours.public_key(), header.ephemeral);
    dh.iter_mut().for_each(|d| d.zeroize());
    secret
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
