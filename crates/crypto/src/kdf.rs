//! Schluesselableitung (HKDF-SHA256) und Ketten-Schritte (HMAC-SHA256)

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{CryptoError, CryptoResult};
use crate::types::{NONCE_LAENGE, SCHLUESSEL_LAENGE};

type HmacSha256 = Hmac<Sha256>;

/// Label fuer den Nachrichtenschluessel eines Kettenglieds
const LABEL_NACHRICHT: u8 = 0x01;
/// Label fuer den naechsten Kettenschluessel
const LABEL_KETTE: u8 = 0x02;

/// HKDF-basierte Key Derivation (allgemein verwendbar)
pub fn hkdf_derive(ikm: &[u8], salt: &[u8], info: &[u8], len: usize) -> CryptoResult<Vec<u8>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = vec![0u8; len];
    hk.expand(info, &mut okm)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(okm)
}

/// HKDF mit fester Ausgabelaenge von 32 Bytes
pub fn hkdf_32(ikm: &[u8], salt: &[u8], info: &[u8]) -> CryptoResult<[u8; SCHLUESSEL_LAENGE]> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; SCHLUESSEL_LAENGE];
    hk.expand(info, &mut okm)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(okm)
}

fn hmac_schritt(
    chain_key: &[u8; SCHLUESSEL_LAENGE],
    label: u8,
) -> CryptoResult<[u8; SCHLUESSEL_LAENGE]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(chain_key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac.update(&[label]);
    let mut out = [0u8; SCHLUESSEL_LAENGE];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Ein Schritt der symmetrischen Ratchet-Kette.
///
/// Gibt `(nachrichten_schluessel, naechster_kettenschluessel)` zurueck.
pub fn ketten_schritt(
    chain_key: &[u8; SCHLUESSEL_LAENGE],
) -> CryptoResult<([u8; SCHLUESSEL_LAENGE], [u8; SCHLUESSEL_LAENGE])> {
    let message_key = hmac_schritt(chain_key, LABEL_NACHRICHT)?;
    let next = hmac_schritt(chain_key, LABEL_KETTE)?;
    Ok((message_key, next))
}

/// Expandiert einen Nachrichtenschluessel zu AES-Schluessel + Nonce
pub fn nachrichten_material(
    message_key: &[u8; SCHLUESSEL_LAENGE],
    info: &[u8],
) -> CryptoResult<([u8; SCHLUESSEL_LAENGE], [u8; NONCE_LAENGE])> {
    let okm = hkdf_derive(message_key, &[0u8; SCHLUESSEL_LAENGE], info, SCHLUESSEL_LAENGE + NONCE_LAENGE)?;
    let mut key = [0u8; SCHLUESSEL_LAENGE];
    let mut nonce = [0u8; NONCE_LAENGE];
    key.copy_from_slice(&okm[..SCHLUESSEL_LAENGE]);
    nonce.copy_from_slice(&okm[SCHLUESSEL_LAENGE..]);
    Ok((key, nonce))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hkdf_derive_deterministisch() {
        let ikm = b"test-input-key-material";
        let salt = b"test-salt";
        let info = b"test-info";

        let key1 = hkdf_derive(ikm, salt, info, 32).unwrap();
        let key2 = hkdf_derive(ikm, salt, info, 32).unwrap();
        assert_eq!(key1, key2);
        assert_eq!(key1.len(), 32);
    }

    #[test]
    fn hkdf_verschiedene_infos_geben_verschiedene_keys() {
        let ikm = b"gleicher-ikm";
        let salt = b"gleicher-salt";

        let key1 = hkdf_32(ikm, salt, b"info-1").unwrap();
        let key2 = hkdf_32(ikm, salt, b"info-2").unwrap();
        assert_ne!(key1, key2);
    }

    #[test]
    fn ketten_schritt_trennt_nachricht_und_kette() {
        let chain = [7u8; 32];
        let (mk, next) = ketten_schritt(&chain).unwrap();
        assert_ne!(mk, next);
        assert_ne!(next, chain);

        // Deterministisch
        let (mk2, next2) = ketten_schritt(&chain).unwrap();
        assert_eq!(mk, mk2);
        assert_eq!(next, next2);
    }
}
