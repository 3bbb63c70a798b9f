//! AES-256-GCM Versiegeln und Oeffnen
//!
//! ## Format
//! ```text
//! [ciphertext + auth_tag(16)]
//! ```
//! Nonce und AAD werden vom Aufrufer bestimmt und nicht mitgeschrieben.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Key, Nonce,
};

use crate::error::{CryptoError, CryptoResult};
use crate::types::{NONCE_LAENGE, SCHLUESSEL_LAENGE};

/// Laenge des GCM-Auth-Tags
pub const TAG_LAENGE: usize = 16;

/// Verschluesselt `plaintext` und authentifiziert zusaetzlich `aad`
pub fn seal(
    key_bytes: &[u8; SCHLUESSEL_LAENGE],
    nonce_bytes: &[u8; NONCE_LAENGE],
    plaintext: &[u8],
    aad: &[u8],
) -> CryptoResult<Vec<u8>> {
    let key = Key::<Aes256Gcm>::from_slice(key_bytes);
    let cipher = Aes256Gcm::new(key);
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|e| CryptoError::Verschluesselung(e.to_string()))
}

/// Entschluesselt und verifiziert Auth-Tag sowie `aad`
pub fn open(
    key_bytes: &[u8; SCHLUESSEL_LAENGE],
    nonce_bytes: &[u8; NONCE_LAENGE],
    ciphertext: &[u8],
    aad: &[u8],
) -> CryptoResult<Vec<u8>> {
    if ciphertext.len() < TAG_LAENGE {
        return Err(CryptoError::UngueltigeDaten(
            "Ciphertext kuerzer als Auth-Tag".to_string(),
        ));
    }

    let key = Key::<Aes256Gcm>::from_slice(key_bytes);
    let cipher = Aes256Gcm::new(key);
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|e| CryptoError::Entschluesselung(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_und_open() {
        let key = [3u8; 32];
        let nonce = [9u8; 12];
        let ct = seal(&key, &nonce, b"Hallo Tresor", b"aad").unwrap();
        assert_eq!(ct.len(), b"Hallo Tresor".len() + TAG_LAENGE);

        let pt = open(&key, &nonce, &ct, b"aad").unwrap();
        assert_eq!(pt, b"Hallo Tresor");
    }

    #[test]
    fn falsche_aad_schlaegt_fehl() {
        let key = [3u8; 32];
        let nonce = [9u8; 12];
        let ct = seal(&key, &nonce, b"daten", b"aad-1").unwrap();
        assert!(matches!(
            open(&key, &nonce, &ct, b"aad-2"),
            Err(CryptoError::Entschluesselung(_))
        ));
    }

    #[test]
    fn manipulierter_ciphertext_schlaegt_fehl() {
        let key = [1u8; 32];
        let nonce = [2u8; 12];
        let mut ct = seal(&key, &nonce, b"daten", b"").unwrap();
        ct[0] ^= 0xFF;
        assert!(open(&key, &nonce, &ct, b"").is_err());
    }

    #[test]
    fn zu_kurzer_ciphertext() {
        let key = [1u8; 32];
        let nonce = [2u8; 12];
        assert!(matches!(
            open(&key, &nonce, &[0u8; 4], b""),
            Err(CryptoError::UngueltigeDaten(_))
        ));
    }
}
