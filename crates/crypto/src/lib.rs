//! # tresor-crypto
//!
//! Kryptografische Bausteine der Sitzungsschicht.
//!
//! ## Module
//! - `identity` - Langzeit-Identitaet (Ed25519 + X25519)
//! - `prekeys` - Signierte und One-Time-Pre-Keys, Key-Bundles
//! - `e2e` - X3DH-Handshake, Ratchet-Sitzungen, Sender-Keys
//! - `backup` - Passphrasen-geschuetztes Schluessel-Backup
//! - `pow` - Proof-of-Work fuer die Registrierung
//! - `aead`, `kdf` - AES-256-GCM und HKDF/HMAC-Hilfen
//! - `types` - Laengen und Vergleichshilfe
//! - `error` - Fehlertypen

pub mod aead;
pub mod backup;
pub mod e2e;
pub mod error;
pub mod identity;
pub mod kdf;
pub mod pow;
pub mod prekeys;
pub mod types;

// Bequeme Re-Exports
pub use backup::{ExportedKeyMaterial, KeyBackupCodec};
pub use error::{CryptoError, CryptoResult};
pub use identity::{IdentityKeyPair, IdentityPublicKey, IdentityRecord};
pub use pow::{PowZustand, ProofOfWorkGate};
pub use prekeys::{
    KeyBundle, OneTimePreKey, OneTimePreKeyPublic, PreKeyId, SignedPreKey, SignedPreKeyPublic,
};

pub use e2e::{
    HandshakeSecret, PreKeyHeader, RatchetMessage, RatchetSession, SenderKeyDistribution,
    SenderKeyMessage, SenderKeyState, SessionRole,
};
