//! tresor-protocol – Wire-Formate
//!
//! Dieses Crate definiert die Strukturen, die zwischen Client und Server
//! ausgetauscht werden. Der Server sieht nur Routing-Metadaten; alle
//! Binaerfelder sind Base64 (Standard-Alphabet) im JSON.

pub mod backup;
pub mod base64_serde;
pub mod envelope;
pub mod error;

pub use backup::{KdfParameter, KeyBackupBlob, BACKUP_VERSION};
pub use envelope::{Destination, Envelope, EnvelopeKind, ENVELOPE_VERSION};
pub use error::{ProtocolError, ProtocolResult};
