//! tresor-keystore – Persistenz fuer Schluesselmaterial
//!
//! Alle Datensaetze sind ueber `(Konto, Art, ID)` adressiert und als opake
//! Bytes (JSON) gespeichert. `apply` schreibt einen Batch atomar; darauf
//! stuetzen sich Bootstrap und Backup-Import.
//!
//! Implementierungen:
//! - `SqliteKeyStore` – dauerhaft, WAL-Modus, Migrationen via sqlx
//! - `MemoryKeyStore` – fluechtig, fuer Tests und kurzlebige Clients

pub mod error;
pub mod memory;
pub mod record;
pub mod sqlite;
pub mod store;

pub use error::{KeyStoreError, KeyStoreResult};
pub use memory::MemoryKeyStore;
pub use record::{Mutation, RecordKey, RecordKind};
pub use sqlite::SqliteKeyStore;
pub use store::{KeyStore, KeyStoreExt};
