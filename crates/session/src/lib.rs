//! # tresor-session
//!
//! Sitzungsschicht eines Ende-zu-Ende-verschluesselten Chat-Clients.
//!
//! ## Bausteine
//! - `key_lifecycle` – Identitaet, Signed- und One-Time-Pre-Keys
//! - `establisher` – X3DH als Initiator und Responder, Konvergenz
//! - `session_cache` – Ratchet-Sitzungen pro Peer (Speicher + KeyStore)
//! - `sender_keys` – Sender-Keys pro Kanal, Verteilung und Invalidierung
//! - `pipeline` – Optimistisches Echo, Dedup, Klartext-Cache, Wiederholung
//! - `backup` – Passphrasen-geschuetztes Backup beim Server
//! - `registration` – Proof-of-Work als abbrechbarer Hintergrund-Task
//! - `client` – Fassade und Ereignisschleife
//!
//! Sperren pro Peer und pro Kanal (`locks`) serialisieren Handshakes,
//! Ratchet-Schritte und Sender-Key-Wechsel. Es gibt keine globale Sperre.

pub mod backup;
pub mod client;
pub mod error;
pub mod establisher;
pub mod key_lifecycle;
pub mod locks;
pub mod pipeline;
pub mod registration;
pub mod sender_keys;
pub mod session_cache;
pub mod transport;

pub use backup::BackupService;
pub use client::{Client, ClientAusgabe};
pub use error::{SessionError, SessionResult};
pub use establisher::{Antwort, SessionEstablisher};
pub use key_lifecycle::{AccountKeys, Bereit, BootstrapOutcome, KeyLifecycleManager};
pub use locks::LockRegistry;
pub use pipeline::{
    Ausgehend, DecryptResult, MessagePipeline, Reconciled, Wiederhergestellt,
};
pub use registration::{spawn_solver, RegistrationProof, SolverHandle};
pub use sender_keys::{
    EigenerSenderKey, EmpfangeneSenderKeys, SenderKeyDistributor, GENERATIONEN_BEHALTEN,
};
pub use session_cache::{PeerRecord, RatchetSessionCache};
pub use transport::{Transport, TransportError, TransportEvent, TransportResult};
