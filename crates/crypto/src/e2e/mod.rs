//! E2E Verschluesselung (End-to-End)
//!
//! Client <-> Client Verschluesselung. Der Server leitet Envelopes blind
//! weiter und sieht nur Routing-Metadaten.
//!
//! ## Ablauf
//! 1. Jeder Client hat eine `IdentityKeyPair` und veroeffentlicht Pre-Keys
//! 2. Erster Kontakt: X3DH-Handshake gegen das Key-Bundle des Peers
//! 3. Paarweise Nachrichten laufen ueber eine `RatchetSession`
//! 4. Kanaele nutzen einen `SenderKeyState` pro Sender, verteilt ueber
//!    die paarweisen Sitzungen
//! 5. Bei Join/Leave: neue Sender-Key-Generation

pub mod ratchet;
pub mod sender_key;
pub mod x3dh;

pub use ratchet::{RatchetMessage, RatchetSession, SessionRole, MAX_UEBERSPRUNGEN};
pub use sender_key::{SenderKeyDistribution, SenderKeyMessage, SenderKeyState};
pub use x3dh::{initiate, respond, HandshakeSecret, PreKeyHeader};
