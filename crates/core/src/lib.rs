//! tresor-core – Gemeinsame Typen, Ereignisse und Konfiguration
//!
//! Dieses Crate stellt die fundamentalen Bausteine bereit, die von allen
//! anderen Tresor-Crates gemeinsam genutzt werden.

pub mod config;
pub mod event;
pub mod types;

// Re-Exporte fuer bequemen Zugriff
pub use config::TresorConfig;
pub use event::SchluesselEreignis;
pub use types::{ChannelId, MessageId, ServerId, UserId};
