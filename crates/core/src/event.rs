//! Schluessel-Ereignisse vom Server
//!
//! Der Server pusht Ereignisse, die Schluesselmaterial betreffen. Die
//! Transport-Schicht reicht sie unveraendert in die Ereignisschleife des
//! Clients weiter, wo sie an den zustaendigen Baustein verteilt werden.

use crate::types::{ChannelId, ServerId, UserId};
use serde::{Deserialize, Serialize};

/// Ereignisse, die eine Neuverteilung oder Nachlieferung von Schluesseln ausloesen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchluesselEreignis {
    /// Mitgliedschaft eines Servers hat sich geaendert (Join/Leave/Kick).
    /// Alle Sender-Keys der Kanaele dieses Servers sind ungueltig.
    MembershipChanged { server_id: ServerId },

    /// Ein Mitglied hat fuer einen Kanal neue Sender-Keys verteilt
    /// (oder der Server fordert eine Neuverteilung an).
    SenderKeysChanged {
        channel_id: ChannelId,
        sender: Option<UserId>,
    },

    /// Der Server meldet, dass nur noch wenige One-Time-Pre-Keys vorraetig sind
    PreKeysLow { remaining: usize },
}

impl SchluesselEreignis {
    /// Kurzname fuer Logging
    pub fn art(&self) -> &'static str {
        match self {
            Self::MembershipChanged { .. } => "membership_changed",
            Self::SenderKeysChanged { .. } => "sender_keys_changed",
            Self::PreKeysLow { .. } => "pre_keys_low",
        }
    }
}
