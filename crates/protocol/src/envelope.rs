//! Envelope – die Transporteinheit zwischen Clients
//!
//! Ein Envelope traegt nie Klartext. Sichtbar fuer den Server sind nur
//! Absender, Ziel, Art und optionale Referenzen.
//!
//! ## Wire-Format
//! ```json
//! {
//!   "version": 1,
//!   "message_id": null,
//!   "sender": "…uuid…",
//!   "destination": { "type": "channel", "server_id": "…", "channel_id": "…" },
//!   "kind": "sender_key",
//!   "ciphertext": "base64…"
//! }
//! ```

use serde::{Deserialize, Serialize};
use tresor_core::{ChannelId, MessageId, ServerId, UserId};

use crate::error::{ProtocolError, ProtocolResult};

/// Aktuelle Envelope-Version
pub const ENVELOPE_VERSION: u32 = 1;

/// Ziel eines Envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Destination {
    /// Direktnachricht an einen Benutzer (paarweise Sitzung)
    User { user_id: UserId },
    /// Kanal eines Servers (Sender-Key)
    Channel {
        server_id: ServerId,
        channel_id: ChannelId,
    },
}

impl Destination {
    pub fn user(user_id: UserId) -> Self {
        Self::User { user_id }
    }

    pub fn channel(server_id: ServerId, channel_id: ChannelId) -> Self {
        Self::Channel {
            server_id,
            channel_id,
        }
    }

    /// Loggbare Kurzform
    pub fn bezeichnung(&self) -> String {
        match self {
            Self::User { user_id } => user_id.to_string(),
            Self::Channel { channel_id, .. } => channel_id.to_string(),
        }
    }
}

/// Art des verschluesselten Inhalts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// Erste Nachricht(en) einer paarweisen Sitzung mit Pre-Key-Kopf
    PreKey,
    /// Paarweise Nachricht einer etablierten Sitzung
    Ratchet,
    /// Kanalnachricht unter einem Sender-Key
    SenderKey,
    /// Paarweise verschluesselte Verteilung eines Sender-Keys
    SenderKeyDistribution,
    /// Neuer Handshake ohne Nutzinhalt, nachdem der Empfaenger seine
    /// Sitzung verloren hat
    SessionReset,
}

impl EnvelopeKind {
    /// Nur Anwendungsnachrichten werden vom Server bestaetigt
    pub fn ist_anwendungsnachricht(&self) -> bool {
        matches!(self, Self::PreKey | Self::Ratchet | Self::SenderKey)
    }
}

/// Verschluesseltes Envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    /// Vom Server vergebene ID (bei ausgehenden Envelopes `None`)
    #[serde(default)]
    pub message_id: Option<MessageId>,
    pub sender: UserId,
    pub destination: Destination,
    pub kind: EnvelopeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    #[serde(with = "crate::base64_serde")]
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    pub fn new(
        sender: UserId,
        destination: Destination,
        kind: EnvelopeKind,
        ciphertext: Vec<u8>,
    ) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            message_id: None,
            sender,
            destination,
            kind,
            reply_to: None,
            attachments: Vec::new(),
            ciphertext,
        }
    }

    /// Setzt die Antwort-Referenz (Builder-Pattern)
    pub fn with_reply_to(mut self, reply_to: Option<MessageId>) -> Self {
        self.reply_to = reply_to;
        self
    }

    /// Setzt Anhang-Referenzen (Builder-Pattern)
    pub fn with_attachments(mut self, attachments: Vec<String>) -> Self {
        self.attachments = attachments;
        self
    }

    /// Setzt die Server-ID (nach Zustellung)
    pub fn with_message_id(mut self, message_id: MessageId) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parst ein Envelope und lehnt unbekannte Versionen ab
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        let envelope: Self = serde_json::from_str(json)?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(ProtocolError::Version {
                erhalten: envelope.version,
                unterstuetzt: ENVELOPE_VERSION,
            });
        }
        if envelope.ciphertext.is_empty() {
            return Err(ProtocolError::UngueltigesFeld {
                feld: "ciphertext",
                grund: "leer".into(),
            });
        }
        Ok(envelope)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn beispiel() -> Envelope {
        Envelope::new(
            UserId::new(),
            Destination::channel(ServerId::new(), ChannelId::new()),
            EnvelopeKind::SenderKey,
            vec![1, 2, 3, 4],
        )
    }

    #[test]
    fn json_roundtrip() {
        let env = beispiel().with_reply_to(Some(MessageId::new()));
        let json = env.to_json().unwrap();
        assert_eq!(Envelope::from_json(&json).unwrap(), env);
    }

    #[test]
    fn wire_felder_sind_snake_case() {
        let json = beispiel().to_json().unwrap();
        assert!(json.contains(r#""kind":"sender_key""#));
        assert!(json.contains(r#""type":"channel""#));
        assert!(json.contains(r#""ciphertext":"AQIDBA==""#));
        // Leere Optionals werden weggelassen
        assert!(!json.contains("reply_to"));
        assert!(!json.contains("attachments"));
    }

    #[test]
    fn steuer_envelopes_sind_keine_anwendungsnachrichten() {
        assert!(EnvelopeKind::Ratchet.ist_anwendungsnachricht());
        assert!(!EnvelopeKind::SenderKeyDistribution.ist_anwendungsnachricht());
        assert!(!EnvelopeKind::SessionReset.ist_anwendungsnachricht());
        assert_eq!(
            serde_json::to_string(&EnvelopeKind::SessionReset).unwrap(),
            r#""session_reset""#
        );
    }

    #[test]
    fn unbekannte_version_abgelehnt() {
        let mut env = beispiel();
        env.version = 9;
        let json = serde_json::to_string(&env).unwrap();
        assert!(matches!(
            Envelope::from_json(&json),
            Err(ProtocolError::Version { erhalten: 9, .. })
        ));
    }

    #[test]
    fn leerer_ciphertext_abgelehnt() {
        let mut env = beispiel();
        env.ciphertext.clear();
        let json = serde_json::to_string(&env).unwrap();
        assert!(matches!(
            Envelope::from_json(&json),
            Err(ProtocolError::UngueltigesFeld { feld: "ciphertext", .. })
        ));
    }
}
