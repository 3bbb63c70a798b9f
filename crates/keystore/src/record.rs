//! Adressierung von Datensaetzen und Batch-Mutationen

use serde::{Deserialize, Serialize};
use tresor_core::UserId;

use crate::error::{KeyStoreError, KeyStoreResult};

/// Art eines gespeicherten Datensatzes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecordKind {
    /// Identitaetsschluessel (genau ein Datensatz pro Konto)
    Identity,
    SignedPreKey,
    /// Private Haelften der One-Time-Pre-Keys, ID = Pre-Key-ID
    OneTimePreKey,
    /// Naechste freie Pre-Key-ID
    PreKeyCounter,
    /// Paarweise Sitzungen, ID = Peer-UserId
    Session,
    /// Eigene Sender-Keys, ID = ChannelId
    SenderKeyOwn,
    /// Empfangene Sender-Keys, ID = "ChannelId/UserId"
    SenderKeyInbound,
    /// Klartext-Cache, ID = Server-Nachrichten-ID
    PlaintextCache,
}

impl RecordKind {
    pub fn als_str(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::SignedPreKey => "signed_pre_key",
            Self::OneTimePreKey => "one_time_pre_key",
            Self::PreKeyCounter => "pre_key_counter",
            Self::Session => "session",
            Self::SenderKeyOwn => "sender_key_own",
            Self::SenderKeyInbound => "sender_key_inbound",
            Self::PlaintextCache => "plaintext_cache",
        }
    }

    pub fn aus_str(s: &str) -> KeyStoreResult<Self> {
        Ok(match s {
            "identity" => Self::Identity,
            "signed_pre_key" => Self::SignedPreKey,
            "one_time_pre_key" => Self::OneTimePreKey,
            "pre_key_counter" => Self::PreKeyCounter,
            "session" => Self::Session,
            "sender_key_own" => Self::SenderKeyOwn,
            "sender_key_inbound" => Self::SenderKeyInbound,
            "plaintext_cache" => Self::PlaintextCache,
            other => {
                return Err(KeyStoreError::UngueltigeDaten(format!(
                    "Unbekannte Datensatz-Art: '{other}'"
                )))
            }
        })
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.als_str())
    }
}

/// Vollstaendige Adresse eines Datensatzes
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub account: UserId,
    pub kind: RecordKind,
    pub id: String,
}

impl RecordKey {
    pub fn new(account: UserId, kind: RecordKind, id: impl Into<String>) -> Self {
        Self {
            account,
            kind,
            id: id.into(),
        }
    }

    /// Adresse fuer Arten mit genau einem Datensatz pro Konto
    pub fn singleton(account: UserId, kind: RecordKind) -> Self {
        Self::new(account, kind, "")
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.account, self.kind, self.id)
    }
}

/// Eine Aenderung innerhalb eines atomaren Batches
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Put { key: RecordKey, value: Vec<u8> },
    Delete { key: RecordKey },
    /// Loescht alle Datensaetze einer Art eines Kontos
    DeleteKind { account: UserId, kind: RecordKind },
}

impl Mutation {
    /// Serialisiert `value` als JSON
    pub fn put_json<T: Serialize>(key: RecordKey, value: &T) -> KeyStoreResult<Self> {
        Ok(Self::Put {
            key,
            value: serde_json::to_vec(value)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn art_roundtrip() {
        for art in [
            RecordKind::Identity,
            RecordKind::SignedPreKey,
            RecordKind::OneTimePreKey,
            RecordKind::PreKeyCounter,
            RecordKind::Session,
            RecordKind::SenderKeyOwn,
            RecordKind::SenderKeyInbound,
            RecordKind::PlaintextCache,
        ] {
            assert_eq!(RecordKind::aus_str(art.als_str()).unwrap(), art);
        }
        assert!(RecordKind::aus_str("unbekannt").is_err());
    }

    #[test]
    fn put_json_serialisiert() {
        let key = RecordKey::new(UserId::new(), RecordKind::Session, "peer");
        let m = Mutation::put_json(key.clone(), &vec![1u8, 2]).unwrap();
        assert_eq!(
            m,
            Mutation::Put {
                key,
                value: b"[1,2]".to_vec()
            }
        );
    }
}
