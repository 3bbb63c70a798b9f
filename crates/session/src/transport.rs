//! Schnittstelle zum Server
//!
//! Die Sitzungsschicht spricht nie selbst HTTP oder WebSocket. Alles, was
//! den Server erreicht, laeuft ueber `Transport`; alles, was der Server
//! pusht, kommt als `TransportEvent` in die Ereignisschleife des Clients.

use async_trait::async_trait;
use thiserror::Error;
use tresor_core::{ChannelId, MessageId, SchluesselEreignis, ServerId, UserId};
use tresor_crypto::{IdentityPublicKey, KeyBundle, OneTimePreKeyPublic, SignedPreKeyPublic};
use tresor_protocol::{Envelope, KeyBackupBlob};

/// Fehler der Transport-Schicht
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Netzwerk weg, Timeout, Server nicht erreichbar
    #[error("Verbindungsfehler: {0}")]
    Verbindung(String),

    #[error("Nicht gefunden: {0}")]
    NichtGefunden(String),

    /// Der Server hat die Anfrage inhaltlich abgelehnt
    #[error("Vom Server abgelehnt: {0}")]
    Abgelehnt(String),
}

impl TransportError {
    pub fn ist_voruebergehend(&self) -> bool {
        matches!(self, Self::Verbindung(_))
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Ausgehende Server-Aufrufe
#[async_trait]
pub trait Transport: Send + Sync {
    /// Veroeffentlicht Identitaet und Signed-Pre-Key
    async fn publish_keys(
        &self,
        account: UserId,
        identity: IdentityPublicKey,
        signed_pre_key: SignedPreKeyPublic,
    ) -> TransportResult<()>;

    /// Verwirft alle noch unverbrauchten One-Time-Pre-Keys beim Server
    async fn clear_one_time_pre_keys(&self, account: UserId) -> TransportResult<()>;

    async fn upload_one_time_pre_keys(
        &self,
        account: UserId,
        keys: Vec<OneTimePreKeyPublic>,
    ) -> TransportResult<()>;

    /// Holt das Bundle eines Peers; der Server verbraucht dabei einen One-Time-Pre-Key
    async fn fetch_key_bundle(&self, peer: UserId) -> TransportResult<KeyBundle>;

    /// Stellt ein Envelope an `envelope.destination` zu
    async fn deliver_envelope(&self, envelope: &Envelope) -> TransportResult<()>;

    async fn channel_members(
        &self,
        server_id: ServerId,
        channel_id: ChannelId,
    ) -> TransportResult<Vec<UserId>>;

    async fn fetch_backup(&self, account: UserId) -> TransportResult<Option<KeyBackupBlob>>;

    async fn store_backup(&self, account: UserId, blob: KeyBackupBlob) -> TransportResult<()>;

    async fn delete_backup(&self, account: UserId) -> TransportResult<()>;
}

/// Vom Server gepushte Ereignisse
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Eingehendes Envelope (mit Server-ID)
    Envelope(Envelope),
    /// Server bestaetigt die aelteste offene Sendung mit dieser ID
    Bestaetigung(MessageId),
    /// Mitgliedschaft oder Schluessel haben sich geaendert
    Schluessel(SchluesselEreignis),
}
