//! Cache der paarweisen Sitzungen
//!
//! Pro Peer gibt es einen `PeerRecord`: eine aktuelle Sitzung und eine
//! begrenzte Liste frueherer Sitzungen, die noch Nachrichten entschluesseln
//! koennen. Der Cache schreibt immer zuerst in den KeyStore und
//! aktualisiert erst danach den Speicher.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use tresor_core::UserId;
use tresor_crypto::{RatchetMessage, RatchetSession};
use tresor_keystore::{KeyStore, KeyStoreExt, Mutation, RecordKey, RecordKind};

use crate::error::{SessionError, SessionResult};
use crate::locks::LockRegistry;

/// Alle Sitzungen mit einem Peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub current: RatchetSession,
    /// Neueste zuerst
    pub previous: VecDeque<RatchetSession>,
}

impl PeerRecord {
    pub fn neu(current: RatchetSession) -> Self {
        Self {
            current,
            previous: VecDeque::new(),
        }
    }

    /// Macht `session` zur aktuellen Sitzung und archiviert die bisherige
    pub fn ersetzen(&mut self, session: RatchetSession, max_frueher: usize) {
        let alt = std::mem::replace(&mut self.current, session);
        self.archivieren(alt, max_frueher);
    }

    /// Legt eine Sitzung in die Liste frueherer Sitzungen
    pub fn archivieren(&mut self, session: RatchetSession, max_frueher: usize) {
        self.previous.push_front(session);
        while self.previous.len() > max_frueher {
            if let Some(verworfen) = self.previous.pop_back() {
                if verworfen.has_received() || verworfen.skipped_count() > 0 {
                    warn!(
                        peer = %verworfen.remote_identity().fingerprint(),
                        "Fruehere Sitzung verworfen"
                    );
                }
            }
        }
    }

    /// Findet die Sitzung zu einer Handshake-ID
    pub fn finden(&self, handshake_id: &[u8; 32]) -> Option<&RatchetSession> {
        std::iter::once(&self.current)
            .chain(self.previous.iter())
            .find(|s| &s.handshake_id() == handshake_id)
    }

    fn finden_mut(&mut self, handshake_id: &[u8; 32]) -> Option<&mut RatchetSession> {
        if &self.current.handshake_id() == handshake_id {
            return Some(&mut self.current);
        }
        self.previous
            .iter_mut()
            .find(|s| &s.handshake_id() == handshake_id)
    }
}

pub struct RatchetSessionCache {
    account: UserId,
    store: Arc<dyn KeyStore>,
    locks: Arc<LockRegistry>,
    max_frueher: usize,
    sitzungen: DashMap<UserId, PeerRecord>,
}

impl RatchetSessionCache {
    pub fn neu(
        account: UserId,
        store: Arc<dyn KeyStore>,
        locks: Arc<LockRegistry>,
        max_frueher: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            account,
            store,
            locks,
            max_frueher,
            sitzungen: DashMap::new(),
        })
    }

    pub fn max_frueher(&self) -> usize {
        self.max_frueher
    }

    fn key(&self, peer: UserId) -> RecordKey {
        RecordKey::new(self.account, RecordKind::Session, peer.als_schluessel())
    }

    /// Liest den Datensatz eines Peers (Speicher, sonst KeyStore)
    pub async fn get(&self, peer: UserId) -> SessionResult<Option<PeerRecord>> {
        if let Some(record) = self.sitzungen.get(&peer) {
            return Ok(Some(record.clone()));
        }
        let geladen: Option<PeerRecord> = self.store.get_json(&self.key(peer)).await?;
        if let Some(record) = &geladen {
            self.sitzungen.insert(peer, record.clone());
        }
        Ok(geladen)
    }

    /// Schreibt einen Datensatz (erst KeyStore, dann Speicher)
    pub async fn put(&self, peer: UserId, record: PeerRecord) -> SessionResult<()> {
        self.put_mit(peer, record, Vec::new()).await
    }

    /// Wie `put`, aber zusammen mit weiteren Mutationen in einem Batch
    pub async fn put_mit(
        &self,
        peer: UserId,
        record: PeerRecord,
        weitere: Vec<Mutation>,
    ) -> SessionResult<()> {
        let mut batch = Vec::with_capacity(weitere.len() + 1);
        batch.push(Mutation::put_json(self.key(peer), &record)?);
        batch.extend(weitere);
        self.store.apply(batch).await?;
        self.sitzungen.insert(peer, record);
        Ok(())
    }

    /// Verwirft alle Sitzungen mit einem Peer
    pub async fn invalidate(&self, peer: UserId) -> SessionResult<()> {
        let _guard = self.locks.peer(peer).await;
        self.store.delete(&self.key(peer)).await?;
        self.sitzungen.remove(&peer);
        debug!(%peer, "Sitzung verworfen");
        Ok(())
    }

    /// Verwirft alle Sitzungen (nach Identitaetswechsel)
    pub async fn invalidate_all(&self) -> SessionResult<()> {
        self.store
            .apply(vec![Mutation::DeleteKind {
                account: self.account,
                kind: RecordKind::Session,
            }])
            .await?;
        self.sitzungen.clear();
        self.locks.aufraeumen();
        debug!("Alle Sitzungen verworfen");
        Ok(())
    }

    /// Nur den Speicher leeren (der KeyStore wurde bereits bereinigt)
    pub fn speicher_leeren(&self) {
        self.sitzungen.clear();
    }

    /// Markiert die aktuelle Sitzung als veraltet; der naechste Versand
    /// baut eine neue auf
    pub async fn mark_stale(&self, peer: UserId) -> SessionResult<bool> {
        let _guard = self.locks.peer(peer).await;
        let Some(mut record) = self.get(peer).await? else {
            return Ok(false);
        };
        record.current.mark_stale();
        self.put(peer, record).await?;
        Ok(true)
    }

    /// Verschluesselt mit der aktuellen Sitzung
    pub async fn encrypt(&self, peer: UserId, plaintext: &[u8]) -> SessionResult<RatchetMessage> {
        let _guard = self.locks.peer(peer).await;
        let mut record = self
            .get(peer)
            .await?
            .ok_or_else(|| SessionError::SessionNotFound(format!("keine Sitzung mit {peer}")))?;

        let message = record.current.encrypt(plaintext)?;
        self.put(peer, record).await?;
        Ok(message)
    }

    /// Entschluesselt mit der Sitzung, deren Handshake-ID die Nachricht traegt
    pub async fn decrypt(&self, peer: UserId, message: &RatchetMessage) -> SessionResult<Vec<u8>> {
        let _guard = self.locks.peer(peer).await;
        let mut record = self
            .get(peer)
            .await?
            .ok_or_else(|| SessionError::SessionNotFound(format!("keine Sitzung mit {peer}")))?;

        let session = record.finden_mut(&message.handshake_id).ok_or_else(|| {
            SessionError::SessionNotFound(format!("unbekannter Handshake von {peer}"))
        })?;
        let plaintext = session.decrypt(message)?;

        self.put(peer, record).await?;
        debug!(%peer, counter = message.counter, "Paarweise Nachricht entschluesselt");
        Ok(plaintext)
    }
}
