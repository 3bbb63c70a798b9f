//! Aufbau paarweiser Sitzungen (X3DH)
//!
//! Gleichzeitige Handshakes beider Seiten werden ohne Koordinator
//! aufgeloest: Hat die eigene aktuelle Sitzung noch nichts empfangen,
//! gewinnt auf beiden Seiten die Sitzung mit der kleineren Handshake-ID.
//! Die unterlegene Sitzung wird archiviert und kann ihre bereits
//! gesendeten Nachrichten weiterhin entschluesseln.

use std::sync::Arc;

use tracing::{debug, info, warn};
use tresor_core::UserId;
use tresor_crypto::e2e::x3dh;
use tresor_crypto::{CryptoError, KeyBundle, PreKeyHeader, RatchetSession, SessionRole};

use crate::error::{SessionError, SessionResult};
use crate::key_lifecycle::KeyLifecycleManager;
use crate::locks::LockRegistry;
use crate::session_cache::{PeerRecord, RatchetSessionCache};
use crate::transport::Transport;

/// Ergebnis eines eingehenden Handshakes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Antwort {
    /// Neue Sitzung angelegt
    Neu { handshake_id: [u8; 32] },
    /// Handshake war schon bekannt (Replay oder erneute Zustellung)
    Bekannt { handshake_id: [u8; 32] },
}

pub struct SessionEstablisher {
    lifecycle: Arc<KeyLifecycleManager>,
    cache: Arc<RatchetSessionCache>,
    transport: Arc<dyn Transport>,
    locks: Arc<LockRegistry>,
}

impl SessionEstablisher {
    pub fn neu(
        lifecycle: Arc<KeyLifecycleManager>,
        cache: Arc<RatchetSessionCache>,
        transport: Arc<dyn Transport>,
        locks: Arc<LockRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            lifecycle,
            cache,
            transport,
            locks,
        })
    }

    /// Stellt sicher, dass eine nutzbare Sitzung mit `peer` existiert.
    ///
    /// Holt nur dann ein Bundle, wenn keine Sitzung existiert oder die
    /// aktuelle als veraltet markiert ist.
    pub async fn ensure_session(&self, peer: UserId) -> SessionResult<[u8; 32]> {
        {
            let _guard = self.locks.peer(peer).await;
            if let Some(record) = self.cache.get(peer).await? {
                if !record.current.is_stale() {
                    return Ok(record.current.handshake_id());
                }
            }
        }

        let bundle = self.transport.fetch_key_bundle(peer).await?;
        self.initiate(&bundle).await
    }

    /// Initiator-Seite: leitet eine Sitzung aus dem Bundle des Peers ab.
    ///
    /// Eine bestehende, nicht veraltete Sitzung wird nicht ersetzt; dann
    /// wird deren Handshake-ID zurueckgegeben.
    pub async fn initiate(&self, bundle: &KeyBundle) -> SessionResult<[u8; 32]> {
        let peer = bundle.user_id;
        let keys = self.lifecycle.keys()?;
        let _guard = self.locks.peer(peer).await;

        let bestehend = self.cache.get(peer).await?;
        if let Some(record) = &bestehend {
            if !record.current.is_stale() {
                debug!(%peer, "Sitzung besteht bereits, Bundle ignoriert");
                return Ok(record.current.handshake_id());
            }
        }

        let (secret, header) = x3dh::initiate(&keys.identity, bundle).map_err(|e| match e {
            CryptoError::SignaturVerifikation(grund) => SessionError::InvalidKeyBundle { peer, grund },
            other => SessionError::from(other),
        })?;
        let session = RatchetSession::from_handshake(
            &secret,
            SessionRole::Initiator,
            bundle.identity,
            Some(header),
        )?;
        let handshake_id = session.handshake_id();

        let record = match bestehend {
            Some(mut record) => {
                record.ersetzen(session, self.cache.max_frueher());
                record
            }
            None => PeerRecord::neu(session),
        };
        self.cache.put(peer, record).await?;

        info!(
            %peer,
            one_time = bundle.one_time_pre_key.is_some(),
            "Sitzung initiiert"
        );
        Ok(handshake_id)
    }

    /// Responder-Seite: leitet die Sitzung aus dem Pre-Key-Kopf ab.
    ///
    /// Ein bereits bekannter Handshake aendert nichts. Ein verbrauchter
    /// One-Time-Pre-Key fuehrt zu `StaleOneTimePreKey`.
    pub async fn respond(&self, sender: UserId, header: &PreKeyHeader) -> SessionResult<Antwort> {
        let keys = self.lifecycle.keys()?;
        let _guard = self.locks.peer(sender).await;
        let handshake_id = header.ephemeral;

        let bestehend = self.cache.get(sender).await?;
        if let Some(record) = &bestehend {
            if record.finden(&handshake_id).is_some() {
                debug!(%sender, "Handshake bereits bekannt");
                return Ok(Antwort::Bekannt { handshake_id });
            }
        }

        let one_time = match header.one_time_pre_key_id {
            Some(id) => Some(self.lifecycle.peek_one_time_pre_key(id).await?),
            None => None,
        };
        let secret = x3dh::respond(
            &keys.identity,
            &keys.signed_pre_key,
            one_time.as_ref(),
            header,
        )?;
        let session = RatchetSession::from_handshake(
            &secret,
            SessionRole::Responder,
            header.initiator,
            None,
        )?;

        let max = self.cache.max_frueher();
        let record = match bestehend {
            None => PeerRecord::neu(session),
            Some(mut record) => {
                if record.current.remote_identity() != &header.initiator {
                    warn!(%sender, "Peer-Identitaet hat sich geaendert");
                }
                let gleichzeitig = record.current.role() == SessionRole::Initiator
                    && !record.current.has_received();
                if gleichzeitig && record.current.handshake_id() < handshake_id {
                    // Eigene Sitzung gewinnt, die eingehende bleibt lesbar
                    debug!(%sender, "Gleichzeitiger Handshake, eigene Sitzung bleibt");
                    record.archivieren(session, max);
                } else {
                    record.ersetzen(session, max);
                }
                record
            }
        };

        let verbrauchen = header
            .one_time_pre_key_id
            .map(|id| self.lifecycle.verbrauchen(id))
            .into_iter()
            .collect();
        self.cache.put_mit(sender, record, verbrauchen).await?;

        info!(%sender, "Sitzung aus eingehendem Handshake");
        Ok(Antwort::Neu { handshake_id })
    }
}
