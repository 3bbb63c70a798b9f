//! Verteilung und Verwaltung der Sender-Keys pro Kanal
//!
//! Der eigene Sender-Key eines Kanals wird neu erzeugt, wenn
//! - noch keiner existiert,
//! - er invalidiert wurde (`MembershipChanged`, `SenderKeysChanged`), oder
//! - die aktuelle Mitgliederliste von der abweicht, an die er verteilt wurde.
//!
//! Die Verteilung laeuft paarweise verschluesselt an jedes Mitglied.
//! Empfangene Sender-Keys werden pro `(Kanal, Sender)` gespeichert, die
//! letzten `GENERATIONEN_BEHALTEN` Generationen bleiben lesbar.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use tresor_core::{ChannelId, ServerId, UserId};
use tresor_crypto::{SenderKeyDistribution, SenderKeyMessage, SenderKeyState};
use tresor_keystore::{KeyStore, KeyStoreExt, RecordKey, RecordKind};
use tresor_protocol::{Destination, Envelope, EnvelopeKind};

use crate::error::{SessionError, SessionResult};
use crate::establisher::SessionEstablisher;
use crate::locks::LockRegistry;
use crate::session_cache::RatchetSessionCache;
use crate::transport::Transport;

/// Wie viele Generationen eines fremden Senders lesbar bleiben
pub const GENERATIONEN_BEHALTEN: usize = 3;

/// Eigener Sender-Key eines Kanals
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EigenerSenderKey {
    pub server_id: ServerId,
    pub state: SenderKeyState,
    /// Mitglieder, fuer die diese Generation erzeugt wurde
    pub mitglieder: BTreeSet<UserId>,
    /// Mitglieder, denen die Verteilung bereits zugestellt wurde
    pub distributed_to: BTreeSet<UserId>,
    pub invalidated: bool,
}

/// Empfangene Generationen eines Senders (zuerst empfangene vorne)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmpfangeneSenderKeys {
    pub generations: VecDeque<SenderKeyState>,
}

pub struct SenderKeyDistributor {
    account: UserId,
    store: Arc<dyn KeyStore>,
    transport: Arc<dyn Transport>,
    establisher: Arc<SessionEstablisher>,
    cache: Arc<RatchetSessionCache>,
    locks: Arc<LockRegistry>,
}

impl SenderKeyDistributor {
    pub fn neu(
        account: UserId,
        store: Arc<dyn KeyStore>,
        transport: Arc<dyn Transport>,
        establisher: Arc<SessionEstablisher>,
        cache: Arc<RatchetSessionCache>,
        locks: Arc<LockRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            account,
            store,
            transport,
            establisher,
            cache,
            locks,
        })
    }

    fn eigener_key(&self, channel_id: ChannelId) -> RecordKey {
        RecordKey::new(self.account, RecordKind::SenderKeyOwn, channel_id.als_schluessel())
    }

    fn eingehender_key(&self, channel_id: ChannelId, sender: UserId) -> RecordKey {
        RecordKey::new(
            self.account,
            RecordKind::SenderKeyInbound,
            format!("{}/{}", channel_id.als_schluessel(), sender.als_schluessel()),
        )
    }

    /// Eigener Sender-Key eines Kanals (falls vorhanden)
    pub async fn eigener(&self, channel_id: ChannelId) -> SessionResult<Option<EigenerSenderKey>> {
        Ok(self.store.get_json(&self.eigener_key(channel_id)).await?)
    }

    /// Stellt sicher, dass alle `members` den aktuellen Sender-Key haben.
    ///
    /// Gibt die Generation des gueltigen Sender-Keys zurueck.
    pub async fn ensure_distributed(
        &self,
        server_id: ServerId,
        channel_id: ChannelId,
        members: &[UserId],
    ) -> SessionResult<u32> {
        let _guard = self.locks.kanal(channel_id).await;
        Ok(self
            .sicherstellen(server_id, channel_id, members)
            .await?
            .state
            .generation())
    }

    /// Muss unter der Kanal-Sperre laufen.
    ///
    /// Eine neue Generation wird vor der ersten Zustellung persistiert.
    /// Scheitert die Verteilung an einem Mitglied, liefert der naechste
    /// Aufruf denselben Key an die noch fehlenden Mitglieder nach.
    async fn sicherstellen(
        &self,
        server_id: ServerId,
        channel_id: ChannelId,
        members: &[UserId],
    ) -> SessionResult<EigenerSenderKey> {
        let empfaenger: BTreeSet<UserId> = members
            .iter()
            .copied()
            .filter(|m| *m != self.account)
            .collect();
        let key = self.eigener_key(channel_id);

        let mut eigen = match self.eigener(channel_id).await? {
            Some(eigen) if !eigen.invalidated && eigen.mitglieder == empfaenger => {
                if eigen.distributed_to == empfaenger {
                    return Ok(eigen);
                }
                eigen
            }
            bisher => {
                let generation = bisher
                    .as_ref()
                    .map_or(1, |e| e.state.generation().wrapping_add(1));
                let eigen = EigenerSenderKey {
                    server_id,
                    state: SenderKeyState::generate(channel_id, self.account, generation),
                    mitglieder: empfaenger,
                    distributed_to: BTreeSet::new(),
                    invalidated: false,
                };
                self.store.put_json(&key, &eigen).await?;
                debug!(%channel_id, generation, "Neue Sender-Key-Generation");
                eigen
            }
        };

        let verteilung = eigen.state.distribution().to_bytes()?;
        let offen: Vec<UserId> = eigen
            .mitglieder
            .difference(&eigen.distributed_to)
            .copied()
            .collect();
        for member in offen {
            self.zustellen(member, &verteilung).await?;
            eigen.distributed_to.insert(member);
            self.store.put_json(&key, &eigen).await?;
        }

        info!(
            %channel_id,
            generation = eigen.state.generation(),
            mitglieder = eigen.distributed_to.len(),
            "Sender-Key verteilt"
        );
        Ok(eigen)
    }

    async fn zustellen(&self, member: UserId, verteilung: &[u8]) -> SessionResult<()> {
        self.establisher.ensure_session(member).await?;
        let nachricht = self.cache.encrypt(member, verteilung).await?;
        let envelope = Envelope::new(
            self.account,
            Destination::user(member),
            EnvelopeKind::SenderKeyDistribution,
            nachricht.to_bytes()?,
        );
        self.transport.deliver_envelope(&envelope).await?;
        Ok(())
    }

    /// Verschluesselt eine Kanalnachricht; verteilt vorher bei Bedarf neu
    pub async fn encrypt(
        &self,
        server_id: ServerId,
        channel_id: ChannelId,
        plaintext: &[u8],
    ) -> SessionResult<SenderKeyMessage> {
        let members = self.transport.channel_members(server_id, channel_id).await?;
        let _guard = self.locks.kanal(channel_id).await;

        let mut eigen = self.sicherstellen(server_id, channel_id, &members).await?;
        let nachricht = eigen.state.encrypt(plaintext)?;
        self.store
            .put_json(&self.eigener_key(channel_id), &eigen)
            .await?;
        Ok(nachricht)
    }

    /// Markiert den eigenen Sender-Key als ungueltig (Neuverteilung beim naechsten Senden)
    pub async fn invalidate(&self, channel_id: ChannelId) -> SessionResult<bool> {
        let _guard = self.locks.kanal(channel_id).await;
        let Some(mut eigen) = self.eigener(channel_id).await? else {
            return Ok(false);
        };
        if !eigen.invalidated {
            eigen.invalidated = true;
            self.store
                .put_json(&self.eigener_key(channel_id), &eigen)
                .await?;
            debug!(%channel_id, generation = eigen.state.generation(), "Sender-Key invalidiert");
        }
        Ok(true)
    }

    /// `MembershipChanged`: invalidiert die Sender-Keys aller Kanaele des Servers
    pub async fn handle_membership_changed(&self, server_id: ServerId) -> SessionResult<usize> {
        let eigene: Vec<(String, EigenerSenderKey)> = self
            .store
            .list_json(self.account, RecordKind::SenderKeyOwn)
            .await?;

        let mut anzahl = 0;
        for (_, eigen) in eigene.into_iter().filter(|(_, e)| e.server_id == server_id) {
            if self.invalidate(eigen.state.channel_id()).await? {
                anzahl += 1;
            }
        }
        info!(%server_id, kanaele = anzahl, "Mitgliedschaft geaendert");
        Ok(anzahl)
    }

    /// `SenderKeysChanged`: ohne Sender oder fuer uns selbst wird neu verteilt.
    /// Neue Keys anderer Sender kommen ueber ihre Verteilungs-Envelopes.
    pub async fn handle_sender_keys_changed(
        &self,
        channel_id: ChannelId,
        sender: Option<UserId>,
    ) -> SessionResult<bool> {
        match sender {
            Some(anderer) if anderer != self.account => {
                debug!(%channel_id, sender = %anderer, "Neue Sender-Keys angekuendigt");
                Ok(false)
            }
            _ => self.invalidate(channel_id).await,
        }
    }

    /// Ein Peer hat seine Sitzungen verloren und kennt unsere Sender-Keys
    /// nicht mehr. Der naechste Versand liefert ihm den aktuellen Key nach.
    pub async fn peer_zurueckgesetzt(&self, peer: UserId) -> SessionResult<usize> {
        let eigene: Vec<(String, EigenerSenderKey)> = self
            .store
            .list_json(self.account, RecordKind::SenderKeyOwn)
            .await?;

        let mut anzahl = 0;
        for (_, eigen) in eigene.into_iter().filter(|(_, e)| e.distributed_to.contains(&peer)) {
            let channel_id = eigen.state.channel_id();
            let _guard = self.locks.kanal(channel_id).await;
            let Some(mut aktuell) = self.eigener(channel_id).await? else {
                continue;
            };
            if aktuell.distributed_to.remove(&peer) {
                self.store
                    .put_json(&self.eigener_key(channel_id), &aktuell)
                    .await?;
                anzahl += 1;
            }
        }
        if anzahl > 0 {
            debug!(%peer, kanaele = anzahl, "Sender-Keys werden nachgeliefert");
        }
        Ok(anzahl)
    }

    /// Speichert eine empfangene Verteilung.
    ///
    /// Eine bekannte Generation mit anderem Signaturschluessel ersetzt die
    /// gespeicherte (der Sender hat sein Schluesselmaterial verloren und
    /// neu begonnen). Verdraengt wird nach Eingangsreihenfolge.
    pub async fn receive_distribution(
        &self,
        from: UserId,
        verteilung: &SenderKeyDistribution,
    ) -> SessionResult<()> {
        if verteilung.sender != from {
            return Err(SessionError::UndecryptableMessage(format!(
                "Sender-Key von {} wurde von {from} verteilt",
                verteilung.sender
            )));
        }
        let channel_id = verteilung.channel_id;
        let _guard = self.locks.eingehend(channel_id, from).await;

        let key = self.eingehender_key(channel_id, from);
        let mut empfangen: EmpfangeneSenderKeys =
            self.store.get_json(&key).await?.unwrap_or_default();

        if empfangen.generations.iter().any(|s| s.passt_zu(verteilung)) {
            debug!(%channel_id, %from, generation = verteilung.generation, "Verteilung bereits bekannt");
            return Ok(());
        }
        let vorher = empfangen.generations.len();
        empfangen
            .generations
            .retain(|s| s.generation() != verteilung.generation);
        if empfangen.generations.len() != vorher {
            warn!(%channel_id, %from, generation = verteilung.generation, "Sender-Key ersetzt");
        }

        empfangen
            .generations
            .push_back(SenderKeyState::from_distribution(verteilung));
        while empfangen.generations.len() > GENERATIONEN_BEHALTEN {
            empfangen.generations.pop_front();
        }
        self.store.put_json(&key, &empfangen).await?;

        info!(%channel_id, %from, generation = verteilung.generation, "Sender-Key empfangen");
        Ok(())
    }

    /// Entschluesselt eine Kanalnachricht eines anderen Mitglieds
    pub async fn decrypt(&self, from: UserId, nachricht: &SenderKeyMessage) -> SessionResult<Vec<u8>> {
        if nachricht.sender != from {
            return Err(SessionError::UndecryptableMessage(
                "Absender passt nicht zum Sender-Key".into(),
            ));
        }
        let channel_id = nachricht.channel_id;
        let _guard = self.locks.eingehend(channel_id, from).await;

        let key = self.eingehender_key(channel_id, from);
        let mut empfangen: EmpfangeneSenderKeys =
            self.store.get_json(&key).await?.unwrap_or_default();

        let state = empfangen
            .generations
            .iter_mut()
            .find(|s| s.generation() == nachricht.generation)
            .ok_or_else(|| {
                SessionError::SessionNotFound(format!(
                    "Sender-Key {channel_id}/{from} Generation {}",
                    nachricht.generation
                ))
            })?;

        let plaintext = state.decrypt(nachricht)?;
        self.store.put_json(&key, &empfangen).await?;
        Ok(plaintext)
    }
}
