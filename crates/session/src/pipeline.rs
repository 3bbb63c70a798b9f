//! Nachrichten-Pipeline: Verschluesseln, Bestaetigen, Entschluesseln
//!
//! ## Ausgehend (optimistisches Echo)
//! 1. Klartext verschluesseln (paarweise oder Sender-Key)
//! 2. Provisorischen Eintrag unter einer Korrelations-ID einreihen (FIFO)
//! 3. Envelope zustellen
//! 4. `acknowledge(server_id)` nimmt den aeltesten offenen Eintrag und
//!    legt den Klartext dauerhaft unter der Server-ID im Cache ab
//!
//! ## Eingehend
//! Dedup -> Entschluesseln -> `Decrypted`; bei Fehler Klartext-Cache ->
//! `CacheHit`; sonst `Undecryptable`. Fehlt Schluesselmaterial, wird das
//! Envelope zurueckgestellt und beim Eintreffen einer Verteilung oder
//! einer neuen Sitzung erneut versucht.
//!
//! Kennt der Empfaenger die paarweise Sitzung eines Absenders nicht (etwa
//! nach einer Wiederherstellung aus dem Backup), baut er eine neue auf und
//! schickt dem Absender ein `SessionReset`-Envelope.
//!
//! Alle Puffer sind begrenzt und verdraengen den aeltesten Eintrag zuerst.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use tresor_core::config::PipelineEinstellungen;
use tresor_core::{ChannelId, MessageId, UserId};
use tresor_crypto::{RatchetMessage, SenderKeyDistribution, SenderKeyMessage, SessionRole};
use tresor_keystore::{KeyStore, KeyStoreExt, Mutation, RecordKey, RecordKind};
use tresor_protocol::{Destination, Envelope, EnvelopeKind};
use uuid::Uuid;

use crate::error::{SessionError, SessionResult};
use crate::establisher::{Antwort, SessionEstablisher};
use crate::sender_keys::SenderKeyDistributor;
use crate::session_cache::RatchetSessionCache;
use crate::transport::Transport;

/// Ergebnis von `encrypt_outgoing`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ausgehend {
    pub correlation_id: Uuid,
    pub envelope: Envelope,
}

/// Ergebnis von `acknowledge`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    pub correlation_id: Uuid,
    pub server_id: MessageId,
}

/// Nachtraeglich entschluesselte Nachricht aus der Wiederholungs-Warteschlange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wiederhergestellt {
    pub envelope: Envelope,
    pub text: String,
}

/// Ergebnis von `decrypt_incoming`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptResult {
    Decrypted(String),
    CacheHit(String),
    Undecryptable {
        reason: String,
    },
    /// Ein Sender-Key wurde empfangen; zurueckgestellte Nachrichten wurden erneut versucht
    KeyMaterial {
        channel_id: ChannelId,
        sender: UserId,
        recovered: Vec<Wiederhergestellt>,
    },
    /// Der Peer hat eine neue Sitzung aufgebaut, weil ihm unsere fehlte
    SessionRefreshed { peer: UserId },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KlartextEintrag {
    sequenz: u64,
    sender: UserId,
    text: String,
    gespeichert: DateTime<Utc>,
}

#[derive(Debug)]
struct Provisorisch {
    correlation_id: Uuid,
    text: String,
}

#[derive(Debug, Default)]
struct Zustand {
    offen: VecDeque<Provisorisch>,
    gesehen: HashSet<MessageId>,
    gesehen_reihenfolge: VecDeque<MessageId>,
    klartext_reihenfolge: VecDeque<MessageId>,
    naechste_sequenz: u64,
    wiederholung: VecDeque<Envelope>,
    /// Nach einer neuen Sitzung nachtraeglich entschluesselt, noch nicht abgeholt
    nachgeholt: Vec<Wiederhergestellt>,
}

enum Inhalt {
    Text { text: String, neue_sitzung: bool },
    Verteilung(SenderKeyDistribution),
    Neuaufbau { neue_sitzung: bool },
}

pub struct MessagePipeline {
    account: UserId,
    store: Arc<dyn KeyStore>,
    transport: Arc<dyn Transport>,
    cache: Arc<RatchetSessionCache>,
    establisher: Arc<SessionEstablisher>,
    sender_keys: Arc<SenderKeyDistributor>,
    config: PipelineEinstellungen,
    zustand: Mutex<Zustand>,
    /// Haelt Zustellreihenfolge == Reihenfolge der offenen Bestaetigungen.
    /// Umfasst nur Einreihen und Zustellen, nicht die Verschluesselung.
    senden: tokio::sync::Mutex<()>,
}

impl MessagePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn neu(
        account: UserId,
        store: Arc<dyn KeyStore>,
        transport: Arc<dyn Transport>,
        cache: Arc<RatchetSessionCache>,
        establisher: Arc<SessionEstablisher>,
        sender_keys: Arc<SenderKeyDistributor>,
        config: PipelineEinstellungen,
    ) -> Arc<Self> {
        Arc::new(Self {
            account,
            store,
            transport,
            cache,
            establisher,
            sender_keys,
            config,
            zustand: Mutex::new(Zustand::default()),
            senden: tokio::sync::Mutex::new(()),
        })
    }

    fn klartext_key(&self, id: MessageId) -> RecordKey {
        RecordKey::new(self.account, RecordKind::PlaintextCache, id.als_schluessel())
    }

    /// Liest die Reihenfolge des persistierten Klartext-Caches ein
    pub async fn klartext_index_laden(&self) -> SessionResult<usize> {
        let mut eintraege: Vec<(String, KlartextEintrag)> = self
            .store
            .list_json(self.account, RecordKind::PlaintextCache)
            .await?;
        eintraege.sort_by_key(|(_, e)| e.sequenz);

        let mut reihenfolge = VecDeque::with_capacity(eintraege.len());
        let mut naechste = 0;
        for (id, eintrag) in &eintraege {
            match id.parse() {
                Ok(uuid) => reihenfolge.push_back(MessageId(uuid)),
                Err(_) => warn!(id = %id, "Ungueltige ID im Klartext-Cache"),
            }
            naechste = naechste.max(eintrag.sequenz + 1);
        }

        let anzahl = reihenfolge.len();
        let mut z = self.zustand.lock();
        z.klartext_reihenfolge = reihenfolge;
        z.naechste_sequenz = naechste;
        Ok(anzahl)
    }

    // -----------------------------------------------------------------------
    // Ausgehend
    // -----------------------------------------------------------------------

    /// Verschluesselt, reiht provisorisch ein und stellt zu
    pub async fn encrypt_outgoing(
        &self,
        destination: Destination,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> SessionResult<Ausgehend> {
        let (kind, ciphertext) = match destination {
            Destination::User { user_id } => {
                self.establisher.ensure_session(user_id).await?;
                let nachricht = self.cache.encrypt(user_id, text.as_bytes()).await?;
                let kind = if nachricht.pre_key.is_some() {
                    EnvelopeKind::PreKey
                } else {
                    EnvelopeKind::Ratchet
                };
                (kind, nachricht.to_bytes()?)
            }
            Destination::Channel {
                server_id,
                channel_id,
            } => {
                let nachricht = self
                    .sender_keys
                    .encrypt(server_id, channel_id, text.as_bytes())
                    .await?;
                (EnvelopeKind::SenderKey, nachricht.to_bytes()?)
            }
        };

        let envelope =
            Envelope::new(self.account, destination, kind, ciphertext).with_reply_to(reply_to);
        let correlation_id = Uuid::new_v4();

        let _senden = self.senden.lock().await;
        {
            let mut z = self.zustand.lock();
            z.offen.push_back(Provisorisch {
                correlation_id,
                text: text.to_string(),
            });
            while z.offen.len() > self.config.offene_bestaetigungen {
                if let Some(verworfen) = z.offen.pop_front() {
                    warn!(correlation_id = %verworfen.correlation_id, "Offene Sendung verdraengt");
                }
            }
        }

        if let Err(e) = self.transport.deliver_envelope(&envelope).await {
            self.zustand
                .lock()
                .offen
                .retain(|p| p.correlation_id != correlation_id);
            return Err(e.into());
        }

        debug!(%correlation_id, ziel = %destination.bezeichnung(), ?kind, "Nachricht gesendet");
        Ok(Ausgehend {
            correlation_id,
            envelope,
        })
    }

    /// Ordnet die aelteste offene Sendung der Server-ID zu
    pub async fn acknowledge(&self, server_id: MessageId) -> SessionResult<Reconciled> {
        let provisorisch = self
            .zustand
            .lock()
            .offen
            .pop_front()
            .ok_or(SessionError::UnexpectedAcknowledgement(server_id))?;

        if let Err(e) = self
            .klartext_speichern(server_id, self.account, &provisorisch.text)
            .await
        {
            // Nicht bestaetigt: wieder vorne einreihen
            self.zustand.lock().offen.push_front(provisorisch);
            return Err(e);
        }

        debug!(correlation_id = %provisorisch.correlation_id, %server_id, "Sendung bestaetigt");
        Ok(Reconciled {
            correlation_id: provisorisch.correlation_id,
            server_id,
        })
    }

    // -----------------------------------------------------------------------
    // Eingehend
    // -----------------------------------------------------------------------

    /// Entschluesselt ein eingehendes Envelope
    pub async fn decrypt_incoming(&self, envelope: &Envelope) -> SessionResult<DecryptResult> {
        if let Some(id) = envelope.message_id {
            if self.zustand.lock().gesehen.contains(&id) {
                return match self.klartext_lesen(id).await? {
                    Some(text) => Ok(DecryptResult::CacheHit(text)),
                    None => Err(SessionError::Duplicate),
                };
            }
        }

        if envelope.sender == self.account {
            return self
                .cache_oder_fehler(envelope, "eigene Nachricht ohne Cache-Eintrag".into())
                .await;
        }

        match self.entschluesseln(envelope).await {
            Ok(Inhalt::Text { text, neue_sitzung }) => {
                self.verarbeitet(envelope, &text).await?;
                if neue_sitzung {
                    let sender = envelope.sender;
                    let nachgeholt = self
                        .wiederholen(|e| e.sender == sender && e.kind != EnvelopeKind::SenderKey)
                        .await?;
                    self.zustand.lock().nachgeholt.extend(nachgeholt);
                }
                Ok(DecryptResult::Decrypted(text))
            }
            Ok(Inhalt::Neuaufbau { neue_sitzung }) => {
                if let Some(id) = envelope.message_id {
                    self.merken(id);
                }
                let peer = envelope.sender;
                self.sender_keys.peer_zurueckgesetzt(peer).await?;
                if neue_sitzung {
                    let nachgeholt = self
                        .wiederholen(|e| e.sender == peer && e.kind != EnvelopeKind::SenderKey)
                        .await?;
                    self.zustand.lock().nachgeholt.extend(nachgeholt);
                }
                info!(%peer, "Peer hat die Sitzung neu aufgebaut");
                Ok(DecryptResult::SessionRefreshed { peer })
            }
            Ok(Inhalt::Verteilung(verteilung)) => {
                if let Some(id) = envelope.message_id {
                    self.merken(id);
                }
                let channel_id = verteilung.channel_id;
                let sender = verteilung.sender;
                let recovered = self
                    .wiederholen(|e| {
                        e.kind == EnvelopeKind::SenderKey
                            && e.sender == sender
                            && matches!(e.destination, Destination::Channel { channel_id: c, .. } if c == channel_id)
                    })
                    .await?;
                Ok(DecryptResult::KeyMaterial {
                    channel_id,
                    sender,
                    recovered,
                })
            }
            Err(e @ SessionError::StorageFailure(_)) => Err(e),
            Err(e) => {
                if matches!(e, SessionError::SessionNotFound(_)) {
                    self.zurueckstellen(envelope.clone());
                    if envelope.kind != EnvelopeKind::SenderKey {
                        if let Err(fehler) = self.neu_aushandeln(envelope.sender).await {
                            warn!(sender = %envelope.sender, %fehler, "Neuaufbau der Sitzung fehlgeschlagen");
                        }
                    }
                }
                if let Some(id) = envelope.message_id {
                    if let Some(text) = self.klartext_lesen(id).await? {
                        return Ok(DecryptResult::CacheHit(text));
                    }
                }
                if matches!(e, SessionError::Duplicate) {
                    return Err(e);
                }
                debug!(sender = %envelope.sender, fehler = %e, "Nicht entschluesselbar");
                Ok(DecryptResult::Undecryptable {
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Baut eine neue Sitzung mit `peer` auf und kuendigt sie mit einem
    /// `SessionReset` an. Wartet bereits eine selbst initiierte, noch
    /// unbeantwortete Sitzung, passiert nichts.
    async fn neu_aushandeln(&self, peer: UserId) -> SessionResult<()> {
        if let Some(record) = self.cache.get(peer).await? {
            let aktuell = &record.current;
            if aktuell.role() == SessionRole::Initiator
                && !aktuell.has_received()
                && !aktuell.is_stale()
            {
                debug!(%peer, "Neue Sitzung bereits angekuendigt");
                return Ok(());
            }
            self.cache.mark_stale(peer).await?;
        }

        self.establisher.ensure_session(peer).await?;
        let nachricht = self.cache.encrypt(peer, &[]).await?;
        let envelope = Envelope::new(
            self.account,
            Destination::user(peer),
            EnvelopeKind::SessionReset,
            nachricht.to_bytes()?,
        );
        self.transport.deliver_envelope(&envelope).await?;
        info!(%peer, "Sitzung neu aufgebaut");
        Ok(())
    }

    /// Nachrichten, die durch eine neue paarweise Sitzung lesbar wurden
    pub fn nachgeholte_abholen(&self) -> Vec<Wiederhergestellt> {
        std::mem::take(&mut self.zustand.lock().nachgeholt)
    }

    /// Versucht alle zurueckgestellten Envelopes erneut
    pub async fn retry_pending(&self) -> SessionResult<Vec<Wiederhergestellt>> {
        self.wiederholen(|_| true).await
    }

    async fn entschluesseln(&self, envelope: &Envelope) -> SessionResult<Inhalt> {
        match envelope.kind {
            EnvelopeKind::PreKey | EnvelopeKind::Ratchet => {
                let (bytes, neue_sitzung) = self.paarweise(envelope).await?;
                Ok(Inhalt::Text {
                    text: utf8(bytes)?,
                    neue_sitzung,
                })
            }
            EnvelopeKind::SessionReset => {
                let (_, neue_sitzung) = self.paarweise(envelope).await?;
                Ok(Inhalt::Neuaufbau { neue_sitzung })
            }
            EnvelopeKind::SenderKeyDistribution => {
                let (bytes, _) = self.paarweise(envelope).await?;
                let verteilung = SenderKeyDistribution::from_bytes(&bytes)?;
                self.sender_keys
                    .receive_distribution(envelope.sender, &verteilung)
                    .await?;
                Ok(Inhalt::Verteilung(verteilung))
            }
            EnvelopeKind::SenderKey => {
                let nachricht = SenderKeyMessage::from_bytes(&envelope.ciphertext)?;
                match envelope.destination {
                    Destination::Channel { channel_id, .. } if channel_id == nachricht.channel_id => {}
                    _ => {
                        return Err(SessionError::UndecryptableMessage(
                            "Kanal passt nicht zum Envelope".into(),
                        ))
                    }
                }
                let bytes = self.sender_keys.decrypt(envelope.sender, &nachricht).await?;
                Ok(Inhalt::Text {
                    text: utf8(bytes)?,
                    neue_sitzung: false,
                })
            }
        }
    }

    /// Gibt zusaetzlich zurueck, ob dabei eine neue Sitzung entstanden ist
    async fn paarweise(&self, envelope: &Envelope) -> SessionResult<(Vec<u8>, bool)> {
        let nachricht = RatchetMessage::from_bytes(&envelope.ciphertext)?;
        let mut neu = false;
        if let Some(header) = &nachricht.pre_key {
            if let Antwort::Neu { handshake_id } =
                self.establisher.respond(envelope.sender, header).await?
            {
                debug!(sender = %envelope.sender, id = %kurz(&handshake_id), "Eingehende Sitzung angenommen");
                neu = true;
            }
        }
        let bytes = self.cache.decrypt(envelope.sender, &nachricht).await?;
        Ok((bytes, neu))
    }

    async fn cache_oder_fehler(
        &self,
        envelope: &Envelope,
        reason: String,
    ) -> SessionResult<DecryptResult> {
        if let Some(id) = envelope.message_id {
            if let Some(text) = self.klartext_lesen(id).await? {
                return Ok(DecryptResult::CacheHit(text));
            }
        }
        Ok(DecryptResult::Undecryptable { reason })
    }

    async fn verarbeitet(&self, envelope: &Envelope, text: &str) -> SessionResult<()> {
        if let Some(id) = envelope.message_id {
            self.klartext_speichern(id, envelope.sender, text).await?;
            self.merken(id);
        }
        Ok(())
    }

    async fn wiederholen<F>(&self, passt: F) -> SessionResult<Vec<Wiederhergestellt>>
    where
        F: Fn(&Envelope) -> bool,
    {
        let kandidaten: Vec<Envelope> = {
            let mut z = self.zustand.lock();
            let (treffer, rest): (VecDeque<_>, VecDeque<_>) =
                z.wiederholung.drain(..).partition(|e| passt(e));
            z.wiederholung = rest;
            treffer.into()
        };

        let mut wiederhergestellt = Vec::new();
        for envelope in kandidaten {
            match self.entschluesseln(&envelope).await {
                Ok(Inhalt::Text { text, .. }) => {
                    self.verarbeitet(&envelope, &text).await?;
                    wiederhergestellt.push(Wiederhergestellt { envelope, text });
                }
                Ok(Inhalt::Verteilung(verteilung)) => {
                    debug!(channel_id = %verteilung.channel_id, "Verzoegerte Verteilung uebernommen");
                }
                Ok(Inhalt::Neuaufbau { .. }) => {}
                Err(SessionError::SessionNotFound(_)) => self.zurueckstellen(envelope),
                Err(e @ SessionError::StorageFailure(_)) => return Err(e),
                Err(e) => {
                    debug!(sender = %envelope.sender, fehler = %e, "Zurueckgestellte Nachricht verworfen");
                }
            }
        }
        if !wiederhergestellt.is_empty() {
            debug!(anzahl = wiederhergestellt.len(), "Zurueckgestellte Nachrichten entschluesselt");
        }
        Ok(wiederhergestellt)
    }

    // -----------------------------------------------------------------------
    // Begrenzte Puffer
    // -----------------------------------------------------------------------

    fn merken(&self, id: MessageId) {
        let mut z = self.zustand.lock();
        if z.gesehen.insert(id) {
            z.gesehen_reihenfolge.push_back(id);
        }
        while z.gesehen_reihenfolge.len() > self.config.dedup_fenster {
            if let Some(alt) = z.gesehen_reihenfolge.pop_front() {
                z.gesehen.remove(&alt);
            }
        }
    }

    fn zurueckstellen(&self, envelope: Envelope) {
        let mut z = self.zustand.lock();
        z.wiederholung.push_back(envelope);
        while z.wiederholung.len() > self.config.wiederholungs_warteschlange {
            if let Some(verworfen) = z.wiederholung.pop_front() {
                warn!(sender = %verworfen.sender, "Zurueckgestellte Nachricht verdraengt");
            }
        }
    }

    async fn klartext_lesen(&self, id: MessageId) -> SessionResult<Option<String>> {
        Ok(self
            .store
            .get_json::<KlartextEintrag>(&self.klartext_key(id))
            .await?
            .map(|e| e.text))
    }

    async fn klartext_speichern(
        &self,
        id: MessageId,
        sender: UserId,
        text: &str,
    ) -> SessionResult<()> {
        let (sequenz, verdraengt) = {
            let mut z = self.zustand.lock();
            let sequenz = z.naechste_sequenz;
            z.naechste_sequenz += 1;
            let vorhanden = z.klartext_reihenfolge.contains(&id);
            let neu_anzahl = z.klartext_reihenfolge.len() + usize::from(!vorhanden);
            let ueberschuss = neu_anzahl.saturating_sub(self.config.klartext_cache);
            let verdraengt: Vec<MessageId> = z
                .klartext_reihenfolge
                .iter()
                .filter(|alt| **alt != id)
                .take(ueberschuss)
                .copied()
                .collect();
            (sequenz, verdraengt)
        };

        let eintrag = KlartextEintrag {
            sequenz,
            sender,
            text: text.to_string(),
            gespeichert: Utc::now(),
        };
        let mut batch = vec![Mutation::put_json(self.klartext_key(id), &eintrag)?];
        batch.extend(verdraengt.iter().map(|alt| Mutation::Delete {
            key: self.klartext_key(*alt),
        }));
        self.store.apply(batch).await?;

        let mut z = self.zustand.lock();
        z.klartext_reihenfolge
            .retain(|alt| *alt != id && !verdraengt.contains(alt));
        z.klartext_reihenfolge.push_back(id);
        Ok(())
    }

    pub fn offene_bestaetigungen(&self) -> usize {
        self.zustand.lock().offen.len()
    }

    pub fn zurueckgestellt(&self) -> usize {
        self.zustand.lock().wiederholung.len()
    }

    pub fn klartext_anzahl(&self) -> usize {
        self.zustand.lock().klartext_reihenfolge.len()
    }
}

fn kurz(id: &[u8; 32]) -> String {
    id[..4].iter().map(|b| format!("{b:02x}")).collect()
}

fn utf8(bytes: Vec<u8>) -> SessionResult<String> {
    String::from_utf8(bytes)
        .map_err(|_| SessionError::UndecryptableMessage("Klartext ist kein UTF-8".into()))
}
