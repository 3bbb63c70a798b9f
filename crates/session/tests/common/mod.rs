//! Test-Server fuer die Integrationstests
//!
//! Bildet die Server-Seite im Speicher nach: veroeffentlichte Schluessel,
//! One-Time-Pre-Keys (werden beim Bundle-Abruf verbraucht), Postfaecher
//! mit vergebenen Nachrichten-IDs, Kanal-Mitglieder und Backups.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tresor_core::config::TresorConfig;
use tresor_core::{ChannelId, MessageId, ServerId, UserId};
use tresor_crypto::{IdentityPublicKey, KeyBundle, OneTimePreKeyPublic, SignedPreKeyPublic};
use tresor_keystore::{KeyStore, MemoryKeyStore};
use tresor_protocol::{Destination, Envelope, KeyBackupBlob};
use tresor_session::{
    BootstrapOutcome, Bereit, Client, Transport, TransportError, TransportResult,
};

#[derive(Default)]
struct ServerZustand {
    schluessel: HashMap<UserId, (IdentityPublicKey, SignedPreKeyPublic)>,
    one_time: HashMap<UserId, VecDeque<OneTimePreKeyPublic>>,
    postfaecher: HashMap<UserId, Vec<Envelope>>,
    bestaetigungen: HashMap<UserId, VecDeque<MessageId>>,
    kanaele: HashMap<ChannelId, Vec<UserId>>,
    backups: HashMap<UserId, KeyBackupBlob>,
    upload_fehlschlagen: bool,
    zustellung_fehlschlagen: bool,
}

#[derive(Default)]
pub struct TestServer {
    zustand: Mutex<ServerZustand>,
    /// Bundle-Abrufe fuer diese Benutzer warten bis zur Freigabe
    angehalten: Mutex<HashMap<UserId, Arc<Notify>>>,
}

impl TestServer {
    pub fn neu() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Entnimmt alle Envelopes aus dem Postfach eines Benutzers
    pub async fn abholen(&self, user: UserId) -> Vec<Envelope> {
        self.zustand
            .lock()
            .await
            .postfaecher
            .remove(&user)
            .unwrap_or_default()
    }

    /// Server-IDs der eigenen Sendungen (in Versandreihenfolge)
    pub async fn bestaetigungen(&self, user: UserId) -> Vec<MessageId> {
        self.zustand
            .lock()
            .await
            .bestaetigungen
            .remove(&user)
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub async fn mitglieder_setzen(&self, channel_id: ChannelId, mitglieder: Vec<UserId>) {
        self.zustand
            .lock()
            .await
            .kanaele
            .insert(channel_id, mitglieder);
    }

    pub async fn one_time_ids(&self, user: UserId) -> Vec<u32> {
        self.zustand
            .lock()
            .await
            .one_time
            .get(&user)
            .map(|keys| keys.iter().map(|k| k.id).collect())
            .unwrap_or_default()
    }

    pub async fn identitaet(&self, user: UserId) -> Option<IdentityPublicKey> {
        self.zustand.lock().await.schluessel.get(&user).map(|(i, _)| *i)
    }

    /// Bundle ansehen, ohne einen One-Time-Pre-Key zu verbrauchen
    pub async fn bundle_kopie(&self, user: UserId) -> Option<KeyBundle> {
        let z = self.zustand.lock().await;
        let (identity, signed_pre_key) = z.schluessel.get(&user)?.clone();
        Some(KeyBundle {
            user_id: user,
            identity,
            signed_pre_key,
            one_time_pre_key: z.one_time.get(&user).and_then(|k| k.front().copied()),
        })
    }

    pub async fn hat_backup(&self, user: UserId) -> bool {
        self.zustand.lock().await.backups.contains_key(&user)
    }

    pub async fn upload_fehlschlagen(&self, an: bool) {
        self.zustand.lock().await.upload_fehlschlagen = an;
    }

    pub async fn zustellung_fehlschlagen(&self, an: bool) {
        self.zustand.lock().await.zustellung_fehlschlagen = an;
    }

    pub async fn bundle_anhalten(&self, user: UserId) {
        self.angehalten
            .lock()
            .await
            .insert(user, Arc::new(Notify::new()));
    }

    pub async fn bundle_freigeben(&self, user: UserId) {
        if let Some(halt) = self.angehalten.lock().await.remove(&user) {
            halt.notify_one();
        }
    }
}

#[async_trait]
impl Transport for TestServer {
    async fn publish_keys(
        &self,
        account: UserId,
        identity: IdentityPublicKey,
        signed_pre_key: SignedPreKeyPublic,
    ) -> TransportResult<()> {
        self.zustand
            .lock()
            .await
            .schluessel
            .insert(account, (identity, signed_pre_key));
        Ok(())
    }

    async fn clear_one_time_pre_keys(&self, account: UserId) -> TransportResult<()> {
        self.zustand.lock().await.one_time.remove(&account);
        Ok(())
    }

    async fn upload_one_time_pre_keys(
        &self,
        account: UserId,
        keys: Vec<OneTimePreKeyPublic>,
    ) -> TransportResult<()> {
        let mut z = self.zustand.lock().await;
        if z.upload_fehlschlagen {
            return Err(TransportError::Verbindung("Upload abgebrochen".into()));
        }
        z.one_time.entry(account).or_default().extend(keys);
        Ok(())
    }

    async fn fetch_key_bundle(&self, peer: UserId) -> TransportResult<KeyBundle> {
        let halt = self.angehalten.lock().await.get(&peer).cloned();
        if let Some(halt) = halt {
            halt.notified().await;
        }
        let mut z = self.zustand.lock().await;
        let (identity, signed_pre_key) = z
            .schluessel
            .get(&peer)
            .cloned()
            .ok_or_else(|| TransportError::NichtGefunden(peer.to_string()))?;
        let one_time_pre_key = z.one_time.get_mut(&peer).and_then(VecDeque::pop_front);
        Ok(KeyBundle {
            user_id: peer,
            identity,
            signed_pre_key,
            one_time_pre_key,
        })
    }

    async fn deliver_envelope(&self, envelope: &Envelope) -> TransportResult<()> {
        let mut z = self.zustand.lock().await;
        if z.zustellung_fehlschlagen {
            return Err(TransportError::Verbindung("Zustellung abgebrochen".into()));
        }

        let empfaenger: Vec<UserId> = match envelope.destination {
            Destination::User { user_id } => vec![user_id],
            Destination::Channel { channel_id, .. } => z
                .kanaele
                .get(&channel_id)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .filter(|m| *m != envelope.sender)
                .collect(),
        };

        let id = MessageId::new();
        let zugestellt = envelope.clone().with_message_id(id);
        for user in empfaenger {
            z.postfaecher.entry(user).or_default().push(zugestellt.clone());
        }
        // Verteilungen und Resets werden nicht bestaetigt
        if envelope.kind.ist_anwendungsnachricht() {
            z.bestaetigungen
                .entry(envelope.sender)
                .or_default()
                .push_back(id);
        }
        Ok(())
    }

    async fn channel_members(
        &self,
        _server_id: ServerId,
        channel_id: ChannelId,
    ) -> TransportResult<Vec<UserId>> {
        self.zustand
            .lock()
            .await
            .kanaele
            .get(&channel_id)
            .cloned()
            .ok_or_else(|| TransportError::NichtGefunden(channel_id.to_string()))
    }

    async fn fetch_backup(&self, account: UserId) -> TransportResult<Option<KeyBackupBlob>> {
        Ok(self.zustand.lock().await.backups.get(&account).cloned())
    }

    async fn store_backup(&self, account: UserId, blob: KeyBackupBlob) -> TransportResult<()> {
        self.zustand.lock().await.backups.insert(account, blob);
        Ok(())
    }

    async fn delete_backup(&self, account: UserId) -> TransportResult<()> {
        self.zustand.lock().await.backups.remove(&account);
        Ok(())
    }
}

/// Kleine Batches und billige KDF-Parameter
pub fn test_config() -> TresorConfig {
    let mut config = TresorConfig::default();
    config.schluessel.one_time_batch = 5;
    config.schluessel.nachliefern_unter = 2;
    config.backup.m_cost = 64;
    config.backup.t_cost = 1;
    config.backup.p_cost = 1;
    config.arbeitsnachweis.yield_intervall = 16;
    config
}

pub struct Geraet {
    pub account: UserId,
    pub client: Arc<Client>,
    pub store: Arc<MemoryKeyStore>,
}

impl Geraet {
    /// Neuer Client fuer `account` auf einem (ggf. vorhandenen) Speicher
    pub async fn mit_speicher(
        server: &Arc<TestServer>,
        account: UserId,
        store: Arc<MemoryKeyStore>,
    ) -> Self {
        let client = Client::neu(
            account,
            test_config(),
            Arc::clone(&store) as Arc<dyn KeyStore>,
            Arc::clone(server) as Arc<dyn Transport>,
        )
        .await
        .expect("Client konnte nicht erstellt werden");
        Self {
            account,
            client,
            store,
        }
    }

    pub async fn neu(server: &Arc<TestServer>) -> Self {
        Self::mit_speicher(server, UserId::new(), Arc::new(MemoryKeyStore::new())).await
    }

    /// Neuer Client mit Bootstrap
    pub async fn bereit(server: &Arc<TestServer>) -> Self {
        let geraet = Self::neu(server).await;
        geraet.bootstrap().await;
        geraet
    }

    pub async fn bootstrap(&self) -> Bereit {
        match self.client.bootstrap().await.expect("Bootstrap fehlgeschlagen") {
            BootstrapOutcome::Ready(bereit) => bereit,
            BootstrapOutcome::RestoreRequired => panic!("unerwartet RestoreRequired"),
        }
    }

    pub async fn handshake_id(&self, peer: UserId) -> [u8; 32] {
        self.client
            .sessions()
            .get(peer)
            .await
            .unwrap()
            .expect("keine Sitzung")
            .current
            .handshake_id()
    }
}
