//! Fassade fuer die Anwendung
//!
//! Verdrahtet alle Bausteine eines Kontos und verteilt Server-Ereignisse
//! in `run_event_loop`.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tresor_core::config::TresorConfig;
use tresor_core::{MessageId, SchluesselEreignis, UserId};
use tresor_crypto::ProofOfWorkGate;
use tresor_keystore::KeyStore;
use tresor_protocol::{Destination, Envelope, KeyBackupBlob};

use crate::backup::BackupService;
use crate::error::SessionResult;
use crate::establisher::SessionEstablisher;
use crate::key_lifecycle::{BootstrapOutcome, KeyLifecycleManager};
use crate::locks::LockRegistry;
use crate::pipeline::{Ausgehend, DecryptResult, MessagePipeline, Reconciled, Wiederhergestellt};
use crate::registration::{spawn_solver, SolverHandle};
use crate::sender_keys::SenderKeyDistributor;
use crate::session_cache::RatchetSessionCache;
use crate::transport::{Transport, TransportEvent};

/// Ausgaben der Ereignisschleife an die Anwendung
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAusgabe {
    /// Eingehendes Envelope und sein Ergebnis
    Nachricht {
        envelope: Envelope,
        ergebnis: DecryptResult,
    },
    /// Eigene Sendung vom Server bestaetigt
    Bestaetigt(Reconciled),
    /// Zurueckgestellte Nachricht wurde nachtraeglich lesbar
    Nachgeholt(Wiederhergestellt),
    /// Fehler bei der Verarbeitung eines Ereignisses (Schleife laeuft weiter)
    Fehler { ereignis: &'static str, fehler: String },
}

pub struct Client {
    account: UserId,
    locks: Arc<LockRegistry>,
    lifecycle: Arc<KeyLifecycleManager>,
    cache: Arc<RatchetSessionCache>,
    establisher: Arc<SessionEstablisher>,
    sender_keys: Arc<SenderKeyDistributor>,
    pipeline: Arc<MessagePipeline>,
    backup: Arc<BackupService>,
    pow: ProofOfWorkGate,
}

impl Client {
    pub async fn neu(
        account: UserId,
        config: TresorConfig,
        store: Arc<dyn KeyStore>,
        transport: Arc<dyn Transport>,
    ) -> SessionResult<Arc<Self>> {
        let locks = LockRegistry::new();
        let lifecycle = KeyLifecycleManager::neu(
            account,
            Arc::clone(&store),
            Arc::clone(&transport),
            config.schluessel.clone(),
            Arc::clone(&locks),
        );
        let cache = RatchetSessionCache::neu(
            account,
            Arc::clone(&store),
            Arc::clone(&locks),
            config.schluessel.max_fruehere_sitzungen,
        );
        let establisher = SessionEstablisher::neu(
            Arc::clone(&lifecycle),
            Arc::clone(&cache),
            Arc::clone(&transport),
            Arc::clone(&locks),
        );
        let sender_keys = SenderKeyDistributor::neu(
            account,
            Arc::clone(&store),
            Arc::clone(&transport),
            Arc::clone(&establisher),
            Arc::clone(&cache),
            Arc::clone(&locks),
        );
        let pipeline = MessagePipeline::neu(
            account,
            Arc::clone(&store),
            Arc::clone(&transport),
            Arc::clone(&cache),
            Arc::clone(&establisher),
            Arc::clone(&sender_keys),
            config.pipeline.clone(),
        );
        let geladen = pipeline.klartext_index_laden().await?;
        let backup = BackupService::neu(Arc::clone(&lifecycle), transport, &config.backup)?;
        let pow = ProofOfWorkGate::new(config.arbeitsnachweis.yield_intervall);

        debug!(%account, klartexte = geladen, "Client erstellt");
        Ok(Arc::new(Self {
            account,
            locks,
            lifecycle,
            cache,
            establisher,
            sender_keys,
            pipeline,
            backup,
            pow,
        }))
    }

    pub fn account(&self) -> UserId {
        self.account
    }

    pub fn lifecycle(&self) -> &Arc<KeyLifecycleManager> {
        &self.lifecycle
    }

    pub fn sessions(&self) -> &Arc<RatchetSessionCache> {
        &self.cache
    }

    pub fn establisher(&self) -> &Arc<SessionEstablisher> {
        &self.establisher
    }

    pub fn sender_keys(&self) -> &Arc<SenderKeyDistributor> {
        &self.sender_keys
    }

    pub fn pipeline(&self) -> &Arc<MessagePipeline> {
        &self.pipeline
    }

    /// Laedt oder erzeugt Schluesselmaterial und veroeffentlicht es
    pub async fn bootstrap(&self) -> SessionResult<BootstrapOutcome> {
        let outcome = self.lifecycle.bootstrap().await?;
        if let BootstrapOutcome::Ready(bereit) = &outcome {
            if bereit.rotated {
                self.cache.speicher_leeren();
                self.locks.aufraeumen();
            }
            info!(
                account = %self.account,
                fingerprint = %bereit.identity.fingerprint(),
                rotated = bereit.rotated,
                "Client bereit"
            );
        }
        Ok(outcome)
    }

    pub async fn encrypt_outgoing(
        &self,
        destination: Destination,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> SessionResult<Ausgehend> {
        self.pipeline
            .encrypt_outgoing(destination, text, reply_to)
            .await
    }

    pub async fn acknowledge(&self, server_id: MessageId) -> SessionResult<Reconciled> {
        self.pipeline.acknowledge(server_id).await
    }

    pub async fn decrypt_incoming(&self, envelope: &Envelope) -> SessionResult<DecryptResult> {
        self.pipeline.decrypt_incoming(envelope).await
    }

    pub async fn export_backup(&self, passphrase: &str) -> SessionResult<KeyBackupBlob> {
        self.backup.export_backup(passphrase).await
    }

    /// Stellt Identitaet und Signed-Pre-Key aus dem Server-Backup wieder her
    /// und fuehrt danach einen neuen Bootstrap aus
    pub async fn import_backup(&self, passphrase: &str) -> SessionResult<BootstrapOutcome> {
        let material = self.backup.import_backup(passphrase).await?;
        self.lifecycle.restore(&material).await?;
        self.cache.speicher_leeren();
        self.locks.aufraeumen();
        self.bootstrap().await
    }

    pub async fn disable_backup(&self) -> SessionResult<()> {
        self.backup.disable_backup().await
    }

    /// Startet den Proof-of-Work fuer eine Registrierung im Hintergrund
    pub fn start_registration(&self, challenge: Vec<u8>, difficulty: u32) -> SolverHandle {
        spawn_solver(self.pow, challenge, difficulty)
    }

    /// Verteilt ein Schluessel-Ereignis an den zustaendigen Baustein
    pub async fn handle_event(&self, ereignis: SchluesselEreignis) -> SessionResult<()> {
        debug!(art = ereignis.art(), "Schluessel-Ereignis");
        match ereignis {
            SchluesselEreignis::MembershipChanged { server_id } => {
                self.sender_keys.handle_membership_changed(server_id).await?;
            }
            SchluesselEreignis::SenderKeysChanged { channel_id, sender } => {
                self.sender_keys
                    .handle_sender_keys_changed(channel_id, sender)
                    .await?;
            }
            SchluesselEreignis::PreKeysLow { remaining } => {
                if self.lifecycle.nachliefern_noetig(remaining) {
                    self.lifecycle.replenish(remaining).await?;
                }
            }
        }
        Ok(())
    }

    /// Verarbeitet Transport-Ereignisse bis zum Abbruch oder Ende des Streams.
    ///
    /// Fehler einzelner Ereignisse beenden die Schleife nicht, sie werden
    /// als `ClientAusgabe::Fehler` gemeldet.
    pub async fn run_event_loop(
        self: Arc<Self>,
        mut eingang: mpsc::Receiver<TransportEvent>,
        ausgang: mpsc::Sender<ClientAusgabe>,
        cancel: CancellationToken,
    ) {
        info!(account = %self.account, "Ereignisschleife gestartet");
        loop {
            let ereignis = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Ereignisschleife abgebrochen");
                    break;
                }
                ereignis = eingang.recv() => match ereignis {
                    Some(e) => e,
                    None => {
                        debug!("Transport-Stream beendet");
                        break;
                    }
                },
            };

            let ausgaben = self.ereignis_verarbeiten(ereignis).await;
            for ausgabe in ausgaben {
                if ausgang.send(ausgabe).await.is_err() {
                    warn!("Empfaenger der Client-Ausgaben geschlossen");
                    return;
                }
            }
        }
        info!(account = %self.account, "Ereignisschleife beendet");
    }

    async fn ereignis_verarbeiten(&self, ereignis: TransportEvent) -> Vec<ClientAusgabe> {
        let mut ausgaben = Vec::new();
        match ereignis {
            TransportEvent::Envelope(envelope) => {
                match self.pipeline.decrypt_incoming(&envelope).await {
                    Ok(ergebnis) => {
                        if let DecryptResult::KeyMaterial { recovered, .. } = &ergebnis {
                            ausgaben.extend(recovered.iter().cloned().map(ClientAusgabe::Nachgeholt));
                        }
                        ausgaben.insert(0, ClientAusgabe::Nachricht { envelope, ergebnis });
                    }
                    Err(e) => ausgaben.push(fehler("envelope", e)),
                }
                ausgaben.extend(
                    self.pipeline
                        .nachgeholte_abholen()
                        .into_iter()
                        .map(ClientAusgabe::Nachgeholt),
                );
            }
            TransportEvent::Bestaetigung(server_id) => match self.acknowledge(server_id).await {
                Ok(r) => ausgaben.push(ClientAusgabe::Bestaetigt(r)),
                Err(e) => ausgaben.push(fehler("bestaetigung", e)),
            },
            TransportEvent::Schluessel(ereignis) => {
                let art = ereignis.art();
                if let Err(e) = self.handle_event(ereignis).await {
                    ausgaben.push(fehler(art, e));
                }
            }
        }
        ausgaben
    }
}

fn fehler(ereignis: &'static str, e: crate::error::SessionError) -> ClientAusgabe {
    warn!(ereignis, fehler = %e, wiederholbar = e.is_retryable(), "Ereignis fehlgeschlagen");
    ClientAusgabe::Fehler {
        ereignis,
        fehler: e.to_string(),
    }
}
