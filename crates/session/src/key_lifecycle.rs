//! Lebenszyklus von Identitaet und Pre-Keys
//!
//! ## Regeln
//! - Identitaet vorhanden: wiederverwenden, Signed-Pre-Key ebenfalls
//! - Identitaet fehlt, Backup beim Server: nichts erzeugen, `RestoreRequired`
//! - Identitaet fehlt, kein Backup: neue Identitaet + neuer Signed-Pre-Key,
//!   alle Sitzungen und Sender-Keys verwerfen (`rotated`)
//! - One-Time-Pre-Keys: bei jedem Bootstrap frisch, der alte Batch wird
//!   vorher beim Server geloescht
//!
//! Lokale Aenderungen werden erst nach allen Netzwerkschritten in einem
//! atomaren Batch geschrieben. Bricht der Bootstrap vorher ab, bleibt der
//! lokale Zustand unveraendert.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info};
use tresor_core::config::SchluesselEinstellungen;
use tresor_core::UserId;
use tresor_crypto::{
    ExportedKeyMaterial, IdentityKeyPair, IdentityPublicKey, IdentityRecord, OneTimePreKey,
    PreKeyId, SignedPreKey,
};
use tresor_keystore::{KeyStore, KeyStoreExt, Mutation, RecordKey, RecordKind};

use crate::error::{SessionError, SessionResult};
use crate::locks::LockRegistry;
use crate::transport::Transport;

/// Erste vergebene Pre-Key-ID
const ERSTE_PRE_KEY_ID: PreKeyId = 1;

/// Geladenes Schluesselmaterial des eigenen Kontos
#[derive(Debug)]
pub struct AccountKeys {
    pub identity: IdentityKeyPair,
    pub signed_pre_key: SignedPreKey,
}

/// Ergebnis eines erfolgreichen Bootstraps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bereit {
    pub identity: IdentityPublicKey,
    pub signed_pre_key_id: PreKeyId,
    pub one_time_pre_key_ids: Vec<PreKeyId>,
    /// Identitaet wurde neu erzeugt; alle Sitzungen sind ungueltig
    pub rotated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapOutcome {
    Ready(Bereit),
    /// Lokal fehlt alles, beim Server liegt ein Backup
    RestoreRequired,
}

pub struct KeyLifecycleManager {
    account: UserId,
    store: Arc<dyn KeyStore>,
    transport: Arc<dyn Transport>,
    config: SchluesselEinstellungen,
    locks: Arc<LockRegistry>,
    geladen: RwLock<Option<Arc<AccountKeys>>>,
}

impl KeyLifecycleManager {
    pub fn neu(
        account: UserId,
        store: Arc<dyn KeyStore>,
        transport: Arc<dyn Transport>,
        config: SchluesselEinstellungen,
        locks: Arc<LockRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            account,
            store,
            transport,
            config,
            locks,
            geladen: RwLock::new(None),
        })
    }

    pub fn account(&self) -> UserId {
        self.account
    }

    fn key(&self, kind: RecordKind) -> RecordKey {
        RecordKey::singleton(self.account, kind)
    }

    fn one_time_key(&self, id: PreKeyId) -> RecordKey {
        // Nullen vorne, damit `list` numerisch sortiert
        RecordKey::new(self.account, RecordKind::OneTimePreKey, format!("{id:010}"))
    }

    /// Geladenes Schluesselmaterial (nach `bootstrap`)
    pub fn keys(&self) -> SessionResult<Arc<AccountKeys>> {
        self.geladen
            .read()
            .clone()
            .ok_or(SessionError::NotBootstrapped)
    }

    async fn naechste_id(&self) -> SessionResult<PreKeyId> {
        Ok(self
            .store
            .get_json::<PreKeyId>(&self.key(RecordKind::PreKeyCounter))
            .await?
            .unwrap_or(ERSTE_PRE_KEY_ID))
    }

    /// Laedt oder erzeugt Schluesselmaterial und veroeffentlicht es
    pub async fn bootstrap(&self) -> SessionResult<BootstrapOutcome> {
        let _guard = self.locks.konto().await;

        let gespeichert: Option<IdentityRecord> =
            self.store.get_json(&self.key(RecordKind::Identity)).await?;
        let mut naechste_id = self.naechste_id().await?;

        let (identity, rotated) = match gespeichert {
            Some(record) => (IdentityKeyPair::from_record(&record), false),
            None => {
                if self.transport.fetch_backup(self.account).await?.is_some() {
                    info!(account = %self.account, "Keine lokale Identitaet, Backup vorhanden");
                    return Ok(BootstrapOutcome::RestoreRequired);
                }
                info!(account = %self.account, "Erzeuge neue Identitaet");
                (IdentityKeyPair::generate(), true)
            }
        };

        let vorhandener_spk = if rotated {
            None
        } else {
            self.store
                .get_json::<SignedPreKey>(&self.key(RecordKind::SignedPreKey))
                .await?
                .filter(|spk| spk.signed_by(&identity.public_key()))
        };
        let spk_neu = vorhandener_spk.is_none();
        let signed_pre_key = match vorhandener_spk {
            Some(spk) => {
                debug!(
                    id = spk.id(),
                    alter_tage = (Utc::now() - spk.created_at()).num_days(),
                    "Signed-Pre-Key wiederverwendet"
                );
                spk
            }
            None => {
                let spk = SignedPreKey::generate(naechste_id, &identity);
                naechste_id = naechste_id.wrapping_add(1);
                spk
            }
        };

        let batch = OneTimePreKey::generate_batch(naechste_id, self.config.one_time_batch);
        naechste_id = naechste_id.wrapping_add(batch.len() as PreKeyId);

        // Netzwerk zuerst; schlaegt etwas fehl, wurde lokal nichts geschrieben
        self.transport
            .publish_keys(
                self.account,
                identity.public_key(),
                signed_pre_key.public_info(),
            )
            .await?;
        self.transport.clear_one_time_pre_keys(self.account).await?;
        self.transport
            .upload_one_time_pre_keys(
                self.account,
                batch.iter().map(OneTimePreKey::public_info).collect(),
            )
            .await?;

        let mut mutationen = Vec::with_capacity(batch.len() + 8);
        if rotated {
            mutationen.push(Mutation::put_json(
                self.key(RecordKind::Identity),
                &identity.to_record(),
            )?);
            for kind in [
                RecordKind::Session,
                RecordKind::SenderKeyOwn,
                RecordKind::SenderKeyInbound,
            ] {
                mutationen.push(Mutation::DeleteKind {
                    account: self.account,
                    kind,
                });
            }
        }
        if spk_neu {
            mutationen.push(Mutation::put_json(
                self.key(RecordKind::SignedPreKey),
                &signed_pre_key,
            )?);
        }
        mutationen.push(Mutation::DeleteKind {
            account: self.account,
            kind: RecordKind::OneTimePreKey,
        });
        for opk in &batch {
            mutationen.push(Mutation::put_json(self.one_time_key(opk.id()), opk)?);
        }
        mutationen.push(Mutation::put_json(
            self.key(RecordKind::PreKeyCounter),
            &naechste_id,
        )?);
        self.store.apply(mutationen).await?;

        let bereit = Bereit {
            identity: identity.public_key(),
            signed_pre_key_id: signed_pre_key.id(),
            one_time_pre_key_ids: batch.iter().map(OneTimePreKey::id).collect(),
            rotated,
        };
        *self.geladen.write() = Some(Arc::new(AccountKeys {
            identity,
            signed_pre_key,
        }));

        info!(
            account = %self.account,
            fingerprint = %bereit.identity.fingerprint(),
            one_time = bereit.one_time_pre_key_ids.len(),
            rotated,
            "Bootstrap abgeschlossen"
        );
        Ok(BootstrapOutcome::Ready(bereit))
    }

    /// Fuellt die One-Time-Pre-Keys beim Server wieder auf.
    ///
    /// Gibt die Anzahl neu erzeugter Keys zurueck.
    pub async fn replenish(&self, remaining: usize) -> SessionResult<usize> {
        self.keys()?;
        let _guard = self.locks.konto().await;

        let anzahl = self.config.one_time_batch.saturating_sub(remaining);
        if anzahl == 0 {
            return Ok(0);
        }

        let start = self.naechste_id().await?;
        let batch = OneTimePreKey::generate_batch(start, anzahl);
        let naechste_id = start.wrapping_add(anzahl as PreKeyId);

        self.transport
            .upload_one_time_pre_keys(
                self.account,
                batch.iter().map(OneTimePreKey::public_info).collect(),
            )
            .await?;

        let mut mutationen = Vec::with_capacity(anzahl + 1);
        for opk in &batch {
            mutationen.push(Mutation::put_json(self.one_time_key(opk.id()), opk)?);
        }
        mutationen.push(Mutation::put_json(
            self.key(RecordKind::PreKeyCounter),
            &naechste_id,
        )?);
        self.store.apply(mutationen).await?;

        info!(anzahl, remaining, "One-Time-Pre-Keys nachgeliefert");
        Ok(anzahl)
    }

    /// Ob bei `remaining` Keys beim Server nachgeliefert werden sollte
    pub fn nachliefern_noetig(&self, remaining: usize) -> bool {
        remaining < self.config.nachliefern_unter
    }

    /// Uebernimmt Identitaet und Signed-Pre-Key aus einem Backup.
    ///
    /// Verwirft alle Sitzungen, Sender-Keys und One-Time-Pre-Keys, die unter
    /// einer zwischenzeitlichen Identitaet entstanden sind. Danach muss
    /// `bootstrap` erneut laufen.
    pub async fn restore(&self, material: &ExportedKeyMaterial) -> SessionResult<()> {
        if material.account != self.account {
            return Err(SessionError::CorruptBackup(format!(
                "Backup gehoert zu {}, nicht zu {}",
                material.account, self.account
            )));
        }
        if !material
            .signed_pre_key
            .signed_by(&IdentityKeyPair::from_record(&material.identity).public_key())
        {
            return Err(SessionError::CorruptBackup(
                "Signed-Pre-Key passt nicht zur Identitaet".into(),
            ));
        }

        let _guard = self.locks.konto().await;
        let naechste_id = self
            .naechste_id()
            .await?
            .max(material.signed_pre_key.id().wrapping_add(1));

        let mut mutationen = vec![
            Mutation::put_json(self.key(RecordKind::Identity), &material.identity)?,
            Mutation::put_json(
                self.key(RecordKind::SignedPreKey),
                &material.signed_pre_key,
            )?,
            Mutation::put_json(self.key(RecordKind::PreKeyCounter), &naechste_id)?,
        ];
        for kind in [
            RecordKind::OneTimePreKey,
            RecordKind::Session,
            RecordKind::SenderKeyOwn,
            RecordKind::SenderKeyInbound,
        ] {
            mutationen.push(Mutation::DeleteKind {
                account: self.account,
                kind,
            });
        }
        self.store.apply(mutationen).await?;
        *self.geladen.write() = None;

        info!(account = %self.account, "Schluesselmaterial aus Backup uebernommen");
        Ok(())
    }

    /// Exportierbares Material fuer ein Backup
    pub fn export_material(&self) -> SessionResult<ExportedKeyMaterial> {
        let keys = self.keys()?;
        Ok(ExportedKeyMaterial {
            account: self.account,
            identity: keys.identity.to_record(),
            signed_pre_key: keys.signed_pre_key.clone(),
            exported_at: Utc::now(),
        })
    }

    /// Liest einen One-Time-Pre-Key, ohne ihn zu verbrauchen
    pub async fn peek_one_time_pre_key(&self, id: PreKeyId) -> SessionResult<OneTimePreKey> {
        self.store
            .get_json::<OneTimePreKey>(&self.one_time_key(id))
            .await?
            .ok_or(SessionError::StaleOneTimePreKey(id))
    }

    /// Mutation, die einen One-Time-Pre-Key im selben Batch wie die neue
    /// Sitzung verbraucht
    pub fn verbrauchen(&self, id: PreKeyId) -> Mutation {
        Mutation::Delete {
            key: self.one_time_key(id),
        }
    }

    /// Anzahl lokal vorraetiger One-Time-Pre-Keys
    pub async fn one_time_pre_keys_lokal(&self) -> SessionResult<usize> {
        Ok(self
            .store
            .list(self.account, RecordKind::OneTimePreKey)
            .await?
            .len())
    }
}
