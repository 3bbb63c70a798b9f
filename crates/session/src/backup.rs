//! Schluessel-Backup beim Server
//!
//! Export und Import laufen ueber `KeyBackupCodec`. Argon2id ist teuer und
//! wird deshalb auf dem Blocking-Pool ausgefuehrt.

use std::sync::Arc;

use tracing::info;
use tresor_core::config::BackupEinstellungen;
use tresor_core::UserId;
use tresor_crypto::{CryptoResult, ExportedKeyMaterial, KeyBackupCodec};
use tresor_protocol::KeyBackupBlob;

use crate::error::{SessionError, SessionResult};
use crate::key_lifecycle::KeyLifecycleManager;
use crate::transport::Transport;

pub struct BackupService {
    account: UserId,
    lifecycle: Arc<KeyLifecycleManager>,
    transport: Arc<dyn Transport>,
    codec: KeyBackupCodec,
}

impl BackupService {
    pub fn neu(
        lifecycle: Arc<KeyLifecycleManager>,
        transport: Arc<dyn Transport>,
        config: &BackupEinstellungen,
    ) -> SessionResult<Arc<Self>> {
        let codec = KeyBackupCodec::new(config.m_cost, config.t_cost, config.p_cost)?;
        Ok(Arc::new(Self {
            account: lifecycle.account(),
            lifecycle,
            transport,
            codec,
        }))
    }

    /// Verschluesselt Identitaet und Signed-Pre-Key und legt das Backup beim Server ab
    pub async fn export_backup(&self, passphrase: &str) -> SessionResult<KeyBackupBlob> {
        let material = self.lifecycle.export_material()?;
        let codec = self.codec.clone();
        let passphrase = passphrase.to_string();
        let blob = blockierend(move || codec.export(&material, &passphrase)).await?;

        self.transport.store_backup(self.account, blob.clone()).await?;
        info!(account = %self.account, "Backup beim Server hinterlegt");
        Ok(blob)
    }

    /// Holt das Backup vom Server und entschluesselt es
    pub async fn import_backup(&self, passphrase: &str) -> SessionResult<ExportedKeyMaterial> {
        let blob = self
            .transport
            .fetch_backup(self.account)
            .await?
            .ok_or(SessionError::BackupNotFound)?;
        self.import_backup_blob(blob, passphrase).await
    }

    /// Entschluesselt ein bereits vorliegendes Backup
    pub async fn import_backup_blob(
        &self,
        blob: KeyBackupBlob,
        passphrase: &str,
    ) -> SessionResult<ExportedKeyMaterial> {
        let codec = self.codec.clone();
        let passphrase = passphrase.to_string();
        let material = blockierend(move || codec.import(&blob, &passphrase)).await?;

        if material.account != self.account {
            return Err(SessionError::CorruptBackup(format!(
                "Backup gehoert zu {}",
                material.account
            )));
        }
        Ok(material)
    }

    /// Loescht das Backup beim Server
    pub async fn disable_backup(&self) -> SessionResult<()> {
        self.transport.delete_backup(self.account).await?;
        info!(account = %self.account, "Backup deaktiviert");
        Ok(())
    }
}

async fn blockierend<T, F>(arbeit: F) -> SessionResult<T>
where
    F: FnOnce() -> CryptoResult<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(arbeit).await {
        Ok(ergebnis) => Ok(ergebnis?),
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => Err(SessionError::Cancelled),
    }
}
