//! Sperren pro Datensatz
//!
//! Handshakes, Ratchet-Schritte und Sender-Key-Wechsel werden pro Peer bzw.
//! pro Kanal serialisiert. Es gibt keine globale Sperre.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tresor_core::{ChannelId, UserId};

#[derive(Debug, Default)]
pub struct LockRegistry {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LockRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wartet auf die Sperre fuer `name`
    pub async fn sperren(&self, name: impl Into<String>) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(name.into())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    pub async fn peer(&self, peer: UserId) -> OwnedMutexGuard<()> {
        self.sperren(format!("peer/{}", peer.als_schluessel())).await
    }

    pub async fn kanal(&self, channel_id: ChannelId) -> OwnedMutexGuard<()> {
        self.sperren(format!("kanal/{}", channel_id.als_schluessel()))
            .await
    }

    pub async fn eingehend(&self, channel_id: ChannelId, sender: UserId) -> OwnedMutexGuard<()> {
        self.sperren(format!(
            "eingehend/{}/{}",
            channel_id.als_schluessel(),
            sender.als_schluessel()
        ))
        .await
    }

    pub async fn konto(&self) -> OwnedMutexGuard<()> {
        self.sperren("konto").await
    }

    /// Entfernt Sperren, die gerade niemand haelt oder erwartet
    pub fn aufraeumen(&self) {
        self.locks.retain(|_, m| Arc::strong_count(m) > 1);
    }

    pub fn anzahl(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn gleiche_sperre_serialisiert() {
        let locks = LockRegistry::new();
        let peer = UserId::new();

        let guard = locks.peer(peer).await;
        let locks2 = locks.clone();
        let warten = tokio::spawn(async move {
            let _g = locks2.peer(peer).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!warten.is_finished());
        drop(guard);
        warten.await.unwrap();
    }

    #[tokio::test]
    async fn verschiedene_peers_blockieren_nicht() {
        let locks = LockRegistry::new();
        let _a = locks.peer(UserId::new()).await;
        let _b = locks.peer(UserId::new()).await;
        assert_eq!(locks.anzahl(), 2);
    }

    #[tokio::test]
    async fn aufraeumen_entfernt_freie_sperren() {
        let locks = LockRegistry::new();
        let gehalten = locks.peer(UserId::new()).await;
        drop(locks.kanal(ChannelId::new()).await);

        locks.aufraeumen();
        assert_eq!(locks.anzahl(), 1);
        drop(gehalten);
    }
}
