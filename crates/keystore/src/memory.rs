//! Fluechtiger KeyStore im Speicher

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tresor_core::UserId;

use crate::error::{KeyStoreError, KeyStoreResult};
use crate::record::{Mutation, RecordKey, RecordKind};
use crate::store::KeyStore;

type Schluessel = (UserId, RecordKind, String);

/// KeyStore auf Basis einer `BTreeMap`
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    daten: RwLock<BTreeMap<Schluessel, Vec<u8>>>,
    schreibfehler: AtomicBool,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Laesst alle folgenden Schreibzugriffe fehlschlagen (fuer Fehlerpfad-Tests)
    pub fn schreibfehler_simulieren(&self, an: bool) {
        self.schreibfehler.store(an, Ordering::SeqCst);
    }

    /// Anzahl aller Datensaetze
    pub fn len(&self) -> usize {
        self.daten.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.daten.read().is_empty()
    }

    fn schreiben_erlaubt(&self) -> KeyStoreResult<()> {
        if self.schreibfehler.load(Ordering::SeqCst) {
            return Err(KeyStoreError::intern("Schreibfehler simuliert"));
        }
        Ok(())
    }
}

fn schluessel(key: &RecordKey) -> Schluessel {
    (key.account, key.kind, key.id.clone())
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn get(&self, key: &RecordKey) -> KeyStoreResult<Option<Vec<u8>>> {
        Ok(self.daten.read().get(&schluessel(key)).cloned())
    }

    async fn put(&self, key: &RecordKey, value: Vec<u8>) -> KeyStoreResult<()> {
        self.schreiben_erlaubt()?;
        self.daten.write().insert(schluessel(key), value);
        Ok(())
    }

    async fn delete(&self, key: &RecordKey) -> KeyStoreResult<bool> {
        self.schreiben_erlaubt()?;
        Ok(self.daten.write().remove(&schluessel(key)).is_some())
    }

    async fn list(
        &self,
        account: UserId,
        kind: RecordKind,
    ) -> KeyStoreResult<Vec<(String, Vec<u8>)>> {
        Ok(self
            .daten
            .read()
            .iter()
            .filter(|((a, k, _), _)| *a == account && *k == kind)
            .map(|((_, _, id), v)| (id.clone(), v.clone()))
            .collect())
    }

    async fn apply(&self, batch: Vec<Mutation>) -> KeyStoreResult<()> {
        self.schreiben_erlaubt()?;
        // Ein Schreib-Lock fuer den ganzen Batch: Leser sehen alles oder nichts
        let mut daten = self.daten.write();
        for mutation in batch {
            match mutation {
                Mutation::Put { key, value } => {
                    daten.insert(schluessel(&key), value);
                }
                Mutation::Delete { key } => {
                    daten.remove(&schluessel(&key));
                }
                Mutation::DeleteKind { account, kind } => {
                    daten.retain(|(a, k, _), _| !(*a == account && *k == kind));
                }
            }
        }
        Ok(())
    }
}
