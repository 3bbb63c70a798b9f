//! Proof-of-Work im Hintergrund
//!
//! Der Solver laeuft als eigener Task. Das Handle bricht ihn beim Drop ab,
//! damit eine verlassene Registrierung keine CPU mehr verbraucht.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tresor_crypto::{CryptoResult, PowZustand, ProofOfWorkGate};

use crate::error::{SessionError, SessionResult};

/// Geloester Arbeitsnachweis fuer den Registrierungs-Request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationProof {
    pub challenge: Vec<u8>,
    pub difficulty: u32,
    pub nonce: u64,
}

pub struct SolverHandle {
    cancel: CancellationToken,
    task: JoinHandle<CryptoResult<u64>>,
    zustand: watch::Receiver<PowZustand>,
    challenge: Vec<u8>,
    difficulty: u32,
    _guard: DropGuard,
}

/// Startet die Suche nach einer Nonce auf dem Tokio-Runtime.
///
/// Jeder Solver meldet seinen Fortschritt ueber einen eigenen Kanal.
pub fn spawn_solver(gate: ProofOfWorkGate, challenge: Vec<u8>, difficulty: u32) -> SolverHandle {
    let cancel = CancellationToken::new();
    let (sender, zustand) = watch::channel(PowZustand::Idle);

    let task = {
        let cancel = cancel.clone();
        let challenge = challenge.clone();
        tokio::spawn(async move { gate.solve(&challenge, difficulty, &cancel, &sender).await })
    };

    SolverHandle {
        _guard: cancel.clone().drop_guard(),
        cancel,
        task,
        zustand,
        challenge,
        difficulty,
    }
}

impl SolverHandle {
    pub fn abbrechen(&self) {
        self.cancel.cancel();
    }

    /// Aktueller Fortschritt
    pub fn zustand(&self) -> PowZustand {
        *self.zustand.borrow()
    }

    /// Beobachter fuer Fortschrittsanzeigen
    pub fn beobachten(&self) -> watch::Receiver<PowZustand> {
        self.zustand.clone()
    }

    /// Wartet auf die Loesung
    pub async fn ergebnis(self) -> SessionResult<RegistrationProof> {
        let nonce = match self.task.await {
            Ok(ergebnis) => ergebnis?,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => return Err(SessionError::Cancelled),
        };
        Ok(RegistrationProof {
            challenge: self.challenge,
            difficulty: self.difficulty,
            nonce,
        })
    }
}
