//! Proof-of-Work fuer die Registrierung
//!
//! Der Server schickt eine Challenge und eine Schwierigkeit `d`. Gesucht
//! ist die kleinste Nonce, fuer die
//!
//! ```text
//! SHA-256(challenge || dezimal(nonce))
//! ```
//!
//! mindestens `d` fuehrende Null-Bits hat. Die Suche gibt regelmaessig
//! die Kontrolle an den Executor ab und kann ueber ein
//! `CancellationToken` abgebrochen werden. Den Fortschritt meldet jede
//! Suche ueber ihren eigenen `watch`-Kanal.

use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{CryptoError, CryptoResult};

/// Hoechste sinnvolle Schwierigkeit (Laenge des Hashes in Bits)
pub const MAX_SCHWIERIGKEIT: u32 = 256;

/// Zustand des Loesers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowZustand {
    Idle,
    Solving { versuche: u64 },
    Solved { nonce: u64 },
}

fn fuehrende_null_bits(hash: &[u8]) -> u32 {
    let mut count = 0u32;
    for byte in hash {
        if *byte == 0 {
            count += 8;
        } else {
            count += byte.leading_zeros();
            break;
        }
    }
    count
}

fn hash(challenge: &[u8], nonce: u64) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(challenge);
    h.update(nonce.to_string().as_bytes());
    h.finalize().into()
}

/// Loest Proof-of-Work-Aufgaben
#[derive(Debug, Clone, Copy)]
pub struct ProofOfWorkGate {
    yield_intervall: u64,
}

impl ProofOfWorkGate {
    pub fn new(yield_intervall: u64) -> Self {
        Self {
            yield_intervall: yield_intervall.max(1),
        }
    }

    /// Prueft eine Nonce wie der Server
    pub fn verify(challenge: &[u8], nonce: u64, difficulty: u32) -> bool {
        difficulty <= MAX_SCHWIERIGKEIT && fuehrende_null_bits(&hash(challenge, nonce)) >= difficulty
    }

    /// Sucht die kleinste passende Nonce und meldet den Fortschritt an `zustand`
    pub async fn solve(
        &self,
        challenge: &[u8],
        difficulty: u32,
        cancel: &CancellationToken,
        zustand: &watch::Sender<PowZustand>,
    ) -> CryptoResult<u64> {
        if difficulty > MAX_SCHWIERIGKEIT {
            return Err(CryptoError::UngueltigeDaten(format!(
                "Schwierigkeit {difficulty} groesser als {MAX_SCHWIERIGKEIT}"
            )));
        }
        if difficulty == 0 {
            zustand.send_replace(PowZustand::Solved { nonce: 0 });
            return Ok(0);
        }

        tracing::debug!(difficulty, "Proof-of-Work gestartet");
        zustand.send_replace(PowZustand::Solving { versuche: 0 });

        let mut nonce = 0u64;
        loop {
            if fuehrende_null_bits(&hash(challenge, nonce)) >= difficulty {
                zustand.send_replace(PowZustand::Solved { nonce });
                tracing::info!(difficulty, nonce, "Proof-of-Work geloest");
                return Ok(nonce);
            }

            nonce = nonce
                .checked_add(1)
                .ok_or_else(|| CryptoError::UngueltigeDaten("Nonce-Raum erschoepft".into()))?;

            if nonce % self.yield_intervall == 0 {
                zustand.send_replace(PowZustand::Solving { versuche: nonce });
                tokio::task::yield_now().await;
                if cancel.is_cancelled() {
                    zustand.send_replace(PowZustand::Idle);
                    tracing::debug!(versuche = nonce, "Proof-of-Work abgebrochen");
                    return Err(CryptoError::Abgebrochen);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
