//! Gemeinsame Konstanten und Hilfen fuer das Kryptografie-Subsystem

/// Laenge aller symmetrischen Schluessel und X25519-Schluessel
pub const SCHLUESSEL_LAENGE: usize = 32;

/// Laenge der AES-GCM-Nonce
pub const NONCE_LAENGE: usize = 12;

/// Vergleich ohne fruehen Abbruch
pub fn konstante_zeit_gleich(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vergleich() {
        assert!(konstante_zeit_gleich(&[1, 2, 3], &[1, 2, 3]));
        assert!(!konstante_zeit_gleich(&[1, 2, 3], &[1, 2, 4]));
        assert!(!konstante_zeit_gleich(&[1, 2, 3], &[1, 2]));
    }
}
