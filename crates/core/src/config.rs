//! Client-Konfiguration
//!
//! Wird beim Start aus einer TOML-Datei geladen. Alle Felder haben
//! sinnvolle Standardwerte, sodass der Client ohne Konfigurationsdatei
//! lauffaehig ist.

use serde::{Deserialize, Serialize};

/// Vollstaendige Konfiguration der Schluessel- und Sitzungsschicht
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TresorConfig {
    /// Pre-Key- und Sitzungs-Einstellungen
    pub schluessel: SchluesselEinstellungen,
    /// Grenzen der Nachrichten-Pipeline
    pub pipeline: PipelineEinstellungen,
    /// Parameter der Backup-Schluesselableitung
    pub backup: BackupEinstellungen,
    /// Proof-of-Work bei der Registrierung
    pub arbeitsnachweis: ArbeitsnachweisEinstellungen,
    /// Lokaler Speicher
    pub speicher: SpeicherEinstellungen,
    /// Logging-Einstellungen
    pub logging: LoggingEinstellungen,
}

/// Pre-Key- und Sitzungs-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchluesselEinstellungen {
    /// Anzahl One-Time-Pre-Keys pro Batch
    pub one_time_batch: usize,
    /// Unterhalb dieser Anzahl wird nachgeliefert
    pub nachliefern_unter: usize,
    /// Wie viele fruehere Sitzungen pro Peer aufbewahrt werden
    pub max_fruehere_sitzungen: usize,
}

impl Default for SchluesselEinstellungen {
    fn default() -> Self {
        Self {
            one_time_batch: 100,
            nachliefern_unter: 10,
            max_fruehere_sitzungen: 5,
        }
    }
}

/// Grenzen der Nachrichten-Pipeline (alle Caches verdraengen aelteste Eintraege zuerst)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineEinstellungen {
    /// Maximale Anzahl Klartexte im lokalen Cache
    pub klartext_cache: usize,
    /// Maximale Anzahl gemerkter verarbeiteter Nachrichten-IDs
    pub dedup_fenster: usize,
    /// Maximale Anzahl unbestaetigter (optimistischer) Sendungen
    pub offene_bestaetigungen: usize,
    /// Maximale Anzahl zurueckgestellter, nicht entschluesselbarer Envelopes
    pub wiederholungs_warteschlange: usize,
}

impl Default for PipelineEinstellungen {
    fn default() -> Self {
        Self {
            klartext_cache: 1000,
            dedup_fenster: 4096,
            offene_bestaetigungen: 256,
            wiederholungs_warteschlange: 256,
        }
    }
}

/// Argon2id-Parameter fuer die Backup-Passphrase
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupEinstellungen {
    /// Speicherkosten in KiB
    pub m_cost: u32,
    /// Iterationen
    pub t_cost: u32,
    /// Parallelismus
    pub p_cost: u32,
}

impl Default for BackupEinstellungen {
    fn default() -> Self {
        Self {
            m_cost: 19 * 1024,
            t_cost: 2,
            p_cost: 1,
        }
    }
}

/// Proof-of-Work-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbeitsnachweisEinstellungen {
    /// Nach wie vielen Hash-Versuchen die Kontrolle abgegeben wird
    pub yield_intervall: u64,
}

impl Default for ArbeitsnachweisEinstellungen {
    fn default() -> Self {
        Self {
            yield_intervall: 1024,
        }
    }
}

/// Lokaler Speicher fuer Schluesselmaterial
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeicherEinstellungen {
    /// SQLite-URL
    pub url: String,
    /// Ob WAL-Modus aktiviert werden soll
    pub wal: bool,
}

impl Default for SpeicherEinstellungen {
    fn default() -> Self {
        Self {
            url: "sqlite://tresor.db".into(),
            wal: true,
        }
    }
}

/// Logging-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingEinstellungen {
    /// Log-Level: "trace", "debug", "info", "warn", "error"
    pub level: String,
    /// Format: "json" oder "text"
    pub format: String,
}

impl Default for LoggingEinstellungen {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl TresorConfig {
    /// Laedt die Konfiguration aus einer TOML-Datei.
    /// Gibt die Standardkonfiguration zurueck wenn die Datei nicht existiert.
    pub fn laden(pfad: &str) -> anyhow::Result<Self> {
        match std::fs::read_to_string(pfad) {
            Ok(inhalt) => {
                let config: Self = toml::from_str(&inhalt)
                    .map_err(|e| anyhow::anyhow!("Konfigurationsfehler in '{pfad}': {e}"))?;
                config.pruefen()?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    pfad = pfad,
                    "Konfigurationsdatei nicht gefunden, verwende Standardwerte"
                );
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "Konfigurationsdatei '{pfad}' nicht lesbar: {e}"
            )),
        }
    }

    /// Prueft Werte, die zur Laufzeit nicht sinnvoll waeren
    pub fn pruefen(&self) -> anyhow::Result<()> {
        if self.schluessel.one_time_batch == 0 {
            anyhow::bail!("schluessel.one_time_batch muss groesser als 0 sein");
        }
        if self.schluessel.nachliefern_unter > self.schluessel.one_time_batch {
            anyhow::bail!("schluessel.nachliefern_unter darf one_time_batch nicht uebersteigen");
        }
        if self.pipeline.klartext_cache == 0 || self.pipeline.dedup_fenster == 0 {
            anyhow::bail!("pipeline-Grenzen muessen groesser als 0 sein");
        }
        if self.arbeitsnachweis.yield_intervall == 0 {
            anyhow::bail!("arbeitsnachweis.yield_intervall muss groesser als 0 sein");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_config_ist_valide() {
        let cfg = TresorConfig::default();
        assert_eq!(cfg.schluessel.one_time_batch, 100);
        assert_eq!(cfg.pipeline.klartext_cache, 1000);
        assert_eq!(cfg.logging.level, "info");
        assert!(cfg.pruefen().is_ok());
    }

    #[test]
    fn config_aus_toml_string() {
        let toml = r#"
            [schluessel]
            one_time_batch = 20

            [backup]
            m_cost = 64
        "#;
        let cfg: TresorConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.schluessel.one_time_batch, 20);
        assert_eq!(cfg.backup.m_cost, 64);
        // Nicht angegebene Felder behalten Standardwerte
        assert_eq!(cfg.schluessel.nachliefern_unter, 10);
        assert_eq!(cfg.backup.t_cost, 2);
    }

    #[test]
    fn ungueltige_batch_groesse_abgelehnt() {
        let mut cfg = TresorConfig::default();
        cfg.schluessel.one_time_batch = 0;
        assert!(cfg.pruefen().is_err());
    }

    #[test]
    fn fehlende_datei_ergibt_standardwerte() {
        let cfg = TresorConfig::laden("/nicht/vorhanden/tresor.toml").unwrap();
        assert_eq!(cfg.speicher.url, "sqlite://tresor.db");
    }
}
