//! Structured Logging Setup via tracing-subscriber
//!
//! Konfigurierbar per Umgebungsvariable (hat Vorrang vor der Konfiguration):
//! - `TRESOR_LOG_LEVEL`: Filter-Ausdruck, z.B. `info` oder `tresor_session=debug`
//! - `TRESOR_LOG_FORMAT`: Format (text/json)

use tracing_subscriber::{fmt, EnvFilter};
use tresor_core::config::LoggingEinstellungen;

pub const ENV_LEVEL: &str = "TRESOR_LOG_LEVEL";
pub const ENV_FORMAT: &str = "TRESOR_LOG_FORMAT";

/// Initialisiert das Logging-System.
///
/// Darf nur einmal pro Prozess aufgerufen werden; ein zweiter Aufruf
/// liefert einen Fehler statt zu paniken.
pub fn logging_initialisieren(config: &LoggingEinstellungen) -> anyhow::Result<()> {
    if !log_level_gueltig(&config.level) {
        anyhow::bail!("Ungueltiger Log-Level '{}'", config.level);
    }

    let filter = EnvFilter::try_from_env(ENV_LEVEL)
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let format = format_waehlen(std::env::var(ENV_FORMAT).ok(), &config.format);

    let ergebnis = match format.as_str() {
        "json" => fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_current_span(true)
            .try_init(),
        _ => fmt().with_env_filter(filter).with_target(true).try_init(),
    };
    ergebnis.map_err(|e| anyhow::anyhow!("Logging bereits initialisiert: {e}"))?;

    tracing::debug!(format = %format, "Logging initialisiert");
    Ok(())
}

/// Umgebungsvariable vor Konfiguration, ungueltige Werte fallen auf "text"
fn format_waehlen(aus_env: Option<String>, aus_config: &str) -> String {
    let gewaehlt = aus_env.unwrap_or_else(|| aus_config.to_string());
    if log_format_gueltig(&gewaehlt) {
        gewaehlt
    } else {
        "text".to_string()
    }
}

/// Validiert ob ein Log-Level-String gueltig ist.
pub fn log_level_gueltig(level: &str) -> bool {
    matches!(level, "trace" | "debug" | "info" | "warn" | "error")
}

/// Validiert ob ein Log-Format-String gueltig ist.
pub fn log_format_gueltig(format: &str) -> bool {
    matches!(format, "text" | "json")
}
