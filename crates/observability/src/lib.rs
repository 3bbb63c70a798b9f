//! # tresor-observability
//!
//! Structured Logging via tracing-subscriber (Text oder JSON).
//! Geheimes Schluesselmaterial wird nie geloggt; die `Debug`-Implementierungen
//! der Krypto-Typen schwaerzen es.

pub mod logging;

pub use logging::{log_format_gueltig, log_level_gueltig, logging_initialisieren};
