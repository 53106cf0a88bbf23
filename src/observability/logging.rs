//! Tracing subscriber setup and the span macros used across the client
//!
//! Output is chosen with `LOG_FORMAT`:
//!
//! | value     | output                                   |
//! |-----------|------------------------------------------|
//! | `json`    | one JSON object per line (the default)   |
//! | `pretty`  | multi-line, coloured, for local debugging|
//! | `compact` | single-line, coloured, no targets        |
//!
//! `LOG_LEVEL` picks the level (INFO when unset or unknown), `LOG_SPANS=true`
//! adds span open/close events and `RUST_LOG` replaces the whole filter.
//! Without `RUST_LOG`, chatty dependencies are held at WARN.
//!
//! ```bash
//! LOG_FORMAT=pretty LOG_LEVEL=DEBUG courier run
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Dependencies that are only interesting when they fail
const QUIET_TARGETS: &[&str] = &["rumqttc", "sled", "reqwest", "hyper", "tokio"];

/// Log output format options
#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    /// JSON format for structured logging (machine-readable)
    Json,
    /// Pretty format with colors and indentation (human-readable)
    Pretty,
    /// Compact format with colors but minimal spacing (terminal-friendly)
    Compact,
}

impl LogFormat {
    /// Parse log format from string
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Parse a level name, defaulting to INFO
pub fn parse_level(s: &str) -> Level {
    match s.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "INFO" => Level::INFO,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

fn build_filter(level: Level) -> EnvFilter {
    if let Ok(rust_log) = env::var("RUST_LOG") {
        return EnvFilter::new(rust_log);
    }
    QUIET_TARGETS
        .iter()
        .fold(EnvFilter::new(level.to_string()), |filter, target| {
            match format!("{target}=warn").parse() {
                Ok(directive) => filter.add_directive(directive),
                Err(_) => filter,
            }
        })
}

fn span_events(include_spans: bool) -> fmt::format::FmtSpan {
    if include_spans {
        fmt::format::FmtSpan::NEW | fmt::format::FmtSpan::CLOSE
    } else {
        fmt::format::FmtSpan::NONE
    }
}

/// Initialize logging with manual configuration
pub fn init_logging(level: Level, format: LogFormat, include_spans: bool) {
    let subscriber = tracing_subscriber::registry().with(build_filter(level));

    // A second initialisation (tests, embedding apps) keeps the first subscriber
    let result = match format {
        LogFormat::Json => subscriber
            .with(fmt::layer().json().with_span_events(span_events(include_spans)))
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
    };
    if let Err(e) = result {
        tracing::debug!(error = %e, "Logging already initialised");
    }
}

/// Initialize logging from environment variables
pub fn init_default_logging() {
    let level = parse_level(&env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()));
    let format = LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string()));
    let include_spans = env::var("LOG_SPANS")
        .unwrap_or_else(|_| "false".to_string())
        .to_lowercase()
        == "true";

    init_logging(level, format, include_spans);
}

/// Span covering one session worker
#[macro_export]
macro_rules! session_span {
    ($($field:tt)*) => {
        tracing::info_span!("courier_session", $($field)*)
    };
}

/// Span covering one transport supervisor
#[macro_export]
macro_rules! transport_span {
    ($($field:tt)*) => {
        tracing::info_span!("mqtt_connection", $($field)*)
    };
}

/// Span covering the incoming message delivery task
#[macro_export]
macro_rules! persistence_span {
    ($($field:tt)*) => {
        tracing::info_span!("message_delivery", $($field)*)
    };
}

pub use {persistence_span, session_span, transport_span};
