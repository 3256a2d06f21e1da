//! Structured Logging
//!
//! JSON output for log aggregation and pretty output for development, plus
//! structured events for index allocation, receiver issuance and account
//! lifecycle.
//!
//! # Usage
//!
//! ```rust,ignore
//! use account_receivers::logging::{init_logging, LogLevel};
//!
//! init_logging(LogLevel::Info, true)?;
//! tracing::info!(target: "receivers::issuer", account_id = %id, "Issuing receiver");
//! ```

use serde::Serialize;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::types::DerivationIndex;

// ============================================================================
// Log Levels
// ============================================================================

/// Application log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

impl LogLevel {
    fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

// ============================================================================
// Structured Event Types
// ============================================================================

/// Event categories for structured logging
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Derivation index reservations
    Allocation,
    /// Receiver and address issuance
    Receiver,
    /// Account creation and lookup
    Account,
    /// System events (startup, shutdown)
    System,
    /// Failed requests of any category
    Error,
}

/// Structured log event
#[derive(Debug, Serialize)]
pub struct LogEvent {
    /// Event timestamp (ISO 8601)
    pub timestamp: String,
    /// Log level
    pub level: String,
    /// Event category
    pub category: EventCategory,
    /// Human-readable message
    pub message: String,
    /// Correlation ID for request tracing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Additional structured data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Error details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
}

/// Error details for error events
#[derive(Debug, Serialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
}

impl LogEvent {
    /// Create a new log event
    pub fn new(level: LogLevel, category: EventCategory, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: level.as_filter().to_uppercase(),
            category,
            message: message.into(),
            correlation_id: None,
            data: None,
            error: None,
        }
    }

    /// Add correlation ID
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Add structured data
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Add error details
    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error = Some(ErrorDetails {
            code: code.into(),
            message: message.into(),
        });
        self
    }

    /// Serialize to a JSON line
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"error\": \"failed to serialize log\", \"message\": \"{}\"}}",
                self.message
            )
        })
    }
}

// ============================================================================
// Domain Event Logging
// ============================================================================

/// Log a committed index reservation
pub fn log_allocation_event(index: &DerivationIndex, attempts: usize) {
    let event = LogEvent::new(LogLevel::Info, EventCategory::Allocation, "index_allocated")
        .with_correlation_id(index.account_id.as_str())
        .with_data(serde_json::json!({
            "account_id": index.account_id,
            "branch": index.branch,
            "index": index.index,
            "attempts": attempts,
        }));

    tracing::info!(target: "receivers::allocator", "{}", event.to_json());
}

/// Receiver issuance outcome. Failures carry the error category.
pub fn receiver_event(
    event_type: &str,
    correlation_id: &str,
    account_id: &str,
    index: Option<&DerivationIndex>,
    error: Option<(&str, &str)>,
) -> LogEvent {
    let (level, category) = match error {
        None => (LogLevel::Info, EventCategory::Receiver),
        Some(_) => (LogLevel::Error, EventCategory::Error),
    };
    let mut event = LogEvent::new(level, category, event_type)
        .with_correlation_id(correlation_id)
        .with_data(serde_json::json!({
            "account_id": account_id,
            "branch": index.map(|i| i.branch),
            "index": index.map(|i| i.index),
            "success": error.is_none(),
        }));

    if let Some((code, message)) = error {
        event = event.with_error(code, message);
    }
    event
}

/// Log a receiver issuance outcome
pub fn log_receiver_event(
    event_type: &str,
    correlation_id: &str,
    account_id: &str,
    index: Option<&DerivationIndex>,
    error: Option<(&str, &str)>,
) {
    let success = error.is_none();
    let event = receiver_event(event_type, correlation_id, account_id, index, error);

    if success {
        tracing::info!(target: "receivers::issuer", "{}", event.to_json());
    } else {
        tracing::error!(target: "receivers::issuer", "{}", event.to_json());
    }
}

/// Log an account lifecycle event
pub fn log_account_event(event_type: &str, account_id: &str, alias: Option<&str>, keys: usize, quorum: u8) {
    let event = LogEvent::new(LogLevel::Info, EventCategory::Account, event_type)
        .with_correlation_id(account_id)
        .with_data(serde_json::json!({
            "account_id": account_id,
            "alias": alias,
            "keys": keys,
            "quorum": quorum,
        }));

    tracing::info!(target: "receivers::account", "{}", event.to_json());
}

// ============================================================================
// Initialization
// ============================================================================

/// Initialize the logging system
///
/// `RUST_LOG` overrides `level` when set.
pub fn init_logging(level: LogLevel, json_format: bool) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "receivers={level},account_receivers={level}",
            level = level.as_filter()
        ))
    });

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .pretty()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    }

    Ok(())
}

/// Initialize logging from ReceiverConfig
pub fn init_from_config(config: &crate::config::ReceiverConfig) -> Result<(), LoggingError> {
    let level = LogLevel::from(config.log_level.as_str());
    init_logging(level, config.log_json)
}

/// Logging errors
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to initialize logging: {0}")]
    InitFailed(String),
}

/// Generate a unique correlation ID for request tracing
pub fn generate_correlation_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    format!("{:x}-{:04x}", millis & 0xFFFF_FFFF, rand::random::<u16>())
}
