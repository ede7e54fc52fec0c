//! Error taxonomy shared across the engine.
//!
//! Every fallible operation exposed by the core returns one of the kinds
//! below instead of a bag of ad hoc strings, so callers (Control Surface,
//! tests) can branch on `kind()` without parsing messages.

use std::collections::BTreeMap;
use std::fmt;

/// Structured context attached to an error: small, serializable, and safe to
/// log. Never put secrets (API keys, master keys) in here.
pub type Context = BTreeMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("transport error: {message}")]
    Transport { message: String, context: Context },

    #[error("heartbeat timeout after {millis_since_last_frame}ms")]
    HeartbeatTimeout { millis_since_last_frame: u64 },

    #[error("parse error: {message}")]
    Parse { message: String, context: Context },

    #[error("validation error: {message}")]
    Validation { message: String, context: Context },

    #[error("capacity exhausted: {resource}")]
    CapacityExhausted { resource: String },

    #[error("not found: {resource} {id}")]
    NotFound { resource: String, id: String },

    #[error("duplicate: {resource} {id}")]
    Duplicate { resource: String, id: String },

    #[error("sink error in '{sink}': {message}")]
    Sink { sink: String, message: String },

    #[error("operation timed out after {millis}ms")]
    Timeout { millis: u64 },

    #[error("fatal init error: {message}")]
    FatalInit { message: String },
}

/// Stable, loggable name for each error kind, matching the taxonomy in the
/// system design (§7): used for counters and structured logging, never for
/// control flow via string matching.
impl EngineError {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Transport { .. } => "transport_error",
            EngineError::HeartbeatTimeout { .. } => "heartbeat_timeout",
            EngineError::Parse { .. } => "parse_error",
            EngineError::Validation { .. } => "validation_error",
            EngineError::CapacityExhausted { .. } => "capacity_exhausted",
            EngineError::NotFound { .. } => "not_found",
            EngineError::Duplicate { .. } => "duplicate",
            EngineError::Sink { .. } => "sink_error",
            EngineError::Timeout { .. } => "timeout",
            EngineError::FatalInit { .. } => "fatal_init",
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        EngineError::Transport { message: message.into(), context: Context::new() }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        EngineError::Parse { message: message.into(), context: Context::new() }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        EngineError::Validation { message: message.into(), context: Context::new() }
    }

    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        EngineError::NotFound { resource: resource.into(), id: id.into() }
    }

    pub fn duplicate(resource: impl Into<String>, id: impl Into<String>) -> Self {
        EngineError::Duplicate { resource: resource.into(), id: id.into() }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        match &mut self {
            EngineError::Transport { context, .. }
            | EngineError::Parse { context, .. }
            | EngineError::Validation { context, .. } => {
                context.insert(key.into(), value.into());
            }
            _ => {}
        }
        self
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// A parse failure kind, narrower than `EngineError`, returned by the Parser
/// so per-record failures can be counted by kind without constructing a
/// full `EngineError` (and its `Context` map) on the hot path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ParseErrorKind {
    MalformedEnvelope,
    UnknownEventTag,
    UnknownQuoteAsset,
    MissingField,
    InvalidNumber,
    StaleOrFutureTimestamp,
    NonPositivePrice,
    NegativeQuantity,
    BatchTooLarge,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParseErrorKind::MalformedEnvelope => "malformed_envelope",
            ParseErrorKind::UnknownEventTag => "unknown_event_tag",
            ParseErrorKind::UnknownQuoteAsset => "unknown_quote_asset",
            ParseErrorKind::MissingField => "missing_field",
            ParseErrorKind::InvalidNumber => "invalid_number",
            ParseErrorKind::StaleOrFutureTimestamp => "stale_or_future_timestamp",
            ParseErrorKind::NonPositivePrice => "non_positive_price",
            ParseErrorKind::NegativeQuantity => "negative_quantity",
            ParseErrorKind::BatchTooLarge => "batch_too_large",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub detail: String,
}

impl ParseError {
    pub fn new(kind: ParseErrorKind, detail: impl Into<String>) -> Self {
        Self { kind, detail: detail.into() }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

impl std::error::Error for ParseError {}
