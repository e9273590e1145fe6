use thiserror::Error;

use crate::store::{StoreError, Table};

pub type CoreResult<T> = Result<T, CoreError>;

/// Failure taxonomy shared by every operation in the delivery engine.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Missing/null required field or a request that can never succeed as sent.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("no {table} record matched")]
    EmptyResult { table: Table },

    #[error("{count} {table} records matched where exactly one was required")]
    MultipleResults { table: Table, count: usize },

    /// The client did not acknowledge in time; the event may or may not have arrived.
    #[error("acknowledgement for `{event}` not received within {timeout_ms}ms")]
    DeliveryTimeout { event: String, timeout_ms: u64 },

    /// The client processed the event and explicitly declined it.
    #[error("client rejected `{event}`: {reason}")]
    ClientRejected { event: String, reason: String },

    #[error("connection `{0}` is not live")]
    Presence(String),

    #[error("transport failure: {0}")]
    Transport(String),
}

impl CoreError {
    pub fn missing(field: &str) -> Self {
        CoreError::Validation(format!("missing required field `{field}`"))
    }

    pub fn is_client_rejected(&self) -> bool {
        matches!(self, CoreError::ClientRejected { .. })
    }

    pub fn is_empty_result(&self) -> bool {
        matches!(self, CoreError::EmptyResult { .. })
    }

    /// Short label used for metrics and structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation",
            CoreError::Storage(_) => "storage",
            CoreError::EmptyResult { .. } => "empty_result",
            CoreError::MultipleResults { .. } => "multiple_results",
            CoreError::DeliveryTimeout { .. } => "delivery_timeout",
            CoreError::ClientRejected { .. } => "client_rejected",
            CoreError::Presence(_) => "presence",
            CoreError::Transport(_) => "transport",
        }
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::EmptyResult { table } => CoreError::EmptyResult { table },
            StoreError::MultipleResults { table, count } => {
                CoreError::MultipleResults { table, count }
            }
            StoreError::Duplicate { table, key } => {
                CoreError::Validation(format!("{table} record `{key}` already exists"))
            }
            StoreError::Backend(message) | StoreError::Codec(message) => {
                CoreError::Storage(message)
            }
        }
    }
}

/// Unwraps a required request field, reporting its wire name when absent.
pub fn require<T>(value: Option<T>, field: &str) -> CoreResult<T> {
    value.ok_or_else(|| CoreError::missing(field))
}

/// Like [`require`] but also rejects blank strings.
pub fn require_text(value: Option<String>, field: &str) -> CoreResult<String> {
    match value {
        Some(text) if !text.trim().is_empty() => Ok(text),
        _ => Err(CoreError::missing(field)),
    }
}
