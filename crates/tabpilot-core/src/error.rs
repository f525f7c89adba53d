use thiserror::Error;

/// Unified error type for tabpilot.
#[derive(Error, Debug)]
pub enum PilotError {
    // ── Driver errors ──────────────────────────────────────────
    #[error("trigger not found: {0}")]
    TriggerNotFound(String),

    #[error("precondition timeout: {step} after {elapsed_ms}ms")]
    PreconditionTimeout { step: String, elapsed_ms: u64 },

    #[error("action failed: {step}: {reason}")]
    ActionFailed { step: String, reason: String },

    #[error("aborted: {0}")]
    Aborted(String),

    // ── Device errors ──────────────────────────────────────────
    #[error("device error: {0}")]
    Device(String),

    // ── Transport errors ───────────────────────────────────────
    #[error("transport disconnected: {0}")]
    TransportDisconnected(String),

    #[error("transfer rejected: {id}: {reason}")]
    TransferRejected { id: String, reason: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    #[error("config validation failed: {field}: {reason}")]
    ConfigValidation { field: String, reason: String },

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl PilotError {
    /// Whether a caller can reasonably retry the whole operation later.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PilotError::PreconditionTimeout { .. }
                | PilotError::TransportDisconnected(_)
                | PilotError::TransferRejected { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PilotError>;
