//! Error kinds (SPEC_FULL.md §7). These are propagated verbatim up through
//! Proxy and Supervisor operations; a collaborating HTTP layer would map
//! [`GatewayError::status_code_hint`] onto an actual status code.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("model file missing: {0}")]
    ModelFileMissing(String),

    #[error("failed to load model: {0}")]
    LoadFailed(String),

    #[error("worker not running")]
    WorkerNotRunning,

    #[error("worker crashed: {0}")]
    WorkerCrashed(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("generation failed: {0}")]
    GenerationError(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),
}

impl GatewayError {
    /// The HTTP status an external collaborator should map this onto
    /// (SPEC_FULL.md §7's propagation policy). Not used internally — the
    /// HTTP surface itself is out of scope for this crate.
    pub fn status_code_hint(&self) -> u16 {
        match self {
            GatewayError::UnknownModel(_) => 404,
            GatewayError::ModelFileMissing(_) => 500,
            GatewayError::LoadFailed(_)
            | GatewayError::Timeout(_)
            | GatewayError::WorkerCrashed(_)
            | GatewayError::GenerationError(_) => 500,
            GatewayError::WorkerNotRunning | GatewayError::ProtocolError(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
