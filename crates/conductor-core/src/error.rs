//! Domain errors that callers need to tell apart
//!
//! Everything else travels as `anyhow::Error`; these variants are wrapped in
//! it and recovered with [`is_cancellation`] / `downcast_ref` where a layer
//! has to react to a specific failure.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConductorError {
    #[error("Unknown agent '{0}' and no default agent is registered")]
    UnknownAgent(String),

    #[error("Maximum delegation depth exceeded (depth {depth}, max {max})")]
    DepthExceeded { depth: u32, max: u32 },

    #[error("Operation cancelled by user.")]
    Cancelled,

    #[error("A request is already in flight for conversation '{0}'")]
    Busy(String),

    #[error("Trace '{0}' is already finalized")]
    TraceFinalized(String),

    #[error("Trace '{0}' not found")]
    TraceNotFound(String),
}

/// Whether an error chain bottoms out in a user cancellation
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<ConductorError>(),
        Some(ConductorError::Cancelled)
    )
}
