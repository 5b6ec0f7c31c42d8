//! Custom error types for the workflow controller.
//!
//! This module defines the primary error type, `WorkflowError`, for the whole
//! crate. Using the `thiserror` crate, it provides a single place for the
//! failure modes of the controller, from malformed protocol input to
//! instrument task failures.
//!
//! ## Error Hierarchy
//!
//! - **`Validation`**: Malformed or contradictory input, such as a repeat count
//!   that does not match the number of unrolled scans, or a non-positive decay
//!   limit. Aborts the current handler.
//! - **`Configuration`**: Configuration that is missing for the chosen policy,
//!   for example recentring mode `none` without solver reference parameters.
//! - **`Config`**: Wraps errors from loading or validating the configuration
//!   file itself.
//! - **`Protocol`**: An inbound message that cannot be decoded. Terminates the
//!   dispatch loop.
//! - **`Solver`**: The external geometry solver produced no usable result.
//! - **`CentringFailed`**: No translation source was left after a solver or
//!   centring failure.
//! - **`TaskExecution`**: An enqueued instrument task failed. Handlers turn this
//!   into a status code rather than propagating it.
//!
//! By using `#[from]`, `WorkflowError` can be created from the component error
//! types, so `?` works across module boundaries.

use crate::config::ConfigError;
use crate::lattice::SelectionError;
use crate::recentring::SolverError;
use crate::session::WorkflowState;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, WorkflowError>;

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Configuration file error: {0}")]
    Config(#[from] ConfigError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Lattice selection error: {0}")]
    Selection(#[from] SelectionError),

    #[error("Geometry solver failure: {0}")]
    Solver(#[from] SolverError),

    #[error("Centring gave no result")]
    CentringFailed,

    #[error("Task execution failed: {0}")]
    TaskExecution(#[from] TaskError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Workflow cannot {action} in state {state:?}")]
    InvalidState {
        action: &'static str,
        state: WorkflowState,
    },

    #[error("No workflow session is active")]
    NoSession,
}

/// Failure reported by the instrument task executor.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    #[error("Task '{name}' failed: {reason}")]
    Failed { name: String, reason: String },

    #[error("Task '{0}' was aborted")]
    Aborted(String),
}
