//! Error types for mirror operations.
//!
//! Every failure the tools can hit falls into one of four groups:
//! configuration problems (skipped and logged), environment problems
//! (fatal for the whole invocation), transient rule problems (retried
//! with bounded polling) and per-pair reconciliation failures.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for mirror operations.
pub type MirrorResult<T> = Result<T, MirrorError>;

/// Errors that can occur while reconciling mirror rules.
#[derive(Debug, Error)]
pub enum MirrorError {
    /// Failed to execute a command (spawn error).
    #[error("Failed to execute command '{command}': {source}")]
    ShellExec {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Command returned non-zero exit code.
    #[error("Command failed: '{command}' (exit code {exit_code}): {output}")]
    ShellCommandFailed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// Configuration validation error.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig {
        /// The field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    /// Required tooling or privilege is missing.
    #[error("Environment not usable: {message}")]
    Environment {
        /// Error message.
        message: String,
    },

    /// No guest configuration exists for the given id.
    #[error("Guest {guest_id} not found")]
    GuestNotFound {
        /// The guest identifier.
        guest_id: u32,
    },

    /// Interface did not show up within the wait budget.
    #[error("Interface '{interface}' did not appear within {waited:?}")]
    InterfaceNotReady {
        /// The interface name.
        interface: String,
        /// How long we waited.
        waited: Duration,
    },

    /// A created filter could not be found again in the filter listing.
    #[error("No handle found for new filter on '{interface}' (prio {priority})")]
    HandleNotFound {
        /// The interface the filter was added to.
        interface: String,
        /// The filter priority.
        priority: u16,
    },

    /// Rules did not reach the expected state before the deadline.
    #[error("Timed out waiting for {operation} of mirror {guest_interface} <-> {physical_interface}")]
    ConfirmTimeout {
        /// "creation" or "removal".
        operation: &'static str,
        /// Guest side of the pair.
        guest_interface: String,
        /// Physical side of the pair.
        physical_interface: String,
    },

    /// Output of a query command could not be understood.
    #[error("Unparseable output from '{command}': {message}")]
    ParseOutput {
        /// The query command.
        command: String,
        /// Error message.
        message: String,
    },

    /// Reading or writing the persisted state failed.
    #[error("State store error at {}: {source}", path.display())]
    StateStore {
        /// The file involved.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl MirrorError {
    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates an environment error.
    pub fn environment(message: impl Into<String>) -> Self {
        Self::Environment {
            message: message.into(),
        }
    }

    /// Creates an interface not ready error.
    pub fn interface_not_ready(interface: impl Into<String>, waited: Duration) -> Self {
        Self::InterfaceNotReady {
            interface: interface.into(),
            waited,
        }
    }

    /// Creates a state store error.
    pub fn state_store(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::StateStore {
            path: path.into(),
            source,
        }
    }

    /// Creates an output parse error.
    pub fn parse_output(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ParseOutput {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this error indicates a transient condition
    /// that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MirrorError::InterfaceNotReady { .. }
                | MirrorError::HandleNotFound { .. }
                | MirrorError::ShellCommandFailed { .. }
        )
    }

    /// Returns true if the whole invocation must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MirrorError::Environment { .. }
                | MirrorError::GuestNotFound { .. }
                | MirrorError::InvalidConfig { .. }
        )
    }
}
