//! Domain-specific error types for pxedeploy.
//!
//! This module defines `DeployError`, a `thiserror`-based enum covering the
//! failures that abort a deployment: configuration mistakes detected before
//! any node is touched, and misuse of the engine API. Per-node step failures
//! are *not* errors; they travel as KO membership through the task queue.
//!
//! `DeployError` implements `Into<anyhow::Error>`, so the `?` operator
//! converts it automatically at trait boundaries that return `anyhow::Result`.

use std::io;

/// Formats an IO error kind into a human-readable message.
///
/// Provides consistent, user-friendly messages for common IO error kinds
/// (e.g., "I/O error: not found") instead of the OS-level messages
/// (e.g., "No such file or directory (os error 2)"). For unrecognized
/// error kinds, falls back to including the OS-level error message.
pub(crate) fn io_error_kind_message(err: &io::Error) -> String {
    match err.kind() {
        io::ErrorKind::NotFound => "I/O error: not found".to_string(),
        io::ErrorKind::PermissionDenied => "I/O error: permission denied".to_string(),
        io::ErrorKind::IsADirectory => "I/O error: is a directory".to_string(),
        _ => format!("I/O error: {}", err),
    }
}

/// Domain-specific error type for pxedeploy.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DeployError {
    /// The deployment file or the phase table is malformed.
    #[error("configuration error: {0}")]
    Config(String),

    /// A phase or nested phase table references a step nobody provides.
    #[error("unknown step '{name}' referenced by {context}")]
    UnknownStep {
        /// The unresolved step name.
        name: String,
        /// Where the reference was found (e.g. "phase 2").
        context: String,
    },

    /// A catalogue step rejected its positional parameters.
    #[error("invalid parameters for step '{step}': {reason}")]
    InvalidStepParams {
        /// The configured step name.
        step: String,
        /// Why the constructor refused them.
        reason: String,
    },

    /// Nested phase tables reference each other in a loop.
    #[error("nested phase tables form a cycle: {0}")]
    NestingCycle(String),

    /// `start()` was called on a manager that already ran.
    #[error("task manager '{0}' has already been started")]
    AlreadyStarted(String),

    /// A command execution failed (spawn failure, wait failure, thread panic, etc.).
    #[error("command execution failed: {command}: {status}")]
    Execution {
        /// The command that was executed.
        command: String,
        /// Human-readable reason for the failure.
        status: String,
    },

    /// The program of a `command` step could not be found in `PATH`.
    #[error("command not found in PATH: {command}")]
    CommandNotFound {
        /// The program name as configured.
        command: String,
    },

    /// An I/O operation failed with contextual information.
    #[error("{context}: {message}")]
    Io {
        /// What was being done when the error occurred, usually a path.
        context: String,
        /// Human-readable description derived from [`io_error_kind_message`].
        message: String,
        /// The underlying I/O error, preserved for programmatic inspection.
        #[source]
        source: std::io::Error,
    },
}

impl DeployError {
    /// Creates an `Io` variant with the `message` field derived from the `source`.
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            message: io_error_kind_message(&source),
            source,
        }
    }

    /// Creates an `UnknownStep` variant.
    pub(crate) fn unknown_step(name: impl Into<String>, context: impl Into<String>) -> Self {
        Self::UnknownStep {
            name: name.into(),
            context: context.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_display() {
        let err = DeployError::Config("phase table must not be empty".to_string());
        assert_eq!(err.to_string(), "configuration error: phase table must not be empty");
    }

    #[test]
    fn test_unknown_step_display() {
        let err = DeployError::unknown_step("format_tmp", "phase 2");
        assert_eq!(err.to_string(), "unknown step 'format_tmp' referenced by phase 2");
    }

    #[test]
    fn test_invalid_params_display() {
        let err = DeployError::InvalidStepParams {
            step: "reboot".to_string(),
            reason: "a program is required".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid parameters for step 'reboot': a program is required"
        );
    }

    #[test]
    fn test_already_started_display() {
        let err = DeployError::AlreadyStarted("griffon".to_string());
        assert_eq!(err.to_string(), "task manager 'griffon' has already been started");
    }

    #[test]
    fn test_execution_display() {
        let err = DeployError::Execution {
            command: "ssh".to_string(),
            status: "exit status: 255".to_string(),
        };
        assert_eq!(err.to_string(), "command execution failed: ssh: exit status: 255");
    }

    #[test]
    fn test_io_display_and_source() {
        let err = DeployError::io(
            "/etc/deploy.yaml",
            io::Error::new(io::ErrorKind::NotFound, "entity not found"),
        );
        assert_eq!(err.to_string(), "/etc/deploy.yaml: I/O error: not found");
        match &err {
            DeployError::Io { source, .. } => assert_eq!(source.kind(), io::ErrorKind::NotFound),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_io_error_kind_message_other() {
        let err = io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused");
        assert!(io_error_kind_message(&err).starts_with("I/O error: "));
    }

    #[test]
    fn test_into_anyhow_error() {
        let err = DeployError::NestingCycle("a -> b -> a".to_string());
        let anyhow_err: anyhow::Error = err.into();
        let downcast = anyhow_err.downcast_ref::<DeployError>();
        assert!(matches!(downcast, Some(DeployError::NestingCycle(_))));
    }
}
