// Error types for fanout
//
// Two layers: `OperationError` is what a single dispatch can produce and is
// always folded into a Response; `FanoutError` aborts a whole run.

use std::fmt;
use std::io::IsTerminal;
use std::path::PathBuf;

use colored::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Initialize color output based on TTY detection and NO_COLOR environment variable
fn should_use_colors() -> bool {
    // Check NO_COLOR environment variable first (https://no-color.org/)
    if std::env::var("NO_COLOR").is_ok() {
        return false;
    }

    // Check if stderr is a TTY (errors are typically written to stderr)
    std::io::stderr().is_terminal()
}

/// Classification of a failed dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Name resolution, TCP connect or transport timeout failed
    Unreachable,
    /// SSH authentication or escalation password rejected
    AuthError,
    /// sudo demanded a terminal even after retrying with one
    EscalationRequiresTTY,
    /// Remote command exited with a non-zero status
    ReturnCodeNotZero,
    /// Remote command was killed by a signal
    ProcessSignalled,
    /// An SFTP call failed
    SftpError,
    /// A user callback returned an error
    CallbackError,
    /// The program asked for something its method intent forbids
    ProtocolMisuse,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Unreachable => "Unreachable",
            ErrorKind::AuthError => "AuthError",
            ErrorKind::EscalationRequiresTTY => "EscalationRequiresTTY",
            ErrorKind::ReturnCodeNotZero => "ReturnCodeNotZero",
            ErrorKind::ProcessSignalled => "ProcessSignalled",
            ErrorKind::SftpError => "SftpError",
            ErrorKind::CallbackError => "CallbackError",
            ErrorKind::ProtocolMisuse => "ProtocolMisuse",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dispatch failure, localised to one host and one operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct OperationError {
    pub kind: ErrorKind,
    pub message: String,
}

impl OperationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        OperationError {
            kind,
            message: message.into(),
        }
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unreachable, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthError, message)
    }

    pub fn sftp(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SftpError, message)
    }

    pub fn misuse(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProtocolMisuse, message)
    }
}

/// Run-level failures. These abort `execute` as a whole; everything else
/// is reported per host inside the result list.
#[derive(Debug)]
pub enum FanoutError {
    /// `endpoint_execute` was called before a default inventory was set
    InventoryMissing,

    /// Inventory could not be loaded or is inconsistent
    Inventory {
        message: String,
        suggestion: Option<String>,
    },

    /// I/O errors (inventory files, run logs)
    Io {
        message: String,
        path: Option<PathBuf>,
    },

    /// The program factory failed while creating a per-host instance
    ProgramFactory { message: String },

    /// A per-host executor panicked; remaining hosts were cancelled
    Executor { host: String, message: String },
}

impl std::error::Error for FanoutError {}

impl fmt::Display for FanoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Set color mode based on TTY detection and NO_COLOR
        let use_colors = should_use_colors();
        if !use_colors {
            colored::control::set_override(false);
        }

        match self {
            FanoutError::InventoryMissing => {
                writeln!(f, "{}: no default inventory is set", "INVENTORY ERROR".red().bold())?;
                writeln!(f)?;
                writeln!(
                    f,
                    "{}: call set_default_inventory() at startup or pass --inventory",
                    "Hint".yellow().bold()
                )?;
                Ok(())
            }

            FanoutError::Inventory {
                message,
                suggestion,
            } => {
                writeln!(f, "{}: {}", "INVENTORY ERROR".red().bold(), message)?;

                if let Some(suggestion) = suggestion {
                    writeln!(f)?;
                    writeln!(f, "{}: {}", "Hint".yellow().bold(), suggestion)?;
                }

                Ok(())
            }

            FanoutError::Io { message, path } => {
                writeln!(f, "{}: {}", "I/O ERROR".red().bold(), message)?;
                if let Some(path) = path {
                    writeln!(f, "  {} {}", "Path:".dimmed(), path.display())?;
                }
                Ok(())
            }

            FanoutError::ProgramFactory { message } => {
                writeln!(f, "{}: {}", "PROGRAM ERROR".red().bold(), message)?;
                writeln!(f)?;
                writeln!(
                    f,
                    "{}: no host was contacted; fix the program factory and re-run",
                    "Hint".yellow().bold()
                )?;
                Ok(())
            }

            FanoutError::Executor { host, message } => {
                writeln!(f, "{}: {}", "EXECUTOR ERROR".red().bold(), message)?;
                writeln!(f, "  {} {}", "Host:".dimmed(), host)?;
                Ok(())
            }
        }
    }
}
