//! Crate-wide error taxonomy.
//!
//! Every fatal condition in the trust pipeline and execution engine maps to
//! exactly one of these kinds, which in turn maps to exactly one process
//! exit code (see [`CommandRunnerError::exit_code`]).

use thiserror::Error;

/// Convenience result type used throughout the crate.
pub type Result<T> = std::result::Result<T, CommandRunnerError>;

#[derive(Error, Debug)]
pub enum CommandRunnerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsafe path: {0}")]
    PathUnsafe(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("hash mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("no hash record found for {0}")]
    RecordNotFound(String),

    #[error("hash manifest invalid: {0}")]
    ManifestInvalid(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("circular reference detected while expanding '{0}'")]
    CircularReference(String),

    #[error("'{name}' is not in the effective allow-list at {level}")]
    NotInAllowlist { name: String, level: String },

    #[error("invalid variable format: {0}")]
    InvalidVariableFormat(String),

    #[error("template '{0}' not found")]
    TemplateNotFound(String),

    #[error("unresolved parameter '{0}'")]
    UnresolvedParam(String),

    #[error("conflicting env_import definitions for '{0}'")]
    AllowlistConflict(String),

    #[error("risk policy rejected command '{command}': {reason}")]
    RiskRejected { command: String, reason: String },

    #[error("privilege escalation denied: {0}")]
    PrivilegeEscalationDenied(String),

    #[error("privilege post-condition audit failed: {0}")]
    PrivilegeAuditFailure(String),

    #[error("failed to spawn command '{command}': {source}")]
    ExecSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command '{command}' timed out after {timeout_secs}s")]
    ExecTimeout { command: String, timeout_secs: u64 },

    #[error("output exceeded cap of {cap} bytes and was truncated")]
    OutputCapOverflow { cap: u64 },

    #[error("invalid output path: {0}")]
    OutputPathInvalid(String),

    #[error("run cancelled")]
    Cancelled,
}

impl CommandRunnerError {
    /// Process exit code per spec section 6.
    ///
    /// - 0: never returned from here (success has no error value)
    /// - 1: command execution error
    /// - 2: configuration error
    /// - 3: security/verification error
    /// - 4: system error
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::HashMismatch { .. }
            | Self::RecordNotFound(_)
            | Self::ManifestInvalid(_)
            | Self::RiskRejected { .. }
            | Self::PrivilegeEscalationDenied(_)
            | Self::PrivilegeAuditFailure(_) => 3,

            Self::UnknownVariable(_)
            | Self::CircularReference(_)
            | Self::NotInAllowlist { .. }
            | Self::InvalidVariableFormat(_)
            | Self::TemplateNotFound(_)
            | Self::UnresolvedParam(_)
            | Self::AllowlistConflict(_)
            | Self::OutputPathInvalid(_)
            | Self::ConfigInvalid(_) => 2,

            Self::ExecSpawn { .. } | Self::ExecTimeout { .. } | Self::Cancelled => 1,

            Self::Io(_) | Self::PathUnsafe(_) | Self::PermissionDenied(_) => 4,

            // A cap overflow is a warning elsewhere; if it ever escapes as a
            // hard error treat it as a command execution failure.
            Self::OutputCapOverflow { .. } => 1,
        }
    }
}
