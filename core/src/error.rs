use std::io;

use serde_json;
use thiserror::Error;
use tokio::task::JoinError;

use shipsec_protocol::ComponentIdError;
use shipsec_protocol::ContractViolation;

pub type Result<T> = std::result::Result<T, ShipsecErr>;

/// Maximum bytes of stderr carried in a user-visible failure.
pub const STDERR_TAIL_BYTES: usize = 500;

/// Error kinds surfaced to operators and to the orchestrator's retry
/// machinery. Kinds, not types: several variants collapse into one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Configuration,
    Container,
    Timeout,
    Service,
    Auth,
    NotFound,
    Cancelled,
}

impl ErrorKind {
    /// Whether the orchestrator may retry an activity that failed with this
    /// kind. Container failures are retryable only when marked transient.
    pub fn retryable(&self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::Service)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Container => "container",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Service => "service",
            ErrorKind::Auth => "auth",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

#[derive(Error, Debug)]
pub enum ShipsecErr {
    /// A parameter or output record failed its declared contract, or a
    /// component produced malformed result JSON.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Missing or unusable configuration: env vars, runner kinds the
    /// process refuses to serve, duplicate registrations.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The container exited non-zero. Captured stdout is preserved so
    /// scanner-style callers can salvage partial output from `stdout`.
    #[error("container exited with code {exit_code}: {stderr_tail}")]
    Container {
        exit_code: i32,
        stderr_tail: String,
        stdout: String,
        /// Set when the failure looks like a transient infrastructure
        /// problem (image pull, network) rather than a component bug.
        transient: bool,
    },

    /// Wall-clock deadline breached; the container tree was killed.
    #[error("execution timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// Transient failure calling an internal dependency.
    #[error("service error: {0}")]
    Service(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The surrounding workflow was cancelled; in-flight work was torn
    /// down. Not a failure from the operator's perspective.
    #[error("activity cancelled")]
    Cancelled,

    #[error("{0}")]
    EnvVar(EnvVarError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    TokioJoin(#[from] JoinError),
}

impl ShipsecErr {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ShipsecErr::Validation(_) | ShipsecErr::Json(_) => ErrorKind::Validation,
            ShipsecErr::Configuration(_) | ShipsecErr::EnvVar(_) => ErrorKind::Configuration,
            ShipsecErr::Container { .. } => ErrorKind::Container,
            ShipsecErr::Timeout { .. } => ErrorKind::Timeout,
            ShipsecErr::Service(_) | ShipsecErr::Io(_) | ShipsecErr::TokioJoin(_) => {
                ErrorKind::Service
            }
            ShipsecErr::Auth(_) => ErrorKind::Auth,
            ShipsecErr::NotFound(_) => ErrorKind::NotFound,
            ShipsecErr::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ShipsecErr::Container { transient, .. } => *transient,
            other => other.kind().retryable(),
        }
    }

    pub fn validation_from_violations(
        scope: &str,
        violations: &[ContractViolation],
    ) -> ShipsecErr {
        let details = violations
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        ShipsecErr::Validation(format!("{scope}: {details}"))
    }
}

impl From<ComponentIdError> for ShipsecErr {
    fn from(err: ComponentIdError) -> Self {
        ShipsecErr::Validation(err.to_string())
    }
}

#[derive(Debug)]
pub struct EnvVarError {
    /// Name of the environment variable that is missing or malformed.
    pub var: String,

    /// Optional instructions to help the operator produce a valid value.
    pub instructions: Option<String>,
}

impl std::fmt::Display for EnvVarError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Missing environment variable: `{}`.", self.var)?;
        if let Some(instructions) = &self.instructions {
            write!(f, " {instructions}")?;
        }
        Ok(())
    }
}

/// Keep the last `STDERR_TAIL_BYTES` bytes of stderr on a char boundary.
pub fn stderr_tail(stderr: &str) -> String {
    if stderr.len() <= STDERR_TAIL_BYTES {
        return stderr.to_string();
    }
    let mut start = stderr.len() - STDERR_TAIL_BYTES;
    while start < stderr.len() && !stderr.is_char_boundary(start) {
        start += 1;
    }
    stderr[start..].to_string()
}

/// User-visible failure line: kind, component id and message, with stderr
/// already truncated by construction.
pub fn user_facing_failure(err: &ShipsecErr, component_id: &str) -> String {
    format!("[{}] {component_id}: {err}", err.kind())
}
