use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a failure should be handled by whoever observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Worth retrying after a backoff.
    Transient,
    /// Terminates the owning node (or connection attempt) only.
    Permanent,
    /// Aborts the whole run.
    Fatal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Permanent => write!(f, "permanent"),
            ErrorKind::Fatal => write!(f, "fatal"),
        }
    }
}

/// Originating error class, reported for every node that did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Graph,
    Timeout,
    TransientConnection,
    PermanentConnection,
    Validation,
    Execution,
    Fatal,
    Cancelled,
    Config,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorClass::Graph => "GraphError",
            ErrorClass::Timeout => "TimeoutError",
            ErrorClass::TransientConnection => "TransientConnectionError",
            ErrorClass::PermanentConnection => "PermanentConnectionError",
            ErrorClass::Validation => "ValidationError",
            ErrorClass::Execution => "ExecutionError",
            ErrorClass::Fatal => "FatalRunError",
            ErrorClass::Cancelled => "Cancelled",
            ErrorClass::Config => "ConfigError",
        };
        f.write_str(name)
    }
}

/// Classified error returned by an execution unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind} error: {message}")]
pub struct UnitError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl UnitError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind == ErrorKind::Transient,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    /// A transient error the unit explicitly marked as not worth retrying
    /// is handled as permanent.
    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::Transient && self.retryable
    }
}

/// Failure reported by a capability connector while establishing a connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("permanent: {0}")]
    Permanent(String),
}

#[derive(Debug, Error)]
pub enum StrandError {
    // Graph errors
    #[error("Graph error: {0}")]
    Graph(String),

    // Execution errors
    #[error("Node '{node}' timed out after {timeout_ms}ms")]
    Timeout { node: String, timeout_ms: u64 },

    #[error("Unit failed: {node}: {source}")]
    Unit {
        node: String,
        #[source]
        source: UnitError,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Fatal run error: {0}")]
    Fatal(String),

    #[error("Run cancelled")]
    Cancelled,

    // Connection errors
    #[error("Transient connection error: {capability}: {message}")]
    TransientConnection { capability: String, message: String },

    #[error("Permanent connection error: {capability}: {message}")]
    PermanentConnection { capability: String, message: String },

    #[error("Timed out after {waited_ms}ms waiting for a lease: {capability}")]
    LeaseTimeout { capability: String, waited_ms: u64 },

    #[error("Circuit open for capability {capability}, retry in {retry_in_ms}ms")]
    CircuitOpen { capability: String, retry_in_ms: u64 },

    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StrandError {
    pub fn unit(node: impl Into<String>, source: UnitError) -> Self {
        Self::Unit {
            node: node.into(),
            source,
        }
    }

    /// Retry classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StrandError::TransientConnection { .. } | StrandError::LeaseTimeout { .. } => {
                ErrorKind::Transient
            }
            StrandError::Unit { source, .. } => {
                if source.kind == ErrorKind::Transient && !source.retryable {
                    ErrorKind::Permanent
                } else {
                    source.kind
                }
            }
            StrandError::Graph(_)
            | StrandError::Fatal(_)
            | StrandError::Config(_)
            | StrandError::ConfigNotFound(_) => ErrorKind::Fatal,
            _ => ErrorKind::Permanent,
        }
    }

    /// The class reported in run results.
    pub fn class(&self) -> ErrorClass {
        match self {
            StrandError::Graph(_) => ErrorClass::Graph,
            StrandError::Timeout { .. } => ErrorClass::Timeout,
            StrandError::Unit { source, .. } if source.kind == ErrorKind::Fatal => {
                ErrorClass::Fatal
            }
            StrandError::Unit { .. } => ErrorClass::Execution,
            StrandError::Validation(_) => ErrorClass::Validation,
            StrandError::Fatal(_) => ErrorClass::Fatal,
            StrandError::Cancelled => ErrorClass::Cancelled,
            StrandError::TransientConnection { .. } | StrandError::LeaseTimeout { .. } => {
                ErrorClass::TransientConnection
            }
            StrandError::PermanentConnection { .. }
            | StrandError::CircuitOpen { .. }
            | StrandError::UnknownCapability(_) => ErrorClass::PermanentConnection,
            StrandError::Config(_) | StrandError::ConfigNotFound(_) => ErrorClass::Config,
            StrandError::Io(_) | StrandError::Json(_) => ErrorClass::Execution,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}

pub type Result<T> = std::result::Result<T, StrandError>;
