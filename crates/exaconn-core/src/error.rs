use thiserror::Error;

/// Broad classification of an [`ExaError`], used by callers that only care
/// about which layer rejected an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Dsn,
    Auth,
    Query,
    Request,
    Runtime,
    Concurrency,
    Transport,
    Codec,
}

#[derive(Debug, Error)]
pub enum ExaError {
    #[error("could not connect to any host: {}", format_attempts(.attempts))]
    Connection { attempts: Vec<(String, String)> },
    #[error("connection string error: {0}")]
    Dsn(String),
    #[error("authentication failed [{code}]: {message}")]
    Auth { code: String, message: String },
    #[error("query error [{code}]: {message}\n{sql}")]
    Query {
        code: String,
        message: String,
        sql: String,
    },
    #[error("query timeout [{code}]: {message}\n{sql}")]
    QueryTimeout {
        code: String,
        message: String,
        sql: String,
    },
    #[error("query aborted [{code}]: {message}\n{sql}")]
    QueryAborted {
        code: String,
        message: String,
        sql: String,
    },
    #[error("request '{command}' failed [{code}]: {message}")]
    Request {
        command: String,
        code: String,
        message: String,
    },
    #[error("statement is closed")]
    StatementClosed,
    #[error("session is closed")]
    SessionClosed,
    #[error("statement has no result set")]
    NoResultSet,
    #[error("duplicate column names in result set: {}", .0.join(", "))]
    DuplicateColumns(Vec<String>),
    #[error("{0}")]
    Runtime(String),
    #[error("another request is already running on this session")]
    Concurrency,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("worker {index} failed: {message}")]
    Worker { index: usize, message: String },
    #[error("callback failed: {0}")]
    Callback(String),
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExaError::Connection { .. } | ExaError::WebSocket(_) | ExaError::Io(_) => {
                ErrorKind::Connection
            }
            ExaError::Dsn(_) => ErrorKind::Dsn,
            ExaError::Auth { .. } => ErrorKind::Auth,
            ExaError::Query { .. } | ExaError::QueryTimeout { .. } | ExaError::QueryAborted { .. } => {
                ErrorKind::Query
            }
            ExaError::Request { .. } | ExaError::StatementClosed => ErrorKind::Request,
            ExaError::SessionClosed
            | ExaError::NoResultSet
            | ExaError::DuplicateColumns(_)
            | ExaError::Runtime(_) => ErrorKind::Runtime,
            ExaError::Concurrency => ErrorKind::Concurrency,
            ExaError::Transport(_) | ExaError::Worker { .. } | ExaError::Callback(_) => {
                ErrorKind::Transport
            }
            ExaError::Compression(_) | ExaError::Json(_) => ErrorKind::Codec,
        }
    }

    /// Server error code carried by query, request and auth errors.
    pub fn code(&self) -> Option<&str> {
        match self {
            ExaError::Query { code, .. }
            | ExaError::QueryTimeout { code, .. }
            | ExaError::QueryAborted { code, .. }
            | ExaError::Request { code, .. }
            | ExaError::Auth { code, .. } => Some(code),
            _ => None,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        ExaError::Transport(message.into())
    }
}

fn format_attempts(attempts: &[(String, String)]) -> String {
    if attempts.is_empty() {
        return "no hosts".to_string();
    }
    attempts
        .iter()
        .map(|(addr, reason)| format!("{addr} ({reason})"))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, ExaError>;
