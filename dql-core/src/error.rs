use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Syntax error at position {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("Unindexed query: {0}")]
    UnindexedQuery(String),

    #[error("Index '{index}' not found on table '{table}'")]
    IndexNotFound { table: String, index: String },

    #[error("Invalid index: {0}")]
    InvalidIndex(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    // Store-reported failures
    #[error("Throughput exceeded: {0}")]
    ThroughputExceeded(String),

    #[error("Transient store failure: {0}")]
    Transient(String),

    #[error("Remote error {code}: {message}")]
    Remote { code: String, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid expression: {0}")]
    InvalidExpression(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Statement interrupted")]
    Interrupted,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Builds a syntax error at a character offset of the statement text.
    pub fn syntax(position: usize, message: impl Into<String>) -> Self {
        Error::Syntax {
            position,
            message: message.into(),
        }
    }

    /// Builds an error for a failure reported by the store that is not
    /// one of the transient classes.
    pub fn remote(code: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Remote {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Returns a stable error code for this error variant.
    /// These codes are stable and can be used by clients for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Syntax { .. } => "SYNTAX_ERROR",
            Error::UnindexedQuery(_) => "UNINDEXED_QUERY",
            Error::IndexNotFound { .. } => "INDEX_NOT_FOUND",
            Error::InvalidIndex(_) => "INVALID_INDEX",
            Error::SchemaMismatch(_) => "SCHEMA_MISMATCH",
            Error::ThroughputExceeded(_) => "THROUGHPUT_EXCEEDED",
            Error::Transient(_) => "TRANSIENT",
            Error::Remote { .. } => "REMOTE_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::AlreadyExists(_) => "ALREADY_EXISTS",
            Error::InvalidArgument(_) => "INVALID_ARGUMENT",
            Error::InvalidQuery(_) => "INVALID_QUERY",
            Error::InvalidExpression(_) => "INVALID_EXPRESSION",
            Error::Unsupported(_) => "UNSUPPORTED",
            Error::Interrupted => "INTERRUPTED",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns true if this error is potentially retryable.
    ///
    /// Only capacity and transient store failures are retried. Parse and
    /// plan errors are deterministic and surface immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ThroughputExceeded(_) => true,
            Error::Transient(_) => true,

            Error::Syntax { .. } => false,
            Error::UnindexedQuery(_) => false,
            Error::IndexNotFound { .. } => false,
            Error::InvalidIndex(_) => false,
            Error::SchemaMismatch(_) => false,
            Error::Remote { .. } => false,
            Error::NotFound(_) => false,
            Error::AlreadyExists(_) => false,
            Error::InvalidArgument(_) => false,
            Error::InvalidQuery(_) => false,
            Error::InvalidExpression(_) => false,
            Error::Unsupported(_) => false,
            Error::Interrupted => false,
            Error::Internal(_) => false,
        }
    }

    /// Adds context to an error by wrapping it in an Internal error.
    ///
    /// # Examples
    ///
    /// ```
    /// use dql_core::Error;
    ///
    /// let err = Error::NotFound("foobar".to_string()).with_context("describe failed");
    /// assert_eq!(err.to_string(), "Internal error: describe failed: Not found: foobar");
    /// ```
    pub fn with_context(self, context: &str) -> Error {
        Error::Internal(format!("{}: {}", context, self))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
