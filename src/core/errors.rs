use thiserror::Error;

/// Failures raised inside a pipeline stage.
///
/// Every variant carries the human-readable text that ends up verbatim in the
/// `error` field of the workflow's result, so `message()` never decorates it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StageError {
    /// The document could not be decoded or split into chunks
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Text could not be turned into a vector
    #[error("embedding error: {message}")]
    Embedding { message: String },

    /// Malformed query or inconsistent index state
    #[error("retrieval error: {message}")]
    Retrieval { message: String },

    /// The answer generator failed
    #[error("generation error: {message}")]
    Generation { message: String },

    /// A message arrived with a payload the stage cannot interpret, or a stage
    /// produced a follow-up that breaks the trace chain
    #[error("protocol error: {message}")]
    Protocol { message: String },
}

impl StageError {
    pub fn parse<S: Into<String>>(message: S) -> Self {
        Self::Parse { message: message.into() }
    }

    pub fn embedding<S: Into<String>>(message: S) -> Self {
        Self::Embedding { message: message.into() }
    }

    pub fn retrieval<S: Into<String>>(message: S) -> Self {
        Self::Retrieval { message: message.into() }
    }

    pub fn generation<S: Into<String>>(message: S) -> Self {
        Self::Generation { message: message.into() }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol { message: message.into() }
    }

    /// The raw message, without the category prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Parse { message }
            | Self::Embedding { message }
            | Self::Retrieval { message }
            | Self::Generation { message }
            | Self::Protocol { message } => message,
        }
    }

    /// Short category name, carried in `error` messages as `stage`
    pub fn category(&self) -> &'static str {
        match self {
            Self::Parse { .. } => "parse",
            Self::Embedding { .. } => "embedding",
            Self::Retrieval { .. } => "retrieval",
            Self::Generation { .. } => "generation",
            Self::Protocol { .. } => "protocol",
        }
    }
}

/// Unified error type for the crate
#[derive(Debug, Error)]
pub enum RagError {
    /// A stage failed; normally converted into an `error` message before it
    /// gets this far
    #[error(transparent)]
    Stage(#[from] StageError),

    /// A caller stopped waiting for a workflow
    #[error("Workflow {trace} timed out (timeout: {timeout_ms}ms)")]
    Timeout { trace: String, timeout_ms: u64 },

    /// A handler failed while a message was being delivered
    #[error("Delivery to {receiver} failed: {message}")]
    DeliveryFault { receiver: String, message: String },

    /// No request record exists for the trace
    #[error("Unknown trace: {trace}")]
    UnknownTrace { trace: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Operation needs a Tokio runtime that is not there
    #[error("Runtime error: {message}")]
    Runtime { message: String },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// IO errors
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// HTTP client errors
    #[error("HTTP request to {url} failed")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl RagError {
    pub fn timeout<S: Into<String>>(trace: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            trace: trace.into(),
            timeout_ms,
        }
    }

    pub fn delivery_fault<R: Into<String>, M: Into<String>>(receiver: R, message: M) -> Self {
        Self::DeliveryFault {
            receiver: receiver.into(),
            message: message.into(),
        }
    }

    pub fn unknown_trace<S: Into<String>>(trace: S) -> Self {
        Self::UnknownTrace { trace: trace.into() }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error naming the offending field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn runtime<S: Into<String>>(message: S) -> Self {
        Self::Runtime { message: message.into() }
    }

    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if retrying the operation could succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Io { .. } | Self::Http { .. } => true,
            Self::DeliveryFault { .. } => true,
            Self::Stage(StageError::Generation { .. }) => true,
            Self::Configuration { .. } | Self::UnknownTrace { .. } => false,
            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Stage(inner) => inner.category(),
            Self::Timeout { .. } => "timeout",
            Self::DeliveryFault { .. } => "delivery",
            Self::UnknownTrace { .. } => "unknown_trace",
            Self::Configuration { .. } => "configuration",
            Self::Runtime { .. } => "runtime",
            Self::Serialization { .. } => "serialization",
            Self::Io { .. } => "io",
            Self::Http { .. } => "http",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, RagError>;

impl From<std::io::Error> for RagError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for RagError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for RagError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<anyhow::Error> for RagError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string())
    }
}
