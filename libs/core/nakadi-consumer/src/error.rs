//! Consumer error types and error classification
//!
//! Every error maps to one of four kinds that decide how the pipeline reacts:
//! - **Unrecoverable**: contract violation, unsubscribes the affected channel
//! - **Transport**: absorbed by the channel's retry loop
//! - **Processing**: routed to error handlers, consumption continues
//! - **StaleCursor**: committed cursor fell out of retention

use thiserror::Error;

/// How the pipeline reacts to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unrecoverable,
    Transport,
    Processing,
    StaleCursor,
}

/// Consumer errors
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// HTTP request or body read failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Transport failure raised by a non-reqwest transport
    #[error("Transport error: {0}")]
    Transport(String),

    /// Coordination service command failure
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] core_config::ConfigError),

    /// Double registration or missing registration
    #[error("Registration error: {0}")]
    Registration(String),

    /// Broker rejected the cursor as outside its retention window
    #[error("Stale cursor for partition {partition}: {detail}")]
    StaleCursor { partition: String, detail: String },

    /// User handler failed, consumption continues
    #[error("Processing error: {0}")]
    Processing(String),

    /// Contract violation, the channel stops
    #[error("Unrecoverable error: {0}")]
    Unrecoverable(String),

    /// Membership or election failure
    #[error("Coordination error: {0}")]
    Coordination(String),

    /// Shutdown requested
    #[error("Shutdown requested")]
    Shutdown,
}

impl ConsumerError {
    pub fn unrecoverable(message: impl Into<String>) -> Self {
        ConsumerError::Unrecoverable(message.into())
    }

    pub fn processing(message: impl Into<String>) -> Self {
        ConsumerError::Processing(message.into())
    }

    pub fn coordination(message: impl Into<String>) -> Self {
        ConsumerError::Coordination(message.into())
    }

    pub fn registration(message: impl Into<String>) -> Self {
        ConsumerError::Registration(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ConsumerError::Http(_) => ErrorKind::Transport,
            ConsumerError::Transport(_) => ErrorKind::Transport,
            ConsumerError::Redis(_) => ErrorKind::Transport,
            ConsumerError::Coordination(_) => ErrorKind::Transport,
            ConsumerError::Serialization(_) => ErrorKind::Processing,
            ConsumerError::Processing(_) => ErrorKind::Processing,
            ConsumerError::StaleCursor { .. } => ErrorKind::StaleCursor,
            ConsumerError::Config(_) => ErrorKind::Unrecoverable,
            ConsumerError::Registration(_) => ErrorKind::Unrecoverable,
            ConsumerError::Unrecoverable(_) => ErrorKind::Unrecoverable,
            ConsumerError::Shutdown => ErrorKind::Unrecoverable,
        }
    }

    pub fn is_unrecoverable(&self) -> bool {
        self.kind() == ErrorKind::Unrecoverable
    }
}

impl From<serde_json::Error> for ConsumerError {
    fn from(err: serde_json::Error) -> Self {
        ConsumerError::Serialization(err.to_string())
    }
}

pub type ConsumerResult<T> = Result<T, ConsumerError>;

/// Error returned by user event handlers
#[derive(Error, Debug)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    recoverable: bool,
}

impl HandlerError {
    /// Failure local to this event; it is reported and consumption continues.
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recoverable: true,
        }
    }

    /// Failure that must stop the partition's pipeline.
    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recoverable: false,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.recoverable
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::recoverable(format!("event payload did not deserialize: {err}"))
    }
}

impl From<HandlerError> for ConsumerError {
    fn from(err: HandlerError) -> Self {
        if err.recoverable {
            ConsumerError::Processing(err.message)
        } else {
            ConsumerError::Unrecoverable(err.message)
        }
    }
}
