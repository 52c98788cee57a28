// src/error.rs

use std::fmt;

/// Error kinds for every fallible operation in the crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input: oversized payload, interval below minimum, bad region name.
    InvalidArgument,
    /// A fixed table or pool is full: listener table, delivery queue,
    /// payload arena, worker pool.
    ResourceExhausted,
    /// Handle or unit id is unknown to the runtime.
    NotFound,
    /// A bounded wait elapsed without the condition becoming true.
    Timeout,
    /// Media ring writes while the control flag is off.
    Stopped,
    /// Duplicate listener registration. Advisory, never fatal.
    AlreadyRegistered,
    /// OS failure to map, truncate, or initialize a primitive.
    Internal,
}

impl ErrorKind {
    /// Advisory errors degrade a single row/registration; the containing
    /// operation still succeeds.
    pub fn is_advisory(self) -> bool {
        matches!(self, ErrorKind::AlreadyRegistered | ErrorKind::ResourceExhausted)
    }

    pub fn description(self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::ResourceExhausted => "resource exhausted",
            ErrorKind::NotFound => "not found",
            ErrorKind::Timeout => "timed out",
            ErrorKind::Stopped => "stopped",
            ErrorKind::AlreadyRegistered => "already registered",
            ErrorKind::Internal => "internal error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// An error with kind, message, and optional source.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::InvalidArgument, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::ResourceExhausted, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::NotFound, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Timeout, message)
    }

    pub fn stopped(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Stopped, message)
    }

    pub fn already_registered(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::AlreadyRegistered, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Internal, message)
    }

    /// Internal error wrapping the current `errno`.
    pub(crate) fn last_os(message: impl Into<String>) -> Self {
        Error::with_source(ErrorKind::Internal, message, std::io::Error::last_os_error())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// Result type alias for moot operations.
pub type Result<T> = std::result::Result<T, Error>;
