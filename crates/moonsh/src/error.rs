//! Error types for the script bridge

use thiserror::Error;

/// A value crossed the host/guest boundary in a shape neither side accepts.
#[derive(Debug, Error)]
pub enum MarshalError {
    /// The guest value belongs to a category the host has no mapping for
    #[error("unsupported guest value of type {0}")]
    UnsupportedGuest(&'static str),
    /// Userdata that does not wrap a host handle
    #[error("userdata is not a host handle")]
    ForeignUserData,
    /// Guest tables cannot hold nil keys
    #[error("table key cannot be nil")]
    NilKey,
    /// The value has the wrong kind for the declared host type
    #[error("expected {expected}, found {found}")]
    Kind {
        /// Kind the declared host type needs
        expected: &'static str,
        /// Kind that was actually seen
        found: &'static str,
    },
    /// An integer does not fit the declared host type
    #[error("integer {value} out of range for {target}")]
    OutOfRange {
        /// The offending value
        value: i64,
        /// The declared host type
        target: &'static str,
    },
    /// Guest tables nest deeper than the marshaller follows (usually a cycle)
    #[error("table nesting exceeds {0} levels")]
    TooDeep(usize),
    /// Error from the guest runtime while building or reading a value
    #[error("guest runtime error: {0}")]
    Lua(#[from] mlua::Error),
}

/// A virtual property write was rejected.
#[derive(Debug, Error)]
#[error("{name}: {reason}")]
pub struct PropertyError {
    /// Property (or collection key) being written
    pub name: String,
    /// Why the write failed
    pub reason: String,
}

impl PropertyError {
    /// Create a new property error.
    pub fn new(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Errors surfaced to callers of the bridge
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Marshalling failed in either direction
    #[error("marshalling error: {0}")]
    Marshal(#[from] MarshalError),
    /// The guest raised an error
    #[error("script error: {0}")]
    Runtime(String),
    /// A property write was rejected
    #[error("property error: {0}")]
    Property(#[from] PropertyError),
    /// No session is bound to the shell (scripting disabled)
    #[error("script is not supported: {0}")]
    NotSupported(String),
    /// The session has already been closed
    #[error("session is closed")]
    Closed,
    /// The ambient context was cancelled
    #[error("operation cancelled")]
    Cancelled,
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Invalid bridge configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<mlua::Error> for BridgeError {
    fn from(err: mlua::Error) -> Self {
        BridgeError::Runtime(err.to_string())
    }
}

impl BridgeError {
    /// Returns true if this error was raised by guest code.
    pub fn is_runtime(&self) -> bool {
        matches!(self, BridgeError::Runtime(_))
    }
}
