//! Server errors

use thiserror::Error;

use crate::driver::{DriverError, UsartEvent};

/// Errors from a timeout-bounded transport operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The driver rejected the operation
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    /// No completion within the timeout
    #[error("Operation timed out after {transferred} items")]
    Timeout {
        /// Items moved before giving up
        transferred: usize,
    },

    /// Reception ended by overflow, break, framing or parity error
    #[error("Line error: {0:?}")]
    LineError(UsartEvent),

    /// A stop request ended an idle wait
    #[error("Reception cancelled by stop request")]
    Cancelled,

    /// Operation larger than the buffer it targets
    #[error("{items} items do not fit in a {capacity} byte buffer")]
    BufferTooSmall {
        /// Items requested
        items: usize,
        /// Buffer size in bytes
        capacity: usize,
    },
}

/// Errors decoding a received command
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Slot starts with NUL
    #[error("Empty command")]
    Empty,

    /// Slot holds non-ASCII bytes
    #[error("Command is not valid ASCII text")]
    NotText,

    /// No keyword matched; holds the start of the text
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// A required field is absent
    #[error("Missing parameter '{0}'")]
    MissingParameter(&'static str),

    /// A required field does not parse
    #[error("Malformed parameter '{name}': {text}")]
    Malformed {
        /// Field name
        name: &'static str,
        /// Offending text
        text: String,
    },

    /// A field parsed but lies outside its domain
    #[error("Parameter '{name}' out of range: {value}")]
    OutOfRange {
        /// Field name
        name: &'static str,
        /// Parsed value
        value: u32,
    },
}

/// Errors from a command handler
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The command did not decode
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// A transport operation failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Length or count beyond buffer capacity
    #[error("{count} items exceed the {capacity} byte transfer buffer")]
    CountExceedsBuffer {
        /// Requested length or item count
        count: u32,
        /// Buffer size in bytes
        capacity: usize,
    },

    /// Reply text longer than its slot
    #[error("Response does not fit its {slot} byte slot")]
    ResponseOverflow {
        /// Reply slot size
        slot: usize,
    },
}

/// Errors starting or stopping the Server
#[derive(Error, Debug)]
pub enum ServerError {
    /// A transfer buffer could not be allocated
    #[error("Failed to allocate {size} byte buffer")]
    Allocation {
        /// Requested buffer size
        size: usize,
    },

    /// Driver bring-up failed
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    /// The Server thread could not be created
    #[error("Failed to spawn server thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// The thread was still busy after every exit poll
    #[error("Server thread did not exit after {attempts} polls")]
    StopTimeout {
        /// Polls made
        attempts: u32,
    },

    /// The Server thread panicked
    #[error("Server thread panicked")]
    ThreadPanicked,

    /// The Server was already stopped
    #[error("Server is not running")]
    NotRunning,
}
