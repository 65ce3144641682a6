//! USART test-partner Server
//!
//! Answers the fixed 32-byte text commands sent by a driver validation suite
//! over a serial link: version and capability queries, buffer fill/drain,
//! line reconfiguration, timed transfers, break and modem-line control.

pub mod buffer;
pub mod commands;
mod context;
mod error;
mod handle;
pub mod params;
pub mod probe;
mod state;
pub mod transport;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::driver::Mode;

pub use buffer::AlignedBuffer;
pub use commands::{parse_command, Command, COMMAND_SLOT};
pub use context::ServerContext;
pub use error::{CommandError, ParseError, ServerError, TransportError};
pub use handle::{detect_capabilities, Server};
pub use probe::CapabilitySnapshot;
pub use state::{RunState, SharedRunState};
pub use transport::{Transport, Wait};

/// Size of each transfer buffer in bytes
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Timeout for command reception and replies
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 100;

/// Initial `XFER` timeout
pub const DEFAULT_XFER_TIMEOUT_MS: u64 = 100;

/// Pause before a reply so the peer can arm its reception
pub const DEFAULT_RESPONSE_DELAY_MS: u64 = 10;

/// Pause before the `GET CAP` reply
pub const DEFAULT_CAPABILITY_DELAY_MS: u64 = 25;

/// Exit polls made by `Server::stop`
pub const DEFAULT_STOP_RETRIES: u32 = 10;

/// Interval between exit polls
pub const DEFAULT_STOP_POLL_MS: u64 = 100;

/// Server tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Capacity of each transfer buffer
    pub buffer_size: usize,
    /// Timeout for command reception and replies
    pub command_timeout_ms: u64,
    /// `XFER` timeout until a command overrides it
    pub xfer_timeout_ms: u64,
    /// Pause before each reply
    pub response_delay_ms: u64,
    /// Pause before the `GET CAP` reply
    pub capability_delay_ms: u64,
    /// Mode used for command exchange: asynchronous, single-wire or IrDA
    pub mode: Mode,
    /// Polls of the Server thread's exit on stop
    pub stop_retries: u32,
    /// Interval between exit polls on stop
    pub stop_poll_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            xfer_timeout_ms: DEFAULT_XFER_TIMEOUT_MS,
            response_delay_ms: DEFAULT_RESPONSE_DELAY_MS,
            capability_delay_ms: DEFAULT_CAPABILITY_DELAY_MS,
            mode: Mode::Asynchronous,
            stop_retries: DEFAULT_STOP_RETRIES,
            stop_poll_ms: DEFAULT_STOP_POLL_MS,
        }
    }
}

impl ServerConfig {
    /// Command timeout as a duration
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Reply lead-in as a duration
    pub fn response_delay(&self) -> Duration {
        Duration::from_millis(self.response_delay_ms)
    }

    /// `GET CAP` lead-in as a duration
    pub fn capability_delay(&self) -> Duration {
        Duration::from_millis(self.capability_delay_ms)
    }

    /// Stop poll interval as a duration
    pub fn stop_poll(&self) -> Duration {
        Duration::from_millis(self.stop_poll_ms)
    }
}
