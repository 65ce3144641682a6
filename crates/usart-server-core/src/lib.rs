//! # USART Server Core Library
//!
//! The far end of a serial link used by a USART driver validation suite.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! The Server receives fixed 32-byte ASCII commands from the suite and
//! answers them:
//! - version and capability reports
//! - transfer buffer fill and readback
//! - line reconfiguration and timed send/receive/transfer
//! - break signalling and modem-line control
//!
//! The transport itself is abstracted by [`driver::UsartDriver`]; a host
//! serial port and an in-memory simulator are provided.
//!
//! ## Example
//!
//! ```rust,ignore
//! use usart_server_core::driver::{serial::SerialPortDriver, NoAuxSignals};
//! use usart_server_core::server::{Server, ServerConfig};
//!
//! let driver = SerialPortDriver::new("/dev/ttyUSB0");
//! let server = Server::start(driver, NoAuxSignals, ServerConfig::default())?;
//! // ... the validation suite runs ...
//! server.stop()?;
//! ```

pub mod driver;
pub mod server;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::driver::sim::{SimAux, SimHandle, SimProfile, SimulatedUsart};
    pub use crate::driver::{
        AuxSignals, CommConfig, DriverCapabilities, DriverError, NoAuxSignals, UsartDriver,
        UsartEvent,
    };
    pub use crate::server::{
        CapabilitySnapshot, Command, RunState, Server, ServerConfig, ServerError,
    };
}

/// Server version reported by `GET VER`
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
