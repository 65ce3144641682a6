//! USART driver abstraction
//!
//! The Server never touches hardware directly. Everything it needs from the
//! serial transport is expressed by [`UsartDriver`]: line configuration,
//! asynchronous send/receive/transfer whose completion is reported through an
//! [`EventSender`], modem-control lines and break signalling.
//!
//! Two implementations ship with the crate:
//! - [`serial::SerialPortDriver`] drives a host serial port
//! - [`sim::SimulatedUsart`] is a scriptable in-memory transport for tests

pub mod event;
mod rx;
pub mod serial;
pub mod sim;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use event::{event_channel, EventReceiver, EventSender, UsartEvent};

/// Errors reported by a driver operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// The driver cannot do what was asked
    #[error("Operation not supported")]
    Unsupported,

    /// Another operation is in flight
    #[error("Driver is busy")]
    Busy,

    /// An argument is out of range
    #[error("Invalid parameter: {0}")]
    Parameter(String),

    /// `initialize` has not been called
    #[error("Driver not initialized")]
    NotInitialized,

    /// Host serial port failure
    #[error("Serial port error: {0}")]
    SerialError(String),
}

/// A configurable line option with a wire code and a capability mask bit
pub trait LineOption: Copy + Sized + 'static {
    /// Every value of the option, in probing order
    const ALL: &'static [Self];

    /// Numeric code used by `SET COM`
    fn code(self) -> u32;

    /// Bit position in the capability mask reported by `GET CAP`
    fn mask_bit(self) -> u32;

    /// Decode a `SET COM` field
    fn from_code(code: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|o| o.code() == code)
    }
}

/// USART operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Asynchronous UART
    Asynchronous,
    /// Synchronous, Server drives the clock
    SynchronousMaster,
    /// Synchronous, peer drives the clock
    SynchronousSlave,
    /// Half duplex on one wire
    SingleWire,
    /// IrDA SIR
    Irda,
    /// ISO 7816 smart card
    SmartCard,
}

impl LineOption for Mode {
    const ALL: &'static [Self] = &[
        Mode::Asynchronous,
        Mode::SynchronousMaster,
        Mode::SynchronousSlave,
        Mode::SingleWire,
        Mode::Irda,
        Mode::SmartCard,
    ];

    fn code(self) -> u32 {
        match self {
            Mode::Asynchronous => 1,
            Mode::SynchronousMaster => 2,
            Mode::SynchronousSlave => 3,
            Mode::SingleWire => 4,
            Mode::Irda => 5,
            Mode::SmartCard => 6,
        }
    }

    fn mask_bit(self) -> u32 {
        self.code() - 1
    }
}

/// Number of data bits per character
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataBits {
    /// 5 bits
    Five,
    /// 6 bits
    Six,
    /// 7 bits
    Seven,
    /// 8 bits
    Eight,
    /// 9 bits, two bytes per item
    Nine,
}

impl LineOption for DataBits {
    const ALL: &'static [Self] = &[
        DataBits::Five,
        DataBits::Six,
        DataBits::Seven,
        DataBits::Eight,
        DataBits::Nine,
    ];

    fn code(self) -> u32 {
        match self {
            DataBits::Five => 5,
            DataBits::Six => 6,
            DataBits::Seven => 7,
            DataBits::Eight => 8,
            DataBits::Nine => 9,
        }
    }

    fn mask_bit(self) -> u32 {
        self.code() - 5
    }
}

impl DataBits {
    /// Bytes occupied by one data item in memory
    pub fn bytes_per_item(self) -> usize {
        if self == DataBits::Nine {
            2
        } else {
            1
        }
    }
}

/// Parity bit setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    /// No parity bit
    None,
    /// Even parity
    Even,
    /// Odd parity
    Odd,
}

impl LineOption for Parity {
    const ALL: &'static [Self] = &[Parity::None, Parity::Even, Parity::Odd];

    fn code(self) -> u32 {
        match self {
            Parity::None => 0,
            Parity::Even => 1,
            Parity::Odd => 2,
        }
    }

    fn mask_bit(self) -> u32 {
        self.code()
    }
}

/// Number of stop bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopBits {
    /// 1 stop bit
    One,
    /// 2 stop bits
    Two,
    /// 1.5 stop bits
    OnePointFive,
    /// 0.5 stop bits
    Half,
}

impl LineOption for StopBits {
    const ALL: &'static [Self] = &[
        StopBits::One,
        StopBits::Two,
        StopBits::OnePointFive,
        StopBits::Half,
    ];

    fn code(self) -> u32 {
        match self {
            StopBits::One => 0,
            StopBits::Two => 1,
            StopBits::OnePointFive => 2,
            StopBits::Half => 3,
        }
    }

    fn mask_bit(self) -> u32 {
        self.code()
    }
}

/// Hardware flow control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowControl {
    /// No flow control
    None,
    /// RTS only
    Rts,
    /// CTS only
    Cts,
    /// RTS and CTS
    RtsCts,
}

impl LineOption for FlowControl {
    const ALL: &'static [Self] = &[
        FlowControl::None,
        FlowControl::Rts,
        FlowControl::Cts,
        FlowControl::RtsCts,
    ];

    fn code(self) -> u32 {
        match self {
            FlowControl::None => 0,
            FlowControl::Rts => 1,
            FlowControl::Cts => 2,
            FlowControl::RtsCts => 3,
        }
    }

    // The capability mask orders CTS before RTS.
    fn mask_bit(self) -> u32 {
        match self {
            FlowControl::None => 0,
            FlowControl::Cts => 1,
            FlowControl::Rts => 2,
            FlowControl::RtsCts => 3,
        }
    }
}

/// Clock polarity (synchronous modes only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockPolarity {
    /// Data captured on rising edge
    Cpol0,
    /// Data captured on falling edge
    Cpol1,
}

impl LineOption for ClockPolarity {
    const ALL: &'static [Self] = &[ClockPolarity::Cpol0, ClockPolarity::Cpol1];

    fn code(self) -> u32 {
        match self {
            ClockPolarity::Cpol0 => 0,
            ClockPolarity::Cpol1 => 1,
        }
    }

    fn mask_bit(self) -> u32 {
        self.code()
    }
}

/// Clock phase (synchronous modes only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockPhase {
    /// Sample on leading edge
    Cpha0,
    /// Sample on trailing edge
    Cpha1,
}

impl LineOption for ClockPhase {
    const ALL: &'static [Self] = &[ClockPhase::Cpha0, ClockPhase::Cpha1];

    fn code(self) -> u32 {
        match self {
            ClockPhase::Cpha0 => 0,
            ClockPhase::Cpha1 => 1,
        }
    }

    fn mask_bit(self) -> u32 {
        self.code()
    }
}

/// Complete line configuration applied with [`UsartDriver::configure`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommConfig {
    /// Operating mode
    pub mode: Mode,
    /// Character width
    pub data_bits: DataBits,
    /// Parity
    pub parity: Parity,
    /// Stop bits
    pub stop_bits: StopBits,
    /// Flow control
    pub flow_control: FlowControl,
    /// Clock polarity, synchronous modes only
    pub cpol: ClockPolarity,
    /// Clock phase, synchronous modes only
    pub cpha: ClockPhase,
    /// Baud rate in bits per second
    pub baud_rate: u32,
}

impl CommConfig {
    /// Fixed settings used for command exchange: 115200 8N1, no flow control
    pub fn command_exchange(mode: Mode) -> Self {
        Self {
            mode,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            cpol: ClockPolarity::Cpol0,
            cpha: ClockPhase::Cpha0,
            baud_rate: 115_200,
        }
    }

    /// Bytes per data item for this configuration
    pub fn bytes_per_item(&self) -> usize {
        self.data_bits.bytes_per_item()
    }
}

impl Default for CommConfig {
    fn default() -> Self {
        Self::command_exchange(Mode::Asynchronous)
    }
}

/// Static capability report of a driver
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverCapabilities {
    /// Asynchronous mode
    pub asynchronous: bool,
    /// Synchronous master mode
    pub synchronous_master: bool,
    /// Synchronous slave mode
    pub synchronous_slave: bool,
    /// Single-wire half duplex
    pub single_wire: bool,
    /// IrDA
    pub irda: bool,
    /// Smart card
    pub smart_card: bool,
    /// RTS flow control
    pub flow_control_rts: bool,
    /// CTS flow control
    pub flow_control_cts: bool,
    /// Driver signals [`UsartEvent::TxComplete`] once data has left the wire
    pub event_tx_complete: bool,
    /// RTS output
    pub rts: bool,
    /// CTS input
    pub cts: bool,
    /// DTR output
    pub dtr: bool,
    /// DSR input
    pub dsr: bool,
    /// DCD input
    pub dcd: bool,
    /// RI input
    pub ri: bool,
}

/// Modem-control line command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModemControl {
    /// Release RTS
    RtsClear,
    /// Assert RTS
    RtsSet,
    /// Release DTR
    DtrClear,
    /// Assert DTR
    DtrSet,
}

/// Live modem input line states
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModemStatus {
    /// Clear to send
    pub cts: bool,
    /// Data set ready
    pub dsr: bool,
    /// Data carrier detect
    pub dcd: bool,
    /// Ring indicator
    pub ri: bool,
}

/// Transfer activity reported by the driver
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverStatus {
    /// A send is still shifting out
    pub tx_busy: bool,
    /// A receive is armed
    pub rx_busy: bool,
}

/// Which in-flight operation to abort
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortKind {
    /// Abort the armed send
    Send,
    /// Abort the armed receive
    Receive,
    /// Abort the armed transfer
    Transfer,
}

/// Asynchronous, event-completed USART transport
///
/// Operations that move data only *arm* the transfer and return immediately;
/// completion is signalled later through the [`EventSender`] registered with
/// [`UsartDriver::initialize`]. All counts are in data items, all slices in
/// bytes (two bytes per item for 9-bit data).
pub trait UsartDriver: Send {
    /// Static capability report
    fn capabilities(&self) -> DriverCapabilities;

    /// Register the event sink and prepare the driver
    fn initialize(&mut self, events: EventSender) -> Result<(), DriverError>;

    /// Release the hardware and drop the event sink
    fn uninitialize(&mut self) -> Result<(), DriverError>;

    /// Power the peripheral up or down
    fn power(&mut self, on: bool) -> Result<(), DriverError>;

    /// Apply a line configuration, or reject it
    fn configure(&mut self, config: &CommConfig) -> Result<(), DriverError>;

    /// Enable or disable the receiver
    fn control_rx(&mut self, enable: bool) -> Result<(), DriverError>;

    /// Enable or disable the transmitter
    fn control_tx(&mut self, enable: bool) -> Result<(), DriverError>;

    /// Arm transmission of `items` items taken from `data`
    fn send(&mut self, data: &[u8], items: usize) -> Result<(), DriverError>;

    /// Arm reception of `items` items
    fn receive(&mut self, items: usize) -> Result<(), DriverError>;

    /// Arm a simultaneous send of `data` and reception of `items` items
    fn transfer(&mut self, data: &[u8], items: usize) -> Result<(), DriverError>;

    /// Copy the bytes received by the current or last receive/transfer into
    /// `out`, returning the number of bytes copied
    fn read_received(&mut self, out: &mut [u8]) -> usize;

    /// Items transmitted by the current or last operation
    fn tx_count(&self) -> usize;

    /// Items received by the current or last operation
    fn rx_count(&self) -> usize;

    /// Current busy flags
    fn status(&self) -> DriverStatus;

    /// Cancel an armed operation
    fn abort(&mut self, kind: AbortKind) -> Result<(), DriverError>;

    /// Assert (`true`) or release (`false`) the break condition
    fn set_break(&mut self, active: bool) -> Result<(), DriverError>;

    /// Drive RTS or DTR
    fn set_modem_control(&mut self, control: ModemControl) -> Result<(), DriverError>;

    /// Read the modem input lines
    fn modem_status(&mut self) -> ModemStatus;
}

/// Presence of the auxiliary DCD/RI outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxLines {
    /// DCD output is wired
    pub dcd: bool,
    /// RI output is wired
    pub ri: bool,
}

/// Auxiliary signal outputs driving the peer's DCD and RI inputs
///
/// These lines are not part of the USART itself; each is a plain two-state
/// output owned by the board.
pub trait AuxSignals: Send {
    /// Prepare the outputs and report which of them exist
    fn initialize(&mut self) -> AuxLines {
        AuxLines { dcd: true, ri: true }
    }

    /// Release the outputs
    fn uninitialize(&mut self) {}

    /// Drive the DCD output
    fn set_dcd(&mut self, active: bool);

    /// Drive the RI output
    fn set_ri(&mut self, active: bool);
}

/// Board without DCD/RI outputs
#[derive(Debug, Default)]
pub struct NoAuxSignals;

impl AuxSignals for NoAuxSignals {
    fn initialize(&mut self) -> AuxLines {
        AuxLines {
            dcd: false,
            ri: false,
        }
    }

    fn set_dcd(&mut self, _active: bool) {}

    fn set_ri(&mut self, _active: bool) {}
}
