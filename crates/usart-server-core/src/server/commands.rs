//! Server commands
//!
//! A command arrives as a fixed 32-byte slot holding ASCII text padded with
//! NUL (or space) bytes. It is decoded once into a [`Command`] carrying its
//! parameters; handlers never look at the raw text.

use crate::driver::{
    ClockPhase, ClockPolarity, CommConfig, DataBits, FlowControl, LineOption, Mode, Parity,
    StopBits,
};

use super::error::ParseError;
use super::params::{ParamCursor, Radix};

/// Size of a command slot in bytes
pub const COMMAND_SLOT: usize = 32;

/// Transfer buffer selected by `SET BUF` / `GET BUF`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferSelect {
    /// Receive buffer
    Rx,
    /// Transmit buffer
    Tx,
}

/// Direction of an `XFER`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Send from the transmit buffer
    Send,
    /// Receive into the receive buffer
    Receive,
    /// Send and receive at the same time
    Transfer,
}

impl Direction {
    fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Direction::Send),
            1 => Some(Direction::Receive),
            2 => Some(Direction::Transfer),
            _ => None,
        }
    }
}

/// Fields of `SET COM`; only the mode is mandatory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComSettings {
    /// Mode, always given
    pub mode: Mode,
    /// Character width
    pub data_bits: Option<DataBits>,
    /// Parity
    pub parity: Option<Parity>,
    /// Stop bits
    pub stop_bits: Option<StopBits>,
    /// Flow control
    pub flow_control: Option<FlowControl>,
    /// Clock polarity
    pub cpol: Option<ClockPolarity>,
    /// Clock phase
    pub cpha: Option<ClockPhase>,
    /// Baud rate
    pub baud_rate: Option<u32>,
}

impl ComSettings {
    /// `base` with every provided field replaced
    pub fn apply_to(&self, base: &CommConfig) -> CommConfig {
        CommConfig {
            mode: self.mode,
            data_bits: self.data_bits.unwrap_or(base.data_bits),
            parity: self.parity.unwrap_or(base.parity),
            stop_bits: self.stop_bits.unwrap_or(base.stop_bits),
            flow_control: self.flow_control.unwrap_or(base.flow_control),
            cpol: self.cpol.unwrap_or(base.cpol),
            cpha: self.cpha.unwrap_or(base.cpha),
            baud_rate: self.baud_rate.unwrap_or(base.baud_rate),
        }
    }
}

/// Parameters of `XFER`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XferRequest {
    /// Send, receive or both
    pub direction: Direction,
    /// Items to move, never zero
    pub count: u32,
    /// Pause before the transfer starts
    pub delay_ms: Option<u32>,
    /// Replaces the transfer timeout for this and later transfers
    pub timeout_ms: Option<u32>,
    /// Receive only: items to take while RTS is asserted
    pub split_count: Option<u32>,
}

/// A decoded command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `GET VER`
    GetVersion,
    /// `GET CAP`
    GetCapabilities,
    /// `SET BUF RX|TX,length[,pattern]`
    SetBuffer {
        select: BufferSelect,
        length: u32,
        pattern: u8,
    },
    /// `GET BUF RX|TX,length`
    GetBuffer { select: BufferSelect, length: u32 },
    /// `SET COM mode,dataBits,parity,stopBits,flowCtrl,cpol,cpha,baud`
    SetCom(ComSettings),
    /// `XFER dir,count[,delay][,timeout][,split]`
    Xfer(XferRequest),
    /// `GET CNT`
    GetCount,
    /// `SET BRK delay,duration`
    SetBreak { delay_ms: u32, duration_ms: u32 },
    /// `GET BRK`
    GetBreak,
    /// `SET MDM mask,delay,duration`
    SetModem {
        mask: u32,
        delay_ms: u32,
        duration_ms: u32,
    },
    /// `GET MDM`
    GetModem,
}

impl Command {
    /// Command keyword as sent on the wire
    pub fn keyword(&self) -> &'static str {
        match self {
            Command::GetVersion => "GET VER",
            Command::GetCapabilities => "GET CAP",
            Command::SetBuffer { .. } => "SET BUF",
            Command::GetBuffer { .. } => "GET BUF",
            Command::SetCom(_) => "SET COM",
            Command::Xfer(_) => "XFER",
            Command::GetCount => "GET CNT",
            Command::SetBreak { .. } => "SET BRK",
            Command::GetBreak => "GET BRK",
            Command::SetModem { .. } => "SET MDM",
            Command::GetModem => "GET MDM",
        }
    }
}

type ParseFn = fn(&mut ParamCursor<'_>) -> Result<Command, ParseError>;

const COMMANDS: &[(&str, ParseFn)] = &[
    ("GET VER", parse_get_version),
    ("GET CAP", parse_get_capabilities),
    ("SET BUF", parse_set_buffer),
    ("GET BUF", parse_get_buffer),
    ("SET COM", parse_set_com),
    ("XFER", parse_xfer),
    ("GET CNT", parse_get_count),
    ("SET BRK", parse_set_break),
    ("GET BRK", parse_get_break),
    ("SET MDM", parse_set_modem),
    ("GET MDM", parse_get_modem),
];

/// Decode a received command slot
pub fn parse_command(slot: &[u8]) -> Result<Command, ParseError> {
    let end = slot.iter().position(|&b| b == 0).unwrap_or(slot.len());
    let text = std::str::from_utf8(&slot[..end]).map_err(|_| ParseError::NotText)?;
    if !text.is_ascii() {
        return Err(ParseError::NotText);
    }
    if text.trim().is_empty() {
        return Err(ParseError::Empty);
    }

    let (keyword, parse) = COMMANDS
        .iter()
        .filter(|(keyword, _)| text.starts_with(keyword))
        .max_by_key(|(keyword, _)| keyword.len())
        .ok_or_else(|| ParseError::UnknownCommand(text.trim_end().chars().take(20).collect()))?;

    let mut params = ParamCursor::new(&text[keyword.len()..]);
    parse(&mut params)
}

fn parse_get_version(_: &mut ParamCursor<'_>) -> Result<Command, ParseError> {
    Ok(Command::GetVersion)
}

fn parse_get_capabilities(_: &mut ParamCursor<'_>) -> Result<Command, ParseError> {
    Ok(Command::GetCapabilities)
}

fn parse_get_count(_: &mut ParamCursor<'_>) -> Result<Command, ParseError> {
    Ok(Command::GetCount)
}

fn parse_get_break(_: &mut ParamCursor<'_>) -> Result<Command, ParseError> {
    Ok(Command::GetBreak)
}

fn parse_get_modem(_: &mut ParamCursor<'_>) -> Result<Command, ParseError> {
    Ok(Command::GetModem)
}

fn parse_select(params: &mut ParamCursor<'_>) -> Result<BufferSelect, ParseError> {
    match params.required_word("select")? {
        "RX" => Ok(BufferSelect::Rx),
        "TX" => Ok(BufferSelect::Tx),
        other => Err(ParseError::Malformed {
            name: "select",
            text: other.to_string(),
        }),
    }
}

fn parse_set_buffer(params: &mut ParamCursor<'_>) -> Result<Command, ParseError> {
    let select = parse_select(params)?;
    let length = params.required("length", Radix::Decimal)?;
    let pattern = match params.optional(Radix::Hex) {
        None => 0,
        Some(value) => u8::try_from(value).map_err(|_| ParseError::OutOfRange {
            name: "pattern",
            value,
        })?,
    };
    Ok(Command::SetBuffer {
        select,
        length,
        pattern,
    })
}

fn parse_get_buffer(params: &mut ParamCursor<'_>) -> Result<Command, ParseError> {
    let select = parse_select(params)?;
    let length = params.required("length", Radix::Decimal)?;
    if length == 0 {
        return Err(ParseError::OutOfRange {
            name: "length",
            value: length,
        });
    }
    Ok(Command::GetBuffer { select, length })
}

/// Decode an optional enumerated field; an unknown code fails the command
fn optional_option<T: LineOption>(
    params: &mut ParamCursor<'_>,
    name: &'static str,
) -> Result<Option<T>, ParseError> {
    match params.optional(Radix::Decimal) {
        None => Ok(None),
        Some(value) => T::from_code(value)
            .map(Some)
            .ok_or(ParseError::OutOfRange { name, value }),
    }
}

fn parse_set_com(params: &mut ParamCursor<'_>) -> Result<Command, ParseError> {
    let value = params.required("mode", Radix::Decimal)?;
    let mode = Mode::from_code(value).ok_or(ParseError::OutOfRange {
        name: "mode",
        value,
    })?;
    let data_bits = optional_option(params, "data_bits")?;
    let parity = optional_option(params, "parity")?;
    let stop_bits = optional_option(params, "stop_bits")?;
    let flow_control = optional_option(params, "flow_control")?;
    let cpol = optional_option(params, "cpol")?;
    let cpha = optional_option(params, "cpha")?;
    let baud_rate = params.optional(Radix::Decimal);

    Ok(Command::SetCom(ComSettings {
        mode,
        data_bits,
        parity,
        stop_bits,
        flow_control,
        cpol,
        cpha,
        baud_rate,
    }))
}

/// Delays must be finite; `u32::MAX` means "wait forever" on the peer side
fn finite_ms(name: &'static str, value: u32) -> Result<u32, ParseError> {
    if value == u32::MAX {
        Err(ParseError::OutOfRange { name, value })
    } else {
        Ok(value)
    }
}

fn optional_ms(
    params: &mut ParamCursor<'_>,
    name: &'static str,
) -> Result<Option<u32>, ParseError> {
    params
        .optional(Radix::Decimal)
        .map(|value| finite_ms(name, value))
        .transpose()
}

fn parse_xfer(params: &mut ParamCursor<'_>) -> Result<Command, ParseError> {
    let value = params.required("dir", Radix::Decimal)?;
    let direction = Direction::from_code(value).ok_or(ParseError::OutOfRange {
        name: "dir",
        value,
    })?;
    let count = params.required("count", Radix::Decimal)?;
    if count == 0 {
        return Err(ParseError::OutOfRange {
            name: "count",
            value: count,
        });
    }
    let delay_ms = optional_ms(params, "delay")?;
    let timeout_ms = optional_ms(params, "timeout")?;
    let split_count = match params.optional(Radix::Decimal) {
        Some(split) if split > count => {
            return Err(ParseError::OutOfRange {
                name: "split_count",
                value: split,
            })
        }
        split => split,
    };

    Ok(Command::Xfer(XferRequest {
        direction,
        count,
        delay_ms,
        timeout_ms,
        split_count,
    }))
}

fn parse_set_break(params: &mut ParamCursor<'_>) -> Result<Command, ParseError> {
    let delay_ms = finite_ms("delay", params.required("delay", Radix::Decimal)?)?;
    let duration_ms = optional_ms(params, "duration")?.unwrap_or(0);
    Ok(Command::SetBreak {
        delay_ms,
        duration_ms,
    })
}

fn parse_set_modem(params: &mut ParamCursor<'_>) -> Result<Command, ParseError> {
    let mask = params.required("mask", Radix::Hex)?;
    let delay_ms = finite_ms("delay", params.required("delay", Radix::Decimal)?)?;
    let duration_ms = optional_ms(params, "duration")?.unwrap_or(0);
    Ok(Command::SetModem {
        mask,
        delay_ms,
        duration_ms,
    })
}
