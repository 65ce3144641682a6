//! Host serial port driver
//!
//! Runs the Server on a PC, with an ordinary serial port as the USART. A
//! background reader thread feeds received bytes into the armed operation and
//! signals completion through the event sink, which gives the blocking
//! `serialport` API the same event-completed shape as an MCU driver.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use super::rx::RxAssembler;
use super::{
    AbortKind, CommConfig, DataBits, DriverCapabilities, DriverError, DriverStatus, EventSender,
    FlowControl, ModemControl, ModemStatus, Mode, Parity, StopBits, UsartDriver, UsartEvent,
};

/// Read timeout of the reader thread, bounds how fast it notices shutdown
const READ_POLL: Duration = Duration::from_millis(10);

/// Bytes buffered while no receive is armed
const RX_FIFO_SIZE: usize = 8192;

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Product name (if available)
    pub product: Option<String>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, product) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => {
                (Some(usb_info.vid), Some(usb_info.pid), usb_info.product)
            }
            _ => (None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            product,
        }
    }
}

/// Sort key placing ttyACM* first, then ttyUSB* (both numerically), then
/// everything else by name
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// List available serial ports, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone()).or_insert_with(|| PortInfo {
                        name: full,
                        vid: None,
                        pid: None,
                        product: None,
                    });
                }
            }
        }
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// Open a serial port at the command-exchange baud rate
pub fn open_port(name: &str, baud_rate: u32) -> Result<Box<dyn SerialPort>, DriverError> {
    serialport::new(name, baud_rate)
        .timeout(READ_POLL)
        .open()
        .map_err(|e| DriverError::SerialError(e.to_string()))
}

fn serial_err(e: serialport::Error) -> DriverError {
    DriverError::SerialError(e.to_string())
}

/// Translate a line configuration into `serialport` settings
fn port_settings(
    config: &CommConfig,
) -> Result<
    (
        serialport::DataBits,
        serialport::Parity,
        serialport::StopBits,
        serialport::FlowControl,
    ),
    DriverError,
> {
    if config.mode != Mode::Asynchronous {
        return Err(DriverError::Unsupported);
    }
    let data_bits = match config.data_bits {
        DataBits::Five => serialport::DataBits::Five,
        DataBits::Six => serialport::DataBits::Six,
        DataBits::Seven => serialport::DataBits::Seven,
        DataBits::Eight => serialport::DataBits::Eight,
        DataBits::Nine => return Err(DriverError::Unsupported),
    };
    let parity = match config.parity {
        Parity::None => serialport::Parity::None,
        Parity::Even => serialport::Parity::Even,
        Parity::Odd => serialport::Parity::Odd,
    };
    let stop_bits = match config.stop_bits {
        StopBits::One => serialport::StopBits::One,
        StopBits::Two => serialport::StopBits::Two,
        StopBits::OnePointFive | StopBits::Half => return Err(DriverError::Unsupported),
    };
    let flow_control = match config.flow_control {
        FlowControl::None => serialport::FlowControl::None,
        FlowControl::RtsCts => serialport::FlowControl::Hardware,
        FlowControl::Rts | FlowControl::Cts => return Err(DriverError::Unsupported),
    };
    if config.baud_rate == 0 {
        return Err(DriverError::Parameter("baud rate 0".to_string()));
    }
    Ok((data_bits, parity, stop_bits, flow_control))
}

#[derive(Debug)]
struct ReaderShared {
    rx: RxAssembler,
    events: Option<EventSender>,
}

impl ReaderShared {
    fn notify(&self, event: UsartEvent) {
        if let Some(events) = &self.events {
            events.notify(event);
        }
    }
}

fn lock(shared: &Mutex<ReaderShared>) -> MutexGuard<'_, ReaderShared> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

/// [`UsartDriver`] over a host serial port
pub struct SerialPortDriver {
    name: String,
    port: Option<Box<dyn SerialPort>>,
    shared: Arc<Mutex<ReaderShared>>,
    reader: Option<JoinHandle<()>>,
    stop_reader: Arc<AtomicBool>,
    tx_items: usize,
}

impl SerialPortDriver {
    /// Create a driver for the named port; the port opens on initialize
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            port: None,
            shared: Arc::new(Mutex::new(ReaderShared {
                rx: RxAssembler::new(RX_FIFO_SIZE),
                events: None,
            })),
            reader: None,
            stop_reader: Arc::new(AtomicBool::new(false)),
            tx_items: 0,
        }
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>, DriverError> {
        self.port.as_mut().ok_or(DriverError::NotInitialized)
    }

    fn spawn_reader(&mut self, mut reader: Box<dyn SerialPort>) -> Result<(), DriverError> {
        let shared = self.shared.clone();
        let stop = self.stop_reader.clone();
        let handle = thread::Builder::new()
            .name("usart-rx".to_string())
            .spawn(move || {
                let mut buf = [0u8; 256];
                while !stop.load(Ordering::Acquire) {
                    match reader.read(&mut buf) {
                        Ok(0) => continue,
                        Ok(n) => {
                            let mut sh = lock(&shared);
                            if !sh.rx.push(&buf[..n]) {
                                sh.notify(UsartEvent::RxOverflow);
                            }
                            if let Some(event) = sh.rx.pump() {
                                sh.notify(event);
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::TimedOut => continue,
                        Err(e) => {
                            warn!("serial read failed: {}", e);
                            thread::sleep(READ_POLL);
                        }
                    }
                }
                debug!("reader thread exiting");
            })
            .map_err(|e| DriverError::SerialError(e.to_string()))?;
        self.reader = Some(handle);
        Ok(())
    }

    fn stop_reader(&mut self) {
        self.stop_reader.store(true, Ordering::Release);
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
        self.stop_reader.store(false, Ordering::Release);
    }
}

impl UsartDriver for SerialPortDriver {
    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            asynchronous: true,
            flow_control_rts: true,
            flow_control_cts: true,
            event_tx_complete: false,
            rts: true,
            cts: true,
            dtr: true,
            dsr: true,
            dcd: true,
            ri: true,
            ..DriverCapabilities::default()
        }
    }

    fn initialize(&mut self, events: EventSender) -> Result<(), DriverError> {
        if self.port.is_some() {
            return Err(DriverError::Busy);
        }
        let port = open_port(&self.name, CommConfig::default().baud_rate)?;
        let reader = port.try_clone().map_err(serial_err)?;
        lock(&self.shared).events = Some(events);
        self.port = Some(port);
        self.spawn_reader(reader)
    }

    fn uninitialize(&mut self) -> Result<(), DriverError> {
        self.stop_reader();
        lock(&self.shared).events = None;
        self.port = None;
        Ok(())
    }

    fn power(&mut self, _on: bool) -> Result<(), DriverError> {
        Ok(())
    }

    fn configure(&mut self, config: &CommConfig) -> Result<(), DriverError> {
        let (data_bits, parity, stop_bits, flow_control) = port_settings(config)?;
        let port = self.port()?;
        port.set_baud_rate(config.baud_rate).map_err(serial_err)?;
        port.set_data_bits(data_bits).map_err(serial_err)?;
        port.set_parity(parity).map_err(serial_err)?;
        port.set_stop_bits(stop_bits).map_err(serial_err)?;
        port.set_flow_control(flow_control).map_err(serial_err)?;
        lock(&self.shared)
            .rx
            .set_bytes_per_item(config.bytes_per_item());
        Ok(())
    }

    // The host receiver and transmitter are always enabled.
    fn control_rx(&mut self, _enable: bool) -> Result<(), DriverError> {
        Ok(())
    }

    fn control_tx(&mut self, _enable: bool) -> Result<(), DriverError> {
        Ok(())
    }

    fn send(&mut self, data: &[u8], items: usize) -> Result<(), DriverError> {
        let bytes = data.get(..items).ok_or_else(|| {
            DriverError::Parameter(format!("{} items exceed {} bytes", items, data.len()))
        })?;
        self.tx_items = 0;
        self.port()?
            .write_all(bytes)
            .map_err(|e| DriverError::SerialError(e.to_string()))?;
        self.tx_items = items;
        lock(&self.shared).notify(UsartEvent::SendComplete);
        Ok(())
    }

    fn receive(&mut self, items: usize) -> Result<(), DriverError> {
        let mut sh = lock(&self.shared);
        sh.rx.arm(items, false)?;
        if let Some(event) = sh.rx.pump() {
            sh.notify(event);
        }
        Ok(())
    }

    fn transfer(&mut self, data: &[u8], items: usize) -> Result<(), DriverError> {
        lock(&self.shared).rx.arm(items, true)?;
        if let Err(e) = self.send(data, items) {
            lock(&self.shared).rx.abort();
            return Err(e);
        }
        let mut sh = lock(&self.shared);
        if let Some(event) = sh.rx.pump() {
            sh.notify(event);
        }
        Ok(())
    }

    fn read_received(&mut self, out: &mut [u8]) -> usize {
        lock(&self.shared).rx.read(out)
    }

    fn tx_count(&self) -> usize {
        self.tx_items
    }

    fn rx_count(&self) -> usize {
        lock(&self.shared).rx.items()
    }

    fn status(&self) -> DriverStatus {
        let tx_busy = self
            .port
            .as_ref()
            .and_then(|p| p.bytes_to_write().ok())
            .map(|n| n > 0)
            .unwrap_or(false);
        DriverStatus {
            tx_busy,
            rx_busy: lock(&self.shared).rx.is_armed(),
        }
    }

    fn abort(&mut self, kind: AbortKind) -> Result<(), DriverError> {
        match kind {
            AbortKind::Send => self
                .port()?
                .clear(serialport::ClearBuffer::Output)
                .map_err(serial_err),
            AbortKind::Receive | AbortKind::Transfer => {
                let mut sh = lock(&self.shared);
                sh.rx.abort();
                sh.rx.flush();
                Ok(())
            }
        }
    }

    fn set_break(&mut self, active: bool) -> Result<(), DriverError> {
        let port = self.port()?;
        if active {
            port.set_break().map_err(serial_err)
        } else {
            port.clear_break().map_err(serial_err)
        }
    }

    fn set_modem_control(&mut self, control: ModemControl) -> Result<(), DriverError> {
        let port = self.port()?;
        match control {
            ModemControl::RtsSet => port.write_request_to_send(true),
            ModemControl::RtsClear => port.write_request_to_send(false),
            ModemControl::DtrSet => port.write_data_terminal_ready(true),
            ModemControl::DtrClear => port.write_data_terminal_ready(false),
        }
        .map_err(serial_err)
    }

    fn modem_status(&mut self) -> ModemStatus {
        let Some(port) = self.port.as_mut() else {
            return ModemStatus::default();
        };
        ModemStatus {
            cts: port.read_clear_to_send().unwrap_or(false),
            dsr: port.read_data_set_ready().unwrap_or(false),
            dcd: port.read_carrier_detect().unwrap_or(false),
            ri: port.read_ring_indicator().unwrap_or(false),
        }
    }
}

impl Drop for SerialPortDriver {
    fn drop(&mut self) {
        self.stop_reader();
    }
}
