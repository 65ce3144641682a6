//! Simulated USART
//!
//! An in-memory transport that behaves like a small MCU USART driver: it
//! accepts or rejects configurations according to a [`SimProfile`], completes
//! armed receives as soon as enough inbound bytes are queued, and signals
//! completion through the registered event sink the way an interrupt handler
//! would.
//!
//! The [`SimHandle`] side plays the remote peer (the validation suite): it
//! queues command and data bytes, collects everything the Server sends and
//! inspects the control calls the Server made.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use super::rx::RxAssembler;
use super::{
    AbortKind, AuxLines, AuxSignals, CommConfig, DataBits, DriverCapabilities, DriverError,
    DriverStatus, EventSender, FlowControl, ModemControl, ModemStatus, Mode, Parity, StopBits,
    UsartDriver, UsartEvent,
};

/// What the simulated peripheral supports
#[derive(Debug, Clone)]
pub struct SimProfile {
    /// Static capabilities reported to the Server
    pub capabilities: DriverCapabilities,
    /// Lowest accepted baud rate
    pub min_baud: u32,
    /// Highest accepted baud rate
    pub max_baud: u32,
    /// Accepted modes
    pub modes: Vec<Mode>,
    /// Accepted character widths
    pub data_bits: Vec<DataBits>,
    /// Accepted parities
    pub parities: Vec<Parity>,
    /// Accepted stop bits
    pub stop_bits: Vec<StopBits>,
    /// Accepted flow controls
    pub flow_controls: Vec<FlowControl>,
    /// Asserting break is seen by our own receiver (TX looped back to RX)
    pub loopback_break: bool,
}

impl Default for SimProfile {
    fn default() -> Self {
        Self {
            capabilities: DriverCapabilities {
                asynchronous: true,
                synchronous_master: true,
                synchronous_slave: false,
                single_wire: true,
                irda: true,
                smart_card: false,
                flow_control_rts: true,
                flow_control_cts: true,
                event_tx_complete: true,
                rts: true,
                cts: true,
                dtr: false,
                dsr: false,
                dcd: false,
                ri: false,
            },
            min_baud: 1_200,
            max_baud: 4_500_000,
            modes: vec![
                Mode::Asynchronous,
                Mode::SynchronousMaster,
                Mode::SingleWire,
                Mode::Irda,
            ],
            data_bits: vec![DataBits::Seven, DataBits::Eight, DataBits::Nine],
            parities: vec![Parity::None, Parity::Even, Parity::Odd],
            stop_bits: vec![StopBits::One, StopBits::Two],
            flow_controls: vec![
                FlowControl::None,
                FlowControl::Rts,
                FlowControl::Cts,
                FlowControl::RtsCts,
            ],
            loopback_break: true,
        }
    }
}

impl SimProfile {
    fn accepts(&self, config: &CommConfig) -> bool {
        self.modes.contains(&config.mode)
            && self.data_bits.contains(&config.data_bits)
            && self.parities.contains(&config.parity)
            && self.stop_bits.contains(&config.stop_bits)
            && self.flow_controls.contains(&config.flow_control)
            && (self.min_baud..=self.max_baud).contains(&config.baud_rate)
    }
}

/// A control call made on the simulated driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCall {
    /// `initialize`
    Initialize,
    /// `uninitialize`
    Uninitialize,
    /// `power`
    Power(bool),
    /// `configure`
    Configure {
        /// Requested configuration
        config: CommConfig,
        /// Whether the profile accepted it
        accepted: bool,
    },
    /// `control_rx`
    ControlRx(bool),
    /// `control_tx`
    ControlTx(bool),
    /// `send` of the given items
    Send(usize),
    /// `receive` of the given items
    Receive(usize),
    /// `transfer` of the given items
    Transfer(usize),
    /// `abort`
    Abort(AbortKind),
    /// `set_break`
    Break(bool),
    /// `set_modem_control`
    Modem(ModemControl),
}

#[derive(Debug)]
struct SimState {
    profile: SimProfile,
    events: Option<EventSender>,
    config: Option<CommConfig>,
    rx: RxAssembler,
    outbound: Vec<u8>,
    tx_items: usize,
    stall_sends: bool,
    stall_transfers: bool,
    break_active: bool,
    rts: bool,
    dtr: bool,
    modem_status: ModemStatus,
    calls: Vec<SimCall>,
}

impl SimState {
    fn notify(&self, event: UsartEvent) {
        if let Some(events) = &self.events {
            events.notify(event);
        }
    }

    fn bytes_per_item(&self) -> usize {
        self.config.map(|c| c.bytes_per_item()).unwrap_or(1)
    }

    /// Move queued inbound bytes into the armed receive
    fn pump(&mut self) {
        if self.rx.is_transfer() && self.stall_transfers {
            return;
        }
        if let Some(event) = self.rx.pump() {
            if event == UsartEvent::TransferComplete {
                self.tx_items = self.rx.items();
            }
            self.notify(event);
        }
    }

    fn arm_rx(&mut self, items: usize, transfer: bool) -> Result<(), DriverError> {
        if self.events.is_none() {
            return Err(DriverError::NotInitialized);
        }
        self.rx.arm(items, transfer)?;
        self.pump();
        Ok(())
    }
}

/// Simulated USART driver
#[derive(Debug, Clone)]
pub struct SimulatedUsart {
    state: Arc<Mutex<SimState>>,
}

/// Peer-side view of a [`SimulatedUsart`]
#[derive(Debug, Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl Default for SimulatedUsart {
    fn default() -> Self {
        Self::new(SimProfile::default())
    }
}

impl SimulatedUsart {
    /// Simulated driver accepting what `profile` allows
    pub fn new(profile: SimProfile) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                profile,
                events: None,
                config: None,
                rx: RxAssembler::new(usize::MAX),
                outbound: Vec::new(),
                tx_items: 0,
                stall_sends: false,
                stall_transfers: false,
                break_active: false,
                rts: false,
                dtr: false,
                modem_status: ModemStatus::default(),
                calls: Vec::new(),
            })),
        }
    }

    /// Peer-side handle sharing this driver's state
    pub fn handle(&self) -> SimHandle {
        SimHandle {
            state: self.state.clone(),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        lock(&self.state)
    }
}

impl UsartDriver for SimulatedUsart {
    fn capabilities(&self) -> DriverCapabilities {
        self.state().profile.capabilities
    }

    fn initialize(&mut self, events: EventSender) -> Result<(), DriverError> {
        let mut st = self.state();
        st.events = Some(events);
        st.calls.push(SimCall::Initialize);
        Ok(())
    }

    fn uninitialize(&mut self) -> Result<(), DriverError> {
        let mut st = self.state();
        st.events = None;
        st.calls.push(SimCall::Uninitialize);
        Ok(())
    }

    fn power(&mut self, on: bool) -> Result<(), DriverError> {
        self.state().calls.push(SimCall::Power(on));
        Ok(())
    }

    fn configure(&mut self, config: &CommConfig) -> Result<(), DriverError> {
        let mut st = self.state();
        let accepted = st.profile.accepts(config);
        st.calls.push(SimCall::Configure {
            config: *config,
            accepted,
        });
        if accepted {
            st.config = Some(*config);
            st.rx.set_bytes_per_item(config.bytes_per_item());
            Ok(())
        } else {
            Err(DriverError::Unsupported)
        }
    }

    fn control_rx(&mut self, enable: bool) -> Result<(), DriverError> {
        self.state().calls.push(SimCall::ControlRx(enable));
        Ok(())
    }

    fn control_tx(&mut self, enable: bool) -> Result<(), DriverError> {
        self.state().calls.push(SimCall::ControlTx(enable));
        Ok(())
    }

    fn send(&mut self, data: &[u8], items: usize) -> Result<(), DriverError> {
        let mut st = self.state();
        st.calls.push(SimCall::Send(items));
        if st.events.is_none() {
            return Err(DriverError::NotInitialized);
        }
        let bytes = items * st.bytes_per_item();
        if bytes > data.len() {
            return Err(DriverError::Parameter(format!(
                "{} items do not fit in {} bytes",
                items,
                data.len()
            )));
        }
        if st.stall_sends {
            st.tx_items = 0;
            return Ok(());
        }
        st.outbound.extend_from_slice(&data[..bytes]);
        st.tx_items = items;
        st.notify(UsartEvent::SendComplete);
        if st.profile.capabilities.event_tx_complete {
            st.notify(UsartEvent::TxComplete);
        }
        Ok(())
    }

    fn receive(&mut self, items: usize) -> Result<(), DriverError> {
        let mut st = self.state();
        st.calls.push(SimCall::Receive(items));
        st.arm_rx(items, false)
    }

    fn transfer(&mut self, data: &[u8], items: usize) -> Result<(), DriverError> {
        let mut st = self.state();
        st.calls.push(SimCall::Transfer(items));
        let bytes = items * st.bytes_per_item();
        if bytes > data.len() {
            return Err(DriverError::Parameter(format!(
                "{} items do not fit in {} bytes",
                items,
                data.len()
            )));
        }
        st.tx_items = 0;
        if !st.stall_transfers {
            st.outbound.extend_from_slice(&data[..bytes]);
        }
        st.arm_rx(items, true)
    }

    fn read_received(&mut self, out: &mut [u8]) -> usize {
        self.state().rx.read(out)
    }

    fn tx_count(&self) -> usize {
        self.state().tx_items
    }

    fn rx_count(&self) -> usize {
        self.state().rx.items()
    }

    fn status(&self) -> DriverStatus {
        let st = self.state();
        DriverStatus {
            tx_busy: false,
            rx_busy: st.rx.is_armed(),
        }
    }

    fn abort(&mut self, kind: AbortKind) -> Result<(), DriverError> {
        let mut st = self.state();
        st.calls.push(SimCall::Abort(kind));
        if matches!(kind, AbortKind::Receive | AbortKind::Transfer) {
            st.rx.abort();
        }
        Ok(())
    }

    fn set_break(&mut self, active: bool) -> Result<(), DriverError> {
        let mut st = self.state();
        st.calls.push(SimCall::Break(active));
        if active && !st.break_active && st.profile.loopback_break {
            st.notify(UsartEvent::RxBreak);
        }
        st.break_active = active;
        Ok(())
    }

    fn set_modem_control(&mut self, control: ModemControl) -> Result<(), DriverError> {
        let mut st = self.state();
        st.calls.push(SimCall::Modem(control));
        match control {
            ModemControl::RtsSet => st.rts = true,
            ModemControl::RtsClear => st.rts = false,
            ModemControl::DtrSet => st.dtr = true,
            ModemControl::DtrClear => st.dtr = false,
        }
        Ok(())
    }

    fn modem_status(&mut self) -> ModemStatus {
        self.state().modem_status
    }
}

impl SimHandle {
    fn state(&self) -> MutexGuard<'_, SimState> {
        lock(&self.state)
    }

    /// Queue bytes arriving on the Server's RX line
    pub fn push_inbound(&self, data: &[u8]) {
        let mut st = self.state();
        st.rx.push(data);
        st.pump();
    }

    /// Queue a command padded to the 32-byte command slot
    pub fn send_command(&self, command: &str) {
        let mut slot = [0u8; 32];
        let n = command.len().min(slot.len());
        slot[..n].copy_from_slice(&command.as_bytes()[..n]);
        self.push_inbound(&slot);
    }

    /// Take everything the Server has sent so far
    pub fn take_outbound(&self) -> Vec<u8> {
        std::mem::take(&mut self.state().outbound)
    }

    /// Wait for `len` bytes sent by the Server and take them
    pub fn wait_outbound(&self, len: usize, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut st = self.state();
                if st.outbound.len() >= len {
                    return Some(st.outbound.drain(..len).collect());
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Wait until `pred` holds for the recorded calls
    pub fn wait_for_call<F>(&self, timeout: Duration, pred: F) -> bool
    where
        F: Fn(&SimCall) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if self.state().calls.iter().any(&pred) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Every control call so far, in order
    pub fn calls(&self) -> Vec<SimCall> {
        self.state().calls.clone()
    }

    /// Forget the recorded calls
    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Configuration currently applied to the simulated peripheral
    pub fn current_config(&self) -> Option<CommConfig> {
        self.state().config
    }

    /// Bytes queued inbound but not yet consumed by a receive
    pub fn inbound_len(&self) -> usize {
        self.state().rx.pending()
    }

    /// Set the modem inputs seen by the Server
    pub fn set_modem_status(&self, status: ModemStatus) {
        self.state().modem_status = status;
    }

    /// Current (RTS, DTR) output states
    pub fn modem_outputs(&self) -> (bool, bool) {
        let st = self.state();
        (st.rts, st.dtr)
    }

    /// Whether break is currently asserted
    pub fn break_active(&self) -> bool {
        self.state().break_active
    }

    /// Make sends hand data to nobody and never complete
    pub fn set_stall_sends(&self, stall: bool) {
        self.state().stall_sends = stall;
    }

    /// Make transfers never complete
    pub fn set_stall_transfers(&self, stall: bool) {
        self.state().stall_transfers = stall;
    }

    /// Signal a break condition detected on the RX line
    pub fn inject_break(&self) {
        self.state().notify(UsartEvent::RxBreak);
    }
}

/// Recorded state of the simulated DCD/RI outputs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuxState {
    /// DCD output level
    pub dcd: bool,
    /// RI output level
    pub ri: bool,
    /// Every (line, state) write in order
    pub history: Vec<(&'static str, bool)>,
}

/// Simulated auxiliary DCD/RI outputs
#[derive(Debug, Clone, Default)]
pub struct SimAux {
    state: Arc<Mutex<AuxState>>,
    absent: bool,
}

impl SimAux {
    /// Board with both outputs present
    pub fn new() -> Self {
        Self::default()
    }

    /// Board reporting both outputs absent
    pub fn absent() -> Self {
        Self {
            absent: true,
            ..Self::default()
        }
    }

    /// Snapshot of the output levels and write history
    pub fn state(&self) -> AuxState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn write(&self, line: &'static str, active: bool) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match line {
            "DCD" => st.dcd = active,
            _ => st.ri = active,
        }
        st.history.push((line, active));
    }
}

impl AuxSignals for SimAux {
    fn initialize(&mut self) -> AuxLines {
        AuxLines {
            dcd: !self.absent,
            ri: !self.absent,
        }
    }

    fn set_dcd(&mut self, active: bool) {
        self.write("DCD", active);
    }

    fn set_ri(&mut self, active: bool) {
        self.write("RI", active);
    }
}
