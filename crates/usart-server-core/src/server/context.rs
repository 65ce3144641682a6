//! Server state and command handlers

use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::driver::{AbortKind, AuxLines, AuxSignals, CommConfig, ModemControl};
use crate::VERSION;

use super::buffer::AlignedBuffer;
use super::commands::{
    parse_command, BufferSelect, ComSettings, Command, Direction, XferRequest, COMMAND_SLOT,
};
use super::error::{CommandError, TransportError};
use super::probe::{probe, CapabilitySnapshot};
use super::state::{RunState, SharedRunState};
use super::transport::{bytes_to_items, Transport, Wait};
use super::ServerConfig;

/// Reply slot for `GET VER` and `GET CNT`
const SHORT_REPLY: usize = 16;

/// `SET MDM` mask bits
const MDM_RTS: u32 = 1 << 0;
const MDM_DTR: u32 = 1 << 1;
const MDM_DCD: u32 = 1 << 2;
const MDM_RI: u32 = 1 << 3;

/// Everything the Server thread owns
pub struct ServerContext {
    config: ServerConfig,
    transport: Transport,
    aux: Box<dyn AuxSignals>,
    aux_lines: AuxLines,
    run_state: SharedRunState,
    default_comm: CommConfig,
    xfer_comm: CommConfig,
    cmd_rx: [u8; COMMAND_SLOT],
    cmd_tx: [u8; COMMAND_SLOT],
    rx_buf: AlignedBuffer,
    tx_buf: AlignedBuffer,
    capabilities: Option<CapabilitySnapshot>,
    xfer_timeout: Duration,
    xfer_count: usize,
}

impl ServerContext {
    pub(crate) fn new(
        config: ServerConfig,
        transport: Transport,
        aux: Box<dyn AuxSignals>,
        aux_lines: AuxLines,
        run_state: SharedRunState,
        buffers: (AlignedBuffer, AlignedBuffer),
    ) -> Self {
        let default_comm = CommConfig::command_exchange(config.mode);
        let xfer_timeout = Duration::from_millis(config.xfer_timeout_ms);
        let (rx_buf, tx_buf) = buffers;
        Self {
            config,
            transport,
            aux,
            aux_lines,
            run_state,
            default_comm,
            xfer_comm: default_comm,
            cmd_rx: [0; COMMAND_SLOT],
            cmd_tx: [0; COMMAND_SLOT],
            rx_buf,
            tx_buf,
            capabilities: None,
            xfer_timeout,
            xfer_count: 0,
        }
    }

    /// Configuration used for command exchange
    pub fn default_comm(&self) -> &CommConfig {
        &self.default_comm
    }

    /// Configuration the next `XFER` will apply
    pub fn xfer_comm(&self) -> &CommConfig {
        &self.xfer_comm
    }

    /// Item count of the last `XFER`
    pub fn xfer_count(&self) -> usize {
        self.xfer_count
    }

    /// Snapshot from the start-up probe, once taken
    pub fn capabilities(&self) -> Option<&CapabilitySnapshot> {
        self.capabilities.as_ref()
    }

    /// Receive buffer contents
    pub fn rx_buffer(&self) -> &[u8] {
        &self.rx_buf
    }

    /// Transmit buffer contents
    pub fn tx_buffer(&self) -> &[u8] {
        &self.tx_buf
    }

    /// Probe capabilities unless already known
    pub fn probe_capabilities(&mut self) -> CapabilitySnapshot {
        if let Some(snapshot) = self.capabilities {
            return snapshot;
        }
        let snapshot = probe(&mut self.transport, self.aux_lines, &self.default_comm);
        self.capabilities = Some(snapshot);
        snapshot
    }

    /// Serve commands until a stop is requested
    pub fn run(mut self) -> Self {
        info!("USART Server v{} running", VERSION);
        loop {
            match self.run_state.get() {
                RunState::Receiving => match self.receive_command() {
                    Ok(()) => {
                        self.run_state.advance(RunState::Receiving, RunState::Executing);
                    }
                    Err(TransportError::Cancelled) => {}
                    Err(e) => debug!("Command reception failed: {}", e),
                },
                RunState::Executing => {
                    self.execute();
                    self.run_state.advance(RunState::Executing, RunState::Receiving);
                }
                RunState::Terminating => break,
            }
        }
        self.transport.abort(AbortKind::Transfer);
        info!("USART Server stopped");
        self
    }

    fn receive_command(&mut self) -> Result<(), TransportError> {
        let items = bytes_to_items(COMMAND_SLOT, self.transport.bytes_per_item());
        self.transport
            .receive(&mut self.cmd_rx, items, Wait::NextCommand)
            .map(|_| ())
    }

    fn execute(&mut self) {
        let command = match parse_command(&self.cmd_rx) {
            Ok(command) => command,
            Err(e) => {
                debug!("Dropping command: {}", e);
                return;
            }
        };
        info!("{}", command.keyword());
        if let Err(e) = self.dispatch(command) {
            warn!("{} failed: {}", command.keyword(), e);
        }
    }

    /// Run the handler for `command`
    pub fn dispatch(&mut self, command: Command) -> Result<(), CommandError> {
        match command {
            Command::GetVersion => self.get_version(),
            Command::GetCapabilities => self.get_capabilities(),
            Command::SetBuffer {
                select,
                length,
                pattern,
            } => self.set_buffer(select, length, pattern),
            Command::GetBuffer { select, length } => self.get_buffer(select, length),
            Command::SetCom(settings) => {
                self.set_com(&settings);
                Ok(())
            }
            Command::Xfer(request) => self.xfer(&request),
            Command::GetCount => self.get_count(),
            Command::SetBreak {
                delay_ms,
                duration_ms,
            } => self.set_break(delay_ms, duration_ms),
            Command::GetBreak => self.get_break(),
            Command::SetModem {
                mask,
                delay_ms,
                duration_ms,
            } => self.set_modem(mask, delay_ms, duration_ms),
            Command::GetModem => self.get_modem(),
        }
    }

    /// Send the first `len` bytes of the reply slot after the lead-in delay
    fn reply(&mut self, len: usize, delay: Duration) -> Result<(), CommandError> {
        sleep_ms(delay);
        let items = bytes_to_items(len, self.transport.bytes_per_item());
        self.transport
            .send(&self.cmd_tx[..len], items, self.config.command_timeout())?;
        Ok(())
    }

    /// Write `text` zero-padded into the first `slot` bytes of the reply slot
    fn fill_reply(&mut self, text: &str, slot: usize) -> Result<(), CommandError> {
        if text.len() > slot {
            return Err(CommandError::ResponseOverflow { slot });
        }
        self.cmd_tx[..slot].fill(0);
        self.cmd_tx[..text.len()].copy_from_slice(text.as_bytes());
        Ok(())
    }

    fn get_version(&mut self) -> Result<(), CommandError> {
        self.fill_reply(VERSION, SHORT_REPLY)?;
        self.reply(SHORT_REPLY, self.config.response_delay())
    }

    fn get_capabilities(&mut self) -> Result<(), CommandError> {
        let record = self.probe_capabilities().to_record();
        self.fill_reply(&record, COMMAND_SLOT)?;
        self.reply(COMMAND_SLOT, self.config.capability_delay())
    }

    fn check_length(&self, length: u32) -> Result<usize, CommandError> {
        let capacity = self.rx_buf.capacity();
        match usize::try_from(length) {
            Ok(len) if len <= capacity => Ok(len),
            _ => Err(CommandError::CountExceedsBuffer {
                count: length,
                capacity,
            }),
        }
    }

    fn set_buffer(
        &mut self,
        select: BufferSelect,
        length: u32,
        pattern: u8,
    ) -> Result<(), CommandError> {
        let len = self.check_length(length)?;
        let items = bytes_to_items(len, self.transport.bytes_per_item());
        let wait = Wait::Bounded(self.config.command_timeout());
        let buf = match select {
            BufferSelect::Rx => &mut self.rx_buf,
            BufferSelect::Tx => &mut self.tx_buf,
        };
        buf.fill(pattern);

        // Length 0 means no data phase
        if len > 0 {
            self.transport.receive(buf, items, wait)?;
        }
        Ok(())
    }

    fn get_buffer(&mut self, select: BufferSelect, length: u32) -> Result<(), CommandError> {
        let len = self.check_length(length)?;
        sleep_ms(self.config.response_delay());

        let items = bytes_to_items(len, self.transport.bytes_per_item());
        let buf = match select {
            BufferSelect::Rx => &self.rx_buf,
            BufferSelect::Tx => &self.tx_buf,
        };
        self.transport
            .send(&buf[..len], items, self.config.command_timeout())?;
        Ok(())
    }

    fn set_com(&mut self, settings: &ComSettings) {
        self.xfer_comm = settings.apply_to(&self.xfer_comm);
        debug!("Transfer configuration: {:?}", self.xfer_comm);
    }

    fn xfer(&mut self, request: &XferRequest) -> Result<(), CommandError> {
        let capacity = self.rx_buf.capacity();
        let count = request.count as usize;
        if count * self.xfer_comm.bytes_per_item() > capacity {
            return Err(CommandError::CountExceedsBuffer {
                count: request.count,
                capacity,
            });
        }
        if let Some(timeout_ms) = request.timeout_ms {
            self.xfer_timeout = Duration::from_millis(u64::from(timeout_ms));
        }
        if let Some(delay_ms) = request.delay_ms {
            sleep_ms(Duration::from_millis(u64::from(delay_ms)));
        }

        let result = self.run_xfer(request.direction, count, request.split_count);

        if let Err(e) = self.transport.configure(&self.default_comm) {
            warn!("Could not restore default configuration: {}", e);
        }
        result
    }

    fn run_xfer(
        &mut self,
        direction: Direction,
        count: usize,
        split: Option<u32>,
    ) -> Result<(), CommandError> {
        self.transport
            .configure(&self.xfer_comm)
            .map_err(TransportError::from)?;
        let timeout = self.xfer_timeout;

        match (direction, split) {
            (Direction::Send, _) => {
                let result = self.transport.send(&self.tx_buf, count, timeout);
                self.xfer_count = self.transport.tx_count();
                result?;
            }
            (Direction::Receive, None) => {
                let result = self
                    .transport
                    .receive(&mut self.rx_buf, count, Wait::Bounded(timeout));
                self.xfer_count = self.transport.rx_count();
                result?;
            }
            (Direction::Receive, Some(split)) => {
                self.split_receive(count, split as usize, timeout)?;
            }
            (Direction::Transfer, _) => {
                let tx = &self.tx_buf;
                let rx = &mut self.rx_buf;
                self.xfer_count = self.transport.transfer(tx, rx, count, timeout)?;
            }
        }
        Ok(())
    }

    /// Receive `split` items with RTS asserted, then the rest with RTS released
    fn split_receive(
        &mut self,
        count: usize,
        split: usize,
        timeout: Duration,
    ) -> Result<(), CommandError> {
        let phase_timeout = |items| Wait::Bounded(phase_timeout(timeout, items, count));
        let offset = split * self.xfer_comm.bytes_per_item();

        self.set_rts(ModemControl::RtsSet);
        let first = if split > 0 {
            let result = self
                .transport
                .receive(&mut self.rx_buf, split, phase_timeout(split));
            self.xfer_count = self.transport.rx_count();
            result.map(|_| ())
        } else {
            self.xfer_count = 0;
            Ok(())
        };
        self.set_rts(ModemControl::RtsClear);

        let rest = count - split;
        let second = if rest > 0 {
            let result = self.transport.receive(
                &mut self.rx_buf[offset..],
                rest,
                phase_timeout(rest),
            );
            self.xfer_count += self.transport.rx_count();
            result.map(|_| ())
        } else {
            Ok(())
        };

        first?;
        second?;
        Ok(())
    }

    fn set_rts(&mut self, control: ModemControl) {
        if let Err(e) = self.transport.set_modem_control(control) {
            warn!("{:?} failed: {}", control, e);
        }
    }

    fn get_count(&mut self) -> Result<(), CommandError> {
        let text = self.xfer_count.to_string();
        self.fill_reply(&text, SHORT_REPLY)?;
        self.reply(SHORT_REPLY, self.config.response_delay())
    }

    fn set_break(&mut self, delay_ms: u32, duration_ms: u32) -> Result<(), CommandError> {
        sleep_ms(Duration::from_millis(u64::from(delay_ms)));
        let result = self.transport.set_break(true).map(|()| {
            sleep_ms(Duration::from_millis(u64::from(duration_ms)));
        });
        if let Err(e) = self.transport.set_break(false) {
            warn!("Could not release break: {}", e);
        }
        Ok(result?)
    }

    fn get_break(&mut self) -> Result<(), CommandError> {
        self.cmd_tx[0] = b'0' + u8::from(self.transport.take_break());
        self.reply(1, self.config.response_delay())
    }

    /// Drive RTS/DTR (when the driver has them) and the DCD/RI outputs
    fn drive_modem_lines(&mut self, mask: u32) -> Result<(), TransportError> {
        let caps = self.transport.capabilities();
        if caps.rts {
            self.transport.set_modem_control(if mask & MDM_RTS != 0 {
                ModemControl::RtsSet
            } else {
                ModemControl::RtsClear
            })?;
        }
        if caps.dtr {
            self.transport.set_modem_control(if mask & MDM_DTR != 0 {
                ModemControl::DtrSet
            } else {
                ModemControl::DtrClear
            })?;
        }
        self.aux.set_dcd(mask & MDM_DCD != 0);
        self.aux.set_ri(mask & MDM_RI != 0);
        Ok(())
    }

    fn set_modem(
        &mut self,
        mask: u32,
        delay_ms: u32,
        duration_ms: u32,
    ) -> Result<(), CommandError> {
        let result = self.drive_modem_lines(0).and_then(|()| {
            sleep_ms(Duration::from_millis(u64::from(delay_ms)));
            self.drive_modem_lines(mask)
        });
        if result.is_ok() {
            sleep_ms(Duration::from_millis(u64::from(duration_ms)));
        }
        if let Err(e) = self.drive_modem_lines(0) {
            warn!("Could not release modem lines: {}", e);
        }
        Ok(result?)
    }

    fn get_modem(&mut self) -> Result<(), CommandError> {
        let status = self.transport.modem_status();
        self.cmd_tx[0] = b'0' + u8::from(status.cts) + 2 * u8::from(status.dsr);
        self.reply(1, self.config.response_delay())
    }

    /// Power the driver down and release the auxiliary lines
    pub(crate) fn shutdown(mut self) {
        self.aux.uninitialize();
        if let Err(e) = self.transport.close() {
            warn!("Driver shutdown failed: {}", e);
        }
    }
}

/// Share of `timeout` for a phase moving `items` of `count` items, at least 1 ms
fn phase_timeout(timeout: Duration, items: usize, count: usize) -> Duration {
    let share = timeout.as_millis() as u64 * items as u64 / count.max(1) as u64;
    Duration::from_millis(share.max(1))
}

fn sleep_ms(duration: Duration) {
    if !duration.is_zero() {
        thread::sleep(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::sim::{SimAux, SimCall, SimHandle, SimProfile, SimulatedUsart};
    use crate::driver::{event_channel, DataBits, Mode, Parity, UsartDriver};
    use pretty_assertions::assert_eq;
    use std::time::Instant;

    const BUFFER: usize = 64;

    fn context() -> (ServerContext, SimHandle, SimAux) {
        let mut sim = SimulatedUsart::new(SimProfile::default());
        let handle = sim.handle();
        let (tx, rx) = event_channel();
        sim.initialize(tx).unwrap();

        let config = ServerConfig {
            buffer_size: BUFFER,
            command_timeout_ms: 20,
            xfer_timeout_ms: 20,
            response_delay_ms: 0,
            capability_delay_ms: 0,
            ..ServerConfig::default()
        };
        let mut transport = Transport::new(
            Box::new(sim),
            rx,
            config.command_timeout(),
            SharedRunState::default(),
        );
        transport.configure(&CommConfig::default()).unwrap();

        let aux = SimAux::new();
        let context = ServerContext::new(
            config,
            transport,
            Box::new(aux.clone()),
            AuxLines { dcd: true, ri: true },
            SharedRunState::default(),
            (
                AlignedBuffer::new(BUFFER).unwrap(),
                AlignedBuffer::new(BUFFER).unwrap(),
            ),
        );
        (context, handle, aux)
    }

    fn xfer(direction: Direction, count: u32, timeout_ms: u32, split: Option<u32>) -> Command {
        Command::Xfer(XferRequest {
            direction,
            count,
            delay_ms: None,
            timeout_ms: Some(timeout_ms),
            split_count: split,
        })
    }

    #[test]
    fn test_set_buffer_fills_then_loads_data_phase() {
        let (mut ctx, handle, _aux) = context();
        handle.push_inbound(b"abcd");
        ctx.dispatch(Command::SetBuffer {
            select: BufferSelect::Tx,
            length: 4,
            pattern: 0x55,
        })
        .unwrap();
        assert_eq!(&ctx.tx_buffer()[..4], b"abcd");
        assert!(ctx.tx_buffer()[4..].iter().all(|&b| b == 0x55));
        assert!(ctx.rx_buffer().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_failed_transfer_keeps_previous_count() {
        let (mut ctx, handle, _aux) = context();
        ctx.dispatch(xfer(Direction::Send, 4, 20, None)).unwrap();
        assert_eq!(ctx.xfer_count(), 4);

        handle.set_stall_transfers(true);
        handle.clear_calls();
        let result = ctx.dispatch(xfer(Direction::Transfer, 8, 5, None));
        assert!(matches!(
            result,
            Err(CommandError::Transport(TransportError::Timeout { .. }))
        ));
        assert_eq!(ctx.xfer_count(), 4);
        assert!(handle.calls().contains(&SimCall::Abort(AbortKind::Transfer)));
        assert_eq!(handle.current_config(), Some(*ctx.default_comm()));
    }

    #[test]
    fn test_split_receive_toggles_rts_between_phases() {
        let (mut ctx, handle, _aux) = context();
        handle.push_inbound(b"0123456789");
        handle.clear_calls();
        ctx.dispatch(xfer(Direction::Receive, 10, 50, Some(4))).unwrap();
        assert_eq!(ctx.xfer_count(), 10);
        assert_eq!(&ctx.rx_buffer()[..10], b"0123456789");

        let calls = handle.calls();
        let pos = |call: &SimCall| calls.iter().position(|c| c == call).unwrap();
        assert!(pos(&SimCall::Modem(ModemControl::RtsSet)) < pos(&SimCall::Receive(4)));
        assert!(pos(&SimCall::Receive(4)) < pos(&SimCall::Modem(ModemControl::RtsClear)));
        assert!(pos(&SimCall::Modem(ModemControl::RtsClear)) < pos(&SimCall::Receive(6)));
    }

    #[test]
    fn test_phase_timeout_share_and_floor() {
        let timeout = Duration::from_millis(50);
        assert_eq!(phase_timeout(timeout, 4, 10), Duration::from_millis(20));
        assert_eq!(phase_timeout(timeout, 6, 10), Duration::from_millis(30));
        assert_eq!(phase_timeout(Duration::from_millis(10), 1, 100), Duration::from_millis(1));
        assert_eq!(phase_timeout(Duration::ZERO, 3, 4), Duration::from_millis(1));
    }

    #[test]
    fn test_split_receive_phases_wait_at_least_a_millisecond() {
        let (mut ctx, handle, _aux) = context();
        handle.clear_calls();
        let started = Instant::now();
        let result = ctx.dispatch(xfer(Direction::Receive, 2, 1, Some(1)));
        assert!(matches!(
            result,
            Err(CommandError::Transport(TransportError::Timeout { .. }))
        ));
        assert!(started.elapsed() >= Duration::from_millis(2));
        let calls = handle.calls();
        assert!(calls.contains(&SimCall::Receive(1)));
        assert_eq!(
            calls
                .iter()
                .filter(|c| **c == SimCall::Abort(AbortKind::Receive))
                .count(),
            2
        );
    }

    #[test]
    fn test_set_com_applies_only_for_the_transfer() {
        let (mut ctx, handle, _aux) = context();
        ctx.dispatch(Command::SetCom(ComSettings {
            mode: Mode::Asynchronous,
            data_bits: Some(DataBits::Seven),
            parity: Some(Parity::Even),
            stop_bits: None,
            flow_control: None,
            cpol: None,
            cpha: None,
            baud_rate: Some(9600),
        }))
        .unwrap();
        let expected = *ctx.xfer_comm();
        assert_eq!(expected.baud_rate, 9600);
        assert_eq!(handle.current_config(), Some(*ctx.default_comm()));

        handle.push_inbound(b"xy");
        handle.clear_calls();
        ctx.dispatch(xfer(Direction::Receive, 2, 20, None)).unwrap();
        assert!(handle.calls().contains(&SimCall::Configure {
            config: expected,
            accepted: true
        }));
        assert_eq!(handle.current_config(), Some(*ctx.default_comm()));
    }

    #[test]
    fn test_count_beyond_buffer_is_rejected_before_configure() {
        let (mut ctx, handle, _aux) = context();
        handle.clear_calls();
        let result = ctx.dispatch(xfer(Direction::Send, BUFFER as u32 + 1, 20, None));
        assert_eq!(
            result,
            Err(CommandError::CountExceedsBuffer {
                count: BUFFER as u32 + 1,
                capacity: BUFFER
            })
        );
        assert!(handle.calls().is_empty());
    }

    #[test]
    fn test_nine_bit_transfer_halves_item_capacity() {
        let (mut ctx, _handle, _aux) = context();
        ctx.dispatch(Command::SetCom(ComSettings {
            mode: Mode::Asynchronous,
            data_bits: Some(DataBits::Nine),
            parity: None,
            stop_bits: None,
            flow_control: None,
            cpol: None,
            cpha: None,
            baud_rate: None,
        }))
        .unwrap();
        let result = ctx.dispatch(xfer(Direction::Send, BUFFER as u32 / 2 + 1, 20, None));
        assert!(matches!(result, Err(CommandError::CountExceedsBuffer { .. })));
    }

    #[test]
    fn test_set_modem_pulses_requested_lines() {
        let (mut ctx, handle, aux) = context();
        handle.clear_calls();
        ctx.dispatch(Command::SetModem {
            mask: 0xF,
            delay_ms: 0,
            duration_ms: 0,
        })
        .unwrap();

        let modem: Vec<SimCall> = handle
            .calls()
            .into_iter()
            .filter(|c| matches!(c, SimCall::Modem(_)))
            .collect();
        // The default profile has RTS but no DTR
        assert_eq!(
            modem,
            vec![
                SimCall::Modem(ModemControl::RtsClear),
                SimCall::Modem(ModemControl::RtsSet),
                SimCall::Modem(ModemControl::RtsClear),
            ]
        );
        assert_eq!(
            aux.state().history,
            vec![
                ("DCD", false),
                ("RI", false),
                ("DCD", true),
                ("RI", true),
                ("DCD", false),
                ("RI", false),
            ]
        );
        assert_eq!(handle.modem_outputs(), (false, false));
    }

    #[test]
    fn test_capabilities_are_probed_once() {
        let (mut ctx, handle, _aux) = context();
        ctx.dispatch(Command::GetCapabilities).unwrap();
        let first = handle.take_outbound();
        assert_eq!(first.len(), COMMAND_SLOT);

        handle.clear_calls();
        ctx.dispatch(Command::GetCapabilities).unwrap();
        assert_eq!(handle.take_outbound(), first);
        assert!(!handle
            .calls()
            .iter()
            .any(|c| matches!(c, SimCall::Configure { .. })));
        assert!(ctx.capabilities().is_some());
    }

    #[test]
    fn test_shutdown_powers_down_driver() {
        let (ctx, handle, _aux) = context();
        ctx.shutdown();
        let calls = handle.calls();
        assert!(calls.contains(&SimCall::Power(false)));
        assert_eq!(calls.last(), Some(&SimCall::Uninitialize));
    }
}
