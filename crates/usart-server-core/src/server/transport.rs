//! Timeout-bounded transport operations
//!
//! Wraps the asynchronous [`UsartDriver`] so the Server can call blocking
//! `send`/`receive`/`transfer` with a timeout. Each operation arms the driver,
//! waits on the event channel and, on any failure, aborts the armed operation
//! so the driver is idle before its next use. Nothing is retried here.

use std::thread;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::driver::{
    AbortKind, CommConfig, DriverCapabilities, DriverError, EventReceiver, ModemControl,
    ModemStatus, UsartDriver, UsartEvent,
};

use super::error::TransportError;
use super::state::SharedRunState;

/// Short poll used while idle-waiting for the next command
const IDLE_POLL: Duration = Duration::from_millis(1);

/// Polls of the driver's TX-busy flag after `SendComplete`
const TX_DRAIN_POLLS: u32 = 10;

/// How long a receive waits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Wait for the next command. Idles in short polls until the first bytes
    /// arrive, then allows the command timeout for the rest of the slot. A stop
    /// request is honoured only while nothing has been received.
    NextCommand,
    /// Single wait of the given duration
    Bounded(Duration),
}

/// Number of items needed to carry `bytes` bytes
pub fn bytes_to_items(bytes: usize, bytes_per_item: usize) -> usize {
    bytes.div_ceil(bytes_per_item.max(1))
}

/// Blocking adapter over a [`UsartDriver`]
pub struct Transport {
    driver: Box<dyn UsartDriver>,
    events: EventReceiver,
    capabilities: DriverCapabilities,
    bytes_per_item: usize,
    command_timeout: Duration,
    run_state: SharedRunState,
}

impl Transport {
    /// Wrap an initialized driver and its event receiver
    pub fn new(
        driver: Box<dyn UsartDriver>,
        events: EventReceiver,
        command_timeout: Duration,
        run_state: SharedRunState,
    ) -> Self {
        let capabilities = driver.capabilities();
        Self {
            driver,
            events,
            capabilities,
            bytes_per_item: 1,
            command_timeout,
            run_state,
        }
    }

    /// Capabilities the driver reported at construction
    pub fn capabilities(&self) -> DriverCapabilities {
        self.capabilities
    }

    /// Bytes per item of the configuration last applied
    pub fn bytes_per_item(&self) -> usize {
        self.bytes_per_item
    }

    /// Raw driver access for capability probing
    pub(crate) fn driver_mut(&mut self) -> &mut dyn UsartDriver {
        self.driver.as_mut()
    }

    /// Apply a line configuration and enable both directions
    pub fn configure(&mut self, config: &CommConfig) -> Result<(), DriverError> {
        self.driver.configure(config)?;
        self.bytes_per_item = config.bytes_per_item();
        self.driver.control_rx(true)?;
        self.driver.control_tx(true)?;
        debug!(
            "Configured {:?} {} baud, {:?} data bits",
            config.mode, config.baud_rate, config.data_bits
        );
        Ok(())
    }

    fn check_capacity(&self, items: usize, capacity: usize) -> Result<usize, TransportError> {
        let bytes = items * self.bytes_per_item;
        if bytes > capacity {
            return Err(TransportError::BufferTooSmall { items, capacity });
        }
        Ok(bytes)
    }

    /// Receive `items` items into the start of `buf`.
    ///
    /// The target region is pre-filled with `'?'`; whatever arrived is copied
    /// back even if the operation fails. Returns the driver's receive count.
    pub fn receive(
        &mut self,
        buf: &mut [u8],
        items: usize,
        wait: Wait,
    ) -> Result<usize, TransportError> {
        let bytes = self.check_capacity(items, buf.len())?;
        buf[..bytes].fill(b'?');

        self.events.clear();
        self.driver.control_rx(true)?;
        if let Err(e) = self.driver.receive(items) {
            let _ = self.driver.control_rx(false);
            return Err(e.into());
        }

        let result = match wait {
            Wait::NextCommand => self.wait_next_command(),
            Wait::Bounded(timeout) => self.wait_bounded(timeout, |e| {
                e == UsartEvent::ReceiveComplete
            }),
        };

        self.driver.read_received(&mut buf[..bytes]);
        let received = self.driver.rx_count();
        if result.is_err() {
            self.abort(AbortKind::Receive);
        }
        let _ = self.driver.control_rx(false);

        match result {
            Ok(()) => Ok(received),
            Err(TransportError::Timeout { .. }) => Err(TransportError::Timeout {
                transferred: received,
            }),
            Err(e) => Err(e),
        }
    }

    fn wait_next_command(&mut self) -> Result<(), TransportError> {
        loop {
            match self.events.wait_for(IDLE_POLL, UsartEvent::ends_reception) {
                Some(UsartEvent::ReceiveComplete) => return Ok(()),
                Some(event) => return Err(TransportError::LineError(event)),
                None => {}
            }
            if self.driver.rx_count() != 0 {
                trace!("Partial command, waiting for the rest");
                return match self
                    .events
                    .wait_for(self.command_timeout, UsartEvent::ends_reception)
                {
                    Some(UsartEvent::ReceiveComplete) => Ok(()),
                    Some(event) => Err(TransportError::LineError(event)),
                    None => Err(TransportError::Timeout { transferred: 0 }),
                };
            }
            if self.run_state.is_terminating() {
                return Err(TransportError::Cancelled);
            }
        }
    }

    fn wait_bounded<F>(&self, timeout: Duration, accept: F) -> Result<(), TransportError>
    where
        F: Fn(UsartEvent) -> bool,
    {
        match self.events.wait_for(timeout, accept) {
            Some(_) => Ok(()),
            None => Err(TransportError::Timeout { transferred: 0 }),
        }
    }

    /// Send `items` items from the start of `data`.
    ///
    /// Completes on `TxComplete` when the driver reports it, otherwise on
    /// `SendComplete` followed by the TX queue running empty.
    pub fn send(
        &mut self,
        data: &[u8],
        items: usize,
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let bytes = self.check_capacity(items, data.len())?;

        self.events.clear();
        self.driver.control_tx(true)?;
        if let Err(e) = self.driver.send(&data[..bytes], items) {
            let _ = self.driver.control_tx(false);
            return Err(e.into());
        }

        let result = if self.capabilities.event_tx_complete {
            self.wait_bounded(timeout, |e| e == UsartEvent::TxComplete)
        } else {
            self.wait_bounded(timeout, |e| e == UsartEvent::SendComplete)
                .and_then(|()| self.wait_tx_drained())
        };

        let sent = self.driver.tx_count();
        if result.is_err() {
            self.abort(AbortKind::Send);
        }
        let _ = self.driver.control_tx(false);

        result.map(|()| sent).map_err(|e| match e {
            TransportError::Timeout { .. } => TransportError::Timeout { transferred: sent },
            e => e,
        })
    }

    // SendComplete may fire once data sits in the FIFO, before it is on the wire.
    fn wait_tx_drained(&self) -> Result<(), TransportError> {
        for _ in 0..TX_DRAIN_POLLS {
            if !self.driver.status().tx_busy {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(1));
        }
        Err(TransportError::Timeout { transferred: 0 })
    }

    /// Send `items` items from `tx` while receiving as many into `rx`
    pub fn transfer(
        &mut self,
        tx: &[u8],
        rx: &mut [u8],
        items: usize,
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let bytes = self.check_capacity(items, tx.len().min(rx.len()))?;

        self.events.clear();
        self.driver.transfer(&tx[..bytes], items)?;
        let event = self.events.wait_for(timeout, UsartEvent::ends_transfer);
        self.driver.read_received(&mut rx[..bytes]);
        let transferred = self.driver.rx_count();

        match event {
            Some(UsartEvent::TransferComplete) => Ok(transferred),
            Some(event) => {
                self.abort(AbortKind::Transfer);
                Err(TransportError::LineError(event))
            }
            None => {
                self.abort(AbortKind::Transfer);
                Err(TransportError::Timeout { transferred })
            }
        }
    }

    /// Abort an armed operation, logging failures
    pub fn abort(&mut self, kind: AbortKind) {
        if let Err(e) = self.driver.abort(kind) {
            warn!("Abort {:?} failed: {}", kind, e);
        }
    }

    /// Drive RTS or DTR
    pub fn set_modem_control(&mut self, control: ModemControl) -> Result<(), TransportError> {
        Ok(self.driver.set_modem_control(control)?)
    }

    /// Read the modem input lines
    pub fn modem_status(&mut self) -> ModemStatus {
        self.driver.modem_status()
    }

    /// Assert or release break
    pub fn set_break(&mut self, active: bool) -> Result<(), TransportError> {
        Ok(self.driver.set_break(active)?)
    }

    /// Read and clear the sticky break-detected flag
    pub fn take_break(&self) -> bool {
        self.events.take_break()
    }

    /// Items the driver sent in the last send or transfer
    pub fn tx_count(&self) -> usize {
        self.driver.tx_count()
    }

    /// Items the driver received in the last receive or transfer
    pub fn rx_count(&self) -> usize {
        self.driver.rx_count()
    }

    /// Power the driver down and release it
    pub fn close(&mut self) -> Result<(), DriverError> {
        self.driver.power(false)?;
        self.driver.uninitialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::event_channel;
    use crate::driver::sim::{SimCall, SimHandle, SimProfile, SimulatedUsart};

    fn transport_with(profile: SimProfile) -> (Transport, SimHandle) {
        let mut sim = SimulatedUsart::new(profile);
        let handle = sim.handle();
        let (tx, rx) = event_channel();
        sim.initialize(tx).unwrap();
        let mut transport = Transport::new(
            Box::new(sim),
            rx,
            Duration::from_millis(20),
            SharedRunState::default(),
        );
        transport.configure(&CommConfig::default()).unwrap();
        (transport, handle)
    }

    fn transport() -> (Transport, SimHandle) {
        transport_with(SimProfile::default())
    }

    #[test]
    fn test_items_for_bytes() {
        assert_eq!(bytes_to_items(32, 1), 32);
        assert_eq!(bytes_to_items(5, 2), 3);
        assert_eq!(bytes_to_items(16, 2), 8);
    }

    #[test]
    fn test_bounded_receive_timeout_aborts_and_keeps_prefill() {
        let (mut transport, handle) = transport();
        handle.push_inbound(b"ab");
        let mut buf = [0u8; 8];
        let result = transport.receive(&mut buf, 4, Wait::Bounded(Duration::from_millis(5)));
        assert_eq!(result, Err(TransportError::Timeout { transferred: 2 }));
        assert_eq!(&buf, b"ab??\0\0\0\0");
        assert!(handle.calls().contains(&SimCall::Abort(AbortKind::Receive)));
        assert_eq!(handle.calls().last(), Some(&SimCall::ControlRx(false)));
    }

    #[test]
    fn test_next_command_with_partial_slot_times_out() {
        let (mut transport, handle) = transport();
        handle.push_inbound(b"GET");
        let mut buf = [0u8; 32];
        let result = transport.receive(&mut buf, 32, Wait::NextCommand);
        assert!(matches!(result, Err(TransportError::Timeout { .. })));
        assert!(handle.calls().contains(&SimCall::Abort(AbortKind::Receive)));
    }

    #[test]
    fn test_next_command_stops_when_idle_and_terminating() {
        let mut sim = SimulatedUsart::default();
        let (tx, rx) = event_channel();
        sim.initialize(tx).unwrap();
        let state = SharedRunState::default();
        state.request_stop();
        let mut transport = Transport::new(Box::new(sim), rx, Duration::from_millis(20), state);
        let mut buf = [0u8; 32];
        assert_eq!(
            transport.receive(&mut buf, 32, Wait::NextCommand),
            Err(TransportError::Cancelled)
        );
    }

    #[test]
    fn test_next_command_fails_on_line_break() {
        let (mut transport, handle) = transport();
        let inject = handle.clone();
        let injector = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            inject.inject_break();
        });
        let mut buf = [0u8; 32];
        let result = transport.receive(&mut buf, 32, Wait::NextCommand);
        injector.join().unwrap();
        assert_eq!(result, Err(TransportError::LineError(UsartEvent::RxBreak)));
        assert!(transport.take_break());
    }

    #[test]
    fn test_send_without_tx_complete_event_polls_status() {
        let mut profile = SimProfile::default();
        profile.capabilities.event_tx_complete = false;
        let (mut transport, handle) = transport_with(profile);
        assert_eq!(transport.send(b"hello", 5, Duration::from_millis(20)), Ok(5));
        assert_eq!(handle.take_outbound(), b"hello".to_vec());
    }

    #[test]
    fn test_stalled_send_aborts() {
        let (mut transport, handle) = transport();
        handle.set_stall_sends(true);
        let result = transport.send(b"hello", 5, Duration::from_millis(5));
        assert_eq!(result, Err(TransportError::Timeout { transferred: 0 }));
        assert!(handle.calls().contains(&SimCall::Abort(AbortKind::Send)));
    }

    #[test]
    fn test_transfer_exchanges_both_directions() {
        let (mut transport, handle) = transport();
        handle.push_inbound(b"wxyz");
        let mut rx = [0u8; 4];
        assert_eq!(
            transport.transfer(b"abcd", &mut rx, 4, Duration::from_millis(20)),
            Ok(4)
        );
        assert_eq!(&rx, b"wxyz");
        assert_eq!(handle.take_outbound(), b"abcd".to_vec());
    }

    #[test]
    fn test_item_count_larger_than_buffer() {
        let (mut transport, _handle) = transport();
        let mut buf = [0u8; 4];
        assert_eq!(
            transport.receive(&mut buf, 5, Wait::Bounded(Duration::from_millis(1))),
            Err(TransportError::BufferTooSmall {
                items: 5,
                capacity: 4
            })
        );
    }
}
