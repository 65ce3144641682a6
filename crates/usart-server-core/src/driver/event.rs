//! Driver completion events
//!
//! Drivers report completion from their own context (an interrupt handler,
//! a reader thread) by pushing typed events into a channel that the Server
//! thread drains. Producers only ever send; they never touch Server buffers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Event signalled by a driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsartEvent {
    /// Send data handed over to the output queue
    SendComplete,
    /// Armed receive got all requested items
    ReceiveComplete,
    /// Armed transfer moved all requested items
    TransferComplete,
    /// Last bit of the send left the wire
    TxComplete,
    /// Transmitter ran dry in a synchronous slave mode
    TxUnderflow,
    /// Receiver lost data
    RxOverflow,
    /// Receiver idle timeout
    RxTimeout,
    /// Break condition seen on RX
    RxBreak,
    /// Framing error on RX
    RxFramingError,
    /// Parity error on RX
    RxParityError,
    /// CTS changed
    Cts,
    /// DSR changed
    Dsr,
    /// DCD changed
    Dcd,
    /// RI changed
    Ri,
}

impl UsartEvent {
    /// Events that terminate a command reception
    pub fn ends_reception(self) -> bool {
        matches!(
            self,
            UsartEvent::ReceiveComplete
                | UsartEvent::RxOverflow
                | UsartEvent::RxBreak
                | UsartEvent::RxFramingError
                | UsartEvent::RxParityError
        )
    }

    /// Events that terminate a bidirectional transfer
    pub fn ends_transfer(self) -> bool {
        matches!(
            self,
            UsartEvent::TransferComplete | UsartEvent::TxUnderflow | UsartEvent::RxOverflow
        )
    }
}

/// Producer half handed to the driver
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<UsartEvent>,
    break_seen: Arc<AtomicBool>,
}

impl EventSender {
    /// Signal an event. Never blocks; a closed channel is ignored.
    pub fn notify(&self, event: UsartEvent) {
        if event == UsartEvent::RxBreak {
            self.break_seen.store(true, Ordering::Release);
        }
        let _ = self.tx.send(event);
    }
}

/// Consumer half owned by the Server thread
#[derive(Debug)]
pub struct EventReceiver {
    rx: Receiver<UsartEvent>,
    break_seen: Arc<AtomicBool>,
}

/// Create a connected event sender/receiver pair
pub fn event_channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel();
    let break_seen = Arc::new(AtomicBool::new(false));
    (
        EventSender {
            tx,
            break_seen: break_seen.clone(),
        },
        EventReceiver { rx, break_seen },
    )
}

impl EventReceiver {
    /// Discard every event queued so far
    pub fn clear(&self) {
        while self.rx.try_recv().is_ok() {}
    }

    /// Wait until an event accepted by `accept` arrives or `timeout` expires.
    /// Events that are not accepted are discarded.
    pub fn wait_for<F>(&self, timeout: Duration, accept: F) -> Option<UsartEvent>
    where
        F: Fn(UsartEvent) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(event) if accept(event) => return Some(event),
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return None
                }
            }
        }
    }

    /// Read and clear the sticky break flag
    pub fn take_break(&self) -> bool {
        self.break_seen.swap(false, Ordering::AcqRel)
    }
}
