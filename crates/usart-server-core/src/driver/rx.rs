//! Receive-side bookkeeping shared by the bundled drivers

use std::collections::VecDeque;

use super::{DriverError, UsartEvent};

#[derive(Debug, Clone, Copy)]
struct RxOp {
    wanted_bytes: usize,
    transfer: bool,
}

/// Collects inbound bytes into the currently armed receive or transfer.
/// Bytes arriving while nothing is armed wait in a FIFO of `fifo_limit` bytes.
#[derive(Debug)]
pub(crate) struct RxAssembler {
    op: Option<RxOp>,
    data: Vec<u8>,
    fifo: VecDeque<u8>,
    fifo_limit: usize,
    bytes_per_item: usize,
}

impl RxAssembler {
    pub(crate) fn new(fifo_limit: usize) -> Self {
        Self {
            op: None,
            data: Vec::new(),
            fifo: VecDeque::new(),
            fifo_limit,
            bytes_per_item: 1,
        }
    }

    pub(crate) fn set_bytes_per_item(&mut self, bytes: usize) {
        self.bytes_per_item = bytes.max(1);
    }

    pub(crate) fn arm(&mut self, items: usize, transfer: bool) -> Result<(), DriverError> {
        if self.op.is_some() {
            return Err(DriverError::Busy);
        }
        if items == 0 {
            return Err(DriverError::Parameter("zero items".to_string()));
        }
        self.data.clear();
        self.op = Some(RxOp {
            wanted_bytes: items * self.bytes_per_item,
            transfer,
        });
        Ok(())
    }

    /// Queue bytes arriving on the line; overflowing bytes are dropped
    pub(crate) fn push(&mut self, bytes: &[u8]) -> bool {
        let room = self.fifo_limit.saturating_sub(self.fifo.len());
        self.fifo.extend(bytes.iter().take(room).copied());
        bytes.len() <= room
    }

    /// Move queued bytes into the armed operation and report its completion
    pub(crate) fn pump(&mut self) -> Option<UsartEvent> {
        let op = self.op?;
        let take = (op.wanted_bytes - self.data.len()).min(self.fifo.len());
        self.data.extend(self.fifo.drain(..take));
        if self.data.len() < op.wanted_bytes {
            return None;
        }
        self.op = None;
        Some(if op.transfer {
            UsartEvent::TransferComplete
        } else {
            UsartEvent::ReceiveComplete
        })
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.op.is_some()
    }

    pub(crate) fn is_transfer(&self) -> bool {
        self.op.map(|op| op.transfer).unwrap_or(false)
    }

    /// Drop the armed operation; bytes already received stay readable
    pub(crate) fn abort(&mut self) {
        self.op = None;
    }

    /// Discard bytes waiting in the FIFO
    pub(crate) fn flush(&mut self) {
        self.fifo.clear();
    }

    pub(crate) fn items(&self) -> usize {
        self.data.len() / self.bytes_per_item
    }

    pub(crate) fn pending(&self) -> usize {
        self.fifo.len()
    }

    pub(crate) fn read(&self, out: &mut [u8]) -> usize {
        let n = self.data.len().min(out.len());
        out[..n].copy_from_slice(&self.data[..n]);
        n
    }
}
