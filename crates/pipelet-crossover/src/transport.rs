//! Transports carry text frames and report connection events.
//!
//! Transports never block: [`Transport::poll`] returns what has arrived so
//! far. The only transport built in is an in-process pair over tokio
//! channels, used by tests and by graphs split inside one process.

use std::collections::VecDeque;

use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::trace;

use crate::error::{CrossoverError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Frame(String),
    Closed,
}

pub trait Transport: Send {
    fn kind(&self) -> TransportKind;
    fn send(&mut self, frame: String) -> Result<()>;
    fn poll(&mut self) -> Option<TransportEvent>;
    /// Close both ends; each side sees `Closed` once.
    fn close(&mut self);
    fn is_open(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Memory,
}

impl TransportKind {
    pub const SUPPORTED: &'static [TransportKind] = &[TransportKind::Memory];

    pub fn name(self) -> &'static str {
        match self {
            TransportKind::Memory => "memory",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::SUPPORTED.iter().copied().find(|k| k.name() == name.trim())
    }
}

/// First entry of `preferred` this build supports.
pub fn select_transport(preferred: &[String]) -> Result<TransportKind> {
    preferred
        .iter()
        .find_map(|name| TransportKind::parse(name))
        .ok_or_else(|| CrossoverError::UnsupportedTransport(preferred.to_vec()))
}

enum Wire {
    Data(String),
    Close,
}

pub struct MemoryTransport {
    tx: UnboundedSender<Wire>,
    rx: UnboundedReceiver<Wire>,
    local: VecDeque<TransportEvent>,
    open: bool,
}

/// Two connected ends. Both report `Open` first.
pub fn memory_pair() -> (MemoryTransport, MemoryTransport) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (MemoryTransport::new(a_tx, a_rx), MemoryTransport::new(b_tx, b_rx))
}

impl MemoryTransport {
    fn new(tx: UnboundedSender<Wire>, rx: UnboundedReceiver<Wire>) -> Self {
        Self {
            tx,
            rx,
            local: VecDeque::from([TransportEvent::Open]),
            open: true,
        }
    }

    fn closed(&mut self) -> Option<TransportEvent> {
        if !self.open {
            return None;
        }
        self.open = false;
        Some(TransportEvent::Closed)
    }
}

impl Transport for MemoryTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }

    fn send(&mut self, frame: String) -> Result<()> {
        if !self.open {
            return Err(CrossoverError::Closed);
        }
        trace!(bytes = frame.len(), "memory frame out");
        self.tx.send(Wire::Data(frame)).map_err(|_| CrossoverError::Closed)
    }

    fn poll(&mut self) -> Option<TransportEvent> {
        if let Some(ev) = self.local.pop_front() {
            return Some(ev);
        }
        if !self.open {
            return None;
        }
        match self.rx.try_recv() {
            Ok(Wire::Data(frame)) => Some(TransportEvent::Frame(frame)),
            Ok(Wire::Close) | Err(TryRecvError::Disconnected) => self.closed(),
            Err(TryRecvError::Empty) => None,
        }
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        // the peer may already be gone
        let _ = self.tx.send(Wire::Close);
        self.local.retain(|ev| *ev != TransportEvent::Open);
        if let Some(ev) = self.closed() {
            self.local.push_back(ev);
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
