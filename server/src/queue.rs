//! Per-session outbound queues.
//!
//! Each session owns a priority queue and a normal queue. Any thread may
//! enqueue; only the session's own I/O loop drains them, a bounded number of
//! packets per service cycle.

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use shared::Packet;
use std::io;

/// Result of one service cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Serviced {
    pub sent: usize,
    /// A disconnect packet was sent; the session must stop sending.
    pub disconnect: bool,
}

struct Queue {
    tx: Sender<Packet>,
    rx: Receiver<Packet>,
}

impl Queue {
    fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Queue { tx, rx }
    }
}

pub struct QueuePair {
    priority: Queue,
    normal: Queue,
}

impl QueuePair {
    pub fn new() -> Self {
        QueuePair {
            priority: Queue::new(),
            normal: Queue::new(),
        }
    }

    pub fn push(&self, packet: Packet) {
        // Both ends live in self, so the channel can never be disconnected.
        let _ = self.normal.tx.send(packet);
    }

    pub fn push_priority(&self, packet: Packet) {
        let _ = self.priority.tx.send(packet);
    }

    pub fn priority_len(&self) -> usize {
        self.priority.rx.len()
    }

    pub fn normal_len(&self) -> usize {
        self.normal.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.priority.rx.is_empty() && self.normal.rx.is_empty()
    }

    /// Drains up to `cap` packets, the whole priority queue first, handing
    /// each to `send`. Stops early after a disconnect packet.
    pub fn service<F>(&self, cap: usize, mut send: F) -> io::Result<Serviced>
    where
        F: FnMut(&Packet) -> io::Result<()>,
    {
        let mut serviced = Serviced::default();
        for queue in [&self.priority, &self.normal] {
            while serviced.sent < cap {
                let packet = match queue.rx.try_recv() {
                    Ok(packet) => packet,
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                };
                send(&packet)?;
                serviced.sent += 1;
                if packet.is_disconnect() {
                    serviced.disconnect = true;
                    return Ok(serviced);
                }
            }
        }
        Ok(serviced)
    }

    /// Discards everything still queued.
    pub fn clear(&self) {
        while self.priority.rx.try_recv().is_ok() {}
        while self.normal.rx.try_recv().is_ok() {}
    }
}

impl Default for QueuePair {
    fn default() -> Self {
        Self::new()
    }
}
