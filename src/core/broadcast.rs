//! Output Broadcaster
//!
//! Fans the normalized stream out to the attached WebSocket subscribers.
//! Each subscriber has its own bounded queue; a subscriber that cannot keep
//! up is dropped, it never blocks the filter or its peers.

use crate::web::protocol::ServerMessage;
use log::{debug, warn};
use tokio::sync::mpsc;

/// Outbound queue depth per subscriber.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 64;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<ServerMessage>,
}

/// Explicit subscriber set with bounded per-subscriber queues. Callers
/// serialize access (the session lock), which is what makes
/// snapshot-then-live onboarding gapless.
pub struct OutputBroadcaster {
    subscribers: Vec<Subscriber>,
    next_id: u64,
    queue_capacity: usize,
    accepting: bool,
}

impl OutputBroadcaster {
    pub fn new() -> Self {
        Self::with_queue_capacity(SUBSCRIBER_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        Self {
            subscribers: Vec::new(),
            next_id: 0,
            queue_capacity,
            accepting: true,
        }
    }

    /// Attach a new subscriber. Returns its id and the receiving end of its
    /// queue, or `None` once the session is shutting down.
    pub fn attach(&mut self) -> Option<(u64, mpsc::Receiver<ServerMessage>)> {
        if !self.accepting {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.subscribers.push(Subscriber { id, tx });
        debug!("subscriber {} attached ({} total)", id, self.subscribers.len());
        Some((id, rx))
    }

    pub fn detach(&mut self, id: u64) {
        self.subscribers.retain(|s| s.id != id);
        debug!("subscriber {} detached ({} left)", id, self.subscribers.len());
    }

    /// Deliver a message to one subscriber (used for the onboarding
    /// snapshot and state recovery). Returns false if the subscriber is
    /// gone or overflowed.
    pub fn send_to(&mut self, id: u64, msg: ServerMessage) -> bool {
        let ok = match self.subscribers.iter().find(|s| s.id == id) {
            Some(sub) => sub.tx.try_send(msg).is_ok(),
            None => false,
        };
        if !ok {
            self.detach(id);
        }
        ok
    }

    /// Enqueue a message to every subscriber. Overflowing or closed
    /// subscribers are reaped here; nobody else is affected.
    pub fn broadcast(&mut self, msg: &ServerMessage) {
        self.subscribers.retain(|sub| {
            match sub.tx.try_send(msg.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("subscriber {} queue overflow, dropping subscriber", sub.id);
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("subscriber {} closed, dropping subscriber", sub.id);
                    false
                }
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Stop accepting new subscribers and drop the existing queues; their
    /// outbound tasks terminate when the senders go away.
    pub fn close(&mut self) {
        self.accepting = false;
        self.subscribers.clear();
    }
}

impl Default for OutputBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(seq: u64) -> ServerMessage {
        ServerMessage::TerminalOutput {
            data: format!("chunk {}\r\n", seq),
            source: None,
            timestamp: 0,
            sequence: seq,
        }
    }

    fn sequence_of(msg: &ServerMessage) -> u64 {
        match msg {
            ServerMessage::TerminalOutput { sequence, .. } => *sequence,
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_all_subscribers_see_same_sequence() {
        let mut b = OutputBroadcaster::new();
        let (_, mut rx1) = b.attach().unwrap();
        let (_, mut rx2) = b.attach().unwrap();
        for seq in 0..3 {
            b.broadcast(&output(seq));
        }
        for rx in [&mut rx1, &mut rx2] {
            for seq in 0..3 {
                assert_eq!(sequence_of(&rx.try_recv().unwrap()), seq);
            }
        }
    }

    #[test]
    fn test_overflow_reaps_only_slow_subscriber() {
        let mut b = OutputBroadcaster::with_queue_capacity(2);
        let (_, _slow_rx) = b.attach().unwrap();
        let (_, mut fast_rx) = b.attach().unwrap();
        // Nobody drains `slow_rx`; the fast one drains as we go.
        for seq in 0..5 {
            b.broadcast(&output(seq));
            let _ = fast_rx.try_recv();
        }
        assert_eq!(b.subscriber_count(), 1);
    }

    #[test]
    fn test_closed_receiver_is_reaped() {
        let mut b = OutputBroadcaster::new();
        let (_, rx) = b.attach().unwrap();
        drop(rx);
        b.broadcast(&output(0));
        assert_eq!(b.subscriber_count(), 0);
    }

    #[test]
    fn test_no_attach_after_close() {
        let mut b = OutputBroadcaster::new();
        b.close();
        assert!(b.attach().is_none());
    }

    #[test]
    fn test_send_to_targets_one_subscriber() {
        let mut b = OutputBroadcaster::new();
        let (id1, mut rx1) = b.attach().unwrap();
        let (_, mut rx2) = b.attach().unwrap();
        assert!(b.send_to(id1, output(9)));
        assert_eq!(sequence_of(&rx1.try_recv().unwrap()), 9);
        assert!(rx2.try_recv().is_err());
    }
}
