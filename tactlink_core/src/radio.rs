//! Radio transport seam.
//!
//! The BLE UART transport is an external collaborator; the engine
//! only needs an outbound byte sink. Inbound bytes enter through
//! [`crate::engine::RadioPort`], on whatever thread the transport
//! owns.
//!
//! [`loopback_pair`] provides the in-process transport used by
//! integration tests: two connected endpoints with a fixed one-way
//! latency measured on a shared transit clock.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tact::clock::Clock;
use thiserror::Error;

/// Error types for transport operations.
#[derive(Debug, Clone, Error)]
pub enum RadioError {
    #[error("transport send failed: {0}")]
    SendFailed(String),

    #[error("transport not connected")]
    NotConnected,
}

/// Outbound byte sink. Frames arrive already EOT-terminated.
pub trait Radio: Send {
    fn send(&mut self, frame: &[u8]) -> Result<(), RadioError>;
}

/// Outbound half shared between the main context and the radio
/// callback (which sends PONGs and ACKs directly).
pub type SharedRadio = Arc<Mutex<Box<dyn Radio>>>;

type Inbox = Arc<Mutex<VecDeque<(u64, Vec<u8>)>>>;

/// One endpoint of an in-process loopback link. Clones share the same
/// inboxes, so a test harness can keep a handle to an endpoint it
/// moved into an engine.
#[derive(Clone)]
pub struct LoopbackRadio {
    peer_inbox: Inbox,
    own_inbox: Inbox,
    latency_us: u64,
    transit_clock: Arc<dyn Clock>,
}

/// Two connected endpoints with a fixed one-way latency. Delivery
/// times are measured on `transit_clock`, which the test harness
/// advances.
pub fn loopback_pair(
    transit_clock: Arc<dyn Clock>,
    latency_us: u64,
) -> (LoopbackRadio, LoopbackRadio) {
    let a_inbox: Inbox = Arc::new(Mutex::new(VecDeque::new()));
    let b_inbox: Inbox = Arc::new(Mutex::new(VecDeque::new()));
    (
        LoopbackRadio {
            peer_inbox: b_inbox.clone(),
            own_inbox: a_inbox.clone(),
            latency_us,
            transit_clock: transit_clock.clone(),
        },
        LoopbackRadio {
            peer_inbox: a_inbox,
            own_inbox: b_inbox,
            latency_us,
            transit_clock,
        },
    )
}

impl LoopbackRadio {
    /// Frames whose latency has elapsed by now.
    pub fn poll_inbox(&self) -> Vec<Vec<u8>> {
        let now = self.transit_clock.now_us();
        let mut inbox = self.own_inbox.lock();
        let mut ready = Vec::new();
        while let Some((deliver_at, _)) = inbox.front() {
            if *deliver_at > now {
                break;
            }
            let (_, bytes) = inbox.pop_front().unwrap();
            ready.push(bytes);
        }
        ready
    }

    /// Handle to this endpoint's inbox for harness-side inspection.
    pub fn pending(&self) -> usize {
        self.own_inbox.lock().len()
    }
}

impl Radio for LoopbackRadio {
    fn send(&mut self, frame: &[u8]) -> Result<(), RadioError> {
        let deliver_at = self.transit_clock.now_us() + self.latency_us;
        self.peer_inbox.lock().push_back((deliver_at, frame.to_vec()));
        Ok(())
    }
}

/// Sink that drops everything; for rigs without a peer.
pub struct NullRadio;

impl Radio for NullRadio {
    fn send(&mut self, _frame: &[u8]) -> Result<(), RadioError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tact::clock::ManualClock;

    #[test]
    fn latency_gates_delivery() {
        let clock = Arc::new(ManualClock::new(0));
        let (mut a, b) = loopback_pair(clock.clone(), 5_000);

        a.send(b"PING:1|0\x04").unwrap();
        assert!(b.poll_inbox().is_empty(), "nothing before latency elapses");

        clock.advance_us(5_000);
        let frames = b.poll_inbox();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], b"PING:1|0\x04");
    }

    #[test]
    fn both_directions_are_independent() {
        let clock = Arc::new(ManualClock::new(0));
        let (mut a, mut b) = loopback_pair(clock.clone(), 1_000);

        a.send(b"x").unwrap();
        b.send(b"y").unwrap();
        clock.advance_us(1_000);
        assert_eq!(b.poll_inbox(), vec![b"x".to_vec()]);
        assert_eq!(a.poll_inbox(), vec![b"y".to_vec()]);
    }

    #[test]
    fn delivery_preserves_order() {
        let clock = Arc::new(ManualClock::new(0));
        let (mut a, b) = loopback_pair(clock.clone(), 1_000);
        a.send(b"1").unwrap();
        clock.advance_us(10);
        a.send(b"2").unwrap();
        clock.advance_us(2_000);
        let frames = b.poll_inbox();
        assert_eq!(frames, vec![b"1".to_vec(), b"2".to_vec()]);
    }
}
