//! Byte transport between a client and a server.

use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

/// Moves whole command runs between the two sides. Each `send` delivers one contiguous run that
/// the peer passes to `handle_commands` as-is.
pub trait Transport: Send {
    /// Returns `false` once the peer is gone.
    fn send(&mut self, bytes: &[u8]) -> bool;

    /// Next received run. `None` as the timeout polls without blocking.
    fn receive(&mut self, timeout: Option<Duration>) -> Option<Vec<u8>>;
}

/// In-process transport over a pair of channels.
#[derive(Debug)]
pub struct ChannelTransport {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

/// Build a connected pair: whatever one end sends, the other receives.
pub fn channel_transport() -> (ChannelTransport, ChannelTransport) {
    let (a_tx, b_rx) = channel();
    let (b_tx, a_rx) = channel();
    (
        ChannelTransport { tx: a_tx, rx: a_rx },
        ChannelTransport { tx: b_tx, rx: b_rx },
    )
}

impl Transport for ChannelTransport {
    fn send(&mut self, bytes: &[u8]) -> bool {
        self.tx.send(bytes.to_vec()).is_ok()
    }

    fn receive(&mut self, timeout: Option<Duration>) -> Option<Vec<u8>> {
        match timeout {
            None => match self.rx.try_recv() {
                Ok(bytes) => Some(bytes),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
            },
            Some(timeout) => match self.rx.recv_timeout(timeout) {
                Ok(bytes) => Some(bytes),
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_is_cross_connected() {
        let (mut a, mut b) = channel_transport();
        assert!(a.send(&[1, 2]));
        assert!(b.send(&[3]));
        assert_eq!(b.receive(None), Some(vec![1, 2]));
        assert_eq!(a.receive(Some(Duration::from_millis(10))), Some(vec![3]));
        assert_eq!(a.receive(None), None);
    }

    #[test]
    fn send_fails_after_peer_drop() {
        let (mut a, b) = channel_transport();
        drop(b);
        assert!(!a.send(&[0]));
    }
}
