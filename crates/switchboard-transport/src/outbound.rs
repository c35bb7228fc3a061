//! Per-connection outbound queue.
//!
//! Handlers and broadcasts push onto an unbounded queue; a single writer
//! task per connection drains it in order. A close request travels through
//! the same queue, so frames queued before it are still delivered.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

use crate::traits::{FrameSink, TransportError};

/// An item waiting to be written to the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Encoded frame bytes.
    Frame(Bytes),
    /// Tear down the connection after everything queued before it.
    Close {
        /// Namespace that requested the close.
        namespace: String,
        /// Skip the `disconnect` notification frame.
        silent: bool,
    },
}

/// Create a connected sender/receiver pair.
#[must_use]
pub fn outbound_channel() -> (OutboundSender, OutboundReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let open = Arc::new(AtomicBool::new(true));
    (
        OutboundSender {
            tx,
            open: Arc::clone(&open),
        },
        OutboundReceiver { rx, open },
    )
}

/// Producer side of the queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct OutboundSender {
    tx: mpsc::UnboundedSender<Outbound>,
    open: Arc<AtomicBool>,
}

impl OutboundSender {
    fn push(&self, item: Outbound) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        self.tx
            .send(item)
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

impl FrameSink for OutboundSender {
    fn send_raw(&self, data: Bytes) -> Result<(), TransportError> {
        trace!(bytes = data.len(), "Queued frame");
        self.push(Outbound::Frame(data))
    }

    fn close(&self, namespace: &str, silent: bool) -> Result<(), TransportError> {
        self.push(Outbound::Close {
            namespace: namespace.to_string(),
            silent,
        })?;
        // Nothing queued after a close request would ever be written.
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }
}

/// Consumer side of the queue, owned by the writer task.
#[derive(Debug)]
pub struct OutboundReceiver {
    rx: mpsc::UnboundedReceiver<Outbound>,
    open: Arc<AtomicBool>,
}

impl OutboundReceiver {
    /// Wait for the next queued item.
    ///
    /// Returns `None` once every sender is gone and the queue is drained.
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.rx.recv().await
    }

    /// Take the next item without waiting.
    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.rx.try_recv().ok()
    }

    /// Stop accepting new items. Already queued items can still be read.
    pub fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
        self.rx.close();
    }
}

impl Drop for OutboundReceiver {
    fn drop(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_protocol::{codec, Frame};

    #[test]
    fn test_frames_are_queued_in_order() {
        let (tx, mut rx) = outbound_channel();

        tx.send(&Frame::message("", "one")).unwrap();
        tx.send(&Frame::message("", "two")).unwrap();

        for expected in ["one", "two"] {
            match rx.try_recv() {
                Some(Outbound::Frame(data)) => {
                    assert_eq!(codec::decode(&data).unwrap(), Frame::message("", expected));
                }
                other => panic!("unexpected item {:?}", other),
            }
        }
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_close_rejects_later_frames() {
        let (tx, mut rx) = outbound_channel();

        tx.close("chat", true).unwrap();
        assert!(!tx.is_open());
        assert!(matches!(
            tx.send(&Frame::message("", "late")),
            Err(TransportError::ConnectionClosed)
        ));

        assert_eq!(
            rx.try_recv(),
            Some(Outbound::Close {
                namespace: "chat".into(),
                silent: true
            })
        );
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_dropped_receiver_closes_sender() {
        let (tx, rx) = outbound_channel();
        drop(rx);

        assert!(!tx.is_open());
        assert!(tx.send_raw(Bytes::from_static(b"x")).is_err());
    }
}
