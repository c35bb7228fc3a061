//! WebSocket plumbing on top of axum.
//!
//! The server splits each upgraded socket. The read half stays with the
//! connection task; the write half is driven by [`write_loop`], which drains
//! the connection's outbound queue.

use futures_util::{Sink, SinkExt};
use std::fmt::Display;
use switchboard_protocol::{codec, Frame};
use tracing::{debug, warn};

use axum::extract::ws::Message;

use crate::outbound::{Outbound, OutboundReceiver};
use crate::traits::{ConnectionId, TransportError};

/// Drain `outbound` into the WebSocket write half until the queue ends or a
/// close is requested.
///
/// `on_write` is called with the size of every binary message written.
///
/// # Errors
///
/// Returns an error if writing to the socket fails.
pub async fn write_loop<S, F>(
    mut sink: S,
    mut outbound: OutboundReceiver,
    connection_id: ConnectionId,
    mut on_write: F,
) -> Result<(), TransportError>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
    F: FnMut(usize),
{
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Frame(data) => {
                on_write(data.len());
                sink.send(Message::Binary(data.to_vec()))
                    .await
                    .map_err(|e| TransportError::SendFailed(e.to_string()))?;
            }
            Outbound::Close { namespace, silent } => {
                debug!(connection = %connection_id, namespace = %namespace, silent, "Closing connection");
                if !silent {
                    let data = codec::encode(&Frame::disconnect(namespace))?;
                    on_write(data.len());
                    sink.send(Message::Binary(data.to_vec()))
                        .await
                        .map_err(|e| TransportError::SendFailed(e.to_string()))?;
                }
                outbound.close();
                break;
            }
        }
    }

    if let Err(e) = sink.close().await {
        warn!(connection = %connection_id, error = %e, "Failed to close WebSocket");
    }
    Ok(())
}

/// Extract the binary payload of an inbound WebSocket message.
///
/// Text messages are treated as binary for compatibility with clients that
/// cannot send binary frames. Control messages yield `None`.
#[must_use]
pub fn inbound_bytes(message: &Message) -> Option<&[u8]> {
    match message {
        Message::Binary(data) => Some(data.as_slice()),
        Message::Text(text) => Some(text.as_bytes()),
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::outbound_channel;
    use crate::traits::FrameSink;

    fn decode_all(messages: &[Message]) -> Vec<Frame> {
        messages
            .iter()
            .map(|m| codec::decode(inbound_bytes(m).unwrap()).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_write_loop_flushes_then_announces_disconnect() {
        let (tx, rx) = outbound_channel();
        tx.send(&Frame::message("chat", "bye")).unwrap();
        tx.close("chat", false).unwrap();

        let mut written: Vec<Message> = Vec::new();
        let mut bytes = 0;
        write_loop(&mut written, rx, "conn-1".into(), |n| bytes += n)
            .await
            .unwrap();

        assert_eq!(
            decode_all(&written),
            vec![Frame::message("chat", "bye"), Frame::disconnect("chat")]
        );
        assert!(bytes > 0);
    }

    #[tokio::test]
    async fn test_silent_close_writes_nothing() {
        let (tx, rx) = outbound_channel();
        tx.close("", true).unwrap();

        let mut written: Vec<Message> = Vec::new();
        write_loop(&mut written, rx, "conn-1".into(), |_| {})
            .await
            .unwrap();

        assert!(written.is_empty());
    }

    #[tokio::test]
    async fn test_write_loop_ends_when_senders_drop() {
        let (tx, rx) = outbound_channel();
        tx.send(&Frame::ping()).unwrap();
        drop(tx);

        let mut written: Vec<Message> = Vec::new();
        write_loop(&mut written, rx, "conn-1".into(), |_| {})
            .await
            .unwrap();
        assert_eq!(decode_all(&written), vec![Frame::ping()]);
    }

    #[test]
    fn test_control_messages_carry_no_frames() {
        assert!(inbound_bytes(&Message::Ping(vec![1])).is_none());
        assert_eq!(inbound_bytes(&Message::Binary(vec![1, 2])), Some(&[1u8, 2][..]));
    }
}
