//! `spec.md` §3 "VirtualChannel": a bidirectional byte-stream multiplexed
//! inside a tunnel. The bounded ring buffer + condition variable described
//! there is expressed here as a bounded `tokio::sync::mpsc` channel, which
//! gives the same backpressure and blocking-reader semantics natively in
//! the async runtime (`spec.md` §9 "Coroutine/async control flow").

use crate::error::{AgentError, AgentResult};
use agentd_protocol::FramedMessage;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

const CHANNEL_BUFFER_CAPACITY: usize = 256;

/// A single multiplexed stream inside a [`super::Tunnel`]. Framed-message
/// channels carry a promoted [`crate::session::Session`]; raw-byte
/// channels back a TCP-proxy pump (`spec.md` §4.2 "Virtual channels").
pub struct VirtualChannel {
    pub channel_id: u32,
    closed: Arc<AtomicBool>,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    inbound_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    outbound_tx: mpsc::Sender<Vec<u8>>,
}

impl VirtualChannel {
    /// Creates a channel plus the outbound receiver the tunnel's demux
    /// loop drains to ship bytes to the peer.
    pub fn new(channel_id: u32) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_BUFFER_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_BUFFER_CAPACITY);
        (
            Arc::new(Self {
                channel_id,
                closed: Arc::new(AtomicBool::new(false)),
                inbound_tx,
                inbound_rx: Mutex::new(inbound_rx),
                outbound_tx,
            }),
            outbound_rx,
        )
    }

    /// Delivers bytes arriving from the tunnel's demux into this channel's
    /// buffer. Dropped silently once closed (`spec.md` §3 "once closed, no
    /// further data is delivered to readers").
    pub async fn deliver(&self, data: Vec<u8>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let _ = self.inbound_tx.send(data).await;
    }

    /// Reads the next chunk. Existing buffered data still drains after
    /// close; `None` once the buffer is empty and closed.
    pub async fn recv(&self) -> Option<Vec<u8>> {
        self.inbound_rx.lock().await.recv().await
    }

    pub async fn send(&self, data: Vec<u8>) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.outbound_tx.send(data).await.is_ok()
    }

    /// Idempotent: calling this twice is equivalent to once (`spec.md`
    /// §8 "A virtual channel's close is idempotent").
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Adapts a [`VirtualChannel`] to [`crate::transport::Transport`], so a
/// channel promoted by `CreateChannel` is driven by the exact same
/// dispatch loop as an inbound TCP/TLS session (`spec.md` §4.2 "promoted
/// to full inbound-session semantics"). Frames are encoded/decoded whole
/// onto the channel's byte-chunk stream, one `FramedMessage` per chunk.
pub struct VirtualChannelTransport {
    channel: Arc<VirtualChannel>,
}

impl VirtualChannelTransport {
    pub fn new(channel: Arc<VirtualChannel>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl crate::transport::Transport for VirtualChannelTransport {
    async fn send(&self, message: FramedMessage) -> AgentResult<()> {
        let wire = message
            .encode()
            .map_err(|e| AgentError::InternalError(e.to_string()))?;
        if self.channel.send(wire).await {
            Ok(())
        } else {
            Err(AgentError::ConnectionBroken)
        }
    }

    async fn recv(&self) -> AgentResult<Option<FramedMessage>> {
        match self.channel.recv().await {
            Some(bytes) => FramedMessage::decode(&bytes)
                .map(Some)
                .map_err(|e| AgentError::InternalError(e.to_string())),
            None => Ok(None),
        }
    }

    fn close(&self) {
        self.channel.close();
    }

    fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivered_bytes_are_read_back() {
        let (channel, _outbound_rx) = VirtualChannel::new(1);
        channel.deliver(vec![1, 2, 3]).await;
        assert_eq!(channel.recv().await, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (channel, _outbound_rx) = VirtualChannel::new(1);
        channel.close();
        channel.close();
        assert!(channel.is_closed());
        assert!(!channel.send(vec![1]).await);
    }

    #[tokio::test]
    async fn delivery_after_close_is_dropped() {
        let (channel, _outbound_rx) = VirtualChannel::new(1);
        channel.close();
        channel.deliver(vec![9]).await;
        // Buffer is empty and the sender side never pushed, so recv
        // immediately returns None once the channel is dropped.
        drop(channel);
    }

    #[tokio::test]
    async fn transport_round_trips_a_framed_message_over_the_channel() {
        use crate::transport::Transport;
        use agentd_protocol::{FramedMessage, MessageCode};

        let (channel, mut outbound_rx) = VirtualChannel::new(1);
        let transport = VirtualChannelTransport::new(channel.clone());

        let message = FramedMessage::new(MessageCode::GetParameter, 7).with_field(1, "Agent.Uptime".to_string());
        transport.send(message.clone()).await.unwrap();
        let wire = outbound_rx.recv().await.unwrap();
        channel.deliver(wire).await;

        let received = transport.recv().await.unwrap().unwrap();
        assert_eq!(received, message);
    }
}
