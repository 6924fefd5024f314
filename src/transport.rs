use crate::error::{LinkError, Result};
use crate::protocol::Protocol;
use bytes::Bytes;
use std::collections::VecDeque;

#[cfg(feature = "async")]
use async_trait::async_trait;

/// A frame received from the wire, with the protocol the sender declared for
/// it if the underlying channel carries one.
pub type IncomingFrame = (Bytes, Option<Protocol>);

/// Carries already-framed telemetry. Framing and encoding happen in the
/// serialization layer; a transport only moves bytes.
pub trait Transport {
    fn send(&mut self, frame: &[u8]) -> Result<()>;
    fn receive(&mut self) -> Result<Option<IncomingFrame>>;
    fn close(&mut self) -> Result<()>;
    fn is_connected(&self) -> bool;
}

#[cfg(feature = "async")]
#[async_trait]
pub trait AsyncTransport: Send + Sync {
    async fn send(&mut self, frame: Bytes) -> Result<()>;
    async fn receive(&mut self) -> Result<Option<IncomingFrame>>;
    async fn close(&mut self) -> Result<()>;
    fn is_connected(&self) -> bool;
}

/// In-process transport used by tests and embedded hosts.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    sent: Vec<Bytes>,
    inbound: VecDeque<IncomingFrame>,
    connected: bool,
    closed: bool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            connected: true,
            ..Self::default()
        }
    }

    /// Queues a frame for the next `receive`.
    pub fn inject(&mut self, frame: impl Into<Bytes>, declared: Option<Protocol>) {
        self.inbound.push_back((frame.into(), declared));
    }

    pub fn sent_frames(&self) -> &[Bytes] {
        &self.sent
    }

    pub fn take_sent(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.sent)
    }

    /// Simulates a dropped link; sends fail until `reconnect`.
    pub fn disconnect(&mut self) {
        self.connected = false;
    }

    pub fn reconnect(&mut self) {
        if !self.closed {
            self.connected = true;
        }
    }
}

impl Transport for MemoryTransport {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        if !self.connected {
            return Err(LinkError::ConnectionClosed);
        }

        self.sent.push(Bytes::copy_from_slice(frame));
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<IncomingFrame>> {
        if !self.connected {
            return Err(LinkError::ConnectionClosed);
        }

        Ok(self.inbound.pop_front())
    }

    fn close(&mut self) -> Result<()> {
        self.connected = false;
        self.closed = true;
        self.sent.clear();
        self.inbound.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[cfg(feature = "async")]
pub struct ChannelTransport {
    tx: tokio::sync::mpsc::Sender<Bytes>,
    rx: tokio::sync::mpsc::Receiver<IncomingFrame>,
    connected: bool,
}

#[cfg(feature = "async")]
impl ChannelTransport {
    /// Returns the transport plus the peer ends: a receiver for outgoing
    /// frames and a sender for frames to deliver.
    pub fn new(
        buffer: usize,
    ) -> (
        Self,
        tokio::sync::mpsc::Receiver<Bytes>,
        tokio::sync::mpsc::Sender<IncomingFrame>,
    ) {
        let (out_tx, out_rx) = tokio::sync::mpsc::channel(buffer);
        let (in_tx, in_rx) = tokio::sync::mpsc::channel(buffer);
        let transport = Self {
            tx: out_tx,
            rx: in_rx,
            connected: true,
        };
        (transport, out_rx, in_tx)
    }
}

#[cfg(feature = "async")]
#[async_trait]
impl AsyncTransport for ChannelTransport {
    async fn send(&mut self, frame: Bytes) -> Result<()> {
        if !self.connected {
            return Err(LinkError::ConnectionClosed);
        }

        self.tx
            .send(frame)
            .await
            .map_err(|e| LinkError::Transport(e.to_string()))
    }

    async fn receive(&mut self) -> Result<Option<IncomingFrame>> {
        if !self.connected {
            return Err(LinkError::ConnectionClosed);
        }

        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> Result<()> {
        self.connected = false;
        self.rx.close();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
