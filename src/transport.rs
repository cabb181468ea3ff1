//! SIP Transport Layer
//!
//! Datagram transports for SIP messages. [`UdpTransport`] is the real socket;
//! [`MemoryTransport`] connects two endpoints in-process for tests.

use crate::{
    codec::{decode_datagram, SipCodec},
    Result, SipError, SipMessage, MAX_MESSAGE_SIZE,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout_at, Instant};
use tokio_util::codec::Encoder;
use tracing::{debug, info};

/// One datagram socket carrying whole SIP messages.
#[async_trait]
pub trait Transport: Send + Sync {
    fn local_addr(&self) -> Result<SocketAddr>;

    async fn send(&self, message: &SipMessage, destination: SocketAddr) -> Result<()>;

    /// Waits for the next datagram. `None` waits forever; an expired deadline
    /// yields [`SipError::Timeout`].
    async fn recv(&self, deadline: Option<Instant>) -> Result<(SipMessage, SocketAddr)>;
}

fn encode(message: &SipMessage) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    SipCodec::new().encode(message, &mut buf)?;
    Ok(buf.freeze())
}

async fn until<F, T>(deadline: Option<Instant>, fut: F) -> Result<T>
where
    F: std::future::Future<Output = T>,
{
    match deadline {
        Some(deadline) => timeout_at(deadline, fut).await.map_err(|_| SipError::Timeout),
        None => Ok(fut.await),
    }
}

/// UDP transport bound to a single local address
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!("UDP transport bound to {}", socket.local_addr()?);
        Ok(Self { socket })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    async fn send(&self, message: &SipMessage, destination: SocketAddr) -> Result<()> {
        let data = encode(message)?;
        self.socket.send_to(&data, destination).await?;

        debug!(
            "Sent {} to {}:\n{}",
            message.summary(),
            destination,
            String::from_utf8_lossy(&data)
        );
        Ok(())
    }

    async fn recv(&self, deadline: Option<Instant>) -> Result<(SipMessage, SocketAddr)> {
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        let (len, source) = until(deadline, self.socket.recv_from(&mut buf)).await??;
        let data = &buf[..len];

        debug!("Received from {}:\n{}", source, String::from_utf8_lossy(data));
        let message = decode_datagram(data)?;

        Ok((message, source))
    }
}

type Datagram = (Bytes, SocketAddr);

/// In-process transport; one half of a connected pair.
#[derive(Debug)]
pub struct MemoryTransport {
    local: SocketAddr,
    peer: mpsc::UnboundedSender<Datagram>,
    inbox: Mutex<mpsc::UnboundedReceiver<Datagram>>,
}

impl MemoryTransport {
    /// Two transports at `a` and `b`; whatever one sends, the other receives.
    pub fn pair(a: SocketAddr, b: SocketAddr) -> (Self, Self) {
        let (to_a, inbox_a) = mpsc::unbounded_channel();
        let (to_b, inbox_b) = mpsc::unbounded_channel();

        let first = Self {
            local: a,
            peer: to_b,
            inbox: Mutex::new(inbox_a),
        };
        let second = Self {
            local: b,
            peer: to_a,
            inbox: Mutex::new(inbox_b),
        };
        (first, second)
    }

    /// Delivers raw bytes to the peer without encoding.
    pub fn send_bytes(&self, data: impl Into<Bytes>) -> Result<()> {
        self.peer
            .send((data.into(), self.local))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer transport dropped"))?;
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local)
    }

    async fn send(&self, message: &SipMessage, destination: SocketAddr) -> Result<()> {
        debug!("Sent {} to {} (memory)", message.summary(), destination);
        self.send_bytes(encode(message)?)
    }

    async fn recv(&self, deadline: Option<Instant>) -> Result<(SipMessage, SocketAddr)> {
        let mut inbox = self.inbox.lock().await;
        let (data, source) = until(deadline, inbox.recv())
            .await?
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionAborted, "peer transport dropped"))?;

        Ok((decode_datagram(&data)?, source))
    }
}
