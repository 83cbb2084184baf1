//! Byte-stream transports an SSH handshake can run over.
//!
//! The bastion hop runs over a plain TCP connection ([`DirectTransport`]).
//! The target hop runs over a `direct-tcpip` channel opened inside the
//! bastion session ([`ProxiedTransport`]), so the target is reached on its
//! private address without anything listening locally.

use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use super::session::FleetClientHandler;

/// A bidirectional stream `russh::client::connect_stream` can drive.
pub trait Duplex: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Duplex for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedStream = Box<dyn Duplex>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a stream to `host:port`.
    async fn open(&self, host: &str, port: u16) -> Result<BoxedStream, String>;

    fn name(&self) -> &'static str;
}

/// Plain TCP dial with a connect timeout.
pub struct DirectTransport {
    timeout: Duration,
}

impl DirectTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Transport for DirectTransport {
    async fn open(&self, host: &str, port: u16) -> Result<BoxedStream, String> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| format!("Connection timed out after {:?}", self.timeout))?
            .map_err(|e| format!("Failed to connect: {}", e))?;

        // Interactive command traffic; don't batch small writes
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY on {}:{}: {}", host, port, e);
        }
        Ok(Box::new(stream))
    }

    fn name(&self) -> &'static str {
        "direct"
    }
}

/// `direct-tcpip` channel through an authenticated bastion session.
pub struct ProxiedTransport<'a> {
    bastion: &'a client::Handle<FleetClientHandler>,
    timeout: Duration,
}

impl<'a> ProxiedTransport<'a> {
    pub fn new(bastion: &'a client::Handle<FleetClientHandler>, timeout: Duration) -> Self {
        Self { bastion, timeout }
    }
}

#[async_trait]
impl Transport for ProxiedTransport<'_> {
    async fn open(&self, host: &str, port: u16) -> Result<BoxedStream, String> {
        let open_future = self.bastion.channel_open_direct_tcpip(
            host,
            port as u32,
            "127.0.0.1",
            0, // Originator port is not significant for direct-tcpip
        );

        let channel = tokio::time::timeout(self.timeout, open_future)
            .await
            .map_err(|_| format!("direct-tcpip channel timed out after {:?}", self.timeout))?
            .map_err(|e| format!("Failed to open direct-tcpip channel: {}", e))?;

        debug!("direct-tcpip channel to {}:{} opened", host, port);
        Ok(Box::new(channel.into_stream()))
    }

    fn name(&self) -> &'static str {
        "proxied"
    }
}
