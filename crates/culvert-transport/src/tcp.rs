//! TCP realization of the stream collaborator

use crate::{
    CancelHandle, EventSender, StreamConnector, StreamHandle, StreamReader, StreamWriter,
    TransportError, TransportEvent, TransportResult,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

/// Growth increment for the internal read buffer
const READ_CHUNK: usize = 16 * 1024;

/// Connects tunnels over plain TCP.
#[derive(Debug, Default)]
pub struct TcpConnector;

impl TcpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StreamConnector for TcpConnector {
    async fn connect(
        &self,
        address: &str,
        events: EventSender,
    ) -> TransportResult<StreamHandle> {
        events.emit(TransportEvent::Connecting);

        let addr = match resolve_address(address).await {
            Ok(addr) => addr,
            Err(e) => {
                events.emit(TransportEvent::Failed(e.to_string()));
                return Err(e);
            }
        };

        debug!(%addr, "opening tcp connection");
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                let (read_half, write_half) = stream.into_split();
                let cancel = CancelHandle::new(events.clone());
                events.emit(TransportEvent::Connected);

                Ok(StreamHandle {
                    reader: Box::new(TcpStreamReader {
                        inner: read_half,
                        buffer: BytesMut::new(),
                        events: events.clone(),
                        cancel: cancel.clone(),
                        eof: false,
                        disconnect_sent: false,
                    }),
                    writer: Box::new(TcpStreamWriter {
                        inner: write_half,
                        events,
                        cancel: cancel.clone(),
                    }),
                    cancel,
                })
            }
            Err(e) => {
                events.emit(TransportEvent::Failed(e.to_string()));
                Err(TransportError::ConnectFailed(format!("{address}: {e}")))
            }
        }
    }
}

/// Parse and resolve `host:port`, tolerating a `tcp://` scheme prefix.
///
/// DNS names resolve through `lookup_host`; IPv4 results are preferred
/// when resolution returns a mixed set.
pub async fn resolve_address(address: &str) -> TransportResult<SocketAddr> {
    let trimmed = address.trim_start_matches("tcp://");

    // Direct IP:port needs no resolution
    if let Ok(socket_addr) = trimmed.parse::<SocketAddr>() {
        return Ok(socket_addr);
    }

    let Some(colon) = trimmed.rfind(':') else {
        return Err(TransportError::InvalidAddress(format!(
            "missing port in '{address}'"
        )));
    };
    let host = &trimmed[..colon];
    let port: u16 = trimmed[colon + 1..]
        .parse()
        .map_err(|_| TransportError::InvalidAddress(format!("invalid port in '{address}'")))?;
    if host.is_empty() {
        return Err(TransportError::InvalidAddress(format!(
            "missing host in '{address}'"
        )));
    }

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| TransportError::ConnectFailed(format!("resolving '{host}': {e}")))?
        .collect();

    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| TransportError::ConnectFailed(format!("no addresses for '{host}'")))
}

#[derive(Debug)]
struct TcpStreamReader {
    inner: OwnedReadHalf,
    buffer: BytesMut,
    events: EventSender,
    cancel: CancelHandle,
    eof: bool,
    disconnect_sent: bool,
}

impl TcpStreamReader {
    fn disconnected(&mut self) {
        if !self.disconnect_sent {
            self.disconnect_sent = true;
            self.events.emit(TransportEvent::Disconnected);
        }
    }
}

#[async_trait]
impl StreamReader for TcpStreamReader {
    async fn read(&mut self, min_len: usize, max_len: usize) -> TransportResult<Bytes> {
        debug_assert!(min_len <= max_len && min_len > 0);

        while self.buffer.len() < min_len {
            if self.eof {
                // Leftover bytes below min_len cannot form a protocol unit
                self.disconnected();
                return Err(TransportError::ConnectionClosed);
            }

            self.buffer.reserve(READ_CHUNK);
            let token = self.cancel.token().clone();
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    return Err(TransportError::Cancelled);
                }
                read = self.inner.read_buf(&mut self.buffer) => match read {
                    Ok(0) => self.eof = true,
                    Ok(_) => {}
                    Err(e) => {
                        self.disconnected();
                        return Err(TransportError::Io(e));
                    }
                }
            }
        }

        let take = self.buffer.len().min(max_len);
        Ok(self.buffer.split_to(take).freeze())
    }
}

#[derive(Debug)]
struct TcpStreamWriter {
    inner: OwnedWriteHalf,
    events: EventSender,
    cancel: CancelHandle,
}

#[async_trait]
impl StreamWriter for TcpStreamWriter {
    async fn write(&mut self, data: Bytes) -> TransportResult<()> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        let token = self.cancel.token().clone();
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(TransportError::Cancelled),
            result = self.inner.write_all(&data) => match result {
                Ok(()) => Ok(()),
                Err(e) => {
                    self.events.emit(TransportEvent::Disconnected);
                    Err(TransportError::Io(e))
                }
            }
        }
    }
}
