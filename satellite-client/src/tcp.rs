//! TCP transport.
//!
//! Satellite messages travel over the byte stream as [`Frame`] payloads.
//! Each open socket runs two tasks: a reader turning frames into
//! [`SocketEvent`]s and a writer framing queued messages.

use crate::config::{SatelliteClientConfig, TlsConfig};
use crate::error::SatelliteError;
use crate::socket::{Socket, SocketEvent, SocketFactory, SocketWriter};
use crate::stream::ClientStream;
use async_trait::async_trait;
use bytes::Bytes;
use satellite_protocol::{Frame, FrameDecoder};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Default bound on connect plus TLS handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens `tcp://host:port` and `tls://host:port` URLs.
#[derive(Debug, Clone, Default)]
pub struct TcpSocketFactory {
    tls: TlsConfig,
    connect_timeout: Option<Duration>,
}

impl TcpSocketFactory {
    pub fn new(tls: TlsConfig) -> Self {
        Self {
            tls,
            connect_timeout: None,
        }
    }

    pub fn from_config(config: &SatelliteClientConfig) -> Self {
        Self::new(config.tls.clone())
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Endpoint {
    tls: bool,
    host: String,
    port: u16,
}

impl Endpoint {
    fn parse(url: &str) -> Result<Self, SatelliteError> {
        let invalid =
            || io::Error::new(io::ErrorKind::InvalidInput, format!("invalid url: {}", url));

        let (scheme, rest) = url.split_once("://").ok_or_else(invalid)?;
        let tls = match scheme {
            "tcp" => false,
            "tls" => true,
            _ => return Err(invalid().into()),
        };
        let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid().into());
        }
        let port = port.parse().map_err(|_| invalid())?;

        Ok(Self {
            tls,
            host: host.to_string(),
            port,
        })
    }
}

#[async_trait]
impl SocketFactory for TcpSocketFactory {
    async fn open(&self, url: &str) -> Result<Socket, SatelliteError> {
        let endpoint = Endpoint::parse(url)?;
        let stream = ClientStream::connect(
            &endpoint.host,
            endpoint.port,
            endpoint.tls.then_some(&self.tls),
            self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
        )
        .await?;
        tracing::debug!("opened {} (tls={})", url, stream.is_tls());

        let (read_half, write_half) = tokio::io::split(stream);
        let (event_tx, events) = mpsc::unbounded_channel();
        let (write_tx, write_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_frames(read_half, event_tx.clone()));
        let writer = tokio::spawn(write_frames(write_half, write_rx, event_tx));

        Ok(Socket::new(
            SocketWriter::new(write_tx),
            events,
            vec![reader, writer],
        ))
    }
}

async fn read_frames<R>(mut reader: R, events: mpsc::UnboundedSender<SocketEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!("connection closed by peer");
                let _ = events.send(SocketEvent::Closed);
                return;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("socket read failed: {}", e);
                let _ = events.send(SocketEvent::Error(e.into()));
                let _ = events.send(SocketEvent::Closed);
                return;
            }
        };

        decoder.extend(&buf[..n]);
        loop {
            match decoder.next_payload() {
                Ok(Some(payload)) => {
                    if events.send(SocketEvent::Message(payload)).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    // The stream cannot be resynchronised after a bad frame.
                    tracing::warn!("dropping connection on bad frame: {}", e);
                    let _ = events.send(SocketEvent::Error(e.into()));
                    let _ = events.send(SocketEvent::Closed);
                    return;
                }
            }
        }
    }
}

async fn write_frames<W>(
    mut writer: W,
    mut outgoing: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedSender<SocketEvent>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(payload) = outgoing.recv().await {
        let frame = match Frame::new(payload).encode() {
            Ok(frame) => frame,
            Err(e) => {
                let _ = events.send(SocketEvent::Error(e.into()));
                continue;
            }
        };
        if let Err(e) = writer.write_all(&frame).await {
            tracing::warn!("socket write failed: {}", e);
            let _ = events.send(SocketEvent::Error(e.into()));
            return;
        }
    }

    let _ = writer.shutdown().await;
}
