//! Byte stream under the TCP transport: plain TCP or TLS.

use crate::config::TlsConfig;
use crate::error::SatelliteError;
use crate::tls::create_tls_connector;
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

pin_project! {
    #[project = ClientStreamProj]
    pub enum ClientStream {
        Plain { #[pin] stream: TcpStream },
        Tls { #[pin] stream: TlsStream<TcpStream> },
    }
}

impl ClientStream {
    /// Connects to `host:port`, upgrading to TLS when `tls` is given.
    ///
    /// `connect_timeout` bounds the TCP connect and the TLS handshake together.
    pub async fn connect(
        host: &str,
        port: u16,
        tls: Option<&TlsConfig>,
        connect_timeout: Duration,
    ) -> Result<Self, SatelliteError> {
        tokio::time::timeout(connect_timeout, Self::establish(host, port, tls))
            .await
            .map_err(|_| SatelliteError::Timeout("connect"))?
    }

    async fn establish(
        host: &str,
        port: u16,
        tls: Option<&TlsConfig>,
    ) -> Result<Self, SatelliteError> {
        tracing::debug!("connecting to {}:{}", host, port);
        let tcp = TcpStream::connect((host, port)).await?;
        tcp.set_nodelay(true).ok();

        let Some(tls) = tls else {
            return Ok(ClientStream::Plain { stream: tcp });
        };

        let (connector, server_name) = create_tls_connector(tls, host)?;
        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| SatelliteError::Tls(format!("handshake failed: {}", e)))?;
        tracing::debug!("TLS handshake with {}:{} complete", host, port);
        Ok(ClientStream::Tls { stream })
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, ClientStream::Tls { .. })
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_read(cx, buf),
            ClientStreamProj::Tls { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_write(cx, buf),
            ClientStreamProj::Tls { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_flush(cx),
            ClientStreamProj::Tls { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_shutdown(cx),
            ClientStreamProj::Tls { stream } => stream.poll_shutdown(cx),
        }
    }
}
