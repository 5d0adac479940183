//! Message-oriented socket abstraction and the in-memory transport.
//!
//! A [`Socket`] delivers whole satellite messages: every
//! [`SocketEvent::Message`] carries exactly one `[type code][protobuf]`
//! buffer, and every [`SocketWriter::write`] sends exactly one.

use crate::error::SatelliteError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use satellite_protocol::{decode, encode, SatMessage};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;

/// Something observed on a socket.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// One complete message.
    Message(Bytes),
    /// A transport failure. The socket may still close afterwards.
    Error(SatelliteError),
    /// The remote end closed the connection.
    Closed,
}

/// Receiving side of a socket.
pub type SocketEvents = mpsc::UnboundedReceiver<SocketEvent>;

/// Non-blocking, cloneable send half of a socket.
#[derive(Debug, Clone)]
pub struct SocketWriter {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl SocketWriter {
    pub fn new(tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self { tx }
    }

    /// Queues one message for sending.
    pub fn write(&self, data: Bytes) -> Result<(), SatelliteError> {
        self.tx
            .send(data)
            .map_err(|_| SatelliteError::ConnectionClosed)
    }
}

/// An open connection.
pub struct Socket {
    pub writer: SocketWriter,
    pub events: SocketEvents,
    tasks: Vec<JoinHandle<()>>,
}

impl Socket {
    /// Assembles a socket; `tasks` are the transport's I/O tasks, aborted on close.
    pub fn new(writer: SocketWriter, events: SocketEvents, tasks: Vec<JoinHandle<()>>) -> Self {
        Self {
            writer,
            events,
            tasks,
        }
    }

    /// Splits into the writer, the event stream and the close handle.
    pub fn into_parts(self) -> (SocketWriter, SocketEvents, SocketCloser) {
        (self.writer, self.events, SocketCloser { tasks: self.tasks })
    }
}

/// Tears down a socket's transport tasks.
#[derive(Debug)]
pub struct SocketCloser {
    tasks: Vec<JoinHandle<()>>,
}

impl SocketCloser {
    /// Stops the transport; no further events are delivered.
    pub fn close_and_remove_listeners(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Opens sockets.
#[async_trait]
pub trait SocketFactory: Send + Sync {
    async fn open(&self, url: &str) -> Result<Socket, SatelliteError>;
}

/// In-process transport. Each successful [`SocketFactory::open`] hands a
/// [`MemoryPeer`] to the paired [`MemoryAcceptor`].
#[derive(Clone)]
pub struct MemorySocketFactory {
    inner: Arc<MemoryFactoryInner>,
}

struct MemoryFactoryInner {
    acceptor: mpsc::UnboundedSender<MemoryPeer>,
    refusals: Mutex<u32>,
}

impl MemorySocketFactory {
    pub fn new() -> (Self, MemoryAcceptor) {
        let (tx, rx) = mpsc::unbounded_channel();
        let factory = Self {
            inner: Arc::new(MemoryFactoryInner {
                acceptor: tx,
                refusals: Mutex::new(0),
            }),
        };
        (factory, MemoryAcceptor { rx })
    }

    /// Refuses the next `n` connection attempts.
    pub fn refuse_connections(&self, n: u32) {
        *self.inner.refusals.lock() = n;
    }
}

fn connection_refused() -> SatelliteError {
    std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into()
}

#[async_trait]
impl SocketFactory for MemorySocketFactory {
    async fn open(&self, url: &str) -> Result<Socket, SatelliteError> {
        {
            let mut refusals = self.inner.refusals.lock();
            if *refusals > 0 {
                *refusals -= 1;
                tracing::debug!("refusing memory connection to {}", url);
                return Err(connection_refused());
            }
        }

        let (to_peer, from_client) = mpsc::unbounded_channel();
        let (to_client, events) = mpsc::unbounded_channel();
        let peer = MemoryPeer {
            incoming: from_client,
            events: to_client,
        };
        self.inner
            .acceptor
            .send(peer)
            .map_err(|_| connection_refused())?;

        tracing::debug!("opened memory connection to {}", url);
        Ok(Socket::new(SocketWriter::new(to_peer), events, Vec::new()))
    }
}

/// Accepts connections made through a [`MemorySocketFactory`].
pub struct MemoryAcceptor {
    rx: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryAcceptor {
    /// Waits for the next connection; `None` once the factory is gone.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.rx.recv().await
    }
}

/// The remote end of an in-memory connection.
pub struct MemoryPeer {
    incoming: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedSender<SocketEvent>,
}

impl MemoryPeer {
    /// Receives the next message the client wrote.
    pub async fn recv(&mut self) -> Result<SatMessage, SatelliteError> {
        let data = self
            .incoming
            .recv()
            .await
            .ok_or(SatelliteError::ConnectionClosed)?;
        Ok(decode(&data)?)
    }

    /// Returns the next already-written message, if any.
    pub fn try_recv(&mut self) -> Result<Option<SatMessage>, SatelliteError> {
        match self.incoming.try_recv() {
            Ok(data) => Ok(Some(decode(&data)?)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(SatelliteError::ConnectionClosed),
        }
    }

    pub fn send(&self, msg: impl Into<SatMessage>) -> Result<(), SatelliteError> {
        self.send_raw(encode(&msg.into()))
    }

    /// Delivers raw bytes as one message, valid or not.
    pub fn send_raw(&self, data: Bytes) -> Result<(), SatelliteError> {
        self.deliver(SocketEvent::Message(data))
    }

    /// Reports a transport error to the client.
    pub fn send_error(&self, err: SatelliteError) -> Result<(), SatelliteError> {
        self.deliver(SocketEvent::Error(err))
    }

    /// Closes the connection from the remote side.
    pub fn close(self) -> Result<(), SatelliteError> {
        self.deliver(SocketEvent::Closed)
    }

    fn deliver(&self, event: SocketEvent) -> Result<(), SatelliteError> {
        self.events
            .send(event)
            .map_err(|_| SatelliteError::ConnectionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SatelliteErrorCode;
    use satellite_protocol::message::{SatPingReq, SatPingResp};

    #[tokio::test]
    async fn test_memory_roundtrip() {
        let (factory, mut acceptor) = MemorySocketFactory::new();
        let socket = factory.open("memory://test").await.unwrap();
        let mut peer = acceptor.accept().await.unwrap();
        let (writer, mut events, _closer) = socket.into_parts();

        writer.write(encode(&SatPingReq {}.into())).unwrap();
        assert_eq!(peer.recv().await.unwrap(), SatMessage::from(SatPingReq {}));
        assert!(peer.try_recv().unwrap().is_none());

        peer.send(SatPingResp { lsn: None }).unwrap();
        match events.recv().await.unwrap() {
            SocketEvent::Message(data) => {
                assert_eq!(decode(&data).unwrap(), SatMessage::from(SatPingResp { lsn: None }))
            }
            other => panic!("unexpected event {:?}", other),
        }

        peer.close().unwrap();
        assert!(matches!(events.recv().await, Some(SocketEvent::Closed)));
    }

    #[tokio::test]
    async fn test_refused_connections() {
        let (factory, mut acceptor) = MemorySocketFactory::new();
        factory.refuse_connections(2);

        for _ in 0..2 {
            let err = factory.open("memory://test").await.err().unwrap();
            assert_eq!(err.code(), SatelliteErrorCode::IoError);
        }
        assert!(factory.open("memory://test").await.is_ok());
        assert!(acceptor.accept().await.is_some());

        drop(acceptor);
        let err = factory.open("memory://test").await.err().unwrap();
        assert_eq!(err.code(), SatelliteErrorCode::IoError);
    }

    #[tokio::test]
    async fn test_writer_fails_after_peer_dropped() {
        let (factory, mut acceptor) = MemorySocketFactory::new();
        let socket = factory.open("memory://test").await.unwrap();
        drop(acceptor.accept().await.unwrap());

        let err = socket.writer.write(Bytes::from_static(&[5])).unwrap_err();
        assert_eq!(err.code(), SatelliteErrorCode::ConnectionClosed);
    }
}
