//! # satellite-client
//!
//! Client side of the Satellite replication protocol.
//!
//! This crate provides:
//! - The protocol state machine driving both replication directions
//! - Row serialization against relation schemas
//! - Assembly of a local oplog into transactions
//! - TCP/TLS and in-memory transports behind a socket abstraction

pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod notifier;
pub mod oplog;
pub mod replication;
pub mod serialization;
pub mod socket;
pub mod stream;
pub mod tcp;
pub mod throttle;
pub mod tls;
pub mod transaction;
pub mod types;

pub use backoff::BackoffPolicy;
pub use client::{AckHandle, EventReceiver, SatelliteClient, SatelliteEvent, TransactionEvent};
pub use config::{ConfigError, SatelliteClientConfig, TlsConfig};
pub use error::{SatelliteError, SatelliteErrorCode};
pub use notifier::{ConnectivityNotifier, ConnectivityState, TracingNotifier};
pub use oplog::{to_transactions, OpType, OplogEntry, RelationsByTable};
pub use socket::{MemoryAcceptor, MemoryPeer, MemorySocketFactory, Socket, SocketFactory};
pub use tcp::TcpSocketFactory;
pub use types::{
    AckType, AuthResponse, Change, ChangeType, ColumnValue, Direction, Lsn, Record, Relation,
    RelationColumn, ReplicationStatus, Transaction,
};
