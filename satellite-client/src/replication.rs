//! Per-direction replication session state.

use crate::types::{Lsn, Relation, ReplicationStatus, Transaction, DEFAULT_LSN};
use std::collections::{HashMap, VecDeque};

/// Session state of one replication direction.
///
/// Inbound `transactions` holds the transaction currently being assembled
/// (at most one); outbound `transactions` is the FIFO of enqueued
/// transactions waiting for the next flush.
#[derive(Debug, Clone, Default)]
pub struct Replication {
    pub authenticated: bool,
    pub status: ReplicationStatus,
    pub relations: HashMap<u32, Relation>,
    pub ack_lsn: Lsn,
    pub enqueued_lsn: Lsn,
    pub transactions: VecDeque<Transaction>,
}

impl Replication {
    /// Builds a fresh record: no relations, no buffered transactions,
    /// not authenticated. LSNs default to [`DEFAULT_LSN`] unless given.
    pub fn reset(
        enqueued_lsn: Option<Lsn>,
        ack_lsn: Option<Lsn>,
        status: Option<ReplicationStatus>,
    ) -> Self {
        Self {
            authenticated: false,
            status: status.unwrap_or_default(),
            relations: HashMap::new(),
            ack_lsn: ack_lsn.unwrap_or(DEFAULT_LSN),
            enqueued_lsn: enqueued_lsn.unwrap_or(DEFAULT_LSN),
            transactions: VecDeque::new(),
        }
    }

    /// Resets this record in place, carrying over the last known LSNs.
    pub fn restart(&mut self, status: ReplicationStatus) {
        *self = Self::reset(
            Some(self.enqueued_lsn.clone()),
            Some(self.ack_lsn.clone()),
            Some(status),
        );
    }

    pub fn is_active(&self) -> bool {
        self.status == ReplicationStatus::Active
    }
}
