//! Replication data model: relations, records, changes and transactions.

use bytes::Bytes;
use satellite_protocol::message::{RelationType, SatRelation, SatRelationColumn};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Log sequence number.
///
/// Opaque to this layer: it is echoed back to the peer, never interpreted,
/// except by the numeric helpers used by oplog assembly and tests.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Lsn(Bytes);

/// The zero-length sentinel LSN.
pub const DEFAULT_LSN: Lsn = Lsn(Bytes::new());

impl Lsn {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Encodes `n` as an 8-byte big-endian LSN.
    pub fn from_u64(n: u64) -> Self {
        Self(Bytes::copy_from_slice(&n.to_be_bytes()))
    }

    /// Decodes a big-endian numeric LSN of up to 8 bytes.
    pub fn to_u64(&self) -> Option<u64> {
        if self.0.is_empty() || self.0.len() > 8 {
            return None;
        }
        Some(self.0.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl From<Vec<u8>> for Lsn {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

impl From<&[u8]> for Lsn {
    fn from(bytes: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(bytes))
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lsn({})", self.to_hex())
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

/// One column of a relation. Order within the relation is significant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
}

impl RelationColumn {
    pub fn new(name: impl Into<String>, column_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column_type: column_type.into(),
        }
    }
}

/// Schema descriptor of a replicated table, scoped to one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Relation {
    pub id: u32,
    pub schema: String,
    pub table: String,
    #[serde(serialize_with = "serialize_relation_type")]
    pub table_type: RelationType,
    pub columns: Vec<RelationColumn>,
}

fn serialize_relation_type<S: Serializer>(ty: &RelationType, s: S) -> Result<S::Ok, S::Error> {
    let name = match ty {
        RelationType::Table => "TABLE",
        RelationType::Index => "INDEX",
        RelationType::View => "VIEW",
        RelationType::Trigger => "TRIGGER",
    };
    s.serialize_str(name)
}

impl Relation {
    /// Converts a received `SatRelation`; unknown table types become `Table`.
    pub fn from_message(msg: &SatRelation) -> Self {
        Self {
            id: msg.relation_id,
            schema: msg.schema_name.clone(),
            table: msg.table_name.clone(),
            table_type: msg.table_type(),
            columns: msg
                .columns
                .iter()
                .map(|c| RelationColumn::new(&c.name, &c.r#type))
                .collect(),
        }
    }

    pub fn to_message(&self) -> SatRelation {
        SatRelation {
            schema_name: self.schema.clone(),
            table_type: self.table_type as i32,
            table_name: self.table.clone(),
            relation_id: self.id,
            columns: self
                .columns
                .iter()
                .map(|c| SatRelationColumn {
                    name: c.name.clone(),
                    r#type: c.column_type.clone(),
                })
                .collect(),
        }
    }
}

/// A non-null column value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ColumnValue {
    Text(String),
    Integer(i64),
    Real(f64),
}

impl From<&str> for ColumnValue {
    fn from(s: &str) -> Self {
        ColumnValue::Text(s.to_string())
    }
}

impl From<String> for ColumnValue {
    fn from(s: String) -> Self {
        ColumnValue::Text(s)
    }
}

impl From<i64> for ColumnValue {
    fn from(n: i64) -> Self {
        ColumnValue::Integer(n)
    }
}

impl From<f64> for ColumnValue {
    fn from(n: f64) -> Self {
        ColumnValue::Real(n)
    }
}

/// A logical row: column name to value, `None` meaning null.
pub type Record = BTreeMap<String, Option<ColumnValue>>;

/// Kind of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

/// Row images carried by a change.
///
/// Inserts carry the new row, deletes the old row, updates both.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RowChange {
    Insert {
        record: Record,
    },
    Update {
        record: Record,
        old_record: Record,
    },
    Delete {
        old_record: Record,
    },
}

/// One row-level change to a relation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Change {
    pub relation: Relation,
    #[serde(flatten)]
    pub row: RowChange,
}

impl Change {
    pub fn insert(relation: Relation, record: Record) -> Self {
        Self {
            relation,
            row: RowChange::Insert { record },
        }
    }

    pub fn update(relation: Relation, record: Record, old_record: Record) -> Self {
        Self {
            relation,
            row: RowChange::Update { record, old_record },
        }
    }

    pub fn delete(relation: Relation, old_record: Record) -> Self {
        Self {
            relation,
            row: RowChange::Delete { old_record },
        }
    }

    pub fn change_type(&self) -> ChangeType {
        match self.row {
            RowChange::Insert { .. } => ChangeType::Insert,
            RowChange::Update { .. } => ChangeType::Update,
            RowChange::Delete { .. } => ChangeType::Delete,
        }
    }

    /// New row image, absent for deletes.
    pub fn record(&self) -> Option<&Record> {
        match &self.row {
            RowChange::Insert { record } | RowChange::Update { record, .. } => Some(record),
            RowChange::Delete { .. } => None,
        }
    }

    /// Old row image, absent for inserts.
    pub fn old_record(&self) -> Option<&Record> {
        match &self.row {
            RowChange::Update { old_record, .. } | RowChange::Delete { old_record } => {
                Some(old_record)
            }
            RowChange::Insert { .. } => None,
        }
    }
}

/// One atomic unit of replicated work. Changes apply in order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transaction {
    pub commit_timestamp: u64,
    pub lsn: Lsn,
    pub changes: Vec<Change>,
}

impl Transaction {
    pub fn new(commit_timestamp: u64, lsn: Lsn) -> Self {
        Self {
            commit_timestamp,
            lsn,
            changes: Vec::new(),
        }
    }
}

/// What an LSN acknowledgement means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckType {
    /// Handed to the transport; not yet confirmed by the peer.
    LocalSend,
    /// The peer has durably committed up to this LSN.
    RemoteCommit,
}

/// Replication status of one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReplicationStatus {
    #[default]
    Stopped,
    Starting,
    Active,
    Stopping,
}

impl fmt::Display for ReplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationStatus::Stopped => write!(f, "STOPPED"),
            ReplicationStatus::Starting => write!(f, "STARTING"),
            ReplicationStatus::Active => write!(f, "ACTIVE"),
            ReplicationStatus::Stopping => write!(f, "STOPPING"),
        }
    }
}

/// Replication direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Peer to this client.
    Inbound,
    /// This client to peer.
    Outbound,
}

/// Successful authentication result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    /// Identity the server reported.
    pub server_id: String,
}
