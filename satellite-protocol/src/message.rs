//! Protobuf message schema for the Satellite protocol.
//!
//! Field numbers are part of the wire contract and must not change.

use std::fmt;

/// Keys allowed in auth request/response headers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum SatAuthHeader {
    Unspecified = 0,
    /// Protocol version the client speaks, e.g. "1.0".
    ProtoVersion = 1,
    /// Schema version of the local database.
    SchemaVersion = 2,
}

/// Error codes carried by `SatErrorResp`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum SatErrorCode {
    Internal = 0,
    AuthRequired = 1,
    AuthFailed = 2,
    ReplicationFailed = 3,
    InvalidRequest = 4,
    ProtoVsnMissmatch = 5,
    SchemaVsnMissmatch = 6,
}

impl fmt::Display for SatErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SatErrorCode::Internal => write!(f, "INTERNAL"),
            SatErrorCode::AuthRequired => write!(f, "AUTH_REQUIRED"),
            SatErrorCode::AuthFailed => write!(f, "AUTH_FAILED"),
            SatErrorCode::ReplicationFailed => write!(f, "REPLICATION_FAILED"),
            SatErrorCode::InvalidRequest => write!(f, "INVALID_REQUEST"),
            SatErrorCode::ProtoVsnMissmatch => write!(f, "PROTO_VSN_MISSMATCH"),
            SatErrorCode::SchemaVsnMissmatch => write!(f, "SCHEMA_VSN_MISSMATCH"),
        }
    }
}

/// Options of a start replication request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ReplicationOption {
    None = 0,
    /// Resume from the last position acknowledged by the consumer.
    LastAcknowledged = 1,
    /// Deliver in synchronous batches of `sync_batch_size`.
    SyncMode = 2,
    /// Start from the first available LSN.
    FirstLsn = 3,
    /// Start from the most recent LSN.
    LastLsn = 4,
}

/// Kind of relation described by `SatRelation`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum RelationType {
    Table = 0,
    Index = 1,
    View = 2,
    Trigger = 3,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SatPingReq {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SatPingResp {
    /// Last LSN the sender has durably applied.
    #[prost(bytes = "vec", optional, tag = "1")]
    pub lsn: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SatAuthHeaderPair {
    #[prost(enumeration = "SatAuthHeader", tag = "1")]
    pub key: i32,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SatAuthReq {
    /// Identity of the connecting client.
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub token: String,
    #[prost(message, repeated, tag = "3")]
    pub headers: Vec<SatAuthHeaderPair>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SatAuthResp {
    /// Identity of the server.
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(message, repeated, tag = "3")]
    pub headers: Vec<SatAuthHeaderPair>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SatErrorResp {
    #[prost(enumeration = "SatErrorCode", tag = "1")]
    pub error_type: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SatInStartReplicationReq {
    #[prost(bytes = "vec", tag = "1")]
    pub lsn: Vec<u8>,
    #[prost(enumeration = "ReplicationOption", repeated, tag = "2")]
    pub options: Vec<i32>,
    #[prost(int32, tag = "3")]
    pub sync_batch_size: i32,
}

impl SatInStartReplicationReq {
    /// Returns true if the request carries `option`.
    pub fn has_option(&self, option: ReplicationOption) -> bool {
        self.options.contains(&(option as i32))
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SatInStartReplicationResp {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SatInStopReplicationReq {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SatInStopReplicationResp {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SatRelationColumn {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub r#type: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SatRelation {
    #[prost(string, tag = "1")]
    pub schema_name: String,
    #[prost(enumeration = "RelationType", tag = "2")]
    pub table_type: i32,
    #[prost(string, tag = "3")]
    pub table_name: String,
    /// Connection-scoped relation identifier.
    #[prost(uint32, tag = "4")]
    pub relation_id: u32,
    #[prost(message, repeated, tag = "5")]
    pub columns: Vec<SatRelationColumn>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SatOpLog {
    #[prost(message, repeated, tag = "1")]
    pub ops: Vec<SatTransOp>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SatTransOp {
    #[prost(oneof = "Op", tags = "1, 2, 3, 4, 5")]
    pub op: Option<Op>,
}

impl SatTransOp {
    pub fn new(op: Op) -> Self {
        Self { op: Some(op) }
    }
}

/// Exactly one operation of a `SatTransOp`.
#[derive(Clone, PartialEq, prost::Oneof)]
pub enum Op {
    #[prost(message, tag = "1")]
    Begin(SatOpBegin),
    #[prost(message, tag = "2")]
    Commit(SatOpCommit),
    #[prost(message, tag = "3")]
    Update(SatOpUpdate),
    #[prost(message, tag = "4")]
    Insert(SatOpInsert),
    #[prost(message, tag = "5")]
    Delete(SatOpDelete),
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SatOpBegin {
    #[prost(uint64, tag = "1")]
    pub commit_timestamp: u64,
    #[prost(string, tag = "2")]
    pub trans_id: String,
    #[prost(bytes = "vec", tag = "3")]
    pub lsn: Vec<u8>,
    /// Origin of the transaction, set when it was replayed from a peer.
    #[prost(string, optional, tag = "4")]
    pub origin: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SatOpCommit {
    #[prost(uint64, tag = "1")]
    pub commit_timestamp: u64,
    #[prost(string, tag = "2")]
    pub trans_id: String,
    #[prost(bytes = "vec", tag = "3")]
    pub lsn: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SatOpInsert {
    #[prost(uint32, tag = "1")]
    pub relation_id: u32,
    #[prost(message, optional, tag = "2")]
    pub row_data: Option<SatOpRow>,
    #[prost(string, repeated, tag = "3")]
    pub tags: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SatOpUpdate {
    #[prost(uint32, tag = "1")]
    pub relation_id: u32,
    #[prost(message, optional, tag = "2")]
    pub row_data: Option<SatOpRow>,
    #[prost(message, optional, tag = "3")]
    pub old_row_data: Option<SatOpRow>,
    #[prost(string, repeated, tag = "4")]
    pub tags: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SatOpDelete {
    #[prost(uint32, tag = "1")]
    pub relation_id: u32,
    #[prost(message, optional, tag = "2")]
    pub old_row_data: Option<SatOpRow>,
    #[prost(string, repeated, tag = "3")]
    pub tags: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SatMigrationNotification {
    #[prost(string, tag = "1")]
    pub old_schema_version: String,
    #[prost(string, tag = "2")]
    pub old_schema_hash: String,
    #[prost(string, tag = "3")]
    pub new_schema_version: String,
    #[prost(string, tag = "4")]
    pub new_schema_hash: String,
}

/// One serialized row.
///
/// `values` holds one entry per relation column; bit `i` of `nulls_bitmask`
/// (byte `i / 8`, LSB first) marks column `i` as null.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SatOpRow {
    #[prost(bytes = "vec", tag = "1")]
    pub nulls_bitmask: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub values: Vec<Vec<u8>>,
}

/// Type code prefixed to every encoded message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    ErrorResp = 0,
    AuthReq = 1,
    AuthResp = 2,
    PingReq = 5,
    PingResp = 6,
    StartReplicationReq = 7,
    StartReplicationResp = 8,
    StopReplicationReq = 9,
    StopReplicationResp = 10,
    OpLog = 11,
    Relation = 12,
    MigrationNotification = 13,
}

impl MessageType {
    /// Returns the one-byte wire code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Looks up the message type for a wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        let ty = match code {
            0 => MessageType::ErrorResp,
            1 => MessageType::AuthReq,
            2 => MessageType::AuthResp,
            5 => MessageType::PingReq,
            6 => MessageType::PingResp,
            7 => MessageType::StartReplicationReq,
            8 => MessageType::StartReplicationResp,
            9 => MessageType::StopReplicationReq,
            10 => MessageType::StopReplicationResp,
            11 => MessageType::OpLog,
            12 => MessageType::Relation,
            13 => MessageType::MigrationNotification,
            _ => return None,
        };
        Some(ty)
    }

    /// Schema name of the message.
    pub fn name(self) -> &'static str {
        match self {
            MessageType::ErrorResp => "SatErrorResp",
            MessageType::AuthReq => "SatAuthReq",
            MessageType::AuthResp => "SatAuthResp",
            MessageType::PingReq => "SatPingReq",
            MessageType::PingResp => "SatPingResp",
            MessageType::StartReplicationReq => "SatInStartReplicationReq",
            MessageType::StartReplicationResp => "SatInStartReplicationResp",
            MessageType::StopReplicationReq => "SatInStopReplicationReq",
            MessageType::StopReplicationResp => "SatInStopReplicationResp",
            MessageType::OpLog => "SatOpLog",
            MessageType::Relation => "SatRelation",
            MessageType::MigrationNotification => "SatMigrationNotification",
        }
    }

    /// Looks up the message type for a schema name.
    pub fn from_name(name: &str) -> Option<Self> {
        ALL_MESSAGE_TYPES.iter().copied().find(|ty| ty.name() == name)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Every message type, in code order.
pub const ALL_MESSAGE_TYPES: [MessageType; 12] = [
    MessageType::ErrorResp,
    MessageType::AuthReq,
    MessageType::AuthResp,
    MessageType::PingReq,
    MessageType::PingResp,
    MessageType::StartReplicationReq,
    MessageType::StartReplicationResp,
    MessageType::StopReplicationReq,
    MessageType::StopReplicationResp,
    MessageType::OpLog,
    MessageType::Relation,
    MessageType::MigrationNotification,
];

/// Any Satellite message.
#[derive(Debug, Clone, PartialEq)]
pub enum SatMessage {
    ErrorResp(SatErrorResp),
    AuthReq(SatAuthReq),
    AuthResp(SatAuthResp),
    PingReq(SatPingReq),
    PingResp(SatPingResp),
    StartReplicationReq(SatInStartReplicationReq),
    StartReplicationResp(SatInStartReplicationResp),
    StopReplicationReq(SatInStopReplicationReq),
    StopReplicationResp(SatInStopReplicationResp),
    OpLog(SatOpLog),
    Relation(SatRelation),
    MigrationNotification(SatMigrationNotification),
}

impl SatMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            SatMessage::ErrorResp(_) => MessageType::ErrorResp,
            SatMessage::AuthReq(_) => MessageType::AuthReq,
            SatMessage::AuthResp(_) => MessageType::AuthResp,
            SatMessage::PingReq(_) => MessageType::PingReq,
            SatMessage::PingResp(_) => MessageType::PingResp,
            SatMessage::StartReplicationReq(_) => MessageType::StartReplicationReq,
            SatMessage::StartReplicationResp(_) => MessageType::StartReplicationResp,
            SatMessage::StopReplicationReq(_) => MessageType::StopReplicationReq,
            SatMessage::StopReplicationResp(_) => MessageType::StopReplicationResp,
            SatMessage::OpLog(_) => MessageType::OpLog,
            SatMessage::Relation(_) => MessageType::Relation,
            SatMessage::MigrationNotification(_) => MessageType::MigrationNotification,
        }
    }
}

macro_rules! impl_from_message {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for SatMessage {
                fn from(msg: $ty) -> Self {
                    SatMessage::$variant(msg)
                }
            }
        )*
    };
}

impl_from_message! {
    ErrorResp => SatErrorResp,
    AuthReq => SatAuthReq,
    AuthResp => SatAuthResp,
    PingReq => SatPingReq,
    PingResp => SatPingResp,
    StartReplicationReq => SatInStartReplicationReq,
    StartReplicationResp => SatInStartReplicationResp,
    StopReplicationReq => SatInStopReplicationReq,
    StopReplicationResp => SatInStopReplicationResp,
    OpLog => SatOpLog,
    Relation => SatRelation,
    MigrationNotification => SatMigrationNotification,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_codes_are_bidirectional() {
        for ty in ALL_MESSAGE_TYPES {
            assert_eq!(MessageType::from_code(ty.code()), Some(ty));
            assert_eq!(MessageType::from_name(ty.name()), Some(ty));
        }
    }

    #[test]
    fn test_stable_type_codes() {
        assert_eq!(MessageType::ErrorResp.code(), 0);
        assert_eq!(MessageType::AuthReq.code(), 1);
        assert_eq!(MessageType::AuthResp.code(), 2);
        assert_eq!(MessageType::PingReq.code(), 5);
        assert_eq!(MessageType::PingResp.code(), 6);
        assert_eq!(MessageType::StartReplicationReq.code(), 7);
        assert_eq!(MessageType::StartReplicationResp.code(), 8);
        assert_eq!(MessageType::StopReplicationReq.code(), 9);
        assert_eq!(MessageType::StopReplicationResp.code(), 10);
        assert_eq!(MessageType::OpLog.code(), 11);
        assert_eq!(MessageType::Relation.code(), 12);
        assert_eq!(MessageType::MigrationNotification.code(), 13);
    }

    #[test]
    fn test_unassigned_codes() {
        // 3 and 4 were server-info messages, no longer part of the schema
        assert_eq!(MessageType::from_code(3), None);
        assert_eq!(MessageType::from_code(4), None);
        assert_eq!(MessageType::from_code(14), None);
        assert_eq!(MessageType::from_code(255), None);
        assert_eq!(MessageType::from_name("SatGetServerInfoReq"), None);
    }

    #[test]
    fn test_start_request_options() {
        let req = SatInStartReplicationReq {
            lsn: vec![],
            options: vec![ReplicationOption::FirstLsn as i32],
            sync_batch_size: 0,
        };
        assert!(req.has_option(ReplicationOption::FirstLsn));
        assert!(!req.has_option(ReplicationOption::LastAcknowledged));
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(
            SatErrorCode::ReplicationFailed.to_string(),
            "REPLICATION_FAILED"
        );
        assert_eq!(
            SatErrorCode::SchemaVsnMissmatch.to_string(),
            "SCHEMA_VSN_MISSMATCH"
        );
    }

    #[test]
    fn test_from_message() {
        let msg: SatMessage = SatPingReq {}.into();
        assert_eq!(msg.message_type(), MessageType::PingReq);
    }
}
