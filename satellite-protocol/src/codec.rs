//! Type-tagged message codec.
//!
//! An encoded message is `[type code][protobuf body]`. There is no length
//! prefix; the transport delivers one complete message at a time.

use crate::error::ProtocolError;
use crate::message::*;
use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;

/// Encodes a message into `[type code][protobuf body]`.
pub fn encode(msg: &SatMessage) -> Bytes {
    let body = match msg {
        SatMessage::ErrorResp(m) => m.encode_to_vec(),
        SatMessage::AuthReq(m) => m.encode_to_vec(),
        SatMessage::AuthResp(m) => m.encode_to_vec(),
        SatMessage::PingReq(m) => m.encode_to_vec(),
        SatMessage::PingResp(m) => m.encode_to_vec(),
        SatMessage::StartReplicationReq(m) => m.encode_to_vec(),
        SatMessage::StartReplicationResp(m) => m.encode_to_vec(),
        SatMessage::StopReplicationReq(m) => m.encode_to_vec(),
        SatMessage::StopReplicationResp(m) => m.encode_to_vec(),
        SatMessage::OpLog(m) => m.encode_to_vec(),
        SatMessage::Relation(m) => m.encode_to_vec(),
        SatMessage::MigrationNotification(m) => m.encode_to_vec(),
    };

    let mut buf = BytesMut::with_capacity(1 + body.len());
    buf.put_u8(msg.message_type().code());
    buf.put_slice(&body);
    buf.freeze()
}

/// Decodes a `[type code][protobuf body]` message.
pub fn decode(data: &[u8]) -> Result<SatMessage, ProtocolError> {
    let (&code, body) = data.split_first().ok_or(ProtocolError::EmptyMessage)?;
    let ty = MessageType::from_code(code).ok_or(ProtocolError::UnknownMessageType(code))?;

    let msg = match ty {
        MessageType::ErrorResp => SatErrorResp::decode(body)?.into(),
        MessageType::AuthReq => SatAuthReq::decode(body)?.into(),
        MessageType::AuthResp => SatAuthResp::decode(body)?.into(),
        MessageType::PingReq => SatPingReq::decode(body)?.into(),
        MessageType::PingResp => SatPingResp::decode(body)?.into(),
        MessageType::StartReplicationReq => SatInStartReplicationReq::decode(body)?.into(),
        MessageType::StartReplicationResp => SatInStartReplicationResp::decode(body)?.into(),
        MessageType::StopReplicationReq => SatInStopReplicationReq::decode(body)?.into(),
        MessageType::StopReplicationResp => SatInStopReplicationResp::decode(body)?.into(),
        MessageType::OpLog => SatOpLog::decode(body)?.into(),
        MessageType::Relation => SatRelation::decode(body)?.into(),
        MessageType::MigrationNotification => SatMigrationNotification::decode(body)?.into(),
    };
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_code_prefix() {
        let encoded = encode(&SatPingReq {}.into());
        assert_eq!(encoded.as_ref(), &[5u8]);

        let encoded = encode(&SatInStartReplicationResp {}.into());
        assert_eq!(encoded[0], 8);
    }

    #[test]
    fn test_auth_request_wire_bytes() {
        let req = SatAuthReq {
            id: "a".to_string(),
            token: "t".to_string(),
            headers: vec![],
        };
        let encoded = encode(&req.into());
        // code 1, field 1 (len 1 "a"), field 2 (len 1 "t")
        assert_eq!(encoded.as_ref(), &[1, 0x0a, 1, b'a', 0x12, 1, b't']);
    }

    #[test]
    fn test_oplog_decodes_to_same_message() {
        let oplog = SatOpLog {
            ops: vec![
                SatTransOp::new(Op::Begin(SatOpBegin {
                    commit_timestamp: 1000,
                    trans_id: String::new(),
                    lsn: vec![0, 0, 0, 1],
                    origin: None,
                })),
                SatTransOp::new(Op::Insert(SatOpInsert {
                    relation_id: 1,
                    row_data: Some(SatOpRow {
                        nulls_bitmask: vec![0b0000_0010],
                        values: vec![b"Foo".to_vec(), vec![]],
                    }),
                    tags: vec![],
                })),
                SatTransOp::new(Op::Commit(SatOpCommit::default())),
            ],
        };
        let msg = SatMessage::from(oplog);
        let decoded = decode(&encode(&msg)).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_start_request_options_are_preserved() {
        let req = SatInStartReplicationReq {
            lsn: vec![],
            options: vec![
                ReplicationOption::FirstLsn as i32,
                ReplicationOption::SyncMode as i32,
            ],
            sync_batch_size: 10,
        };
        match decode(&encode(&req.clone().into())).unwrap() {
            SatMessage::StartReplicationReq(decoded) => {
                assert!(decoded.has_option(ReplicationOption::FirstLsn));
                assert!(decoded.has_option(ReplicationOption::SyncMode));
                assert_eq!(decoded.sync_batch_size, 10);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_decode_empty() {
        assert!(matches!(decode(&[]), Err(ProtocolError::EmptyMessage)));
    }

    #[test]
    fn test_decode_unknown_code() {
        let result = decode(&[3, 0x0a, 0x00]);
        assert!(matches!(result, Err(ProtocolError::UnknownMessageType(3))));
    }

    #[test]
    fn test_decode_truncated_body() {
        // SatAuthReq with a string field claiming 5 bytes but carrying 1
        let result = decode(&[1, 0x0a, 5, b'a']);
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_ping_response_lsn_absent_vs_empty() {
        let absent = decode(&encode(&SatPingResp { lsn: None }.into())).unwrap();
        assert_eq!(absent, SatMessage::from(SatPingResp { lsn: None }));

        let set = decode(&encode(&SatPingResp { lsn: Some(vec![7]) }.into())).unwrap();
        assert_eq!(set, SatMessage::from(SatPingResp { lsn: Some(vec![7]) }));
    }
}
