//! Conversion between [`Transaction`]s and `SatOpLog` operations.

use crate::error::SatelliteError;
use crate::replication::Replication;
use crate::serialization::{deserialize_row, serialize_row};
use crate::types::{Change, Lsn, Relation, RowChange, Transaction};
use satellite_protocol::message::{
    Op, SatOpBegin, SatOpCommit, SatOpDelete, SatOpInsert, SatOpLog, SatOpUpdate, SatTransOp,
};

/// Encodes a transaction as `begin`, one op per change, `commit`.
pub fn transaction_to_oplog(transaction: &Transaction) -> Result<SatOpLog, SatelliteError> {
    let mut ops = Vec::with_capacity(transaction.changes.len() + 2);
    ops.push(SatTransOp::new(Op::Begin(SatOpBegin {
        commit_timestamp: transaction.commit_timestamp,
        trans_id: String::new(),
        lsn: transaction.lsn.to_vec(),
        origin: None,
    })));

    for change in &transaction.changes {
        let relation = &change.relation;
        let op = match &change.row {
            RowChange::Insert { record } => Op::Insert(SatOpInsert {
                relation_id: relation.id,
                row_data: Some(serialize_row(record, relation)?),
                tags: vec![],
            }),
            RowChange::Update { record, old_record } => Op::Update(SatOpUpdate {
                relation_id: relation.id,
                row_data: Some(serialize_row(record, relation)?),
                old_row_data: Some(serialize_row(old_record, relation)?),
                tags: vec![],
            }),
            RowChange::Delete { old_record } => Op::Delete(SatOpDelete {
                relation_id: relation.id,
                old_row_data: Some(serialize_row(old_record, relation)?),
                tags: vec![],
            }),
        };
        ops.push(SatTransOp::new(op));
    }

    ops.push(SatTransOp::new(Op::Commit(SatOpCommit {
        commit_timestamp: transaction.commit_timestamp,
        trans_id: String::new(),
        lsn: transaction.lsn.to_vec(),
    })));

    Ok(SatOpLog { ops })
}

/// Folds one incoming op into the inbound transaction buffer.
///
/// Returns the finished transaction when `op` is a commit. A transaction
/// may span any number of `SatOpLog` messages, but only one may be open.
pub fn apply_op(
    replication: &mut Replication,
    op: SatTransOp,
) -> Result<Option<Transaction>, SatelliteError> {
    let op = op
        .op
        .ok_or_else(|| SatelliteError::ProtocolViolation("empty transaction op".to_string()))?;

    match op {
        Op::Begin(begin) => {
            if !replication.transactions.is_empty() {
                return Err(SatelliteError::ProtocolViolation(
                    "begin received while a transaction is still open".to_string(),
                ));
            }
            replication
                .transactions
                .push_back(Transaction::new(begin.commit_timestamp, Lsn::from(begin.lsn)));
            Ok(None)
        }
        Op::Commit(_) => replication.transactions.pop_front().map(Some).ok_or_else(|| {
            SatelliteError::ProtocolViolation("commit received without begin".to_string())
        }),
        Op::Insert(insert) => {
            let relation = lookup_relation(replication, insert.relation_id)?;
            let record = deserialize_row(insert.row_data.as_ref(), &relation)?
                .ok_or_else(|| missing_row("insert", relation.id))?;
            push_change(replication, Change::insert(relation, record))?;
            Ok(None)
        }
        Op::Update(update) => {
            let relation = lookup_relation(replication, update.relation_id)?;
            let record = deserialize_row(update.row_data.as_ref(), &relation)?
                .ok_or_else(|| missing_row("update", relation.id))?;
            let old_record =
                deserialize_row(update.old_row_data.as_ref(), &relation)?.unwrap_or_default();
            push_change(replication, Change::update(relation, record, old_record))?;
            Ok(None)
        }
        Op::Delete(delete) => {
            let relation = lookup_relation(replication, delete.relation_id)?;
            let old_record = deserialize_row(delete.old_row_data.as_ref(), &relation)?
                .ok_or_else(|| missing_row("delete", relation.id))?;
            push_change(replication, Change::delete(relation, old_record))?;
            Ok(None)
        }
    }
}

fn lookup_relation(replication: &Replication, id: u32) -> Result<Relation, SatelliteError> {
    replication.relations.get(&id).cloned().ok_or_else(|| {
        SatelliteError::ProtocolViolation(format!("missing relation {} for incoming operation", id))
    })
}

fn missing_row(op: &str, relation_id: u32) -> SatelliteError {
    SatelliteError::ProtocolViolation(format!(
        "{} on relation {} carries no row data",
        op, relation_id
    ))
}

fn push_change(replication: &mut Replication, change: Change) -> Result<(), SatelliteError> {
    let transaction = replication.transactions.back_mut().ok_or_else(|| {
        SatelliteError::ProtocolViolation("operation received outside a transaction".to_string())
    })?;
    transaction.changes.push(change);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SatelliteErrorCode;
    use crate::types::{ChangeType, ColumnValue, Record, RelationColumn};
    use satellite_protocol::message::RelationType;

    fn parent() -> Relation {
        Relation {
            id: 1,
            schema: "main".to_string(),
            table: "parent".to_string(),
            table_type: RelationType::Table,
            columns: vec![
                RelationColumn::new("id", "INTEGER"),
                RelationColumn::new("value", "TEXT"),
            ],
        }
    }

    fn row(id: i64, value: Option<&str>) -> Record {
        Record::from([
            ("id".to_string(), Some(ColumnValue::Integer(id))),
            ("value".to_string(), value.map(ColumnValue::from)),
        ])
    }

    fn transaction() -> Transaction {
        Transaction {
            commit_timestamp: 1000,
            lsn: Lsn::from_u64(1),
            changes: vec![
                Change::insert(parent(), row(1, Some("a"))),
                Change::update(parent(), row(1, Some("b")), row(1, Some("a"))),
                Change::delete(parent(), row(1, None)),
            ],
        }
    }

    #[test]
    fn test_transaction_to_oplog_shape() {
        let oplog = transaction_to_oplog(&transaction()).unwrap();
        assert_eq!(oplog.ops.len(), 5);

        match oplog.ops[0].op.as_ref().unwrap() {
            Op::Begin(begin) => {
                assert_eq!(begin.commit_timestamp, 1000);
                assert_eq!(begin.lsn, Lsn::from_u64(1).to_vec());
            }
            other => panic!("expected begin, got {:?}", other),
        }
        assert!(matches!(oplog.ops[1].op, Some(Op::Insert(_))));
        match oplog.ops[2].op.as_ref().unwrap() {
            Op::Update(update) => {
                assert!(update.row_data.is_some());
                assert!(update.old_row_data.is_some());
            }
            other => panic!("expected update, got {:?}", other),
        }
        assert!(matches!(oplog.ops[3].op, Some(Op::Delete(_))));
        assert!(matches!(oplog.ops[4].op, Some(Op::Commit(_))));
    }

    #[test]
    fn test_fold_reassembles_transaction() {
        let mut replication = Replication::default();
        replication.relations.insert(1, parent());

        let mut finished = None;
        for op in transaction_to_oplog(&transaction()).unwrap().ops {
            assert!(finished.is_none());
            finished = apply_op(&mut replication, op).unwrap();
        }

        let finished = finished.unwrap();
        assert_eq!(finished, transaction());
        assert!(replication.transactions.is_empty());
        let types: Vec<ChangeType> = finished.changes.iter().map(Change::change_type).collect();
        assert_eq!(
            types,
            vec![ChangeType::Insert, ChangeType::Update, ChangeType::Delete]
        );
    }

    #[test]
    fn test_unknown_relation() {
        let mut replication = Replication::default();
        let ops = transaction_to_oplog(&transaction()).unwrap().ops;

        apply_op(&mut replication, ops[0].clone()).unwrap();
        let err = apply_op(&mut replication, ops[1].clone()).unwrap_err();
        assert_eq!(err.code(), SatelliteErrorCode::ProtocolViolation);
    }

    #[test]
    fn test_sequence_violations() {
        let mut replication = Replication::default();
        replication.relations.insert(1, parent());
        let ops = transaction_to_oplog(&transaction()).unwrap().ops;

        let err = apply_op(&mut replication, ops[4].clone()).unwrap_err();
        assert_eq!(err.code(), SatelliteErrorCode::ProtocolViolation);

        let err = apply_op(&mut replication, ops[1].clone()).unwrap_err();
        assert_eq!(err.code(), SatelliteErrorCode::ProtocolViolation);

        apply_op(&mut replication, ops[0].clone()).unwrap();
        let err = apply_op(&mut replication, ops[0].clone()).unwrap_err();
        assert_eq!(err.code(), SatelliteErrorCode::ProtocolViolation);

        let err = apply_op(&mut replication, SatTransOp { op: None }).unwrap_err();
        assert_eq!(err.code(), SatelliteErrorCode::ProtocolViolation);
    }

    #[test]
    fn test_unknown_column_type_fails_encoding() {
        let mut relation = parent();
        relation.columns[1].column_type = "BLOB".to_string();
        let tx = Transaction {
            commit_timestamp: 0,
            lsn: Lsn::from_u64(2),
            changes: vec![Change::insert(relation, row(1, Some("x")))],
        };
        let err = transaction_to_oplog(&tx).unwrap_err();
        assert_eq!(err.code(), SatelliteErrorCode::UnknownDataType);
    }
}
