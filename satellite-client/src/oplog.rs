//! Groups a captured oplog into replicable transactions.
//!
//! Entries are the rows of the local oplog table: one per row-level change,
//! with row images stored as JSON text. Consecutive entries sharing a
//! timestamp were written by the same local transaction.

use crate::error::SatelliteError;
use crate::types::{Change, ColumnValue, Lsn, Record, Relation, Transaction};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Kind of captured operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpType {
    Insert,
    Update,
    Delete,
    Upsert,
}

/// One captured row-level change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OplogEntry {
    pub rowid: i64,
    pub namespace: String,
    pub tablename: String,
    pub optype: OpType,
    pub primary_key: String,
    /// RFC 3339 commit time of the local transaction.
    pub timestamp: String,
    /// New row image as a JSON object.
    #[serde(default)]
    pub new_row: Option<String>,
    /// Old row image as a JSON object.
    #[serde(default)]
    pub old_row: Option<String>,
}

/// Relations by table name.
pub type RelationsByTable = HashMap<String, Relation>;

/// Groups `entries` into transactions, in rowid order.
///
/// Each transaction takes its commit timestamp (epoch millis) from its
/// entries and its LSN from the rowid of its last entry.
pub fn to_transactions(
    entries: &[OplogEntry],
    relations: &RelationsByTable,
) -> Result<Vec<Transaction>, SatelliteError> {
    let mut sorted: Vec<&OplogEntry> = entries.iter().collect();
    sorted.sort_by_key(|e| e.rowid);

    let mut transactions: Vec<Transaction> = Vec::new();
    let mut current_timestamp: Option<&str> = None;

    for entry in sorted {
        let change = to_change(entry, relations)?;
        let lsn = entry_lsn(entry)?;

        match transactions.last_mut() {
            Some(tx) if current_timestamp == Some(entry.timestamp.as_str()) => {
                tx.lsn = lsn;
                tx.changes.push(change);
            }
            _ => {
                let mut tx = Transaction::new(commit_timestamp(entry)?, lsn);
                tx.changes.push(change);
                transactions.push(tx);
                current_timestamp = Some(entry.timestamp.as_str());
            }
        }
    }

    Ok(transactions)
}

fn invalid(entry: &OplogEntry, reason: impl Into<String>) -> SatelliteError {
    SatelliteError::InvalidOplog {
        rowid: entry.rowid,
        reason: reason.into(),
    }
}

fn entry_lsn(entry: &OplogEntry) -> Result<Lsn, SatelliteError> {
    u64::try_from(entry.rowid)
        .map(Lsn::from_u64)
        .map_err(|_| invalid(entry, "negative rowid"))
}

fn commit_timestamp(entry: &OplogEntry) -> Result<u64, SatelliteError> {
    let parsed = DateTime::parse_from_rfc3339(&entry.timestamp)
        .map_err(|e| invalid(entry, format!("bad timestamp '{}': {}", entry.timestamp, e)))?;
    u64::try_from(parsed.timestamp_millis())
        .map_err(|_| invalid(entry, format!("timestamp '{}' before epoch", entry.timestamp)))
}

fn to_change(entry: &OplogEntry, relations: &RelationsByTable) -> Result<Change, SatelliteError> {
    let relation = relations
        .get(&entry.tablename)
        .cloned()
        .ok_or_else(|| invalid(entry, format!("no relation for table '{}'", entry.tablename)))?;

    let new_row = entry
        .new_row
        .as_deref()
        .map(|row| parse_row(entry, row))
        .transpose()?;
    let old_row = entry
        .old_row
        .as_deref()
        .map(|row| parse_row(entry, row))
        .transpose()?;

    let change = match (entry.optype, new_row, old_row) {
        (OpType::Insert, Some(record), _) => Change::insert(relation, record),
        (OpType::Delete, _, Some(old_record)) => Change::delete(relation, old_record),
        (OpType::Update | OpType::Upsert, Some(record), Some(old_record)) => {
            Change::update(relation, record, old_record)
        }
        (OpType::Upsert, Some(record), None) => Change::insert(relation, record),
        (optype, _, _) => {
            return Err(invalid(
                entry,
                format!("{:?} entry is missing a row image", optype),
            ))
        }
    };
    Ok(change)
}

fn parse_row(entry: &OplogEntry, text: &str) -> Result<Record, SatelliteError> {
    let object: serde_json::Map<String, Value> = serde_json::from_str(text)
        .map_err(|e| invalid(entry, format!("row is not a JSON object: {}", e)))?;

    object
        .into_iter()
        .map(|(column, value)| {
            let value = match value {
                Value::Null => None,
                Value::String(s) => Some(ColumnValue::Text(s)),
                Value::Number(n) => match n.as_i64() {
                    Some(i) => Some(ColumnValue::Integer(i)),
                    None => n.as_f64().map(ColumnValue::Real),
                },
                other => {
                    return Err(invalid(
                        entry,
                        format!("unsupported value {} in column '{}'", other, column),
                    ))
                }
            };
            Ok((column, value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SatelliteErrorCode;
    use crate::types::{ChangeType, RelationColumn};
    use satellite_protocol::message::RelationType;

    fn relations() -> RelationsByTable {
        let parent = Relation {
            id: 1,
            schema: "schema".to_string(),
            table: "parent".to_string(),
            table_type: RelationType::Table,
            columns: vec![
                RelationColumn::new("id", "INTEGER"),
                RelationColumn::new("value", "TEXT"),
                RelationColumn::new("other", "INTEGER"),
            ],
        };
        HashMap::from([("parent".to_string(), parent)])
    }

    fn entry(rowid: i64, optype: OpType, timestamp: &str) -> OplogEntry {
        let row = format!("{{\"id\":{}}}", rowid);
        OplogEntry {
            rowid,
            namespace: "main".to_string(),
            tablename: "parent".to_string(),
            optype,
            primary_key: row.clone(),
            timestamp: timestamp.to_string(),
            new_row: (optype != OpType::Delete).then(|| row.clone()),
            old_row: matches!(optype, OpType::Update | OpType::Delete).then_some(row),
        }
    }

    #[test]
    fn test_groups_consecutive_entries_by_timestamp() {
        let entries = vec![
            entry(0, OpType::Insert, "1970-01-01T00:00:01.000Z"),
            entry(1, OpType::Update, "1970-01-01T00:00:01.000Z"),
            entry(2, OpType::Update, "1970-01-01T00:00:02.000Z"),
        ];

        let transactions = to_transactions(&entries, &relations()).unwrap();
        assert_eq!(transactions.len(), 2);

        assert_eq!(transactions[0].commit_timestamp, 1000);
        assert_eq!(transactions[0].lsn.to_u64(), Some(1));
        assert_eq!(transactions[0].changes.len(), 2);
        assert_eq!(transactions[0].changes[0].change_type(), ChangeType::Insert);
        assert_eq!(transactions[0].changes[1].change_type(), ChangeType::Update);

        assert_eq!(transactions[1].commit_timestamp, 2000);
        assert_eq!(transactions[1].lsn.to_u64(), Some(2));
    }

    #[test]
    fn test_entries_are_ordered_by_rowid() {
        let entries = vec![
            entry(5, OpType::Delete, "1970-01-01T00:00:01.000Z"),
            entry(4, OpType::Insert, "1970-01-01T00:00:01.000Z"),
        ];
        let transactions = to_transactions(&entries, &relations()).unwrap();
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].lsn.to_u64(), Some(5));
        assert_eq!(transactions[0].changes[1].change_type(), ChangeType::Delete);
    }

    #[test]
    fn test_json_values() {
        let mut e = entry(0, OpType::Insert, "2023-01-01T00:00:00Z");
        e.new_row = Some(r#"{"id":1,"value":"a","other":null}"#.to_string());
        let transactions = to_transactions(&[e], &relations()).unwrap();

        let record = transactions[0].changes[0].record().unwrap();
        assert_eq!(record["id"], Some(ColumnValue::Integer(1)));
        assert_eq!(record["value"], Some(ColumnValue::Text("a".to_string())));
        assert_eq!(record["other"], None);
        assert_eq!(transactions[0].commit_timestamp, 1_672_531_200_000);
    }

    #[test]
    fn test_upsert() {
        let mut e = entry(0, OpType::Upsert, "1970-01-01T00:00:01Z");
        let transactions = to_transactions(&[e.clone()], &relations()).unwrap();
        assert_eq!(transactions[0].changes[0].change_type(), ChangeType::Insert);

        e.old_row = e.new_row.clone();
        let transactions = to_transactions(&[e], &relations()).unwrap();
        assert_eq!(transactions[0].changes[0].change_type(), ChangeType::Update);
    }

    #[test]
    fn test_invalid_entries() {
        let rels = relations();

        let mut e = entry(0, OpType::Insert, "1970-01-01T00:00:01Z");
        e.tablename = "missing".to_string();
        let err = to_transactions(&[e], &rels).unwrap_err();
        assert_eq!(err.code(), SatelliteErrorCode::InvalidOplog);

        let e = entry(0, OpType::Insert, "yesterday");
        assert!(to_transactions(&[e], &rels).is_err());

        let mut e = entry(0, OpType::Update, "1970-01-01T00:00:01Z");
        e.old_row = None;
        assert!(to_transactions(&[e], &rels).is_err());

        let mut e = entry(0, OpType::Insert, "1970-01-01T00:00:01Z");
        e.new_row = Some(r#"{"id":[1]}"#.to_string());
        assert!(to_transactions(&[e], &rels).is_err());

        let e = entry(-1, OpType::Insert, "1970-01-01T00:00:01Z");
        assert!(to_transactions(&[e], &rels).is_err());
    }

    #[test]
    fn test_entry_json_shape() {
        let json = r#"{
            "rowid": 3,
            "namespace": "main",
            "tablename": "parent",
            "optype": "DELETE",
            "primaryKey": "{\"id\":3}",
            "timestamp": "1970-01-01T00:00:01.000Z",
            "oldRow": "{\"id\":3}"
        }"#;
        let e: OplogEntry = serde_json::from_str(json).unwrap();
        assert_eq!(e.optype, OpType::Delete);
        assert!(e.new_row.is_none());
        assert!(e.old_row.is_some());
    }
}
