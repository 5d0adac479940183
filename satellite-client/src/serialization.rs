//! Row serialization: records to null-bitmask + typed column values.
//!
//! Column encodings, matched case-insensitively on the column type:
//!
//! | type                       | encoding                    |
//! |----------------------------|-----------------------------|
//! | `TEXT`, `UUID`, `VARCHAR`  | UTF-8 bytes                 |
//! | `INTEGER`, `INT`, `INT4`   | 4-byte big-endian `i32`     |
//! | `INT8`, `BIGINT`           | 8-byte big-endian `i64`     |
//! | `REAL`, `FLOAT8`, `DOUBLE` | 8-byte big-endian IEEE-754  |
//!
//! Null columns keep a zero-length placeholder in `values` and set their
//! bit in the bitmask. Unsupported types are an error, never a guess.

use crate::error::SatelliteError;
use crate::types::{ColumnValue, Record, Relation, RelationColumn};
use satellite_protocol::message::SatOpRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnEncoding {
    Text,
    Int4,
    Int8,
    Float8,
}

impl ColumnEncoding {
    fn for_column(column: &RelationColumn) -> Result<Self, SatelliteError> {
        match column.column_type.to_ascii_uppercase().as_str() {
            "TEXT" | "UUID" | "VARCHAR" => Ok(ColumnEncoding::Text),
            "INTEGER" | "INT" | "INT4" => Ok(ColumnEncoding::Int4),
            "INT8" | "BIGINT" => Ok(ColumnEncoding::Int8),
            "REAL" | "FLOAT8" | "DOUBLE" => Ok(ColumnEncoding::Float8),
            _ => Err(SatelliteError::UnknownDataType(format!(
                "can't handle column '{}' of type {}",
                column.name, column.column_type
            ))),
        }
    }
}

/// Serializes `record` against the column order of `relation`.
///
/// Columns missing from the record, or explicitly null, are encoded as null.
/// Record keys that are not relation columns are ignored.
pub fn serialize_row(record: &Record, relation: &Relation) -> Result<SatOpRow, SatelliteError> {
    let mut nulls_bitmask = vec![0u8; relation.columns.len().div_ceil(8)];
    let mut values = Vec::with_capacity(relation.columns.len());

    for (i, column) in relation.columns.iter().enumerate() {
        let encoding = ColumnEncoding::for_column(column)?;
        match record.get(&column.name) {
            Some(Some(value)) => values.push(serialize_value(value, column, encoding)?),
            _ => {
                values.push(Vec::new());
                nulls_bitmask[i / 8] |= 1 << (i % 8);
            }
        }
    }

    Ok(SatOpRow {
        nulls_bitmask,
        values,
    })
}

/// Deserializes a wire row; an absent row yields `None`.
///
/// Every relation column appears in the result, null columns as `None`.
pub fn deserialize_row(
    row: Option<&SatOpRow>,
    relation: &Relation,
) -> Result<Option<Record>, SatelliteError> {
    let Some(row) = row else {
        return Ok(None);
    };

    if row.values.len() != relation.columns.len() {
        return Err(SatelliteError::ProtocolViolation(format!(
            "row for relation {} has {} values, expected {}",
            relation.id,
            row.values.len(),
            relation.columns.len()
        )));
    }

    let mut record = Record::new();
    for (i, (column, bytes)) in relation.columns.iter().zip(&row.values).enumerate() {
        let encoding = ColumnEncoding::for_column(column)?;
        let value = if is_null(&row.nulls_bitmask, i) {
            None
        } else {
            Some(deserialize_value(bytes, column, encoding)?)
        };
        record.insert(column.name.clone(), value);
    }
    Ok(Some(record))
}

fn is_null(bitmask: &[u8], i: usize) -> bool {
    bitmask
        .get(i / 8)
        .map(|byte| byte & (1 << (i % 8)) != 0)
        .unwrap_or(false)
}

fn serialize_value(
    value: &ColumnValue,
    column: &RelationColumn,
    encoding: ColumnEncoding,
) -> Result<Vec<u8>, SatelliteError> {
    let invalid = |reason: String| SatelliteError::InvalidColumnValue {
        column: column.name.clone(),
        reason,
    };

    match (encoding, value) {
        (ColumnEncoding::Text, ColumnValue::Text(s)) => Ok(s.as_bytes().to_vec()),
        (ColumnEncoding::Int4, ColumnValue::Integer(n)) => i32::try_from(*n)
            .map(|n| n.to_be_bytes().to_vec())
            .map_err(|_| invalid(format!("{} does not fit in {}", n, column.column_type))),
        (ColumnEncoding::Int8, ColumnValue::Integer(n)) => Ok(n.to_be_bytes().to_vec()),
        (ColumnEncoding::Float8, ColumnValue::Real(x)) => Ok(x.to_be_bytes().to_vec()),
        (ColumnEncoding::Float8, ColumnValue::Integer(n)) => Ok((*n as f64).to_be_bytes().to_vec()),
        (_, other) => Err(invalid(format!(
            "{:?} is not a {} value",
            other, column.column_type
        ))),
    }
}

fn deserialize_value(
    bytes: &[u8],
    column: &RelationColumn,
    encoding: ColumnEncoding,
) -> Result<ColumnValue, SatelliteError> {
    let width_error = |expected: usize| {
        SatelliteError::ProtocolViolation(format!(
            "column '{}' of type {} has {} bytes, expected {}",
            column.name,
            column.column_type,
            bytes.len(),
            expected
        ))
    };

    match encoding {
        ColumnEncoding::Text => String::from_utf8(bytes.to_vec())
            .map(ColumnValue::Text)
            .map_err(|_| {
                SatelliteError::ProtocolViolation(format!(
                    "column '{}' is not valid UTF-8",
                    column.name
                ))
            }),
        ColumnEncoding::Int4 => {
            let raw: [u8; 4] = bytes.try_into().map_err(|_| width_error(4))?;
            Ok(ColumnValue::Integer(i32::from_be_bytes(raw) as i64))
        }
        ColumnEncoding::Int8 => {
            let raw: [u8; 8] = bytes.try_into().map_err(|_| width_error(8))?;
            Ok(ColumnValue::Integer(i64::from_be_bytes(raw)))
        }
        ColumnEncoding::Float8 => {
            let raw: [u8; 8] = bytes.try_into().map_err(|_| width_error(8))?;
            Ok(ColumnValue::Real(f64::from_be_bytes(raw)))
        }
    }
}
