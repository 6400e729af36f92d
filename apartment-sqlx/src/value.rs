//! Conversions between [`apartment_core::Value`] and MySQL wire values.

use anyhow::Result;
use apartment_core::{Row, Statement, Value};
use sqlx::mysql::{MySql, MySqlArguments, MySqlRow};
use sqlx::query::Query;
use sqlx::types::chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use sqlx::{Column as _, Row as _, TypeInfo as _, ValueRef as _};

pub(crate) fn bind(stmt: &Statement) -> Query<'_, MySql, MySqlArguments> {
    let mut query = sqlx::query(&stmt.text);
    for value in &stmt.params {
        query = match value {
            Value::Null => query.bind(None::<String>),
            Value::Bool(v) => query.bind(*v),
            Value::Int(v) => query.bind(*v),
            Value::UInt(v) => query.bind(*v),
            Value::Float(v) => query.bind(*v),
            Value::Text(v) => query.bind(v.as_str()),
            Value::Bytes(v) => query.bind(v.as_slice()),
        };
    }
    query
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Bool,
    Int,
    UInt,
    Float32,
    Float,
    Bytes,
    DateTime,
    Date,
    Time,
    Text,
}

fn column_kind(type_name: &str) -> ColumnKind {
    let upper = type_name.to_ascii_uppercase();
    let base = upper.split_whitespace().next().unwrap_or_default();
    let integer = matches!(base, "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT");
    match base {
        "BOOLEAN" => ColumnKind::Bool,
        _ if integer && upper.ends_with(" UNSIGNED") => ColumnKind::UInt,
        _ if integer => ColumnKind::Int,
        "FLOAT" => ColumnKind::Float32,
        "DOUBLE" => ColumnKind::Float,
        "DATETIME" | "TIMESTAMP" => ColumnKind::DateTime,
        "DATE" => ColumnKind::Date,
        "TIME" => ColumnKind::Time,
        "BIT" | "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB"
        | "GEOMETRY" => ColumnKind::Bytes,
        // DECIMAL, JSON, ENUM, SET and the character types arrive as text.
        _ => ColumnKind::Text,
    }
}

fn decode_column(row: &MySqlRow, idx: usize) -> Result<Value> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let kind = column_kind(raw.type_info().name());

    let value = match kind {
        ColumnKind::Bool => Value::Bool(row.try_get(idx)?),
        ColumnKind::Int => Value::Int(row.try_get(idx)?),
        ColumnKind::UInt => Value::UInt(row.try_get(idx)?),
        ColumnKind::Float32 => Value::Float(f64::from(row.try_get::<f32, _>(idx)?)),
        ColumnKind::Float => Value::Float(row.try_get(idx)?),
        ColumnKind::Bytes => Value::Bytes(row.try_get_unchecked(idx)?),
        ColumnKind::DateTime => Value::Text(row.try_get::<NaiveDateTime, _>(idx)?.to_string()),
        ColumnKind::Date => Value::Text(row.try_get::<NaiveDate, _>(idx)?.to_string()),
        ColumnKind::Time => Value::Text(row.try_get::<NaiveTime, _>(idx)?.to_string()),
        ColumnKind::Text => Value::Text(row.try_get_unchecked(idx)?),
    };
    Ok(value)
}

pub(crate) fn decode_row(row: &MySqlRow) -> Result<Row> {
    let columns = row
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    let values = (0..row.len())
        .map(|idx| decode_column(row, idx))
        .collect::<Result<Vec<_>>>()?;
    Ok(Row { columns, values })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_mysql_types() {
        assert_eq!(column_kind("BOOLEAN"), ColumnKind::Bool);
        assert_eq!(column_kind("INT"), ColumnKind::Int);
        assert_eq!(column_kind("BIGINT UNSIGNED"), ColumnKind::UInt);
        assert_eq!(column_kind("tinyint unsigned"), ColumnKind::UInt);
        assert_eq!(column_kind("FLOAT"), ColumnKind::Float32);
        assert_eq!(column_kind("DOUBLE"), ColumnKind::Float);
        assert_eq!(column_kind("TIMESTAMP"), ColumnKind::DateTime);
        assert_eq!(column_kind("VARBINARY"), ColumnKind::Bytes);
        assert_eq!(column_kind("DECIMAL"), ColumnKind::Text);
        assert_eq!(column_kind("VARCHAR"), ColumnKind::Text);
        assert_eq!(column_kind("JSON"), ColumnKind::Text);
    }

    #[test]
    fn binds_every_parameter() {
        let stmt = Statement::new("INSERT INTO t VALUES (?, ?, ?, ?)")
            .bind("acme")
            .bind(7_i64)
            .bind(Value::Null)
            .bind(vec![1_u8, 2]);
        let query = bind(&stmt);
        assert_eq!(sqlx::Execute::sql(&query), stmt.text);
    }
}
