// ABOUTME: Column type mapping between SQLite declarations and PostgreSQL
// ABOUTME: Converts dynamically typed SQLite values into typed bind parameters

use crate::timestamp::TimeZoneMode;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Value;
use tokio_postgres::types::ToSql;

/// PostgreSQL column types the sink writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SinkType {
    BigInt,
    Integer,
    SmallInt,
    Double,
    Real,
    Text,
    Bytea,
    Timestamp,
    TimestampTz,
    Boolean,
}

impl SinkType {
    /// Type name used in `CREATE TABLE` and `ADD COLUMN`.
    pub fn sql_name(self) -> &'static str {
        match self {
            SinkType::BigInt => "BIGINT",
            SinkType::Integer => "INTEGER",
            SinkType::SmallInt => "SMALLINT",
            SinkType::Double => "DOUBLE PRECISION",
            SinkType::Real => "REAL",
            SinkType::Text => "TEXT",
            SinkType::Bytea => "BYTEA",
            SinkType::Timestamp => "TIMESTAMP",
            SinkType::TimestampTz => "TIMESTAMPTZ",
            SinkType::Boolean => "BOOLEAN",
        }
    }

    /// Map an `information_schema.columns.data_type` value.
    ///
    /// Types the loader has no conversion for are written as text.
    pub fn from_information_schema(data_type: &str) -> SinkType {
        match data_type.to_lowercase().as_str() {
            "bigint" | "int8" => SinkType::BigInt,
            "integer" | "int4" => SinkType::Integer,
            "smallint" | "int2" => SinkType::SmallInt,
            "double precision" | "float8" => SinkType::Double,
            "real" | "float4" => SinkType::Real,
            "bytea" => SinkType::Bytea,
            "timestamp without time zone" | "timestamp" => SinkType::Timestamp,
            "timestamp with time zone" | "timestamptz" => SinkType::TimestampTz,
            "boolean" | "bool" => SinkType::Boolean,
            other => {
                if !matches!(other, "text" | "character varying" | "character" | "name") {
                    tracing::debug!("Sink column type '{}' is written as text", other);
                }
                SinkType::Text
            }
        }
    }
}

/// Map a SQLite declared type to the sink column type.
///
/// Case-insensitive substring match, first rule wins:
///
/// | Declared contains          | Sink type          |
/// |----------------------------|--------------------|
/// | `INT`                      | `BIGINT`           |
/// | `REAL`, `FLOAT`, `DOUBLE`  | `DOUBLE PRECISION` |
/// | `TEXT`, `CHAR`, `CLOB`     | `TEXT`             |
/// | `BLOB`                     | `BYTEA`            |
/// | `TIME`, `DATE`             | `TIMESTAMP`        |
/// | anything else              | `TEXT`             |
pub fn map_declared_type(declared: &str) -> SinkType {
    let upper = declared.to_uppercase();
    if upper.contains("INT") {
        SinkType::BigInt
    } else if ["REAL", "FLOAT", "DOUBLE"].iter().any(|t| upper.contains(t)) {
        SinkType::Double
    } else if ["TEXT", "CHAR", "CLOB"].iter().any(|t| upper.contains(t)) {
        SinkType::Text
    } else if upper.contains("BLOB") {
        SinkType::Bytea
    } else if upper.contains("TIME") || upper.contains("DATE") {
        SinkType::Timestamp
    } else {
        SinkType::Text
    }
}

/// A source value converted for a specific sink column.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkValue {
    Null(SinkType),
    BigInt(i64),
    Integer(i32),
    SmallInt(i16),
    Double(f64),
    Real(f32),
    Text(String),
    Bytea(Vec<u8>),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Boolean(bool),
}

impl SinkValue {
    /// Box the value as a bind parameter. NULLs keep the column's Rust type
    /// so the driver's type check accepts them.
    pub fn into_param(self) -> Box<dyn ToSql + Sync + Send> {
        match self {
            SinkValue::Null(ty) => match ty {
                SinkType::BigInt => Box::new(None::<i64>),
                SinkType::Integer => Box::new(None::<i32>),
                SinkType::SmallInt => Box::new(None::<i16>),
                SinkType::Double => Box::new(None::<f64>),
                SinkType::Real => Box::new(None::<f32>),
                SinkType::Text => Box::new(None::<String>),
                SinkType::Bytea => Box::new(None::<Vec<u8>>),
                SinkType::Timestamp => Box::new(None::<NaiveDateTime>),
                SinkType::TimestampTz => Box::new(None::<DateTime<Utc>>),
                SinkType::Boolean => Box::new(None::<bool>),
            },
            SinkValue::BigInt(v) => Box::new(v),
            SinkValue::Integer(v) => Box::new(v),
            SinkValue::SmallInt(v) => Box::new(v),
            SinkValue::Double(v) => Box::new(v),
            SinkValue::Real(v) => Box::new(v),
            SinkValue::Text(v) => Box::new(v),
            SinkValue::Bytea(v) => Box::new(v),
            SinkValue::Timestamp(v) => Box::new(v),
            SinkValue::TimestampTz(v) => Box::new(v),
            SinkValue::Boolean(v) => Box::new(v),
        }
    }
}

/// Convert one SQLite value for a column of type `ty`.
pub fn convert_value(value: &Value, ty: SinkType, time_zone: TimeZoneMode) -> Result<SinkValue> {
    if let Value::Null = value {
        return Ok(SinkValue::Null(ty));
    }

    let converted = match ty {
        SinkType::BigInt => SinkValue::BigInt(as_i64(value)?),
        SinkType::Integer => {
            let wide = as_i64(value)?;
            SinkValue::Integer(
                i32::try_from(wide).with_context(|| format!("{} does not fit INTEGER", wide))?,
            )
        }
        SinkType::SmallInt => {
            let wide = as_i64(value)?;
            SinkValue::SmallInt(
                i16::try_from(wide).with_context(|| format!("{} does not fit SMALLINT", wide))?,
            )
        }
        SinkType::Double => SinkValue::Double(as_f64(value)?),
        SinkType::Real => SinkValue::Real(as_f64(value)? as f32),
        SinkType::Text => SinkValue::Text(match value {
            Value::Integer(i) => i.to_string(),
            Value::Real(f) => f.to_string(),
            Value::Text(s) => s.clone(),
            Value::Blob(b) => String::from_utf8_lossy(b).into_owned(),
            Value::Null => return Ok(SinkValue::Null(ty)),
        }),
        SinkType::Bytea => match value {
            Value::Blob(b) => SinkValue::Bytea(b.clone()),
            Value::Text(s) => SinkValue::Bytea(s.as_bytes().to_vec()),
            other => bail!("cannot store {} as BYTEA", describe(other)),
        },
        SinkType::Timestamp => SinkValue::Timestamp(as_instant(value, time_zone)?),
        SinkType::TimestampTz => {
            SinkValue::TimestampTz(time_zone.to_utc(&as_instant(value, time_zone)?))
        }
        SinkType::Boolean => SinkValue::Boolean(as_bool(value)?),
    };

    Ok(converted)
}

fn as_i64(value: &Value) -> Result<i64> {
    match value {
        Value::Integer(i) => Ok(*i),
        Value::Real(f) if f.fract() == 0.0 && f.is_finite() => Ok(*f as i64),
        Value::Text(s) => s
            .trim()
            .parse::<i64>()
            .with_context(|| format!("'{}' is not an integer", s)),
        other => bail!("cannot store {} as an integer", describe(other)),
    }
}

fn as_f64(value: &Value) -> Result<f64> {
    match value {
        Value::Integer(i) => Ok(*i as f64),
        Value::Real(f) => Ok(*f),
        Value::Text(s) => s
            .trim()
            .parse::<f64>()
            .with_context(|| format!("'{}' is not a number", s)),
        other => bail!("cannot store {} as a float", describe(other)),
    }
}

fn as_instant(value: &Value, time_zone: TimeZoneMode) -> Result<NaiveDateTime> {
    match time_zone.ordering_value(value) {
        Some(ts) => Ok(ts),
        None => bail!("cannot interpret {} as a timestamp", describe(value)),
    }
}

fn as_bool(value: &Value) -> Result<bool> {
    match value {
        Value::Integer(i) => Ok(*i != 0),
        Value::Real(f) => Ok(*f != 0.0),
        Value::Text(s) => match s.trim().to_lowercase().as_str() {
            "1" | "t" | "true" | "yes" | "y" => Ok(true),
            "0" | "f" | "false" | "no" | "n" => Ok(false),
            _ => bail!("'{}' is not a boolean", s),
        },
        other => bail!("cannot store {} as BOOLEAN", describe(other)),
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(i) => format!("integer {}", i),
        Value::Real(f) => format!("real {}", f),
        Value::Text(s) => format!("text '{}'", s),
        Value::Blob(b) => format!("blob of {} bytes", b.len()),
    }
}
