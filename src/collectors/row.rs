//! Uniform row representation and the conversion from driver rows into it.

use super::columns::ColumnRole;
use crate::{config::DEFAULT_TIMESTAMP_FORMAT, errors::Error};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::{
    Column, ColumnIndex, Decode, Row as SqlxRow, Type, TypeInfo as _,
    mysql::MySqlRow,
    postgres::{PgRow, types::Oid},
    sqlite::SqliteRow,
    types::{Decimal, Uuid, ipnetwork::IpNetwork},
};
use std::{collections::HashMap, fmt};

/// A scanned column value, tagged with its role. `None` means SQL NULL:
/// present in the row but invalid, never defaulted to an empty or zero value.
#[derive(Clone, Debug, PartialEq)]
pub enum ColumnValue {
    Key(Option<String>),
    Value(Option<f64>),
    Time(Option<DateTime<Utc>>),
}

impl ColumnValue {
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        match self {
            Self::Key(v) => v.is_some(),
            Self::Value(v) => v.is_some(),
            Self::Time(v) => v.is_some(),
        }
    }

    /// String form used for row-filter comparisons, `None` for NULL.
    #[must_use]
    pub fn to_filter_string(&self) -> Option<String> {
        match self {
            Self::Key(v) => v.clone(),
            Self::Value(v) => v.map(|f| f.to_string()),
            Self::Time(v) => v.map(|t| format_timestamp(&t)),
        }
    }
}

/// One result row: column name to typed, nullable value.
pub type Row = HashMap<String, ColumnValue>;

/// Renders a timestamp as `YYYY-MM-DD HH:MM:SS.mmm UTC`.
#[must_use]
pub fn format_timestamp(t: &DateTime<Utc>) -> String {
    t.format(DEFAULT_TIMESTAMP_FORMAT).to_string()
}

/// Text layouts accepted for a `Time` column delivered as a string.
const TIME_LAYOUTS: &[&str] = &[
    DEFAULT_TIMESTAMP_FORMAT,
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
];

/// Parse a textual timestamp as produced by common drivers. Offsets are
/// honoured when present, otherwise UTC is assumed.
#[must_use]
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.to_utc());
    }
    if let Ok(t) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(t.to_utc());
    }
    TIME_LAYOUTS
        .iter()
        .find_map(|layout| NaiveDateTime::parse_from_str(s, layout).ok())
        .map(|t| t.and_utc())
}

/// A driver-native result row.
pub enum DbRow {
    Postgres(PgRow),
    MySql(MySqlRow),
    Sqlite(SqliteRow),
}

impl DbRow {
    /// Names of the row's columns, in result order.
    #[must_use]
    pub fn columns(&self) -> Vec<String> {
        match self {
            Self::Postgres(row) => column_names(row.columns()),
            Self::MySql(row) => column_names(row.columns()),
            Self::Sqlite(row) => column_names(row.columns()),
        }
    }
}

impl fmt::Debug for DbRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbRow")
            .field("columns", &self.columns())
            .finish_non_exhaustive()
    }
}

#[must_use]
pub fn column_names<C: Column>(columns: &[C]) -> Vec<String> {
    columns.iter().map(|c| c.name().to_string()).collect()
}

/// Read column `index` of `row` into the slot matching `role`.
///
/// Only classified columns are ever read. A native timestamp read into a
/// `Key` slot stays a timestamp: it stringifies exactly like a key would and
/// lets lag calculations skip parsing.
///
/// # Errors
///
/// Returns [`Error::Scan`] when the driver value cannot be represented in the slot
pub fn scan_column(
    row: &DbRow,
    index: usize,
    column: &str,
    role: ColumnRole,
) -> Result<ColumnValue, Error> {
    let raw = match row {
        DbRow::Postgres(row) => decode_postgres(row, index),
        DbRow::MySql(row) => decode_mysql(row, index),
        DbRow::Sqlite(row) => decode_sqlite(row, index),
    }
    .map_err(|reason| Error::Scan {
        column: column.to_string(),
        reason,
    })?;

    into_slot(raw, column, role)
}

#[derive(Clone, Debug, PartialEq)]
enum Raw {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    /// Exact decimal or unsigned integer, kept as text.
    Numeric(String),
    Time(DateTime<Utc>),
}

fn into_slot(raw: Option<Raw>, column: &str, role: ColumnRole) -> Result<ColumnValue, Error> {
    let scan_error = |reason: String| Error::Scan {
        column: column.to_string(),
        reason,
    };

    let Some(raw) = raw else {
        return Ok(match role {
            ColumnRole::Key => ColumnValue::Key(None),
            ColumnRole::Value => ColumnValue::Value(None),
            ColumnRole::Time => ColumnValue::Time(None),
        });
    };

    match role {
        ColumnRole::Key => Ok(match raw {
            Raw::Text(s) | Raw::Numeric(s) => ColumnValue::Key(Some(s)),
            Raw::Int(n) => ColumnValue::Key(Some(n.to_string())),
            Raw::Float(f) => ColumnValue::Key(Some(f.to_string())),
            Raw::Bool(b) => ColumnValue::Key(Some(b.to_string())),
            Raw::Time(t) => ColumnValue::Time(Some(t)),
        }),
        ColumnRole::Value => match raw {
            #[allow(clippy::cast_precision_loss)]
            Raw::Int(n) => Ok(ColumnValue::Value(Some(n as f64))),
            Raw::Float(f) => Ok(ColumnValue::Value(Some(f))),
            Raw::Text(s) | Raw::Numeric(s) => s
                .trim()
                .parse::<f64>()
                .map(|f| ColumnValue::Value(Some(f)))
                .map_err(|e| scan_error(format!("converting {s:?} to float: {e}"))),
            Raw::Bool(_) => Err(scan_error("cannot convert boolean to float".to_string())),
            Raw::Time(_) => Err(scan_error("cannot convert timestamp to float".to_string())),
        },
        ColumnRole::Time => match raw {
            Raw::Time(t) => Ok(ColumnValue::Time(Some(t))),
            Raw::Text(s) => parse_timestamp(&s)
                .map(|t| ColumnValue::Time(Some(t)))
                .ok_or_else(|| scan_error(format!("unrecognized timestamp {s:?}"))),
            Raw::Int(secs) => DateTime::from_timestamp(secs, 0)
                .map(|t| ColumnValue::Time(Some(t)))
                .ok_or_else(|| scan_error(format!("timestamp {secs} out of range"))),
            Raw::Float(secs) => from_float_seconds(secs)
                .map(|t| ColumnValue::Time(Some(t)))
                .ok_or_else(|| scan_error(format!("timestamp {secs} out of range"))),
            Raw::Numeric(s) => s
                .parse::<f64>()
                .ok()
                .and_then(from_float_seconds)
                .map(|t| ColumnValue::Time(Some(t)))
                .ok_or_else(|| scan_error(format!("unrecognized timestamp {s:?}"))),
            Raw::Bool(_) => Err(scan_error("cannot convert boolean to timestamp".to_string())),
        },
    }
}

#[allow(clippy::cast_possible_truncation)]
fn from_float_seconds(secs: f64) -> Option<DateTime<Utc>> {
    if secs.is_finite() {
        DateTime::from_timestamp_millis((secs * 1000.0) as i64)
    } else {
        None
    }
}

/// `Some` if column `index` decodes as `T` (NULL included), `None` on a
/// type mismatch.
fn get<'r, R, T>(row: &'r R, index: usize) -> Option<Option<T>>
where
    R: SqlxRow,
    usize: ColumnIndex<R>,
    T: Decode<'r, R::Database> + Type<R::Database>,
{
    row.try_get::<Option<T>, usize>(index).ok()
}

fn unsupported<R>(row: &R, index: usize) -> String
where
    R: SqlxRow,
    usize: ColumnIndex<R>,
{
    row.try_column(index).map_or_else(
        |e| e.to_string(),
        |c| format!("unsupported column type {}", c.type_info().name()),
    )
}

fn midnight(date: NaiveDate) -> Raw {
    Raw::Time(date.and_time(NaiveTime::MIN).and_utc())
}

fn decode_postgres(row: &PgRow, index: usize) -> Result<Option<Raw>, String> {
    get::<_, String>(row, index)
        .map(|v| v.map(Raw::Text))
        .or_else(|| get::<_, i64>(row, index).map(|v| v.map(Raw::Int)))
        .or_else(|| get::<_, i32>(row, index).map(|v| v.map(|n| Raw::Int(n.into()))))
        .or_else(|| get::<_, i16>(row, index).map(|v| v.map(|n| Raw::Int(n.into()))))
        .or_else(|| get::<_, Oid>(row, index).map(|v| v.map(|oid| Raw::Int(oid.0.into()))))
        .or_else(|| get::<_, f64>(row, index).map(|v| v.map(Raw::Float)))
        .or_else(|| get::<_, f32>(row, index).map(|v| v.map(|f| Raw::Float(f.into()))))
        .or_else(|| get::<_, bool>(row, index).map(|v| v.map(Raw::Bool)))
        .or_else(|| {
            get::<_, Decimal>(row, index).map(|v| v.map(|d| Raw::Numeric(d.to_string())))
        })
        .or_else(|| get::<_, DateTime<Utc>>(row, index).map(|v| v.map(Raw::Time)))
        .or_else(|| {
            get::<_, NaiveDateTime>(row, index).map(|v| v.map(|t| Raw::Time(t.and_utc())))
        })
        .or_else(|| get::<_, NaiveDate>(row, index).map(|v| v.map(midnight)))
        .or_else(|| get::<_, Uuid>(row, index).map(|v| v.map(|u| Raw::Text(u.to_string()))))
        .or_else(|| {
            get::<_, IpNetwork>(row, index).map(|v| v.map(|n| Raw::Text(n.to_string())))
        })
        .ok_or_else(|| unsupported(row, index))
}

fn decode_mysql(row: &MySqlRow, index: usize) -> Result<Option<Raw>, String> {
    get::<_, String>(row, index)
        .map(|v| v.map(Raw::Text))
        .or_else(|| get::<_, i64>(row, index).map(|v| v.map(Raw::Int)))
        .or_else(|| get::<_, u64>(row, index).map(|v| v.map(|n| Raw::Numeric(n.to_string()))))
        .or_else(|| get::<_, f64>(row, index).map(|v| v.map(Raw::Float)))
        .or_else(|| get::<_, f32>(row, index).map(|v| v.map(|f| Raw::Float(f.into()))))
        .or_else(|| {
            get::<_, Decimal>(row, index).map(|v| v.map(|d| Raw::Numeric(d.to_string())))
        })
        .or_else(|| get::<_, DateTime<Utc>>(row, index).map(|v| v.map(Raw::Time)))
        .or_else(|| {
            get::<_, NaiveDateTime>(row, index).map(|v| v.map(|t| Raw::Time(t.and_utc())))
        })
        .or_else(|| get::<_, NaiveDate>(row, index).map(|v| v.map(midnight)))
        .ok_or_else(|| unsupported(row, index))
}

fn decode_sqlite(row: &SqliteRow, index: usize) -> Result<Option<Raw>, String> {
    get::<_, String>(row, index)
        .map(|v| v.map(Raw::Text))
        .or_else(|| get::<_, i64>(row, index).map(|v| v.map(Raw::Int)))
        .or_else(|| get::<_, f64>(row, index).map(|v| v.map(Raw::Float)))
        .or_else(|| get::<_, bool>(row, index).map(|v| v.map(Raw::Bool)))
        .ok_or_else(|| unsupported(row, index))
}
