//! Result Set - typed rows produced by one executed query

use crate::error::{AnalyticsError, Result};
use crate::table::ColumnType;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Days between 0001-01-01 (CE day 1) and 1970-01-01
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// A single cell value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Boolean(bool),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl Scalar {
    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Integer(v) => Some(*v as f64),
            Scalar::Real(v) => Some(*v),
            _ => None,
        }
    }

    /// Key used for distinct counting; floats compare by bit pattern
    fn distinct_key(&self) -> String {
        match self {
            Scalar::Real(v) => format!("r:{}", v.to_bits()),
            other => format!("{:?}", other),
        }
    }

    /// Read one cell from a polars series
    pub fn from_series(series: &Series, row_idx: usize, column_type: ColumnType) -> Result<Self> {
        let value = series
            .get(row_idx)
            .map_err(|e| AnalyticsError::Execution(format!("Failed to read {}[{}]: {}", series.name(), row_idx, e)))?;
        if matches!(value, AnyValue::Null) {
            return Ok(Scalar::Null);
        }

        let scalar = match column_type {
            ColumnType::Integer => value
                .try_extract::<i64>()
                .map(Scalar::Integer)
                .unwrap_or_else(|_| {
                    value
                        .try_extract::<f64>()
                        .map(Scalar::Real)
                        .unwrap_or(Scalar::Null)
                }),
            ColumnType::Real => value
                .try_extract::<f64>()
                .map(Scalar::Real)
                .unwrap_or(Scalar::Null),
            ColumnType::Boolean => match value {
                AnyValue::Boolean(b) => Scalar::Boolean(b),
                other => Scalar::Text(other.to_string()),
            },
            ColumnType::Date => match value {
                AnyValue::Date(days) => NaiveDate::from_num_days_from_ce_opt(days + UNIX_EPOCH_DAYS_FROM_CE)
                    .map(Scalar::Date)
                    .unwrap_or(Scalar::Null),
                other => Scalar::Text(other.to_string()),
            },
            ColumnType::Timestamp => match value {
                AnyValue::Datetime(v, unit, _) => timestamp_from_unit(v, unit)
                    .map(Scalar::Timestamp)
                    .unwrap_or(Scalar::Null),
                other => Scalar::Text(other.to_string()),
            },
            ColumnType::Text => match value.get_str() {
                Some(s) => Scalar::Text(s.to_string()),
                None => Scalar::Text(value.to_string()),
            },
        };
        Ok(scalar)
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Scalar::Null => serde_json::Value::Null,
            Scalar::Integer(v) => serde_json::Value::from(*v),
            Scalar::Real(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Scalar::Text(s) => serde_json::Value::String(s.clone()),
            Scalar::Boolean(b) => serde_json::Value::Bool(*b),
            Scalar::Date(_) | Scalar::Timestamp(_) => serde_json::Value::String(self.to_string()),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => write!(f, ""),
            Scalar::Integer(v) => write!(f, "{}", v),
            Scalar::Real(v) => write!(f, "{}", v),
            Scalar::Text(s) => write!(f, "{}", s),
            Scalar::Boolean(b) => write!(f, "{}", b),
            Scalar::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Scalar::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}

fn timestamp_from_unit(value: i64, unit: TimeUnit) -> Option<NaiveDateTime> {
    let (secs, nanos) = match unit {
        TimeUnit::Nanoseconds => (value.div_euclid(1_000_000_000), value.rem_euclid(1_000_000_000)),
        TimeUnit::Microseconds => (value.div_euclid(1_000_000), value.rem_euclid(1_000_000) * 1_000),
        TimeUnit::Milliseconds => (value.div_euclid(1_000), value.rem_euclid(1_000) * 1_000_000),
    };
    DateTime::from_timestamp(secs, nanos as u32).map(|dt| dt.naive_utc())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultColumn {
    pub name: String,
    pub column_type: ColumnType,
}

/// Ordered rows plus column metadata; immutable once built
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    columns: Vec<ResultColumn>,
    rows: Vec<Vec<Scalar>>,
}

impl ResultSet {
    pub fn new(columns: Vec<ResultColumn>, rows: Vec<Vec<Scalar>>) -> Result<Self> {
        if let Some(bad) = rows.iter().position(|r| r.len() != columns.len()) {
            return Err(AnalyticsError::Execution(format!(
                "Row {} has {} values but the result has {} columns",
                bad,
                rows[bad].len(),
                columns.len()
            )));
        }
        Ok(Self { columns, rows })
    }

    pub fn from_dataframe(df: &DataFrame) -> Result<Self> {
        let columns: Vec<ResultColumn> = df
            .get_columns()
            .iter()
            .map(|s| ResultColumn {
                name: s.name().to_string(),
                column_type: ColumnType::from_dtype(s.dtype()),
            })
            .collect();

        let series = df.get_columns();
        let mut rows = Vec::with_capacity(df.height());
        for row_idx in 0..df.height() {
            let row = series
                .iter()
                .zip(&columns)
                .map(|(s, c)| Scalar::from_series(s, row_idx, c.column_type))
                .collect::<Result<Vec<_>>>()?;
            rows.push(row);
        }

        Ok(Self { columns, rows })
    }

    pub fn columns(&self) -> &[ResultColumn] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn rows(&self) -> &[Vec<Scalar>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value of `column` in row `row_idx`
    pub fn get(&self, row_idx: usize, column: &str) -> Option<&Scalar> {
        let col_idx = self.column_index(column)?;
        self.rows.get(row_idx).map(|r| &r[col_idx])
    }

    /// All values of one column in row order
    pub fn column_values(&self, column: &str) -> Vec<&Scalar> {
        match self.column_index(column) {
            Some(idx) => self.rows.iter().map(|r| &r[idx]).collect(),
            None => Vec::new(),
        }
    }

    /// Number of distinct non-null values in a column
    pub fn distinct_count(&self, column: &str) -> usize {
        self.column_values(column)
            .into_iter()
            .filter(|v| !v.is_null())
            .map(|v| v.distinct_key())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Rows as JSON objects keyed by column name
    pub fn to_json_rows(&self) -> serde_json::Value {
        let rows: Vec<serde_json::Value> = self
            .rows
            .iter()
            .map(|row| {
                let obj: serde_json::Map<String, serde_json::Value> = self
                    .columns
                    .iter()
                    .zip(row)
                    .map(|(c, v)| (c.name.clone(), v.to_json()))
                    .collect();
                serde_json::Value::Object(obj)
            })
            .collect();

        serde_json::json!({
            "columns": self.columns,
            "rows": rows,
            "row_count": self.rows.len(),
        })
    }

    /// CSV with a header row
    pub fn to_csv(&self) -> Result<String> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(self.columns.iter().map(|c| c.name.as_str()))?;
        for row in &self.rows {
            writer.write_record(row.iter().map(|v| v.to_string()))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| AnalyticsError::Execution(format!("Failed to finish CSV export: {}", e)))?;
        String::from_utf8(bytes)
            .map_err(|e| AnalyticsError::Execution(format!("CSV export is not UTF-8: {}", e)))
    }
}
