//! Tables
//!
//! The in-memory table set every question is answered against. Tables are
//! loaded once at startup and shared read-only between sessions.

use crate::error::{AnalyticsError, Result};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Scalar column type as seen by the generator and the visualization selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Date,
    Timestamp,
    Boolean,
}

impl ColumnType {
    pub fn from_dtype(dtype: &DataType) -> Self {
        if dtype.is_integer() {
            return ColumnType::Integer;
        }
        if dtype.is_float() {
            return ColumnType::Real;
        }
        match dtype {
            DataType::Boolean => ColumnType::Boolean,
            DataType::Date => ColumnType::Date,
            DataType::Datetime(_, _) => ColumnType::Timestamp,
            _ => ColumnType::Text,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Real)
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self, ColumnType::Date | ColumnType::Timestamp)
    }

    pub fn is_categorical(&self) -> bool {
        matches!(self, ColumnType::Text | ColumnType::Boolean)
    }

    /// SQL-flavoured name used in the schema context
    pub fn sql_name(&self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "DECIMAL",
            ColumnType::Text => "VARCHAR",
            ColumnType::Date => "DATE",
            ColumnType::Timestamp => "TIMESTAMP",
            ColumnType::Boolean => "BOOLEAN",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sql_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
}

/// A named, ordered set of typed columns backed by a DataFrame
#[derive(Debug, Clone)]
pub struct Table {
    name: String,
    columns: Vec<ColumnDef>,
    frame: DataFrame,
}

impl Table {
    pub fn new(name: impl Into<String>, frame: DataFrame) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(AnalyticsError::Config("Table name must not be empty".to_string()));
        }

        let columns = frame
            .get_columns()
            .iter()
            .map(|series| ColumnDef {
                name: series.name().to_string(),
                column_type: ColumnType::from_dtype(series.dtype()),
                nullable: series.null_count() > 0,
            })
            .collect();

        Ok(Self { name, columns, frame })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    pub fn row_count(&self) -> usize {
        self.frame.height()
    }
}

/// The immutable set of tables available to queries, in load order
#[derive(Debug, Clone, Default)]
pub struct TableSet {
    tables: Vec<Table>,
    index: HashMap<String, usize>,
}

impl TableSet {
    pub fn new(tables: Vec<Table>) -> Result<Self> {
        let mut index = HashMap::new();
        for (i, table) in tables.iter().enumerate() {
            if index.insert(table.name().to_string(), i).is_some() {
                return Err(AnalyticsError::Config(format!(
                    "Duplicate table name: {}",
                    table.name()
                )));
            }
        }
        Ok(Self { tables, index })
    }

    /// Build a table set from named in-memory frames
    pub fn from_frames<I, S>(frames: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, DataFrame)>,
        S: Into<String>,
    {
        let tables = frames
            .into_iter()
            .map(|(name, frame)| Table::new(name, frame))
            .collect::<Result<Vec<_>>>()?;
        Self::new(tables)
    }

    pub fn get(&self, name: &str) -> Option<&Table> {
        self.index.get(name).map(|&i| &self.tables[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Table> {
        self.tables.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Supplies the initial table set at startup
pub trait TableSource {
    fn load(&self) -> Result<TableSet>;
}

/// Loads every `*.csv` file in a directory as a table named after the file stem
pub struct CsvTableSource {
    data_dir: PathBuf,
}

impl CsvTableSource {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    fn read_csv(path: &Path) -> Result<DataFrame> {
        LazyCsvReader::new(path)
            .with_has_header(true)
            .with_try_parse_dates(true)
            .with_infer_schema_length(Some(1000))
            .finish()
            .map_err(|e| AnalyticsError::Polars(format!("Failed to read CSV {}: {}", path.display(), e)))?
            .collect()
            .map_err(|e| AnalyticsError::Polars(format!("Failed to collect {}: {}", path.display(), e)))
    }
}

impl TableSource for CsvTableSource {
    fn load(&self) -> Result<TableSet> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.data_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("csv"))
            .collect();
        paths.sort();

        let mut tables = Vec::with_capacity(paths.len());
        for path in paths {
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| AnalyticsError::Config(format!("Bad file name: {}", path.display())))?
                .to_string();
            let frame = Self::read_csv(&path)?;
            debug!("Loaded table {} ({} rows) from {}", name, frame.height(), path.display());
            tables.push(Table::new(name, frame)?);
        }

        if tables.is_empty() {
            return Err(AnalyticsError::Config(format!(
                "No CSV tables found in {}",
                self.data_dir.display()
            )));
        }

        info!("Loaded {} tables from {}", tables.len(), self.data_dir.display());
        TableSet::new(tables)
    }
}
