//! Schema Introspector
//!
//! Derives a read-only description of every table: column names, types,
//! nullability, sensitivity and a handful of representative values.

use crate::error::Result;
use crate::execution::result::Scalar;
use crate::security::policy::AccessPolicy;
use crate::table::{ColumnType, Table, TableSet};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

const MAX_SAMPLE_CHARS: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub sensitive: bool,
    pub samples: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub row_count: usize,
    /// Table carries the owner column and is subject to row-level scope
    pub owner_scoped: bool,
    pub columns: Vec<ColumnDescriptor>,
}

impl TableDescriptor {
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn sensitive_columns(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns.iter().filter(|c| c.sensitive)
    }
}

/// Table name -> ordered columns, in table load order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    owner_column: String,
    tables: Vec<TableDescriptor>,
}

impl SchemaDescriptor {
    pub fn new(owner_column: impl Into<String>, tables: Vec<TableDescriptor>) -> Self {
        Self {
            owner_column: owner_column.into(),
            tables,
        }
    }

    pub fn owner_column(&self) -> &str {
        &self.owner_column
    }

    pub fn tables(&self) -> &[TableDescriptor] {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.table(name).is_some()
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn is_owner_scoped(&self, table: &str) -> bool {
        self.table(table).map(|t| t.owner_scoped).unwrap_or(false)
    }
}

pub struct SchemaIntrospector<'a> {
    policy: &'a AccessPolicy,
    samples_per_column: usize,
}

impl<'a> SchemaIntrospector<'a> {
    pub fn new(policy: &'a AccessPolicy, samples_per_column: usize) -> Self {
        Self {
            policy,
            samples_per_column,
        }
    }

    pub fn introspect(&self, tables: &TableSet) -> Result<SchemaDescriptor> {
        let descriptors = tables
            .iter()
            .map(|t| self.describe_table(t))
            .collect::<Result<Vec<_>>>()?;
        Ok(SchemaDescriptor::new(self.policy.owner_column(), descriptors))
    }

    fn describe_table(&self, table: &Table) -> Result<TableDescriptor> {
        let mut columns = Vec::with_capacity(table.columns().len());
        for def in table.columns() {
            let series = table.frame().column(&def.name)?;
            columns.push(ColumnDescriptor {
                name: def.name.clone(),
                column_type: def.column_type,
                nullable: def.nullable,
                sensitive: self.policy.is_sensitive(&def.name),
                samples: self.sample_values(series, def.column_type)?,
            });
        }

        let owner_scoped = table.has_column(self.policy.owner_column());
        debug!(
            "Introspected {}: {} columns, owner scoped: {}",
            table.name(),
            columns.len(),
            owner_scoped
        );

        Ok(TableDescriptor {
            name: table.name().to_string(),
            row_count: table.row_count(),
            owner_scoped,
            columns,
        })
    }

    fn sample_values(&self, series: &Series, column_type: ColumnType) -> Result<Vec<String>> {
        if self.samples_per_column == 0 {
            return Ok(Vec::new());
        }
        let distinct = series.drop_nulls().unique_stable()?;
        let take = distinct.len().min(self.samples_per_column);

        let mut samples = Vec::with_capacity(take);
        for idx in 0..take {
            let value = Scalar::from_series(&distinct, idx, column_type)?;
            samples.push(truncate(&value.to_string(), MAX_SAMPLE_CHARS));
        }
        Ok(samples)
    }
}

fn truncate(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        value.to_string()
    } else {
        let head: String = value.chars().take(max_chars).collect();
        format!("{}...", head)
    }
}
