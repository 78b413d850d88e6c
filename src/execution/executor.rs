//! Query Executor
//!
//! Runs a scoped query against the in-memory tables. Every execution gets a
//! fresh polars `SQLContext`; the tables themselves are shared and never
//! written to.

use crate::error::{AnalyticsError, Result};
use crate::execution::result::ResultSet;
use crate::security::access_control::ScopedQuery;
use crate::security::query_guards::{parse_single_query, referenced_tables};
use crate::table::TableSet;
use async_trait::async_trait;
use polars::prelude::*;
use polars::sql::SQLContext;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, query: &ScopedQuery) -> Result<ResultSet>;
}

pub struct PolarsExecutor {
    tables: Arc<TableSet>,
    timeout: Duration,
}

impl PolarsExecutor {
    pub fn new(tables: Arc<TableSet>, timeout: Duration) -> Self {
        Self { tables, timeout }
    }

    /// Build the lazy plan: base query, owner predicate, row cap
    fn plan(&self, query: &ScopedQuery) -> Result<LazyFrame> {
        // The SQL reaching this point has been validated already; a second
        // parse keeps anything but a single read-only query out of polars.
        let parsed = parse_single_query(query.base_sql())
            .map_err(|e| AnalyticsError::Execution(format!("refusing to execute: {}", e)))?;
        let tables = referenced_tables(&parsed)
            .map_err(|e| AnalyticsError::Execution(format!("refusing to execute: {}", e)))?;

        let mut ctx = SQLContext::new();
        for name in &tables {
            let table = self
                .tables
                .get(name)
                .ok_or_else(|| AnalyticsError::Execution(format!("table '{}' is not loaded", name)))?;
            ctx.register(name, table.frame().clone().lazy());
        }

        let mut plan = ctx
            .execute(query.base_sql())
            .map_err(|e| AnalyticsError::Execution(e.to_string()))?;

        if let Some(scope) = query.scope() {
            plan = plan.filter(
                col(&scope.column)
                    .cast(DataType::String)
                    .eq(lit(scope.value.clone())),
            );
        }

        Ok(plan.limit(query.row_cap() as IdxSize))
    }
}

#[async_trait]
impl ExecutionEngine for PolarsExecutor {
    fn name(&self) -> &'static str {
        "polars"
    }

    async fn execute(&self, query: &ScopedQuery) -> Result<ResultSet> {
        let start = Instant::now();
        let plan = self.plan(query)?;

        let collect = tokio::task::spawn_blocking(move || plan.collect());
        let mut df = match tokio::time::timeout(self.timeout, collect).await {
            Ok(Ok(Ok(df))) => df,
            Ok(Ok(Err(e))) => return Err(AnalyticsError::Execution(e.to_string())),
            Ok(Err(join_error)) => {
                return Err(AnalyticsError::Execution(format!("query worker failed: {}", join_error)))
            }
            Err(_) => {
                return Err(AnalyticsError::Execution(format!(
                    "query exceeded the {}s time limit",
                    self.timeout.as_secs()
                )))
            }
        };

        let hidden: Vec<String> = df
            .get_column_names()
            .into_iter()
            .filter(|name| query.hides(name))
            .map(|name| name.to_string())
            .collect();
        for column in hidden {
            debug!(column = %column, "Removing restricted column from result");
            df = df.drop(&column).map_err(|e| AnalyticsError::Execution(e.to_string()))?;
        }

        let result = ResultSet::from_dataframe(&df)?;
        info!(
            engine = self.name(),
            rows = result.row_count(),
            columns = result.columns().len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Query executed"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::CandidateQuery;
    use crate::schema::SchemaIntrospector;
    use crate::security::{AccessControlFilter, AccessPolicy, Role, SafetyValidator, User};

    fn tables() -> Arc<TableSet> {
        let deals = df! {
            "deal_id" => &[1i64, 2, 3, 4],
            "sales_rep_id" => &["SR001", "SR002", "SR001", "SR003"],
            "amount" => &[100.0f64, 250.0, 75.5, 40.0],
            "commission_amount" => &[10.0f64, 25.0, 7.5, 4.0],
        }
        .unwrap();
        Arc::new(TableSet::from_frames(vec![("deals", deals)]).unwrap())
    }

    fn policy() -> AccessPolicy {
        AccessPolicy::new(
            "sales_rep_id".to_string(),
            vec!["commission_amount".to_string()],
            vec![Role::admin(), Role::sales_rep()],
        )
    }

    fn scoped(sql: &str, user: &User, role: &Role) -> ScopedQuery {
        let tables = tables();
        let policy = policy();
        let schema = SchemaIntrospector::new(&policy, 0).introspect(&tables).unwrap();
        let validated = SafetyValidator::new()
            .validate(&CandidateQuery::new(sql), &schema)
            .unwrap();
        AccessControlFilter::new(&schema, &policy)
            .scope(&validated, user, role)
            .unwrap()
    }

    fn executor() -> PolarsExecutor {
        PolarsExecutor::new(tables(), Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_owner_predicate_and_hidden_columns_applied() {
        let rep = User::new("sam", "sales_rep", Some("SR001".to_string()));
        let query = scoped("SELECT * FROM deals", &rep, &Role::sales_rep());
        let result = executor().execute(&query).await.unwrap();

        assert_eq!(result.row_count(), 2);
        assert!(result.column_index("commission_amount").is_none());
        for row in 0..result.row_count() {
            assert_eq!(result.get(row, "sales_rep_id").unwrap().to_string(), "SR001");
        }
    }

    #[tokio::test]
    async fn test_owner_predicate_runs_before_base_limit() {
        let rep = User::new("sam", "sales_rep", Some("SR001".to_string()));
        let query = scoped(
            "SELECT deal_id, sales_rep_id, amount FROM deals ORDER BY amount DESC LIMIT 1",
            &rep,
            &Role::sales_rep(),
        );
        let result = executor().execute(&query).await.unwrap();
        assert_eq!(result.row_count(), 1);
        assert_eq!(result.get(0, "deal_id").and_then(|v| v.as_f64()), Some(1.0));
    }

    #[tokio::test]
    async fn test_joined_copies_of_hidden_columns_removed() {
        let manager = User::new("max", "manager", None);
        let query = scoped(
            "SELECT * FROM deals a JOIN deals b ON a.deal_id = b.deal_id",
            &manager,
            &Role::manager(),
        );
        assert!(query.hides("commission_amount_right"));
        assert!(query.hides("COMMISSION_AMOUNT"));
        assert!(!query.hides("amount_right"));

        let result = executor().execute(&query).await.unwrap();
        assert_eq!(result.row_count(), 4);
        assert!(result.column_index("amount").is_some());
        assert!(result
            .column_names()
            .iter()
            .all(|name| !name.starts_with("commission_amount")));
    }

    #[tokio::test]
    async fn test_row_cap_applied() {
        let admin = User::new("ada", "admin", None);
        let query = scoped("SELECT * FROM deals LIMIT 3", &admin, &Role::admin());
        let result = executor().execute(&query).await.unwrap();
        assert_eq!(result.row_count(), 3);
    }

    #[tokio::test]
    async fn test_empty_result_is_not_an_error() {
        let admin = User::new("ada", "admin", None);
        let query = scoped("SELECT deal_id FROM deals WHERE amount > 1000", &admin, &Role::admin());
        let result = executor().execute(&query).await.unwrap();
        assert!(result.is_empty());
        assert_eq!(result.column_names(), vec!["deal_id"]);
    }

    #[tokio::test]
    async fn test_unknown_column_is_execution_error() {
        let admin = User::new("ada", "admin", None);
        let query = scoped("SELECT no_such_column FROM deals", &admin, &Role::admin());
        let err = executor().execute(&query).await.unwrap_err();
        assert!(matches!(err, AnalyticsError::Execution(_)));
    }

    #[tokio::test]
    async fn test_tables_unchanged_after_execution() {
        let tables = tables();
        let before = tables.get("deals").unwrap().frame().clone();
        let executor = PolarsExecutor::new(tables.clone(), Duration::from_secs(10));
        let admin = User::new("ada", "admin", None);
        let query = scoped("SELECT amount * 2 AS doubled FROM deals", &admin, &Role::admin());
        executor.execute(&query).await.unwrap();
        assert!(tables.get("deals").unwrap().frame().equals(&before));
    }
}
