//! Access Control
//!
//! Turns a validated query into a scoped one for a given user and role:
//! - row cap: LIMIT is clamped to the role's `max_query_rows`
//! - row scope: roles without `can_view_all_rows` only see rows whose owner
//!   column equals the user's owned scope
//! - column scope: sensitive columns are hidden from roles without
//!   `can_view_sensitive`, and naming one explicitly fails the request
//!
//! When a query's shape prevents the scope from being applied safely the
//! request fails with `ScopeUnenforceable` instead of running under-scoped.

use crate::error::{AnalyticsError, Result};
use crate::schema::SchemaDescriptor;
use crate::security::policy::{AccessPolicy, Role};
use crate::security::query_guards::ValidatedQuery;
use crate::security::user_manager::User;
use crate::visualization::VisualizationHint;
use serde::{Deserialize, Serialize};
use sqlparser::ast::{
    visit_expressions, visit_relations, BinaryOperator, Expr, Ident, Query, Select, SelectItem, SetExpr,
    TableFactor, Value, Visit, Visitor,
};
use std::collections::BTreeSet;
use std::ops::ControlFlow;
use tracing::debug;

/// Suffix polars gives the right-hand copy of a duplicated join column
const JOIN_SUFFIX: &str = "_right";

/// Equality predicate restricting rows to one owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowScope {
    pub column: String,
    pub value: String,
}

/// A validated query plus the restrictions the executor must apply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopedQuery {
    base_sql: String,
    row_cap: usize,
    scope: Option<RowScope>,
    hidden_columns: Vec<String>,
    explanation: String,
    hint: VisualizationHint,
}

impl ScopedQuery {
    pub fn base_sql(&self) -> &str {
        &self.base_sql
    }

    pub fn row_cap(&self) -> usize {
        self.row_cap
    }

    pub fn scope(&self) -> Option<&RowScope> {
        self.scope.as_ref()
    }

    /// Columns removed from the result before it is returned
    pub fn hidden_columns(&self) -> &[String] {
        &self.hidden_columns
    }

    /// Whether a result column is a hidden column, including the
    /// `_right` copies polars makes when joined tables share a name
    pub fn hides(&self, column: &str) -> bool {
        let mut name = column;
        while let Some(stripped) = name.strip_suffix(JOIN_SUFFIX) {
            name = stripped;
        }
        self.hidden_columns.iter().any(|h| h.eq_ignore_ascii_case(name))
    }

    pub fn explanation(&self) -> &str {
        &self.explanation
    }

    pub fn hint(&self) -> &VisualizationHint {
        &self.hint
    }

    /// The query as it is effectively run: the base query, which already
    /// carries the owner predicate, wrapped with the predicate again and the
    /// row cap.
    pub fn to_sql(&self) -> String {
        let mut sql = format!("SELECT * FROM ({}) AS scoped", self.base_sql);
        if let Some(scope) = &self.scope {
            sql.push_str(&format!(
                " WHERE \"{}\" = '{}'",
                scope.column.replace('"', "\"\""),
                scope.value.replace('\'', "''")
            ));
        }
        sql.push_str(&format!(" LIMIT {}", self.row_cap));
        sql
    }
}

pub struct AccessControlFilter<'a> {
    schema: &'a SchemaDescriptor,
    policy: &'a AccessPolicy,
}

impl<'a> AccessControlFilter<'a> {
    pub fn new(schema: &'a SchemaDescriptor, policy: &'a AccessPolicy) -> Self {
        Self { schema, policy }
    }

    pub fn scope(&self, query: &ValidatedQuery, user: &User, role: &Role) -> Result<ScopedQuery> {
        let shape = Shape::of(query.query());

        let hidden_columns = if role.can_view_sensitive {
            Vec::new()
        } else {
            self.check_sensitive_references(query.query())?;
            let hidden = self.hidden_columns_for(query.tables());
            if !hidden.is_empty() {
                check_wildcards(query.query(), &shape)?;
            }
            hidden
        };

        let mut base_sql = query.sql().to_string();
        let scope = if role.can_view_all_rows {
            None
        } else {
            match self.row_scope(query, user, &shape)? {
                Some((scope, restricted)) => {
                    base_sql = restricted.to_string();
                    Some(scope)
                }
                None => None,
            }
        };

        let row_cap = match explicit_limit(query.query()) {
            Some(limit) if limit <= role.max_query_rows => limit,
            _ => role.max_query_rows,
        };

        debug!(
            user = %user.username,
            role = %role.name,
            row_cap,
            scoped = scope.is_some(),
            hidden = hidden_columns.len(),
            "Scoped query"
        );

        Ok(ScopedQuery {
            base_sql,
            row_cap,
            scope,
            hidden_columns,
            explanation: query.explanation().to_string(),
            hint: query.hint().clone(),
        })
    }

    fn check_sensitive_references(&self, query: &Query) -> Result<()> {
        let mut restricted: Option<String> = None;
        let _ = visit_expressions(query, |expr| {
            let name = match expr {
                Expr::Identifier(ident) => Some(&ident.value),
                Expr::CompoundIdentifier(parts) => parts.last().map(|p| &p.value),
                _ => None,
            };
            match name {
                Some(name) if self.policy.is_sensitive(name) => {
                    restricted = Some(name.clone());
                    ControlFlow::Break(())
                }
                _ => ControlFlow::Continue(()),
            }
        });

        match restricted {
            Some(column) => Err(AnalyticsError::ScopeUnenforceable(format!(
                "the query uses restricted column '{}'",
                column
            ))),
            None => Ok(()),
        }
    }

    fn hidden_columns_for(&self, tables: &BTreeSet<String>) -> Vec<String> {
        let hidden: BTreeSet<String> = tables
            .iter()
            .filter_map(|t| self.schema.table(t))
            .flat_map(|t| t.sensitive_columns().map(|c| c.name.clone()))
            .collect();
        hidden.into_iter().collect()
    }

    /// The owner predicate for `user`, plus the query rewritten so the
    /// predicate sits in its WHERE clause
    fn row_scope(&self, query: &ValidatedQuery, user: &User, shape: &Shape) -> Result<Option<(RowScope, Query)>> {
        let owned_tables: Vec<&String> = query
            .tables()
            .iter()
            .filter(|t| self.schema.is_owner_scoped(t))
            .collect();
        if owned_tables.is_empty() {
            // Only reference tables: nothing belongs to anyone
            return Ok(None);
        }

        let value = user.owned_scope.clone().ok_or_else(|| {
            AnalyticsError::ScopeUnenforceable(format!(
                "no owned scope is configured for user '{}'",
                user.username
            ))
        })?;

        let (relations, owned) = self.check_scopable(query.query(), shape)?;
        let restricted = restrict(query.query(), self.owner_predicate(&relations, &owned, &value))?;

        Ok(Some((
            RowScope {
                column: self.schema.owner_column().to_string(),
                value,
            },
            restricted,
        )))
    }

    /// The shape checks that make the owner predicate sound. Returns the
    /// top-level relations and the one among them that carries the owner column.
    fn check_scopable(&self, query: &Query, shape: &Shape) -> Result<(Vec<Relation>, Relation)> {
        let owner = self.schema.owner_column();
        let unenforceable = |reason: String| Err(AnalyticsError::ScopeUnenforceable(reason));

        if query.with.is_some() {
            return unenforceable("common table expressions cannot be restricted".to_string());
        }
        let select: &Select = match query.body.as_ref() {
            SetExpr::Select(select) => select,
            _ => return unenforceable("set operations cannot be restricted".to_string()),
        };
        if shape.column_aliases {
            return unenforceable("renaming columns in a table alias is not allowed here".to_string());
        }

        let relations = match top_level_relations(select) {
            Some(relations) => relations,
            None => {
                return unenforceable(format!(
                    "derived tables and table functions cannot be combined with tables that have a {} column",
                    owner
                ))
            }
        };
        let top_owned: Vec<&Relation> = relations
            .iter()
            .filter(|r| self.schema.is_owner_scoped(&r.table))
            .collect();

        let mut total_owned = 0usize;
        let _ = visit_relations(query, |name| {
            if let Some(last) = name.0.last() {
                if self.schema.is_owner_scoped(&last.value) {
                    total_owned += 1;
                }
            }
            ControlFlow::<()>::Continue(())
        });

        if total_owned != top_owned.len() {
            return unenforceable(format!(
                "tables with a {} column may only appear in the main FROM clause",
                owner
            ));
        }
        let owned = match top_owned.as_slice() {
            [single] => (*single).clone(),
            _ => {
                return unenforceable("queries joining several per-user tables cannot be restricted".to_string())
            }
        };

        let mut windowed = false;
        let _ = visit_expressions(query, |expr| {
            if let Expr::Function(function) = expr {
                if function.over.is_some() {
                    windowed = true;
                    return ControlFlow::Break(());
                }
            }
            ControlFlow::Continue(())
        });
        if windowed {
            return unenforceable("window functions compare rows across users".to_string());
        }

        let mut exposes_owner = false;
        for item in &select.projection {
            match item {
                SelectItem::Wildcard(_) => exposes_owner = true,
                SelectItem::QualifiedWildcard(qualifier, _) => {
                    if matches!(qualifier.0.as_slice(), [q] if q.value == owned.qualifier.value) {
                        exposes_owner = true;
                    }
                }
                SelectItem::UnnamedExpr(expr) => {
                    if is_owner_reference(expr, owner, &owned) {
                        exposes_owner = true;
                    }
                }
                SelectItem::ExprWithAlias { expr, alias } => {
                    if alias.value.eq_ignore_ascii_case(owner) {
                        if !is_owner_reference(expr, owner, &owned) {
                            return unenforceable(format!(
                                "another expression is renamed to {}",
                                owner
                            ));
                        }
                        exposes_owner = true;
                    }
                }
            }
        }

        if !exposes_owner {
            return unenforceable(format!(
                "the query does not return the {} column needed to restrict rows",
                owner
            ));
        }
        Ok((relations, owned))
    }

    /// `<owner> = '<value>'`, qualified when the query joins several tables
    fn owner_predicate(&self, relations: &[Relation], owned: &Relation, value: &str) -> Expr {
        let owner = self.schema.owner_column();
        let column = if relations.len() == 1 {
            Expr::Identifier(column_ident(owner))
        } else {
            Expr::CompoundIdentifier(vec![owned.qualifier.clone(), column_ident(owner)])
        };

        let numeric = self
            .schema
            .table(&owned.table)
            .and_then(|t| t.column(owner))
            .map(|c| c.column_type.is_numeric())
            .unwrap_or(false);
        let literal = if numeric && value.parse::<f64>().is_ok() {
            Value::Number(value.to_string(), false)
        } else {
            Value::SingleQuotedString(value.to_string())
        };

        Expr::BinaryOp {
            left: Box::new(column),
            op: BinaryOperator::Eq,
            right: Box::new(Expr::Value(literal)),
        }
    }
}

/// A plain table in the top-level FROM clause
#[derive(Debug, Clone)]
struct Relation {
    table: String,
    /// Name the rest of the query uses for it: the alias, else the table name
    qualifier: Ident,
}

/// Plain tables of the top-level FROM clause, or `None` when any entry is a
/// derived table, table function or other non-table source
fn top_level_relations(select: &Select) -> Option<Vec<Relation>> {
    let mut relations = Vec::new();
    for table_with_joins in &select.from {
        let factors = std::iter::once(&table_with_joins.relation)
            .chain(table_with_joins.joins.iter().map(|j| &j.relation));
        for factor in factors {
            match factor {
                TableFactor::Table { name, alias, .. } => {
                    let table_ident = name.0.last()?;
                    relations.push(Relation {
                        table: table_ident.value.clone(),
                        qualifier: alias
                            .as_ref()
                            .map(|a| a.name.clone())
                            .unwrap_or_else(|| table_ident.clone()),
                    });
                }
                _ => return None,
            }
        }
    }
    Some(relations)
}

/// Only the owned relation carries the owner column, and every top-level
/// source is a plain table, so a bare name resolves to it. A qualified name
/// must use that relation's qualifier.
fn is_owner_reference(expr: &Expr, owner: &str, owned: &Relation) -> bool {
    match expr {
        Expr::Identifier(ident) => ident.value == owner,
        Expr::CompoundIdentifier(parts) => match parts.as_slice() {
            [qualifier, column] => qualifier.value == owned.qualifier.value && column.value == owner,
            _ => false,
        },
        _ => false,
    }
}

/// Wildcards can only be trimmed of restricted columns when their output
/// names are the table's own column names: a top-level SELECT over plain
/// tables with no column renaming.
fn check_wildcards(query: &Query, shape: &Shape) -> Result<()> {
    let unenforceable = |reason: &str| Err(AnalyticsError::ScopeUnenforceable(reason.to_string()));

    if shape.nested_wildcard {
        return unenforceable("a wildcard inside a subquery could expose restricted columns");
    }
    if shape.column_aliases {
        return unenforceable("renaming columns in a table alias could expose restricted columns");
    }
    if !set_expr_has_wildcard(&query.body) {
        return Ok(());
    }
    match query.body.as_ref() {
        SetExpr::Select(select) if top_level_relations(select).is_some() => Ok(()),
        SetExpr::Select(_) => unenforceable("a wildcard over a derived table could expose restricted columns"),
        _ => unenforceable("a wildcard in a set operation could expose restricted columns"),
    }
}

fn set_expr_has_wildcard(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(select) => select
            .projection
            .iter()
            .any(|item| matches!(item, SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(..))),
        SetExpr::Query(query) => set_expr_has_wildcard(&query.body),
        SetExpr::SetOperation { left, right, .. } => set_expr_has_wildcard(left) || set_expr_has_wildcard(right),
        _ => false,
    }
}

/// Facts gathered in one walk over the whole query tree
#[derive(Debug, Default)]
struct Shape {
    /// A query nested below the top level selects `*` or `t.*`
    nested_wildcard: bool,
    /// A table alias carries a column list, as in `deals AS d(a, b)`
    column_aliases: bool,
}

impl Shape {
    fn of(query: &Query) -> Self {
        let mut scan = ShapeScan {
            root: query,
            shape: Shape::default(),
        };
        let _ = query.visit(&mut scan);
        scan.shape
    }
}

struct ShapeScan<'q> {
    root: &'q Query,
    shape: Shape,
}

impl Visitor for ShapeScan<'_> {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if !std::ptr::eq(query, self.root) && set_expr_has_wildcard(&query.body) {
            self.shape.nested_wildcard = true;
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, factor: &TableFactor) -> ControlFlow<Self::Break> {
        let alias = match factor {
            TableFactor::Table { alias, .. } | TableFactor::Derived { alias, .. } => alias.as_ref(),
            _ => None,
        };
        if alias.map(|a| !a.columns.is_empty()).unwrap_or(false) {
            self.shape.column_aliases = true;
        }
        ControlFlow::Continue(())
    }
}

/// AND the owner predicate into the top-level WHERE clause, so ORDER BY,
/// LIMIT and aggregates only ever see the user's rows
fn restrict(query: &Query, predicate: Expr) -> Result<Query> {
    let mut restricted = query.clone();
    match restricted.body.as_mut() {
        SetExpr::Select(select) => {
            select.selection = Some(match select.selection.take() {
                Some(existing) => Expr::BinaryOp {
                    left: Box::new(Expr::Nested(Box::new(existing))),
                    op: BinaryOperator::And,
                    right: Box::new(predicate),
                },
                None => predicate,
            });
            Ok(restricted)
        }
        _ => Err(AnalyticsError::ScopeUnenforceable(
            "set operations cannot be restricted".to_string(),
        )),
    }
}

/// Quote column names that would not survive as bare identifiers
fn column_ident(name: &str) -> Ident {
    let bare = name
        .chars()
        .next()
        .map(|c| c.is_ascii_lowercase() || c == '_')
        .unwrap_or(false)
        && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if bare {
        Ident::new(name)
    } else {
        Ident::with_quote('"', name)
    }
}

fn explicit_limit(query: &Query) -> Option<usize> {
    match &query.limit {
        Some(Expr::Value(Value::Number(n, _))) => n.parse::<usize>().ok(),
        _ => None,
    }
}
