//! Query Guards
//!
//! Static safety validation of generated SQL. This is a finite rule set, not a
//! SQL grammar: deny-listed words, a single-statement check, a SELECT-prefix
//! check and table membership. Anything the rules cannot classify is rejected.
//! Encoded or otherwise obfuscated keywords that survive these rules are a
//! known residual risk; the access-control filter and the read-only executor
//! sit behind this check.

use crate::error::{AnalyticsError, RejectionRule, Result};
use crate::llm::CandidateQuery;
use crate::schema::SchemaDescriptor;
use crate::visualization::VisualizationHint;
use sqlparser::ast::{visit_relations, ObjectName, Query, Statement};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::collections::BTreeSet;
use std::ops::ControlFlow;
use tracing::debug;

/// Words that never appear in a read-only query
pub const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "TRUNCATE", "GRANT", "REVOKE",
    "ATTACH", "DETACH", "PRAGMA", "EXEC", "EXECUTE", "MERGE", "CALL", "COPY", "VACUUM", "INTO",
];

/// A candidate that passed every guard rule
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedQuery {
    sql: String,
    original_sql: String,
    query: Box<Query>,
    tables: BTreeSet<String>,
    explanation: String,
    hint: VisualizationHint,
}

impl ValidatedQuery {
    /// Canonical rendering of the parsed statement (comments removed)
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn original_sql(&self) -> &str {
        &self.original_sql
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Every table the statement names, including subqueries
    pub fn tables(&self) -> &BTreeSet<String> {
        &self.tables
    }

    pub fn explanation(&self) -> &str {
        &self.explanation
    }

    pub fn hint(&self) -> &VisualizationHint {
        &self.hint
    }
}

/// Comment- and literal-free views of a statement
struct Scanned {
    /// Comments replaced by a space, literals by `''`
    spaced: String,
    /// Comments removed entirely, literals by `''`
    joined: String,
}

pub struct SafetyValidator;

impl SafetyValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, candidate: &CandidateQuery, schema: &SchemaDescriptor) -> Result<ValidatedQuery> {
        let raw = candidate.sql.trim();
        if raw.is_empty() {
            return Err(AnalyticsError::rejected(RejectionRule::Empty, "no SQL was produced"));
        }
        if raw.chars().any(|c| c.is_control() && !c.is_whitespace()) {
            return Err(AnalyticsError::rejected(
                RejectionRule::Unparseable,
                "statement contains control characters",
            ));
        }

        let scanned = scan(raw)?;

        // Rule 1: deny-listed words, wherever they hide
        for text in [raw, scanned.spaced.as_str(), scanned.joined.as_str()] {
            if let Some(keyword) = find_forbidden_keyword(text) {
                return Err(AnalyticsError::rejected(
                    RejectionRule::ForbiddenKeyword,
                    format!("statement contains {}", keyword),
                ));
            }
        }

        // Rule 2: a single statement, optionally terminated
        let body = scanned.spaced.trim();
        let body = body.strip_suffix(';').unwrap_or(body);
        if body.contains(';') {
            return Err(AnalyticsError::rejected(
                RejectionRule::MultipleStatements,
                "only one statement may be submitted",
            ));
        }
        if body.trim().is_empty() {
            return Err(AnalyticsError::rejected(RejectionRule::Empty, "statement has no content"));
        }

        // Rule 3: must open with SELECT
        let first_word = words(body).next().unwrap_or_default();
        if !first_word.eq_ignore_ascii_case("SELECT") {
            return Err(AnalyticsError::rejected(
                RejectionRule::NotSelect,
                format!("statement starts with '{}'", first_word),
            ));
        }

        let query = parse_single_query(raw)?;

        // Rule 4: every relation must be a known table
        let tables = referenced_tables(&query)?;
        for table in &tables {
            if !schema.has_table(table) {
                return Err(AnalyticsError::rejected(
                    RejectionRule::UnknownTable,
                    unknown_table_detail(table, schema),
                ));
            }
        }

        let sql = query.to_string();
        debug!("Validated query over {:?}: {}", tables, sql);

        Ok(ValidatedQuery {
            sql,
            original_sql: candidate.sql.clone(),
            query,
            tables,
            explanation: candidate.explanation.clone(),
            hint: candidate.hint.clone(),
        })
    }
}

impl Default for SafetyValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse text that must hold exactly one query statement
pub(crate) fn parse_single_query(sql: &str) -> Result<Box<Query>> {
    let mut statements = Parser::parse_sql(&GenericDialect {}, sql).map_err(|e| {
        AnalyticsError::rejected(RejectionRule::Unparseable, format!("could not parse statement: {}", e))
    })?;

    if statements.len() != 1 {
        return Err(AnalyticsError::rejected(
            RejectionRule::MultipleStatements,
            format!("expected one statement, found {}", statements.len()),
        ));
    }

    match statements.remove(0) {
        Statement::Query(query) => Ok(query),
        other => Err(AnalyticsError::rejected(
            RejectionRule::NotSelect,
            format!("statement is not a query: {}", statement_label(&other)),
        )),
    }
}

/// Single-part relation names referenced anywhere in the query
pub(crate) fn referenced_tables(query: &Query) -> Result<BTreeSet<String>> {
    let mut names: Vec<ObjectName> = Vec::new();
    let _ = visit_relations(query, |relation| {
        names.push(relation.clone());
        ControlFlow::<()>::Continue(())
    });

    let mut tables = BTreeSet::new();
    for name in names {
        if name.0.len() != 1 {
            return Err(AnalyticsError::rejected(
                RejectionRule::UnknownTable,
                format!("qualified table name '{}' is not allowed", name),
            ));
        }
        tables.insert(name.0[0].value.clone());
    }
    Ok(tables)
}

fn statement_label(statement: &Statement) -> String {
    statement
        .to_string()
        .split_whitespace()
        .next()
        .unwrap_or("unknown")
        .to_uppercase()
}

fn unknown_table_detail(table: &str, schema: &SchemaDescriptor) -> String {
    let suggestion = schema
        .table_names()
        .into_iter()
        .map(|known| (known, strsim::jaro_winkler(&table.to_lowercase(), &known.to_lowercase())))
        .filter(|(_, score)| *score >= 0.85)
        .max_by(|a, b| a.1.total_cmp(&b.1));

    match suggestion {
        Some((known, _)) => format!("unknown table '{}' (did you mean '{}'?)", table, known),
        None => format!("unknown table '{}'", table),
    }
}

fn words(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
}

fn find_forbidden_keyword(text: &str) -> Option<&'static str> {
    words(text).find_map(|word| {
        FORBIDDEN_KEYWORDS
            .iter()
            .copied()
            .find(|keyword| word.eq_ignore_ascii_case(keyword))
    })
}

/// Strip comments and blank out string literals.
///
/// Unterminated comments or literals cannot be classified and are rejected.
fn scan(sql: &str) -> Result<Scanned> {
    let chars: Vec<char> = sql.chars().collect();
    let mut spaced = String::with_capacity(sql.len());
    let mut joined = String::with_capacity(sql.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        match (c, next) {
            ('-', Some('-')) => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                spaced.push(' ');
            }
            ('/', Some('*')) => {
                let mut end = None;
                let mut j = i + 2;
                while j + 1 < chars.len() {
                    if chars[j] == '*' && chars[j + 1] == '/' {
                        end = Some(j + 2);
                        break;
                    }
                    j += 1;
                }
                match end {
                    Some(e) => i = e,
                    None => {
                        return Err(AnalyticsError::rejected(
                            RejectionRule::Unparseable,
                            "unterminated block comment",
                        ))
                    }
                }
                spaced.push(' ');
            }
            ('\'', _) => {
                i += 1;
                loop {
                    match (chars.get(i), chars.get(i + 1)) {
                        (Some('\''), Some('\'')) => i += 2,
                        (Some('\''), _) => {
                            i += 1;
                            break;
                        }
                        (Some(_), _) => i += 1,
                        (None, _) => {
                            return Err(AnalyticsError::rejected(
                                RejectionRule::Unparseable,
                                "unterminated string literal",
                            ))
                        }
                    }
                }
                spaced.push_str("''");
                joined.push_str("''");
            }
            ('"', _) | ('`', _) => {
                // Quoted identifiers are kept so their content is still checked
                let quote = c;
                let start = i;
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(AnalyticsError::rejected(
                        RejectionRule::Unparseable,
                        "unterminated quoted identifier",
                    ));
                }
                i += 1;
                let quoted: String = chars[start..i].iter().collect();
                spaced.push_str(&quoted);
                joined.push_str(&quoted);
            }
            _ => {
                spaced.push(c);
                joined.push(c);
                i += 1;
            }
        }
    }

    Ok(Scanned { spaced, joined })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDescriptor, TableDescriptor};
    use crate::table::ColumnType;

    fn schema() -> SchemaDescriptor {
        let column = |name: &str, column_type| ColumnDescriptor {
            name: name.to_string(),
            column_type,
            nullable: false,
            sensitive: false,
            samples: vec![],
        };
        SchemaDescriptor::new(
            "sales_rep_id",
            vec![
                TableDescriptor {
                    name: "sales".to_string(),
                    row_count: 3,
                    owner_scoped: false,
                    columns: vec![column("region", ColumnType::Text), column("revenue", ColumnType::Real)],
                },
                TableDescriptor {
                    name: "deals".to_string(),
                    row_count: 3,
                    owner_scoped: true,
                    columns: vec![column("sales_rep_id", ColumnType::Text)],
                },
            ],
        )
    }

    fn validate(sql: &str) -> Result<ValidatedQuery> {
        SafetyValidator::new().validate(&CandidateQuery::new(sql), &schema())
    }

    fn rule_of(sql: &str) -> RejectionRule {
        match validate(sql) {
            Err(AnalyticsError::QueryRejected { rule, .. }) => rule,
            other => panic!("expected rejection for {:?}, got {:?}", sql, other),
        }
    }

    #[test]
    fn test_plain_select_passes() {
        let validated = validate("SELECT region, SUM(revenue) AS revenue FROM sales GROUP BY region;").unwrap();
        assert_eq!(validated.tables().iter().collect::<Vec<_>>(), vec!["sales"]);
        assert!(!validated.sql().ends_with(';'));
    }

    #[test]
    fn test_write_keywords_rejected_in_any_case() {
        for sql in [
            "INSERT INTO sales VALUES ('x', 1)",
            "select * from sales; drop table sales",
            "SELECT * FROM sales WHERE 1=1 /* harmless */ ; DeLeTe FROM sales",
            "UPDATE sales SET revenue = 0",
            "ATTACH DATABASE 'x.db' AS x",
            "SELECT * FROM sales -- then DROP everything",
            "SELECT * FROM sales /* dRoP */",
            "SELECT * FROM sales WHERE region = 'x' DR/**/OP TABLE sales",
            "select region into backup from sales",
        ] {
            assert_eq!(rule_of(sql), RejectionRule::ForbiddenKeyword, "{}", sql);
        }
    }

    #[test]
    fn test_keywords_inside_identifiers_are_not_matched() {
        assert!(validate("SELECT region AS updated_region FROM sales").is_ok());
    }

    #[test]
    fn test_multiple_statements_rejected() {
        assert_eq!(
            rule_of("SELECT * FROM sales; SELECT * FROM deals"),
            RejectionRule::MultipleStatements
        );
        assert_eq!(rule_of("SELECT 1;;"), RejectionRule::MultipleStatements);
    }

    #[test]
    fn test_semicolon_inside_literal_is_not_a_separator() {
        assert!(validate("SELECT * FROM sales WHERE region = 'a;b'").is_ok());
    }

    #[test]
    fn test_must_start_with_select() {
        assert_eq!(rule_of("WITH x AS (SELECT 1) SELECT * FROM x"), RejectionRule::NotSelect);
        assert_eq!(rule_of("/* lead */ SHOW TABLES"), RejectionRule::NotSelect);
        assert!(validate("-- comment first\n  SELECT * FROM sales").is_ok());
    }

    #[test]
    fn test_unknown_tables_rejected_with_suggestion() {
        match validate("SELECT * FROM sale") {
            Err(AnalyticsError::QueryRejected { rule, detail }) => {
                assert_eq!(rule, RejectionRule::UnknownTable);
                assert!(detail.contains("did you mean 'sales'"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            rule_of("SELECT * FROM sales WHERE region IN (SELECT name FROM secrets)"),
            RejectionRule::UnknownTable
        );
        assert_eq!(rule_of("SELECT * FROM main.sales"), RejectionRule::UnknownTable);
    }

    #[test]
    fn test_unclassifiable_input_fails_closed() {
        assert_eq!(rule_of("SELECT * FROM sales WHERE region = 'open"), RejectionRule::Unparseable);
        assert_eq!(rule_of("SELECT * FROM sales /* open"), RejectionRule::Unparseable);
        assert_eq!(rule_of("SELECT * FROM sales WHERE"), RejectionRule::Unparseable);
        assert_eq!(rule_of("   "), RejectionRule::Empty);
    }

    #[test]
    fn test_subquery_tables_collected() {
        let validated =
            validate("SELECT s.region FROM sales s JOIN deals d ON s.region = d.sales_rep_id").unwrap();
        assert_eq!(validated.tables().len(), 2);
    }
}
