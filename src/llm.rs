//! SQL generation
//!
//! The generator is an untrusted collaborator: whatever it returns is only a
//! candidate that still has to pass validation and scoping.

use crate::config::Settings;
use crate::error::{AnalyticsError, Result};
use crate::visualization::{ChartKind, VisualizationHint};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info};

pub const DEFAULT_EXPLANATION: &str = "Query generated from natural language";

lazy_static! {
    static ref FENCED_JSON: Regex = Regex::new(r"(?s)```(?:json)?\s*(\{.*\})\s*```").unwrap();
    static ref FENCED_SQL: Regex = Regex::new(r"(?is)```sql\s*(.*?)```").unwrap();
}

/// Raw SQL plus what the generator said about it
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateQuery {
    pub sql: String,
    pub explanation: String,
    pub hint: VisualizationHint,
}

impl CandidateQuery {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            explanation: DEFAULT_EXPLANATION.to_string(),
            hint: VisualizationHint::default(),
        }
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = explanation.into();
        self
    }

    pub fn with_hint(mut self, hint: VisualizationHint) -> Self {
        self.hint = hint;
        self
    }
}

#[async_trait]
pub trait SqlGenerator: Send + Sync {
    async fn generate_sql(&self, question: &str, schema_context: &str) -> Result<CandidateQuery>;
}

/// Generator backed by an OpenAI-compatible chat completions endpoint
pub struct LlmSqlGenerator {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl LlmSqlGenerator {
    pub fn new(settings: &Settings) -> Result<Self> {
        let api_key = settings.llm_api_key.clone().ok_or_else(|| {
            AnalyticsError::Config("LLM_API_KEY (or OPENAI_API_KEY) is not set".to_string())
        })?;
        let client = reqwest::Client::builder()
            .timeout(settings.llm_timeout)
            .build()
            .map_err(|e| AnalyticsError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            base_url: settings.llm_base_url.trim_end_matches('/').to_string(),
            model: settings.llm_model.clone(),
        })
    }

    async fn call_llm(&self, system_prompt: &str, question: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": question}
            ],
            "temperature": 0.0,
            "max_tokens": 2000
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(unavailable)?;

        let status = response.status();
        if !status.is_success() {
            return Err(AnalyticsError::GenerationUnavailable {
                reason: format!("generator returned HTTP {}", status),
                retryable: false,
            });
        }

        let response_json: serde_json::Value = response.json().await.map_err(unavailable)?;
        response_json["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| AnalyticsError::GenerationUnavailable {
                reason: "no content in generator response".to_string(),
                retryable: false,
            })
    }
}

fn unavailable(e: reqwest::Error) -> AnalyticsError {
    AnalyticsError::GenerationUnavailable {
        reason: format!("generator call failed: {}", e),
        retryable: e.is_timeout(),
    }
}

#[async_trait]
impl SqlGenerator for LlmSqlGenerator {
    async fn generate_sql(&self, question: &str, schema_context: &str) -> Result<CandidateQuery> {
        info!(model = %self.model, "Requesting SQL from generator");
        let content = self.call_llm(&system_prompt(schema_context), question).await?;
        debug!(response = %content, "Generator response");
        parse_generator_response(&content)
    }
}

pub fn system_prompt(schema_context: &str) -> String {
    format!(
        r#"You are an expert SQL query generator for a sales and commission analytics database.

DATABASE SCHEMA:
{}

Always respond with this exact JSON object and nothing else:
{{
    "sql": "SELECT ... FROM ... WHERE ...",
    "explanation": "Brief explanation of what the query does",
    "visualization_type": "table|bar|line|pie|scatter",
    "columns_to_visualize": {{"x": "column_name", "y": "column_name"}} or null for tables
}}

RULES:
1. Generate exactly one SELECT statement. Never modify data or schema.
2. Only use the tables and columns listed above. Do not use WITH clauses.
3. Use aggregate functions (SUM, COUNT, AVG) with GROUP BY for totals and averages.
4. Use LIMIT when only the top rows are wanted.
5. Pick the visualization: bar to compare categories, line for trends over time, pie for shares of a whole, scatter for two numeric measures, table otherwise."#,
        schema_context
    )
}

/// Follow-up question asking the generator to revise an earlier query
pub fn refine_prompt(original_question: &str, original_sql: &str, feedback: &str) -> String {
    format!(
        "The user asked: \"{}\"\n\nI generated this SQL:\n```sql\n{}\n```\n\nThe user provided this feedback: \"{}\"\n\nPlease generate an improved SQL query that addresses their feedback.",
        original_question, original_sql, feedback
    )
}

#[derive(Debug, Deserialize)]
struct GeneratorResponse {
    #[serde(default)]
    sql: Option<String>,
    #[serde(default)]
    explanation: Option<String>,
    #[serde(default)]
    visualization_type: Option<String>,
    #[serde(default)]
    columns_to_visualize: Option<AxisColumns>,
}

#[derive(Debug, Deserialize)]
struct AxisColumns {
    #[serde(default)]
    x: Option<String>,
    #[serde(default)]
    y: Option<String>,
}

/// Accepts a JSON object (bare or fenced), else a fenced SQL block
pub fn parse_generator_response(content: &str) -> Result<CandidateQuery> {
    let json_text = FENCED_JSON
        .captures(content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or_else(|| content.trim());

    if let Ok(parsed) = serde_json::from_str::<GeneratorResponse>(json_text) {
        let sql = parsed
            .sql
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| no_sql("generator response has no SQL"))?;

        let axes = parsed.columns_to_visualize;
        let hint = VisualizationHint {
            chart: parsed.visualization_type.as_deref().and_then(ChartKind::parse),
            x: axes.as_ref().and_then(|a| a.x.clone()),
            y: axes.as_ref().and_then(|a| a.y.clone()),
        };
        let explanation = parsed
            .explanation
            .filter(|e| !e.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_EXPLANATION.to_string());

        return Ok(CandidateQuery::new(sql).with_explanation(explanation).with_hint(hint));
    }

    if let Some(sql) = FENCED_SQL.captures(content).and_then(|c| c.get(1)) {
        let sql = sql.as_str().trim();
        if !sql.is_empty() {
            return Ok(CandidateQuery::new(sql).with_hint(VisualizationHint {
                chart: Some(ChartKind::Table),
                ..Default::default()
            }));
        }
    }

    Err(no_sql("could not find SQL in generator response"))
}

fn no_sql(reason: &str) -> AnalyticsError {
    AnalyticsError::GenerationUnavailable {
        reason: reason.to_string(),
        retryable: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_parse_json_response() {
        let content = r#"{"sql": "SELECT region, SUM(revenue) AS revenue FROM sales GROUP BY region",
            "explanation": "Revenue per region",
            "visualization_type": "bar",
            "columns_to_visualize": {"x": "region", "y": "revenue"}}"#;
        let candidate = parse_generator_response(content).unwrap();
        assert!(candidate.sql.starts_with("SELECT region"));
        assert_eq!(candidate.explanation, "Revenue per region");
        assert_eq!(candidate.hint.chart, Some(ChartKind::Bar));
        assert_eq!(candidate.hint.x.as_deref(), Some("region"));
    }

    #[test]
    fn test_parse_fenced_json_with_null_axes() {
        let content = "Here you go:\n```json\n{\"sql\": \"SELECT * FROM deals\", \"visualization_type\": \"table\", \"columns_to_visualize\": null}\n```";
        let candidate = parse_generator_response(content).unwrap();
        assert_eq!(candidate.sql, "SELECT * FROM deals");
        assert_eq!(candidate.explanation, DEFAULT_EXPLANATION);
        assert_eq!(candidate.hint.x, None);
    }

    #[test]
    fn test_parse_sql_block_fallback() {
        let content = "Sure.\n```sql\nSELECT COUNT(*) FROM deals\n```\nThis counts deals.";
        let candidate = parse_generator_response(content).unwrap();
        assert_eq!(candidate.sql, "SELECT COUNT(*) FROM deals");
        assert_eq!(candidate.hint.chart, Some(ChartKind::Table));
    }

    #[test]
    fn test_response_without_sql_is_unavailable() {
        for content in ["I am not sure what you mean.", r#"{"sql": null, "explanation": "unclear"}"#] {
            let err = parse_generator_response(content).unwrap_err();
            assert!(matches!(err, AnalyticsError::GenerationUnavailable { retryable: false, .. }));
        }
    }

    #[test]
    fn test_refine_prompt_carries_context() {
        let prompt = refine_prompt("Revenue by region", "SELECT region FROM sales", "only 2024");
        assert!(prompt.contains("\"Revenue by region\""));
        assert!(prompt.contains("```sql\nSELECT region FROM sales\n```"));
        assert!(prompt.contains("only 2024"));
    }

    #[test]
    fn test_missing_api_key_is_config_error() {
        let settings = Settings::default();
        assert!(matches!(LlmSqlGenerator::new(&settings), Err(AnalyticsError::Config(_))));
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        // A listener that accepts and never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let settings = Settings {
            llm_api_key: Some("test-key".to_string()),
            llm_base_url: format!("http://{}", addr),
            llm_timeout: Duration::from_millis(200),
            ..Settings::default()
        };
        let generator = LlmSqlGenerator::new(&settings).unwrap();
        let err = generator.generate_sql("anything", "TABLE: deals").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
