//! Data Assistant
//!
//! The question pipeline: build schema context for the user's role, ask the
//! generator for SQL, validate it, scope it, run it and pick a chart. Each
//! stage takes an immutable input and either produces the next stage's input
//! or stops the pipeline with a typed error.

use crate::config::Settings;
use crate::error::{AnalyticsError, Result};
use crate::execution::{ExecutionEngine, PolarsExecutor, ResultSet};
use crate::llm::{refine_prompt, CandidateQuery, SqlGenerator};
use crate::retry::RetryPolicy;
use crate::schema::{ContextNotes, SchemaContextBuilder, SchemaDescriptor, SchemaIntrospector};
use crate::security::{AccessControlFilter, AccessPolicy, Role, SafetyValidator, ScopedQuery, User};
use crate::table::TableSet;
use crate::visualization::{ChartSpec, VisualizationSelector};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Everything produced for one answered question
#[derive(Debug, Clone)]
pub struct Answer {
    pub request_id: String,
    pub question: String,
    /// The validated query as generated
    pub sql: String,
    /// The query as run, with scope and row cap applied
    pub executed_sql: String,
    pub explanation: String,
    pub chart: ChartSpec,
    pub result: ResultSet,
}

#[derive(Serialize)]
struct AnswerView<'a> {
    request_id: &'a str,
    question: &'a str,
    sql: &'a str,
    executed_sql: &'a str,
    explanation: &'a str,
    chart: &'a ChartSpec,
    row_count: usize,
    result: serde_json::Value,
}

impl Answer {
    /// CSV of the result, for roles allowed to take data out
    pub fn export_csv(&self, role: &Role) -> Result<String> {
        if !role.can_export {
            return Err(AnalyticsError::PermissionDenied(format!(
                "role '{}' cannot export data",
                role.name
            )));
        }
        self.result.to_csv()
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        let view = AnswerView {
            request_id: &self.request_id,
            question: &self.question,
            sql: &self.sql,
            executed_sql: &self.executed_sql,
            explanation: &self.explanation,
            chart: &self.chart,
            row_count: self.result.row_count(),
            result: self.result.to_json_rows(),
        };
        Ok(serde_json::to_value(view)?)
    }
}

pub struct DataAssistant {
    schema: Arc<SchemaDescriptor>,
    policy: Arc<AccessPolicy>,
    generator: Arc<dyn SqlGenerator>,
    executor: Arc<dyn ExecutionEngine>,
    context_builder: SchemaContextBuilder,
    validator: SafetyValidator,
    selector: VisualizationSelector,
    retry: RetryPolicy,
}

impl DataAssistant {
    pub fn new(
        tables: Arc<TableSet>,
        policy: AccessPolicy,
        notes: ContextNotes,
        generator: Arc<dyn SqlGenerator>,
        settings: &Settings,
    ) -> Result<Self> {
        let schema = SchemaIntrospector::new(&policy, settings.schema_sample_values).introspect(&tables)?;
        info!(
            tables = schema.tables().len(),
            owner_column = %schema.owner_column(),
            "Schema introspected"
        );

        Ok(Self {
            schema: Arc::new(schema),
            policy: Arc::new(policy),
            generator,
            executor: Arc::new(PolarsExecutor::new(tables, settings.query_timeout)),
            context_builder: SchemaContextBuilder::new(notes, settings.schema_context_max_chars),
            validator: SafetyValidator::new(),
            selector: VisualizationSelector::new(),
            retry: RetryPolicy::default().with_max_retries(settings.llm_max_retries),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn schema(&self) -> &SchemaDescriptor {
        &self.schema
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    /// The schema text the generator sees for this user
    pub fn schema_context(&self, user: &User) -> Result<String> {
        let role = self.policy.role_for(user)?;
        Ok(self.context_builder.build(&self.schema, role))
    }

    /// Validate and scope SQL without running it
    pub fn check_sql(&self, sql: &str, user: &User) -> Result<ScopedQuery> {
        let role = self.policy.role_for(user)?;
        let candidate = CandidateQuery::new(sql);
        let validated = self.validator.validate(&candidate, &self.schema)?;
        AccessControlFilter::new(&self.schema, &self.policy).scope(&validated, user, role)
    }

    pub async fn answer_question(&self, question: &str, user: &User) -> Result<Answer> {
        let request_id = Uuid::new_v4().to_string();
        let span = info_span!("answer_question", request_id = %request_id, user = %user.username);
        self.run_pipeline(question, question, user, request_id)
            .instrument(span)
            .await
    }

    /// Ask again with the previous SQL and the user's feedback as context
    pub async fn refine_question(
        &self,
        original_question: &str,
        original_sql: &str,
        feedback: &str,
        user: &User,
    ) -> Result<Answer> {
        let request_id = Uuid::new_v4().to_string();
        let span = info_span!("refine_question", request_id = %request_id, user = %user.username);
        let prompt = refine_prompt(original_question, original_sql, feedback);
        self.run_pipeline(original_question, &prompt, user, request_id)
            .instrument(span)
            .await
    }

    async fn run_pipeline(&self, question: &str, prompt: &str, user: &User, request_id: String) -> Result<Answer> {
        let role = self.policy.role_for(user)?;
        info!(role = %role.name, question = %question, "Answering question");

        let context = self.context_builder.build(&self.schema, role);
        let candidate = self
            .retry
            .retry_with_backoff(|| self.generator.generate_sql(prompt, &context))
            .await
            .map_err(|e| {
                warn!(error = %e, retryable = e.is_retryable(), "SQL generation failed");
                e
            })?;

        let validated = self.validator.validate(&candidate, &self.schema).map_err(|e| {
            warn!(kind = e.kind(), error = %e, sql = %candidate.sql, "Rejected candidate query");
            e
        })?;

        let scoped = AccessControlFilter::new(&self.schema, &self.policy)
            .scope(&validated, user, role)
            .map_err(|e| {
                warn!(kind = e.kind(), error = %e, sql = %validated.sql(), "Could not scope query");
                e
            })?;

        let executed_sql = scoped.to_sql();
        let result = self.executor.execute(&scoped).await.map_err(|e| {
            error!(kind = e.kind(), diagnostic = %e, sql = %executed_sql, "Query execution failed");
            e
        })?;

        let chart = self.selector.select(&result, Some(scoped.hint()));
        info!(
            rows = result.row_count(),
            chart = %chart.kind,
            fallback = chart.fallback_reason.as_deref().unwrap_or(""),
            "Question answered"
        );

        Ok(Answer {
            request_id,
            question: question.to_string(),
            sql: validated.sql().to_string(),
            executed_sql,
            explanation: scoped.explanation().to_string(),
            chart,
            result,
        })
    }
}
