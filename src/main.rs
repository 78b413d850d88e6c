use analytics_chat::config::{AccessConfig, Settings};
use analytics_chat::llm::{CandidateQuery, LlmSqlGenerator, SqlGenerator};
use analytics_chat::security::User;
use analytics_chat::table::{CsvTableSource, TableSource};
use analytics_chat::{AnalyticsError, Answer, DataAssistant};
use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use itertools::Itertools;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const PREVIEW_ROWS: usize = 50;

#[derive(Parser)]
#[command(name = "analytics-chat")]
#[command(about = "Ask questions about sales data in plain language")]
struct Args {
    /// Directory of CSV files, one table per file
    #[arg(short, long, default_value = "data")]
    data_dir: PathBuf,

    /// Roles, users and domain notes
    #[arg(short, long, default_value = "config/access.json")]
    access_config: PathBuf,

    /// Username to act as
    #[arg(short, long)]
    user: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer a question
    Ask {
        question: String,
        /// Print the answer as JSON
        #[arg(long)]
        json: bool,
        /// Write the full result as CSV (roles with export permission only)
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// Print the schema description the generator sees for this user
    Schema,
    /// Validate and scope a SQL statement without running it
    Check { sql: String },
    /// Revise an earlier query with feedback
    Refine {
        #[arg(long)]
        question: String,
        #[arg(long)]
        sql: String,
        #[arg(long)]
        feedback: String,
        #[arg(long)]
        json: bool,
    },
}

/// Stand-in used when no API key is configured
struct UnconfiguredGenerator;

#[async_trait]
impl SqlGenerator for UnconfiguredGenerator {
    async fn generate_sql(&self, _question: &str, _schema_context: &str) -> analytics_chat::Result<CandidateQuery> {
        Err(AnalyticsError::GenerationUnavailable {
            reason: "LLM_API_KEY is not configured".to_string(),
            retryable: false,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("analytics_chat=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let settings = Settings::from_env()?;

    let access = AccessConfig::load(&args.access_config)?;
    let users = access.user_directory()?;
    let user = users.get_user(&args.user)?.clone();

    let tables = CsvTableSource::new(&args.data_dir)
        .load()
        .with_context(|| format!("loading tables from {}", args.data_dir.display()))?;
    info!(tables = %tables.names().iter().join(", "), "Tables loaded");

    let generator: Arc<dyn SqlGenerator> = match LlmSqlGenerator::new(&settings) {
        Ok(generator) => Arc::new(generator),
        Err(e) => {
            warn!("{}; questions cannot be answered", e);
            Arc::new(UnconfiguredGenerator)
        }
    };

    let assistant = DataAssistant::new(
        Arc::new(tables),
        access.access_policy(),
        access.context_notes(),
        generator,
        &settings,
    )?;

    let outcome = run(&assistant, &user, args.command).await;
    if let Err(e) = outcome {
        eprintln!("{}", e.user_message());
        std::process::exit(1);
    }
    Ok(())
}

async fn run(assistant: &DataAssistant, user: &User, command: Command) -> analytics_chat::Result<()> {
    match command {
        Command::Ask { question, json, export } => {
            let answer = assistant.answer_question(&question, user).await?;
            print_answer(&answer, json)?;
            if let Some(path) = export {
                let role = assistant.policy().role_for(user)?;
                std::fs::write(&path, answer.export_csv(role)?)?;
                println!("Exported {} rows to {}", answer.result.row_count(), path.display());
            }
        }
        Command::Schema => {
            println!("{}", assistant.schema_context(user)?);
        }
        Command::Check { sql } => {
            let scoped = assistant.check_sql(&sql, user)?;
            println!("{}", scoped.to_sql());
            if !scoped.hidden_columns().is_empty() {
                println!("hidden columns: {}", scoped.hidden_columns().join(", "));
            }
        }
        Command::Refine { question, sql, feedback, json } => {
            let answer = assistant.refine_question(&question, &sql, &feedback, user).await?;
            print_answer(&answer, json)?;
        }
    }
    Ok(())
}

fn print_answer(answer: &Answer, json: bool) -> analytics_chat::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&answer.to_json()?)?);
        return Ok(());
    }

    println!("{}\n", answer.explanation);
    println!("SQL: {}\n", answer.sql);

    let chart = &answer.chart;
    match (&chart.x, &chart.y) {
        (Some(x), Some(y)) => println!(
            "Chart: {} ({} by {}{})\n",
            chart.kind,
            chart.formatting.y_title.as_deref().unwrap_or(y),
            chart.formatting.x_title.as_deref().unwrap_or(x),
            chart.color.as_ref().map(|c| format!(", series {}", c)).unwrap_or_default()
        ),
        _ => println!("Chart: {}\n", chart.kind),
    }

    let result = &answer.result;
    println!("{}", result.column_names().join(" | "));
    for row in result.rows().iter().take(PREVIEW_ROWS) {
        println!(
            "{}",
            row.iter().map(|v| chart.formatting.format_value(v)).join(" | ")
        );
    }
    if result.row_count() > PREVIEW_ROWS {
        println!("... {} more rows", result.row_count() - PREVIEW_ROWS);
    }
    Ok(())
}
