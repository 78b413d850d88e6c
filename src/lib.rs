//! Conversational analytics over tabular sales data.
//!
//! A question goes to an external SQL generator together with a role-aware
//! description of the schema. The returned SQL is validated as a single
//! read-only SELECT, scoped to what the asking user may see, executed against
//! in-memory tables and paired with a chart suggestion.

pub mod config;
pub mod data_assistant;
pub mod error;
pub mod execution;
pub mod llm;
pub mod retry;
pub mod schema;
pub mod security;
pub mod table;
pub mod visualization;

pub use data_assistant::{Answer, DataAssistant};
pub use error::{AnalyticsError, RejectionRule, Result};
