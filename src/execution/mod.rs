//! Execution Module
//!
//! Scoped queries run here against the loaded tables and come back as
//! typed result sets.

pub mod executor;
pub mod result;

pub use executor::{ExecutionEngine, PolarsExecutor};
pub use result::{ResultColumn, ResultSet, Scalar};
