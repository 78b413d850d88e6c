//! Schema
//!
//! Introspection of the loaded tables and the prompt-ready context built from it.

pub mod context;
pub mod introspector;

pub use context::{ContextNotes, SchemaContextBuilder};
pub use introspector::{ColumnDescriptor, SchemaDescriptor, SchemaIntrospector, TableDescriptor};
