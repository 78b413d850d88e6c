pub mod access_control;
pub mod policy;
pub mod query_guards;
pub mod user_manager;

pub use access_control::{AccessControlFilter, RowScope, ScopedQuery};
pub use policy::{AccessPolicy, Role};
pub use query_guards::{SafetyValidator, ValidatedQuery};
pub use user_manager::{User, UserDirectory};
