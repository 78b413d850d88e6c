//! Security Policy Definitions
//!
//! Roles are plain data checked uniformly by the access-control filter; no
//! component branches on a role's name.

use crate::error::{AnalyticsError, Result};
use crate::security::user_manager::User;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Named permission bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub can_view_sensitive: bool,
    pub can_export: bool,
    pub can_view_all_rows: bool,
    pub max_query_rows: usize,
}

impl Role {
    pub fn admin() -> Self {
        Self {
            name: "admin".to_string(),
            can_view_sensitive: true,
            can_export: true,
            can_view_all_rows: true,
            max_query_rows: 10_000,
        }
    }

    pub fn manager() -> Self {
        Self {
            name: "manager".to_string(),
            can_view_sensitive: false,
            can_export: true,
            can_view_all_rows: true,
            max_query_rows: 5_000,
        }
    }

    pub fn sales_rep() -> Self {
        Self {
            name: "sales_rep".to_string(),
            can_view_sensitive: false,
            can_export: false,
            can_view_all_rows: false,
            max_query_rows: 500,
        }
    }
}

/// Roles plus the column-level rules every role is checked against
#[derive(Debug, Clone)]
pub struct AccessPolicy {
    owner_column: String,
    sensitive_columns: HashSet<String>,
    roles: BTreeMap<String, Role>,
}

impl AccessPolicy {
    pub fn new(owner_column: String, sensitive_columns: Vec<String>, roles: Vec<Role>) -> Self {
        Self {
            owner_column,
            sensitive_columns: sensitive_columns
                .into_iter()
                .map(|c| c.to_lowercase())
                .collect(),
            roles: roles.into_iter().map(|r| (r.name.clone(), r)).collect(),
        }
    }

    /// Column whose value identifies the owning user of a row
    pub fn owner_column(&self) -> &str {
        &self.owner_column
    }

    pub fn is_sensitive(&self, column: &str) -> bool {
        self.sensitive_columns.contains(&column.to_lowercase())
    }

    pub fn role(&self, name: &str) -> Result<&Role> {
        self.roles
            .get(name)
            .ok_or_else(|| AnalyticsError::Config(format!("Unknown role '{}'", name)))
    }

    /// Resolve the role bound to a user; an unknown role fails closed
    pub fn role_for(&self, user: &User) -> Result<&Role> {
        self.role(&user.role)
    }

    pub fn roles(&self) -> impl Iterator<Item = &Role> {
        self.roles.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensitive_lookup_ignores_case() {
        let policy = AccessPolicy::new(
            "sales_rep_id".to_string(),
            vec!["Email".to_string()],
            vec![Role::admin()],
        );
        assert!(policy.is_sensitive("EMAIL"));
        assert!(policy.is_sensitive("email"));
        assert!(!policy.is_sensitive("region"));
    }

    #[test]
    fn test_user_with_unknown_role_fails_closed() {
        let policy = AccessPolicy::new("sales_rep_id".to_string(), vec![], vec![Role::admin()]);
        let user = User::new("sam", "sales_rep", Some("SR001".to_string()));
        assert!(matches!(policy.role_for(&user), Err(AnalyticsError::Config(_))));
    }
}
