//! User Directory
//!
//! Read-only lookup of the users configured at startup.

use crate::error::{AnalyticsError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Identity bound to exactly one role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub display_name: String,
    pub role: String,
    /// Owner-column value this user's rows carry (e.g. a sales rep id)
    pub owned_scope: Option<String>,
}

impl User {
    pub fn new(username: impl Into<String>, role: impl Into<String>, owned_scope: Option<String>) -> Self {
        let username = username.into();
        Self {
            display_name: username.clone(),
            username,
            role: role.into(),
            owned_scope,
        }
    }
}

pub struct UserDirectory {
    users: HashMap<String, User>,
}

impl UserDirectory {
    pub fn new(users: Vec<User>) -> Result<Self> {
        let mut by_name = HashMap::with_capacity(users.len());
        for user in users {
            if by_name.contains_key(&user.username) {
                return Err(AnalyticsError::Config(format!(
                    "User '{}' defined more than once",
                    user.username
                )));
            }
            by_name.insert(user.username.clone(), user);
        }
        Ok(Self { users: by_name })
    }

    pub fn get_user(&self, username: &str) -> Result<&User> {
        self.users
            .get(username)
            .ok_or_else(|| AnalyticsError::Config(format!("User '{}' not found", username)))
    }

    /// Users sorted by username
    pub fn list_users(&self) -> Vec<&User> {
        let mut users: Vec<&User> = self.users.values().collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        users
    }

    pub fn list_users_by_role(&self, role: &str) -> Vec<&User> {
        self.list_users().into_iter().filter(|u| u.role == role).collect()
    }
}
