//! Configuration
//!
//! Runtime settings come from the environment (a `.env` file is honoured by the
//! binary). Roles, users and domain notes come from a JSON access file that is
//! loaded once at startup and never mutated.

use crate::error::{AnalyticsError, Result};
use crate::schema::ContextNotes;
use crate::security::policy::{AccessPolicy, Role};
use crate::security::user_manager::{User, UserDirectory};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

pub const DEFAULT_LLM_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_OWNER_COLUMN: &str = "sales_rep_id";

/// Settings read from environment variables
#[derive(Debug, Clone)]
pub struct Settings {
    pub llm_api_key: Option<String>,
    pub llm_base_url: String,
    pub llm_model: String,
    pub llm_timeout: Duration,
    pub llm_max_retries: usize,
    pub query_timeout: Duration,
    pub schema_sample_values: usize,
    pub schema_context_max_chars: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            llm_api_key: None,
            llm_base_url: DEFAULT_LLM_BASE_URL.to_string(),
            llm_model: DEFAULT_LLM_MODEL.to_string(),
            llm_timeout: Duration::from_secs(30),
            llm_max_retries: 2,
            query_timeout: Duration::from_secs(30),
            schema_sample_values: 3,
            schema_context_max_chars: 8000,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup, falling back to defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let llm_api_key = lookup("LLM_API_KEY")
            .or_else(|| lookup("OPENAI_API_KEY"))
            .filter(|k| !k.trim().is_empty());

        Ok(Self {
            llm_api_key,
            llm_base_url: lookup("LLM_BASE_URL").unwrap_or(defaults.llm_base_url),
            llm_model: lookup("LLM_MODEL").unwrap_or(defaults.llm_model),
            llm_timeout: Duration::from_secs(parse_or(
                &lookup,
                "LLM_TIMEOUT_SECS",
                defaults.llm_timeout.as_secs(),
            )?),
            llm_max_retries: parse_or(&lookup, "LLM_MAX_RETRIES", defaults.llm_max_retries)?,
            query_timeout: Duration::from_secs(parse_or(
                &lookup,
                "QUERY_TIMEOUT_SECS",
                defaults.query_timeout.as_secs(),
            )?),
            schema_sample_values: parse_or(
                &lookup,
                "SCHEMA_SAMPLE_VALUES",
                defaults.schema_sample_values,
            )?,
            schema_context_max_chars: parse_or(
                &lookup,
                "SCHEMA_CONTEXT_MAX_CHARS",
                defaults.schema_context_max_chars,
            )?,
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AnalyticsError::Config(format!("{} must be a number, got '{}'", key, raw))),
        None => Ok(default),
    }
}

/// Role record as written in the access file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleConfig {
    #[serde(default)]
    pub can_view_sensitive: bool,
    #[serde(default)]
    pub can_export: bool,
    #[serde(default)]
    pub can_view_all_rows: bool,
    #[serde(default = "default_max_query_rows")]
    pub max_query_rows: usize,
}

fn default_max_query_rows() -> usize {
    500
}

fn default_owner_column() -> String {
    DEFAULT_OWNER_COLUMN.to_string()
}

/// User record as written in the access file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub username: String,
    #[serde(default)]
    pub name: Option<String>,
    pub role: String,
    #[serde(default)]
    pub owned_scope: Option<String>,
}

/// Contents of the access configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessConfig {
    #[serde(default = "default_owner_column")]
    pub owner_column: String,
    #[serde(default)]
    pub sensitive_columns: Vec<String>,
    pub roles: BTreeMap<String, RoleConfig>,
    pub users: Vec<UserConfig>,
    #[serde(default)]
    pub table_descriptions: BTreeMap<String, String>,
    #[serde(default)]
    pub domain_notes: Vec<String>,
}

impl AccessConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AnalyticsError::Config(format!("Cannot read access config {}: {}", path.display(), e))
        })?;
        let config = Self::from_json(&raw)?;
        info!(
            "Loaded {} roles and {} users from {}",
            config.roles.len(),
            config.users.len(),
            path.display()
        );
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: AccessConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.roles.is_empty() {
            return Err(AnalyticsError::Config("No roles configured".to_string()));
        }
        if self.users.is_empty() {
            return Err(AnalyticsError::Config("No users configured".to_string()));
        }
        if self.owner_column.trim().is_empty() {
            return Err(AnalyticsError::Config("owner_column must not be empty".to_string()));
        }
        for user in &self.users {
            if !self.roles.contains_key(&user.role) {
                return Err(AnalyticsError::Config(format!(
                    "User '{}' references unknown role '{}'",
                    user.username, user.role
                )));
            }
        }
        Ok(())
    }

    pub fn access_policy(&self) -> AccessPolicy {
        let roles = self
            .roles
            .iter()
            .map(|(name, r)| Role {
                name: name.clone(),
                can_view_sensitive: r.can_view_sensitive,
                can_export: r.can_export,
                can_view_all_rows: r.can_view_all_rows,
                max_query_rows: r.max_query_rows,
            })
            .collect();
        AccessPolicy::new(
            self.owner_column.clone(),
            self.sensitive_columns.clone(),
            roles,
        )
    }

    pub fn user_directory(&self) -> Result<UserDirectory> {
        let users = self
            .users
            .iter()
            .map(|u| User {
                username: u.username.clone(),
                display_name: u.name.clone().unwrap_or_else(|| u.username.clone()),
                role: u.role.clone(),
                owned_scope: u.owned_scope.clone(),
            })
            .collect();
        UserDirectory::new(users)
    }

    pub fn context_notes(&self) -> ContextNotes {
        ContextNotes {
            table_descriptions: self.table_descriptions.clone(),
            domain_notes: self.domain_notes.clone(),
        }
    }
}
