//! Principals, role tiers, and scope authorization.
//!
//! Session handling lives in the outer HTTP layer; this module only needs a
//! way to turn request headers into a [`Principal`] and the rules deciding
//! what that principal may start or watch.

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use axum::http::{HeaderMap, header};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConfigError, TaskError};
use crate::tasks::model::TaskScope;

/// Privilege tiers, lowest first. `Owner` is the highest tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Viewer,
    Moderator,
    Admin,
    Owner,
}

/// Minimum role needed to start a task in a guild.
pub const MIN_START_ROLE: Role = Role::Admin;

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    pub role: Role,
    pub guilds: HashSet<String>,
}

impl Principal {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
            guilds: HashSet::new(),
        }
    }

    pub fn with_guild(mut self, guild: impl Into<String>) -> Self {
        self.guilds.insert(guild.into());
        self
    }

    /// Owners are members of every guild.
    pub fn is_member(&self, guild: &str) -> bool {
        self.role == Role::Owner || self.guilds.contains(guild)
    }
}

/// May `principal` observe tasks in `scope`?
pub fn authorize_view(principal: &Principal, scope: &TaskScope) -> Result<(), TaskError> {
    let allowed = match scope {
        TaskScope::Global => principal.role == Role::Owner,
        TaskScope::Guild(guild) => principal.is_member(guild),
    };
    if allowed {
        Ok(())
    } else {
        Err(TaskError::AccessDenied)
    }
}

/// May `principal` start tasks in `scope`?
pub fn authorize_start(principal: &Principal, scope: &TaskScope) -> Result<(), TaskError> {
    authorize_view(principal, scope)?;
    if principal.role < MIN_START_ROLE {
        return Err(TaskError::InsufficientRole);
    }
    Ok(())
}

/// Resolves the caller behind a request.
#[async_trait]
pub trait PrincipalResolver: Send + Sync {
    async fn resolve(&self, headers: &HeaderMap) -> Option<Principal>;
}

/// Extract the token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

#[derive(Deserialize)]
struct PrincipalEntry {
    token: String,
    id: String,
    role: Role,
    #[serde(default)]
    guilds: Vec<String>,
}

/// Fixed token table, loaded from a JSON array of
/// `{ "token", "id", "role", "guilds" }` objects.
pub struct StaticPrincipals {
    entries: Vec<(SecretString, Principal)>,
}

impl StaticPrincipals {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn with(mut self, token: impl Into<String>, principal: Principal) -> Self {
        self.entries
            .push((SecretString::from(token.into()), principal));
        self
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let parsed: Vec<PrincipalEntry> =
            serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        let entries = parsed
            .into_iter()
            .map(|entry| {
                let principal = Principal {
                    id: entry.id,
                    role: entry.role,
                    guilds: entry.guilds.into_iter().collect(),
                };
                (SecretString::from(entry.token), principal)
            })
            .collect();

        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for StaticPrincipals {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PrincipalResolver for StaticPrincipals {
    async fn resolve(&self, headers: &HeaderMap) -> Option<Principal> {
        let token = bearer_token(headers)?;
        let found = self
            .entries
            .iter()
            .find(|(secret, _)| secret.expose_secret() == token)
            .map(|(_, principal)| principal.clone());
        if found.is_none() {
            debug!("Unknown bearer token");
        }
        found
    }
}
