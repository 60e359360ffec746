//! Service configuration, built from environment variables.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigError;
use crate::executor::{CommandExecutor, ExecutorRegistry};
use crate::tasks::TaskKind;
use crate::tasks::reclaim::DEFAULT_RECLAIM_GRACE;

/// Prefix shared by every configuration variable.
pub const ENV_PREFIX: &str = "ADMIN_TASKS_";

/// Service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Interface to bind the HTTP server to.
    pub bind: String,
    /// HTTP port.
    pub port: u16,
    /// How long finished tasks stay queryable before they are reclaimed.
    pub reclaim_grace: Duration,
    /// JSON file with the bearer-token principal table.
    pub principals_path: Option<PathBuf>,
    /// Shell command per task kind. Kinds without one cannot be started.
    pub commands: HashMap<TaskKind, String>,
    /// Working directory for task commands.
    pub work_dir: Option<PathBuf>,
    /// Directory for daily-rolling log files (stderr only when unset).
    pub log_dir: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
            reclaim_grace: DEFAULT_RECLAIM_GRACE,
            principals_path: None,
            commands: HashMap::new(),
            work_dir: None,
            log_dir: None,
        }
    }
}

impl ServiceConfig {
    /// Build config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup. Unset or blank values take
    /// their defaults; malformed numbers are rejected.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let bind = var("BIND").unwrap_or(defaults.bind);

        let port = match var("PORT") {
            Some(s) => parse_number::<u16>("PORT", &s)?,
            None => defaults.port,
        };

        let reclaim_grace = match var("RECLAIM_GRACE_SECS") {
            Some(s) => Duration::from_secs(parse_number("RECLAIM_GRACE_SECS", &s)?),
            None => defaults.reclaim_grace,
        };

        let commands = TaskKind::ALL
            .into_iter()
            .filter_map(|kind| {
                var(&format!("CMD_{}", kind.env_suffix())).map(|cmd| (kind, cmd))
            })
            .collect();

        Ok(Self {
            bind,
            port,
            reclaim_grace,
            principals_path: var("PRINCIPALS").map(PathBuf::from),
            commands,
            work_dir: var("WORK_DIR").map(PathBuf::from),
            log_dir: var("LOG_DIR").map(PathBuf::from),
        })
    }

    /// Socket address string for the listener.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// One [`CommandExecutor`] per configured task command.
    pub fn executors(&self) -> ExecutorRegistry {
        let mut registry = ExecutorRegistry::new();
        for (kind, command) in &self.commands {
            let mut executor = CommandExecutor::new(command.clone());
            if let Some(dir) = &self.work_dir {
                executor = executor.with_working_dir(dir.clone());
            }
            registry.register(*kind, Arc::new(executor));
        }
        registry
    }
}

fn parse_number<T>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: format!("{ENV_PREFIX}{name}"),
        message: format!("{value:?}: {e}"),
    })
}
