//! Process configuration.
//!
//! Defaults come from `SCHED_*` environment variables; a JSON file found via
//! [`resolve_config_path`] overrides them. `${VAR}` references inside string
//! values of the file are expanded from the environment.

use serde::Deserialize;
use std::{env, fs, path::PathBuf, time::Duration};

use crate::db::DatabaseConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// How often a running task polls the executor for results.
    pub poll_interval: Duration,
    /// Upper bound on the dispatch loop's sleep between passes.
    pub dispatch_tick: Duration,
    /// Root directory for raw data saved by the executor.
    pub data_path: PathBuf,
    /// Keep finished tasks in the running pool for inspection.
    pub debug_mode: bool,
    pub database: DatabaseConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: env_millis("SCHED_POLL_INTERVAL_MS").unwrap_or(Duration::from_secs(1)),
            dispatch_tick: env_millis("SCHED_DISPATCH_TICK_MS")
                .unwrap_or(Duration::from_millis(100)),
            data_path: env::var("SCHED_DATA_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_data_path()),
            debug_mode: env::var("SCHED_DEBUG").is_ok_and(|v| is_truthy(&v)),
            database: DatabaseConfig::default(),
        }
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn default_data_path() -> PathBuf {
    env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("data")
}

/// On-disk overrides. Absent fields keep the environment defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SchedulerJsonConfig {
    pub poll_interval_ms: Option<u64>,
    pub dispatch_tick_ms: Option<u64>,
    pub data_path: Option<String>,
    pub debug: Option<bool>,
    pub database: Option<DatabaseJsonConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseJsonConfig {
    pub url: Option<String>,
    pub namespace: Option<String>,
    pub database: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl SchedulerConfig {
    /// Environment defaults, overridden by the config file if one exists.
    pub fn load() -> anyhow::Result<Self> {
        let config = Self::default();
        match resolve_config_path() {
            Some(path) => {
                let raw = fs::read_to_string(&path)?;
                let parsed: SchedulerJsonConfig = serde_json::from_str(&raw)
                    .map_err(|e| anyhow::anyhow!("Invalid config {}: {}", path.display(), e))?;
                Ok(config.apply(parsed))
            }
            None => Ok(config),
        }
    }

    /// Fast intervals and an in-memory database under `data_path`.
    pub fn for_tests(data_path: impl Into<PathBuf>) -> Self {
        Self {
            poll_interval: Duration::from_millis(5),
            dispatch_tick: Duration::from_millis(5),
            data_path: data_path.into(),
            debug_mode: false,
            database: DatabaseConfig::memory(),
        }
    }

    pub fn apply(mut self, file: SchedulerJsonConfig) -> Self {
        if let Some(ms) = file.poll_interval_ms {
            self.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = file.dispatch_tick_ms {
            self.dispatch_tick = Duration::from_millis(ms);
        }
        if let Some(path) = file.data_path {
            self.data_path = PathBuf::from(expand_env_vars(&path));
        }
        if let Some(debug) = file.debug {
            self.debug_mode = debug;
        }
        if let Some(db) = file.database {
            let target = &mut self.database;
            if let Some(url) = db.url {
                target.url = expand_env_vars(&url);
            }
            if let Some(ns) = db.namespace {
                target.namespace = expand_env_vars(&ns);
            }
            if let Some(name) = db.database {
                target.database = expand_env_vars(&name);
            }
            if let Some(user) = db.username {
                target.username = Some(expand_env_vars(&user));
            }
            if let Some(pass) = db.password {
                target.password = Some(expand_env_vars(&pass));
            }
        }
        self
    }

    /// Where the executor should save raw data of task `task_id`.
    pub fn task_data_path(&self, task_id: crate::types::TaskId) -> PathBuf {
        self.data_path.join(task_id.to_string())
    }
}

pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(p) = env::var("SCHED_CONFIG") {
        return Some(PathBuf::from(p));
    }

    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(xdg)
            .join("experiment-scheduler")
            .join("scheduler.json");
        if candidate.exists() {
            return Some(candidate);
        }
    }

    let candidate = PathBuf::from("scheduler.json");
    if candidate.exists() {
        return Some(candidate);
    }

    None
}

fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            match env::var(&name) {
                Ok(val) => out.push_str(&val),
                Err(_) => {
                    out.push_str("${");
                    out.push_str(&name);
                    out.push('}');
                }
            }
        } else {
            out.push(ch);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_unknown_var_is_kept() {
        assert_eq!(
            expand_env_vars("${SCHED_TEST_SURELY_UNSET_VAR}/data"),
            "${SCHED_TEST_SURELY_UNSET_VAR}/data"
        );
        assert_eq!(expand_env_vars("plain"), "plain");
    }

    #[test]
    fn test_expand_known_var() {
        if let Ok(path) = env::var("PATH") {
            assert_eq!(expand_env_vars("${PATH}:/opt"), format!("{path}:/opt"));
        }
    }

    #[test]
    fn test_file_overrides_defaults() {
        let raw = r#"{
            "poll_interval_ms": 250,
            "data_path": "/srv/data",
            "debug": true,
            "database": {"namespace": "fridge2"}
        }"#;
        let parsed: SchedulerJsonConfig = serde_json::from_str(raw).unwrap();
        let config = SchedulerConfig::for_tests("/tmp").apply(parsed);

        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.dispatch_tick, Duration::from_millis(5));
        assert_eq!(config.data_path, PathBuf::from("/srv/data"));
        assert!(config.debug_mode);
        assert_eq!(config.database.namespace, "fridge2");
        assert_eq!(config.database.url, "memory");
    }

    #[test]
    fn test_truthy_values() {
        assert!(is_truthy("1"));
        assert!(is_truthy(" TRUE "));
        assert!(!is_truthy("0"));
        assert!(!is_truthy(""));
    }

    #[test]
    fn test_task_data_path() {
        let config = SchedulerConfig::for_tests("/data");
        assert_eq!(
            config.task_data_path(crate::types::TaskId::new(12)),
            PathBuf::from("/data/12")
        );
    }
}
