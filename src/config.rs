//! Server configuration: defaults, environment overrides.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Knobs consumed by the per-project worker loops.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Local working tree the coding agent and git operate in.
    pub repo_path: PathBuf,
    pub ci_poll_interval: Duration,
    /// Give up on CI after this many polls; `None` waits forever.
    pub ci_max_polls: Option<u32>,
    /// Kill the coding agent after this long; `None` lets it run.
    pub agent_timeout: Option<Duration>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from("."),
            ci_poll_interval: Duration::from_secs(30),
            ci_max_polls: None,
            agent_timeout: None,
        }
    }
}

/// Configuration for the HTTP server and scheduler.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub dev_mode: bool,
    /// Per-project cap on pipelines in the working set.
    pub max_concurrent: usize,
    pub scheduler_poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub runtime: RuntimeConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8321,
            db_path: PathBuf::from(".vibecc/vibecc.db"),
            log_dir: None,
            dev_mode: false,
            max_concurrent: 1,
            scheduler_poll_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(30),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults with `VIBECC_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Apply overrides from a key lookup. Split out from `from_env` so
    /// tests can pass a map instead of mutating the process environment.
    pub fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(port) = parse(&get, "VIBECC_PORT") {
            self.port = port;
        }
        if let Some(path) = get("VIBECC_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Some(path) = get("VIBECC_REPO_PATH") {
            self.runtime.repo_path = PathBuf::from(path);
        }
        if let Some(dir) = get("VIBECC_LOG_DIR") {
            self.log_dir = Some(PathBuf::from(dir));
        }
        if let Some(max) = parse(&get, "VIBECC_MAX_CONCURRENT") {
            self.max_concurrent = max;
        }
        if let Some(secs) = parse(&get, "VIBECC_POLL_INTERVAL_SECS") {
            self.scheduler_poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(&get, "VIBECC_HEARTBEAT_SECS") {
            self.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(&get, "VIBECC_CI_POLL_SECS") {
            self.runtime.ci_poll_interval = Duration::from_secs(secs);
        }
        if let Some(max_polls) = parse(&get, "VIBECC_CI_MAX_POLLS") {
            self.runtime.ci_max_polls = Some(max_polls);
        }
        if let Some(secs) = parse(&get, "VIBECC_AGENT_TIMEOUT_SECS") {
            self.runtime.agent_timeout = Some(Duration::from_secs(secs));
        }
    }
}

fn parse<T: FromStr>(get: impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = get(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable config override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8321);
        assert_eq!(config.db_path, PathBuf::from(".vibecc/vibecc.db"));
        assert_eq!(config.max_concurrent, 1);
        assert_eq!(config.scheduler_poll_interval, Duration::from_secs(2));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.runtime.ci_poll_interval, Duration::from_secs(30));
        assert!(config.runtime.ci_max_polls.is_none());
        assert!(config.runtime.agent_timeout.is_none());
        assert!(!config.dev_mode);
    }

    #[test]
    fn test_overrides_applied() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("VIBECC_PORT", "9000"),
            ("VIBECC_DB_PATH", "/data/vibecc.db"),
            ("VIBECC_REPO_PATH", "/srv/checkout"),
            ("VIBECC_MAX_CONCURRENT", "4"),
            ("VIBECC_CI_MAX_POLLS", "20"),
            ("VIBECC_AGENT_TIMEOUT_SECS", "600"),
        ]);
        let mut config = ServerConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.port, 9000);
        assert_eq!(config.db_path, PathBuf::from("/data/vibecc.db"));
        assert_eq!(config.runtime.repo_path, PathBuf::from("/srv/checkout"));
        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.runtime.ci_max_polls, Some(20));
        assert_eq!(config.runtime.agent_timeout, Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_unparseable_override_is_ignored() {
        let mut config = ServerConfig::default();
        config.apply_overrides(|key| (key == "VIBECC_PORT").then(|| "not-a-port".to_string()));
        assert_eq!(config.port, 8321);
    }
}
