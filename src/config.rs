use std::env;
use std::time::Duration;

use color_eyre::eyre::{eyre, Result, WrapErr};
use serde::{Deserialize, Serialize};

/// Which queue backend drives the workers.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackend {
    #[default]
    Memory,
    Remote,
}

/// Process configuration.
///
/// Values come from an optional `modindex.toml` in the working directory,
/// overridden by environment variables. Required settings with neither
/// source are a fatal init error; unrecognized variables are ignored.
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(default)]
pub struct Config {
    /// Upstream index stream, e.g. `https://index.golang.org/index`.
    pub index_url: String,
    /// Upstream module proxy, e.g. `https://proxy.golang.org`.
    pub proxy_url: String,
    /// Postgres DSN. Required.
    pub database_url: String,
    /// Opaque label of this ingest binary; keys reprocess decisions. Required.
    pub app_version_label: String,
    pub workers: usize,
    /// Hard deadline for one fetch task, in seconds.
    pub fetch_timeout_secs: u64,
    pub exclusion_refresh_secs: u64,
    pub new_poll_interval_secs: u64,
    pub reprocess_interval_secs: u64,
    /// Concurrent requests allowed against the proxy host.
    pub proxy_host_limit: usize,
    /// Global in-flight task bound for the queue.
    pub max_in_flight: usize,
    pub queue_backend: QueueBackend,
    /// Base URL of the hosted task service; required for the remote backend.
    pub tasks_url: Option<String>,
    pub admin_addr: String,
    /// Bootstrap exclusion file, `<prefix> <reason>` per line.
    pub exclusions_file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            index_url: "https://index.golang.org/index".into(),
            proxy_url: "https://proxy.golang.org".into(),
            database_url: String::new(),
            app_version_label: String::new(),
            workers: 10,
            fetch_timeout_secs: 600,
            exclusion_refresh_secs: 60,
            new_poll_interval_secs: 600,
            reprocess_interval_secs: 3600,
            proxy_host_limit: 50,
            max_in_flight: 100,
            queue_backend: QueueBackend::Memory,
            tasks_url: None,
            admin_addr: "0.0.0.0:8000".into(),
            exclusions_file: None,
        }
    }
}

fn env_override(cfg: &mut Config) -> Result<()> {
    fn set_string(slot: &mut String, var: &str) {
        if let Ok(v) = env::var(var) {
            *slot = v;
        }
    }

    fn set_opt(slot: &mut Option<String>, var: &str) {
        if let Ok(v) = env::var(var) {
            *slot = Some(v);
        }
    }

    fn set_parsed<T: std::str::FromStr>(slot: &mut T, var: &str) -> Result<()>
    where
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        if let Ok(v) = env::var(var) {
            *slot = v
                .parse()
                .wrap_err_with(|| format!("invalid value for {var}"))?;
        }
        Ok(())
    }

    set_string(&mut cfg.index_url, "MODINDEX_INDEX_URL");
    set_string(&mut cfg.proxy_url, "MODINDEX_PROXY_URL");
    set_string(&mut cfg.database_url, "MODINDEX_DATABASE_URL");
    set_string(&mut cfg.app_version_label, "MODINDEX_APP_VERSION");
    set_parsed(&mut cfg.workers, "MODINDEX_WORKERS")?;
    set_parsed(&mut cfg.fetch_timeout_secs, "MODINDEX_FETCH_TIMEOUT_SECS")?;
    set_parsed(
        &mut cfg.exclusion_refresh_secs,
        "MODINDEX_EXCLUSION_REFRESH_SECS",
    )?;
    set_parsed(
        &mut cfg.new_poll_interval_secs,
        "MODINDEX_NEW_POLL_INTERVAL_SECS",
    )?;
    set_parsed(
        &mut cfg.reprocess_interval_secs,
        "MODINDEX_REPROCESS_INTERVAL_SECS",
    )?;
    set_parsed(&mut cfg.proxy_host_limit, "MODINDEX_PROXY_HOST_LIMIT")?;
    set_parsed(&mut cfg.max_in_flight, "MODINDEX_MAX_IN_FLIGHT")?;
    if let Ok(v) = env::var("MODINDEX_QUEUE") {
        cfg.queue_backend = match v.as_str() {
            "memory" => QueueBackend::Memory,
            "remote" => QueueBackend::Remote,
            other => return Err(eyre!("unknown queue backend: {other}")),
        };
    }
    set_opt(&mut cfg.tasks_url, "MODINDEX_TASKS_URL");
    set_string(&mut cfg.admin_addr, "MODINDEX_ADMIN_ADDR");
    set_opt(&mut cfg.exclusions_file, "MODINDEX_EXCLUSIONS_FILE");

    Ok(())
}

impl Config {
    pub async fn load() -> Result<Self> {
        let mut cfg = match tokio::fs::read_to_string("modindex.toml").await {
            Ok(text) => toml::from_str(&text).wrap_err("modindex.toml is invalid")?,
            Err(_) => Config::default(),
        };

        env_override(&mut cfg)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.database_url.is_empty() {
            return Err(eyre!("MODINDEX_DATABASE_URL is required"));
        }
        if self.app_version_label.is_empty() {
            return Err(eyre!("MODINDEX_APP_VERSION is required"));
        }
        if self.workers == 0 {
            return Err(eyre!("MODINDEX_WORKERS must be at least 1"));
        }
        if self.queue_backend == QueueBackend::Remote && self.tasks_url.is_none() {
            return Err(eyre!("MODINDEX_TASKS_URL is required for the remote queue"));
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn exclusion_refresh(&self) -> Duration {
        Duration::from_secs(self.exclusion_refresh_secs)
    }

    pub fn new_poll_interval(&self) -> Duration {
        Duration::from_secs(self.new_poll_interval_secs)
    }

    pub fn reprocess_interval(&self) -> Duration {
        Duration::from_secs(self.reprocess_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_need_required_fields() {
        let cfg = Config::default();
        assert!(cfg.validate().is_err());

        let cfg = Config {
            database_url: "postgres://localhost/modindex".into(),
            app_version_label: "20240102t030405".into(),
            ..Config::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn remote_queue_requires_tasks_url() {
        let cfg = Config {
            database_url: "postgres://localhost/modindex".into(),
            app_version_label: "x".into(),
            queue_backend: QueueBackend::Remote,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }
}
