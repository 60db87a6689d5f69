//! Server configuration from environment variables.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use asyncjob_core::NodeId;
use asyncjob_infra::jobs::JobManagerConfig;
use asyncjob_observability::{LogConfig, LogFormat};

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{name}: cannot parse `{value}`: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Postgres store when set. Otherwise an in-memory store, for development.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    /// Redis pub/sub bus when set and built with `redis`.
    pub redis_url: Option<String>,
    pub job: JobManagerConfig,
    pub log: LogConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            database_url: None,
            db_max_connections: DEFAULT_DB_MAX_CONNECTIONS,
            redis_url: None,
            job: JobManagerConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup: &lookup };
        let defaults = JobManagerConfig::default();

        let node_id = match env.parse::<u64>("ASYNCJOB_NODE_ID")? {
            Some(id) => NodeId::new(id),
            None => {
                warn!("ASYNCJOB_NODE_ID not set; defaulting to node 1 (not safe for multi-node)");
                defaults.node_id
            }
        };
        let listen_addr = env
            .parse::<SocketAddr>("ASYNCJOB_LISTEN_ADDR")?
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080)));

        let database_url = env.string("DATABASE_URL");
        if database_url.is_none() {
            warn!("DATABASE_URL not set; jobs are kept in memory and lost on restart");
        }
        let redis_url = env.string("REDIS_URL");

        let minutes = |name: &'static str| -> Result<Option<Duration>, ConfigError> {
            let Some(m) = env.parse::<u64>(name)? else {
                return Ok(None);
            };
            m.checked_mul(60)
                .map(|secs| Some(Duration::from_secs(secs)))
                .ok_or_else(|| ConfigError::Invalid {
                    name,
                    value: m.to_string(),
                    reason: "too many minutes".into(),
                })
        };
        let job_expire = minutes("ASYNCJOB_JOB_EXPIRE_MINUTES")?.unwrap_or(defaults.job_expire);
        let cancel_threshold = minutes("ASYNCJOB_JOB_CANCEL_THRESHOLD_MINUTES")?
            .unwrap_or(defaults.job_cancel_threshold);
        let lock_wait_timeout = env
            .parse::<u64>("ASYNCJOB_LOCK_WAIT_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.lock_wait_timeout);
        let api_pool = env
            .parse::<usize>("ASYNCJOB_API_POOL_SIZE")?
            .unwrap_or(defaults.api_pool_size);
        let worker_pool = env
            .parse::<usize>("ASYNCJOB_WORKER_POOL_SIZE")?
            .unwrap_or(defaults.worker_pool_size);
        let db_max_connections = env
            .parse::<u32>("ASYNCJOB_DB_MAX_CONNECTIONS")?
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS);

        Ok(Self {
            listen_addr,
            database_url,
            db_max_connections,
            redis_url,
            job: JobManagerConfig::default()
                .with_node_id(node_id)
                .with_job_expire(job_expire)
                .with_job_cancel_threshold(cancel_threshold)
                .with_lock_wait_timeout(lock_wait_timeout)
                .with_pool_sizes(api_pool, worker_pool),
            log: log_config_from_lookup(&lookup)?,
        })
    }
}

/// Logging settings alone, so logging can be up before the rest is parsed.
pub fn log_config_from_env() -> Result<LogConfig, ConfigError> {
    log_config_from_lookup(&|name: &str| std::env::var(name).ok())
}

fn log_config_from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<LogConfig, ConfigError> {
    let env = Env { lookup };
    let format = env.parse::<LogFormat>("ASYNCJOB_LOG_FORMAT")?.unwrap_or_default();
    Ok(LogConfig::default().with_format(format))
}

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, name: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(value) = self.string(name) else {
            return Ok(None);
        };
        value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Invalid {
                name,
                value,
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.listen_addr.to_string(), DEFAULT_LISTEN_ADDR);
        assert_eq!(config.database_url, None);
        assert_eq!(config.job.node_id, NodeId::new(1));
        assert_eq!(config.job.job_expire, Duration::from_secs(1440 * 60));
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test]
    fn reads_every_variable() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("ASYNCJOB_NODE_ID", "42"),
            ("ASYNCJOB_LISTEN_ADDR", "127.0.0.1:9000"),
            ("DATABASE_URL", "postgres://localhost/jobs"),
            ("REDIS_URL", "redis://localhost:6379"),
            ("ASYNCJOB_JOB_EXPIRE_MINUTES", "60"),
            ("ASYNCJOB_JOB_CANCEL_THRESHOLD_MINUTES", "5"),
            ("ASYNCJOB_LOCK_WAIT_TIMEOUT_MS", "250"),
            ("ASYNCJOB_API_POOL_SIZE", "3"),
            ("ASYNCJOB_WORKER_POOL_SIZE", "7"),
            ("ASYNCJOB_LOG_FORMAT", "compact"),
        ]))
        .unwrap();

        assert_eq!(config.job.node_id, NodeId::new(42));
        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/jobs"));
        assert_eq!(config.redis_url.as_deref(), Some("redis://localhost:6379"));
        assert_eq!(config.job.job_expire, Duration::from_secs(3600));
        assert_eq!(config.job.job_cancel_threshold, Duration::from_secs(300));
        assert_eq!(config.job.lock_wait_timeout, Duration::from_millis(250));
        assert_eq!(config.job.api_pool_size, 3);
        assert_eq!(config.job.worker_pool_size, 7);
        assert_eq!(config.log.format, LogFormat::Compact);
    }

    #[test]
    fn unparsable_values_are_errors() {
        let err = ServerConfig::from_lookup(lookup(&[("ASYNCJOB_NODE_ID", "node-a")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "ASYNCJOB_NODE_ID", .. }));

        assert!(ServerConfig::from_lookup(lookup(&[("ASYNCJOB_LOG_FORMAT", "xml")])).is_err());
    }

    #[test]
    fn overflowing_minutes_are_errors() {
        let err = ServerConfig::from_lookup(lookup(&[(
            "ASYNCJOB_JOB_EXPIRE_MINUTES",
            "18446744073709551615",
        )]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { name: "ASYNCJOB_JOB_EXPIRE_MINUTES", .. }
        ));
    }

    #[test]
    fn blank_values_count_as_unset() {
        let config = ServerConfig::from_lookup(lookup(&[("DATABASE_URL", "  ")])).unwrap();
        assert_eq!(config.database_url, None);
    }
}
