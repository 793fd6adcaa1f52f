//! Environment-driven configuration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Which services a node runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Hosts worker runtimes consuming dedicated inboxes.
    Worker,
    /// Hosts a resource-manager candidate (active or standby).
    ResourceManager,
    /// Hosts the scheduler-side sweeper.
    Scheduler,
}

impl std::str::FromStr for NodeRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "worker" => Ok(NodeRole::Worker),
            "resource_manager" => Ok(NodeRole::ResourceManager),
            "scheduler" => Ok(NodeRole::Scheduler),
            other => anyhow::bail!("unknown role: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub nats_url: String,
    pub role: NodeRole,
    /// Host-unique suffix for registry names (`worker1@<node_id>`).
    pub node_id: String,
    /// Worker runtimes hosted by a worker node, each with its own inbox.
    pub worker_slots: usize,
    pub heartbeat_interval: Duration,
    /// A worker missing heartbeats for this long is declared gone.
    pub missing_timeout: Duration,
    /// Root for per-task working directories.
    pub work_dir: Option<PathBuf>,
    pub profiling_enabled: bool,
    pub profiling_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let nats_url =
            std::env::var("NATS_URL").unwrap_or_else(|_| "nats://127.0.0.1:4222".to_string());

        let role = std::env::var("DISPATCH_ROLE")
            .unwrap_or_else(|_| "worker".to_string())
            .parse()?;

        let node_id = std::env::var("DISPATCH_NODE_ID")
            .unwrap_or_else(|_| uuid::Uuid::new_v4().simple().to_string());

        let worker_slots = parse_env("DISPATCH_WORKER_SLOTS", 2usize)?;
        let heartbeat_interval =
            Duration::from_secs(parse_env("DISPATCH_HEARTBEAT_INTERVAL_SECS", 5u64)?);
        let missing_timeout =
            Duration::from_secs(parse_env("DISPATCH_MISSING_TIMEOUT_SECS", 30u64)?);

        let work_dir = std::env::var("DISPATCH_WORK_DIR").ok().map(PathBuf::from);

        let profiling_enabled = std::env::var("DISPATCH_PROFILING_ENABLED")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let profiling_dir = std::env::var("DISPATCH_PROFILING_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/lib/dispatch/profiles"));

        Ok(Self {
            database_url,
            nats_url,
            role,
            node_id,
            worker_slots,
            heartbeat_interval,
            missing_timeout,
            work_dir,
            profiling_enabled,
            profiling_dir,
        })
    }

    /// Registry name for a worker slot on this node.
    pub fn worker_name(&self, slot: usize) -> String {
        format!("worker{}@{}", slot, self.node_id)
    }

    /// Registry name for the resource-manager candidate on this node.
    pub fn resource_manager_name(&self) -> String {
        format!("resource_manager@{}", self.node_id)
    }

    /// Registry name for the scheduler on this node.
    pub fn scheduler_name(&self) -> String {
        format!("scheduler@{}", self.node_id)
    }
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("invalid value for {key}: {value}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parses_known_names() {
        assert_eq!("worker".parse::<NodeRole>().unwrap(), NodeRole::Worker);
        assert_eq!(
            "resource_manager".parse::<NodeRole>().unwrap(),
            NodeRole::ResourceManager
        );
        assert_eq!("scheduler".parse::<NodeRole>().unwrap(), NodeRole::Scheduler);
        assert!("other".parse::<NodeRole>().is_err());
    }

    #[test]
    fn derived_names_use_reserved_prefixes() {
        let config = Config {
            database_url: String::new(),
            nats_url: String::new(),
            role: NodeRole::Worker,
            node_id: "h1".into(),
            worker_slots: 2,
            heartbeat_interval: Duration::from_secs(5),
            missing_timeout: Duration::from_secs(30),
            work_dir: None,
            profiling_enabled: false,
            profiling_dir: PathBuf::new(),
        };

        assert_eq!(config.worker_name(1), "worker1@h1");
        assert_eq!(config.resource_manager_name(), "resource_manager@h1");
        assert_eq!(config.scheduler_name(), "scheduler@h1");

        use crate::store::is_user_worker_name;
        assert!(is_user_worker_name(&config.worker_name(1)));
        assert!(!is_user_worker_name(&config.resource_manager_name()));
        assert!(!is_user_worker_name(&config.scheduler_name()));
    }
}
