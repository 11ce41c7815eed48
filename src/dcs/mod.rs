//! Lease-based cluster coordination.
//!
//! A single leader lease per cluster lives in a [`store::DcsStore`].  Each
//! node runs a [`coordinator::LeaseCoordinator`] that acquires, renews and
//! releases the lease through compare-and-swap store primitives, and an
//! [`ha::HaLoop`] that drives it from the engine's observed role.
//! Timestamps are Unix epoch milliseconds taken from a [`clock::Clock`].

pub mod clock;
pub mod coordinator;
pub mod ha;
pub mod memory;
pub mod sqlite;
pub mod store;

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::config::DcsConfig;
use crate::identity::member_index;
use memory::MemoryStore;
use sqlite::SqliteStore;
use store::DcsStore;

// -- Errors -------------------------------------------------------------------

/// Coordination failures.  Losing a lease race is not one of them.
#[derive(Debug, Error)]
pub enum DcsError {
    /// The lease expired or was taken over while this node believed it held it.
    #[error("leader lease lost{}", .holder.as_deref().map(|h| format!(" to {h}")).unwrap_or_default())]
    LeaseLost { holder: Option<String> },

    #[error("candidate {candidate} is not a member of the cluster")]
    CandidateNotMember { candidate: String },

    #[error("a switchover is already pending")]
    SwitchoverPending,

    #[error("switchover needs a leader or a candidate")]
    EmptySwitchover,

    #[error("{leader} does not hold the leader lease (holder: {})", .holder.as_deref().unwrap_or("none"))]
    LeaderNotHolder {
        leader: String,
        holder: Option<String>,
    },

    #[error("the format of member name is wrong: {name}")]
    InvalidMemberName { name: String },

    #[error("lease store failure: {0}")]
    Store(#[from] anyhow::Error),
}

impl DcsError {
    /// Stable identifier for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            DcsError::LeaseLost { .. } => "LeaseLost",
            DcsError::CandidateNotMember { .. } => "CandidateNotMember",
            DcsError::SwitchoverPending => "SwitchoverPending",
            DcsError::EmptySwitchover => "EmptySwitchover",
            DcsError::LeaderNotHolder { .. } => "LeaderNotHolder",
            DcsError::InvalidMemberName { .. } => "InvalidMemberName",
            DcsError::Store(_) => "StoreFailure",
        }
    }
}

// -- Cluster model ------------------------------------------------------------

/// A cluster member.  `index` is the ordinal suffix of the name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub index: u32,
    pub address: String,
}

impl Member {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Result<Self, DcsError> {
        let name = name.into();
        let index = member_index(&name).ok_or_else(|| DcsError::InvalidMemberName {
            name: name.clone(),
        })?;
        Ok(Self {
            name,
            index,
            address: address.into(),
        })
    }
}

/// Current holder of the leader lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leader {
    pub name: String,
    pub acquire_time: i64,
    pub renew_time: i64,
    /// Lease time-to-live in seconds.
    pub ttl: u64,
}

impl Leader {
    pub fn expires_at(&self) -> i64 {
        self.renew_time
            .saturating_add(i64::try_from(self.ttl.saturating_mul(1000)).unwrap_or(i64::MAX))
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at()
    }
}

/// Operator request to move leadership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Switchover {
    /// Member expected to step down.
    pub leader: Option<String>,
    /// Member expected to take over.
    pub candidate: Option<String>,
    pub scheduled_at: i64,
}

/// Cluster-wide HA settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaConfig {
    pub enable: bool,
    /// Lease TTL in seconds.
    pub ttl: u64,
    /// Maximum tolerated replication lag in seconds.
    pub max_lag: i64,
    /// HA loop period in seconds.
    pub health_check_period: u64,
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            enable: true,
            ttl: 15,
            max_lag: 10,
            health_check_period: 10,
        }
    }
}

impl From<&crate::config::DcsConfig> for HaConfig {
    fn from(cfg: &crate::config::DcsConfig) -> Self {
        Self {
            enable: cfg.enable,
            ttl: cfg.ttl,
            max_lag: cfg.max_lag,
            health_check_period: cfg.health_check_period,
        }
    }
}

/// Point-in-time view of the cluster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cluster {
    pub name: String,
    pub members: Vec<Member>,
    pub leader: Option<Leader>,
    pub switchover: Option<Switchover>,
    pub ha_config: HaConfig,
}

impl Cluster {
    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.name == name)
    }

    /// The leader, if its lease has not expired at `now`.
    pub fn live_leader(&self, now: i64) -> Option<&Leader> {
        self.leader.as_ref().filter(|l| !l.is_expired(now))
    }
}

// -- Store selection ----------------------------------------------------------

/// Lease store implementations selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// Private to one process; cannot arbitrate between nodes.
    Memory,
    /// SQLite file shared by every member of the cluster.
    Sqlite,
}

impl StoreBackend {
    /// Whether separate processes see the same leases.
    pub fn is_shared(&self) -> bool {
        matches!(self, StoreBackend::Sqlite)
    }
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(StoreBackend::Memory),
            "sqlite" => Ok(StoreBackend::Sqlite),
            other => Err(anyhow::anyhow!("unknown lease store backend {other:?}")),
        }
    }
}

/// Open the configured lease store for `cluster`.
pub fn open_store(config: &DcsConfig, cluster: &str) -> anyhow::Result<Arc<dyn DcsStore>> {
    match config.backend.parse()? {
        StoreBackend::Sqlite => {
            let path = &config.sqlite_path;
            if let Some(parent) = std::path::Path::new(path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            let store = SqliteStore::open(path, cluster)?;
            info!("SQLite lease store initialized at {}", path);
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            info!("In-memory lease store initialized");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_index() {
        let m = Member::new("pg-2", "10.0.0.2").unwrap();
        assert_eq!(m.index, 2);
        assert!(matches!(
            Member::new("pg", ""),
            Err(DcsError::InvalidMemberName { .. })
        ));
    }

    #[test]
    fn test_leader_expiry() {
        let leader = Leader {
            name: "pg-0".to_string(),
            acquire_time: 1_000,
            renew_time: 5_000,
            ttl: 15,
        };
        assert_eq!(leader.expires_at(), 20_000);
        assert!(!leader.is_expired(19_999));
        assert!(leader.is_expired(20_000));
    }

    #[test]
    fn test_lease_lost_display() {
        let err = DcsError::LeaseLost {
            holder: Some("pg-1".to_string()),
        };
        assert_eq!(err.to_string(), "leader lease lost to pg-1");
        assert_eq!(
            DcsError::LeaseLost { holder: None }.to_string(),
            "leader lease lost"
        );
    }

    #[test]
    fn test_store_backend_parse() {
        assert_eq!("sqlite".parse::<StoreBackend>().unwrap(), StoreBackend::Sqlite);
        assert!(StoreBackend::Sqlite.is_shared());
        assert!(!StoreBackend::Memory.is_shared());
        assert!("sqlit".parse::<StoreBackend>().is_err());
    }

    #[test]
    fn test_open_store_rejects_unknown_backend() {
        let config = DcsConfig {
            backend: "etcd".to_string(),
            ..DcsConfig::default()
        };
        let err = open_store(&config, "orders").err().unwrap();
        assert!(err.to_string().contains("etcd"));
    }

    #[tokio::test]
    async fn test_open_sqlite_store_shares_leases() {
        let dir = tempfile::tempdir().unwrap();
        let config = DcsConfig {
            sqlite_path: dir.path().join("nested/dcs.db").to_str().unwrap().to_string(),
            ..DcsConfig::default()
        };
        let first = open_store(&config, "orders").unwrap();
        let second = open_store(&config, "orders").unwrap();
        assert!(first.acquire_lease("pg-0", 0, 15).await.unwrap().is_some());
        assert!(second.acquire_lease("pg-1", 0, 15).await.unwrap().is_none());
    }
}
