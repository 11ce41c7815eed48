//! Per-node view of the leader lease.
//!
//! The store is the single source of truth; the coordinator only caches
//! what it learned from its last lease operation so that [`has_lease`]
//! can answer without a round trip.
//!
//! [`has_lease`]: LeaseCoordinator::has_lease

use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use super::clock::Clock;
use super::store::DcsStore;
use super::{Cluster, DcsError, HaConfig, Leader, Member, Switchover};
use crate::metrics;

/// What this node believes about the lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseState {
    NoLease,
    HeldByOther(String),
    Held,
}

#[derive(Debug)]
struct Local {
    state: LeaseState,
    /// Expiry of our own lease as of the last acquire or renew.
    expires_at: Option<i64>,
}

pub struct LeaseCoordinator {
    cluster_name: String,
    member: Member,
    store: Arc<dyn DcsStore>,
    clock: Arc<dyn Clock>,
    default_ha: HaConfig,
    local: Mutex<Local>,
}

impl LeaseCoordinator {
    /// `default_ha` is used until the store carries an HA config.
    pub fn new(
        cluster_name: impl Into<String>,
        member: Member,
        store: Arc<dyn DcsStore>,
        clock: Arc<dyn Clock>,
        default_ha: HaConfig,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            member,
            store,
            clock,
            default_ha,
            local: Mutex::new(Local {
                state: LeaseState::NoLease,
                expires_at: None,
            }),
        }
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn member(&self) -> &Member {
        &self.member
    }

    pub fn member_name(&self) -> &str {
        &self.member.name
    }

    pub fn state(&self) -> LeaseState {
        self.with_local(|l| l.state.clone())
    }

    fn with_local<T>(&self, f: impl FnOnce(&mut Local) -> T) -> T {
        let mut guard = match self.local.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    fn set_state(&self, state: LeaseState, expires_at: Option<i64>) {
        let held = state == LeaseState::Held;
        self.with_local(|l| {
            l.state = state;
            l.expires_at = expires_at;
        });
        metrics::set_leader(held);
    }

    fn observe(&self, leader: Option<&Leader>, now: i64) {
        match leader.filter(|l| !l.is_expired(now)) {
            Some(l) if l.name == self.member.name => self.set_state(LeaseState::Held, Some(l.expires_at())),
            Some(l) => self.set_state(LeaseState::HeldByOther(l.name.clone()), None),
            None => self.set_state(LeaseState::NoLease, None),
        }
    }

    async fn ttl(&self) -> Result<u64, DcsError> {
        Ok(self.get_ha_config().await?.ttl)
    }

    // -- Lease ---------------------------------------------------------------

    /// Try to become leader.  `Ok(false)` means a live lease exists.
    pub async fn attempt_acquire_lease(&self) -> Result<bool, DcsError> {
        let ttl = self.ttl().await?;
        let now = self.clock.now_millis();
        match self.store.acquire_lease(&self.member.name, now, ttl).await? {
            Some(leader) => {
                self.set_state(LeaseState::Held, Some(leader.expires_at()));
                metrics::record_lease_transition("acquired");
                info!(
                    "Member {} acquired the leader lease of cluster {}",
                    self.member.name, self.cluster_name
                );
                Ok(true)
            }
            None => {
                let current = self.store.get_leader().await?;
                self.observe(current.as_ref(), now);
                debug!("Lease acquisition lost to {:?}", current.map(|l| l.name));
                Ok(false)
            }
        }
    }

    /// Renew the lease.  Only valid while it is held; losing it resets the
    /// local state to [`LeaseState::NoLease`].
    pub async fn update_lease(&self) -> Result<(), DcsError> {
        if self.state() != LeaseState::Held {
            return Err(DcsError::LeaseLost { holder: None });
        }
        let ttl = self.ttl().await?;
        let now = self.clock.now_millis();
        if let Some(leader) = self.store.renew_lease(&self.member.name, now, ttl).await? {
            self.set_state(LeaseState::Held, Some(leader.expires_at()));
            metrics::record_lease_transition("renewed");
            debug!("Lease renewed until {}", leader.expires_at());
            return Ok(());
        }

        self.set_state(LeaseState::NoLease, None);
        metrics::record_lease_transition("lost");
        let current = self.store.get_leader().await?;
        self.observe(current.as_ref(), now);
        let holder = current.filter(|l| !l.is_expired(now)).map(|l| l.name);
        warn!(
            "Member {} lost the leader lease (current holder: {:?})",
            self.member.name, holder
        );
        Err(DcsError::LeaseLost { holder })
    }

    /// Give up the lease if this node holds it; otherwise do nothing.
    /// The observed holder of someone else's lease is kept.
    pub async fn release_lease(&self) -> Result<(), DcsError> {
        let released = self.store.release_lease(&self.member.name).await?;
        if released {
            metrics::record_lease_transition("released");
            info!("Member {} released the leader lease", self.member.name);
        }
        if released || self.state() == LeaseState::Held {
            self.set_state(LeaseState::NoLease, None);
        }
        Ok(())
    }

    /// Whether this node holds an unexpired lease, by its own bookkeeping.
    pub fn has_lease(&self) -> bool {
        let now = self.clock.now_millis();
        self.with_local(|l| {
            l.state == LeaseState::Held && l.expires_at.is_some_and(|at| now < at)
        })
    }

    /// Whether any unexpired lease exists in the store.
    pub async fn is_lease_exist(&self) -> Result<bool, DcsError> {
        let now = self.clock.now_millis();
        Ok(self
            .store
            .get_leader()
            .await?
            .is_some_and(|l| !l.is_expired(now)))
    }

    /// The current lease holder, or `None` when no lease is live.
    pub async fn get_leader(&self) -> Result<Option<Leader>, DcsError> {
        let now = self.clock.now_millis();
        Ok(self.store.get_leader().await?.filter(|l| !l.is_expired(now)))
    }

    // -- Switchover ----------------------------------------------------------

    /// Record an operator switchover.  The candidate, when given, must be a
    /// registered member; the leader, when given, must hold the live lease.
    /// Nothing is written when validation fails.
    pub async fn create_switchover(
        &self,
        leader: Option<&str>,
        candidate: Option<&str>,
    ) -> Result<(), DcsError> {
        if leader.is_none() && candidate.is_none() {
            return Err(DcsError::EmptySwitchover);
        }
        if let Some(candidate) = candidate {
            let members = self.get_members().await?;
            if !members.iter().any(|m| m.name == candidate) {
                return Err(DcsError::CandidateNotMember {
                    candidate: candidate.to_string(),
                });
            }
        }
        if let Some(leader) = leader {
            let holder = self.get_leader().await?.map(|l| l.name);
            if holder.as_deref() != Some(leader) {
                return Err(DcsError::LeaderNotHolder {
                    leader: leader.to_string(),
                    holder,
                });
            }
        }
        let switchover = Switchover {
            leader: leader.map(str::to_string),
            candidate: candidate.map(str::to_string),
            scheduled_at: self.clock.now_millis(),
        };
        if !self.store.create_switchover(switchover).await? {
            return Err(DcsError::SwitchoverPending);
        }
        info!(
            "Switchover scheduled: leader {:?} candidate {:?}",
            leader, candidate
        );
        Ok(())
    }

    pub async fn get_switchover(&self) -> Result<Option<Switchover>, DcsError> {
        Ok(self.store.get_switchover().await?)
    }

    pub async fn delete_switchover(&self) -> Result<(), DcsError> {
        self.store.delete_switchover().await?;
        Ok(())
    }

    // -- Cluster -------------------------------------------------------------

    pub async fn get_members(&self) -> Result<Vec<Member>, DcsError> {
        Ok(self.store.list_members().await?)
    }

    /// Register this node in the member list.
    pub async fn add_current_member(&self) -> Result<(), DcsError> {
        self.store.put_member(self.member.clone()).await?;
        info!(
            "Registered member {} ({}) in cluster {}",
            self.member.name, self.member.address, self.cluster_name
        );
        Ok(())
    }

    /// HA config from the store, or the local default when none is stored.
    pub async fn get_ha_config(&self) -> Result<HaConfig, DcsError> {
        Ok(self
            .store
            .get_ha_config()
            .await?
            .unwrap_or_else(|| self.default_ha.clone()))
    }

    pub async fn update_ha_config(&self, config: HaConfig) -> Result<(), DcsError> {
        self.store.put_ha_config(config).await?;
        Ok(())
    }

    /// Write the local default HA config if the store has none yet.
    pub async fn ensure_ha_config(&self) -> Result<HaConfig, DcsError> {
        if let Some(existing) = self.store.get_ha_config().await? {
            return Ok(existing);
        }
        self.store.put_ha_config(self.default_ha.clone()).await?;
        Ok(self.default_ha.clone())
    }

    /// Snapshot of everything the HA loop needs for one cycle.
    pub async fn get_cluster(&self) -> Result<Cluster, DcsError> {
        Ok(Cluster {
            name: self.cluster_name.clone(),
            members: self.get_members().await?,
            leader: self.get_leader().await?,
            switchover: self.get_switchover().await?,
            ha_config: self.get_ha_config().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dcs::clock::ManualClock;
    use crate::dcs::memory::MemoryStore;
    use crate::dcs::sqlite::SqliteStore;
    use std::time::Duration;

    fn coordinator(
        name: &str,
        store: Arc<dyn DcsStore>,
        clock: Arc<ManualClock>,
    ) -> LeaseCoordinator {
        LeaseCoordinator::new(
            "orders",
            Member::new(name, format!("{name}.svc")).unwrap(),
            store,
            clock,
            HaConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_acquire_renew_release() {
        let store: Arc<dyn DcsStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let a = coordinator("db-0", store.clone(), clock.clone());
        let b = coordinator("db-1", store.clone(), clock.clone());

        assert!(a.attempt_acquire_lease().await.unwrap());
        assert!(a.has_lease());
        assert_eq!(a.state(), LeaseState::Held);

        assert!(!b.attempt_acquire_lease().await.unwrap());
        assert_eq!(b.state(), LeaseState::HeldByOther("db-0".to_string()));
        assert!(b.is_lease_exist().await.unwrap());

        clock.advance(Duration::from_secs(10));
        a.update_lease().await.unwrap();
        clock.advance(Duration::from_secs(10));
        assert!(a.has_lease());

        // Release by a non-holder is a no-op and keeps what it observed.
        b.release_lease().await.unwrap();
        assert!(a.is_lease_exist().await.unwrap());
        assert_eq!(b.state(), LeaseState::HeldByOther("db-0".to_string()));

        a.release_lease().await.unwrap();
        assert!(!a.has_lease());
        assert!(!b.is_lease_exist().await.unwrap());
        assert!(b.attempt_acquire_lease().await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_is_lost() {
        let store: Arc<dyn DcsStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let a = coordinator("db-0", store.clone(), clock.clone());
        let b = coordinator("db-1", store.clone(), clock.clone());

        assert!(a.attempt_acquire_lease().await.unwrap());
        clock.advance(Duration::from_secs(16));
        assert!(!a.has_lease());
        assert!(b.attempt_acquire_lease().await.unwrap());

        let err = a.update_lease().await.unwrap_err();
        match err {
            DcsError::LeaseLost { holder } => assert_eq!(holder.as_deref(), Some("db-1")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(a.state(), LeaseState::NoLease);
    }

    #[tokio::test]
    async fn test_update_without_lease_fails() {
        let store: Arc<dyn DcsStore> = Arc::new(MemoryStore::new());
        let a = coordinator("db-0", store, Arc::new(ManualClock::new(0)));
        assert!(matches!(
            a.update_lease().await,
            Err(DcsError::LeaseLost { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_is_exclusive() {
        let store: Arc<dyn DcsStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let node = coordinator(&format!("db-{i}"), store.clone(), clock.clone());
                tokio::spawn(async move { node.attempt_acquire_lease().await.unwrap() })
            })
            .collect();
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_across_sqlite_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dcs.db");
        let path = path.to_str().unwrap().to_string();
        let clock = Arc::new(ManualClock::new(0));
        let handles: Vec<_> = (0..6)
            .map(|i| {
                let store: Arc<dyn DcsStore> = Arc::new(SqliteStore::open(&path, "orders").unwrap());
                let node = coordinator(&format!("db-{i}"), store, clock.clone());
                tokio::spawn(async move { node.attempt_acquire_lease().await.unwrap() })
            })
            .collect();
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_switchover_rejects_non_member() {
        let store: Arc<dyn DcsStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let a = coordinator("db-0", store.clone(), clock);
        a.add_current_member().await.unwrap();

        let err = a.create_switchover(Some("db-0"), Some("db-7")).await.unwrap_err();
        assert!(matches!(err, DcsError::CandidateNotMember { .. }));
        assert!(a.get_switchover().await.unwrap().is_none());

        assert!(matches!(
            a.create_switchover(None, None).await,
            Err(DcsError::EmptySwitchover)
        ));
    }

    #[tokio::test]
    async fn test_second_switchover_rejected() {
        let store: Arc<dyn DcsStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let a = coordinator("db-0", store.clone(), clock.clone());
        let b = coordinator("db-1", store.clone(), clock);
        a.add_current_member().await.unwrap();
        b.add_current_member().await.unwrap();
        assert!(a.attempt_acquire_lease().await.unwrap());

        a.create_switchover(Some("db-0"), Some("db-1")).await.unwrap();
        assert!(matches!(
            b.create_switchover(Some("db-0"), None).await,
            Err(DcsError::SwitchoverPending)
        ));
        let pending = a.get_switchover().await.unwrap().unwrap();
        assert_eq!(pending.candidate.as_deref(), Some("db-1"));
        a.delete_switchover().await.unwrap();
        assert!(a.get_switchover().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_switchover_leader_must_hold_lease() {
        let store: Arc<dyn DcsStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let a = coordinator("db-0", store.clone(), clock.clone());
        let b = coordinator("db-1", store.clone(), clock.clone());
        a.add_current_member().await.unwrap();
        b.add_current_member().await.unwrap();

        // No lease at all.
        match a.create_switchover(Some("db-0"), None).await {
            Err(DcsError::LeaderNotHolder { leader, holder }) => {
                assert_eq!(leader, "db-0");
                assert!(holder.is_none());
            }
            other => panic!("unexpected result: {other:?}"),
        }

        assert!(a.attempt_acquire_lease().await.unwrap());
        match b.create_switchover(Some("db-9"), None).await {
            Err(DcsError::LeaderNotHolder { holder, .. }) => {
                assert_eq!(holder.as_deref(), Some("db-0"))
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(a.get_switchover().await.unwrap().is_none());

        // An expired holder no longer counts as the leader.
        clock.advance(Duration::from_secs(20));
        assert!(matches!(
            b.create_switchover(Some("db-0"), Some("db-1")).await,
            Err(DcsError::LeaderNotHolder { holder: None, .. })
        ));
        assert!(a.get_switchover().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_leader_ignores_expired_lease() {
        let store: Arc<dyn DcsStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let a = coordinator("db-0", store.clone(), clock.clone());
        assert!(a.get_leader().await.unwrap().is_none());

        assert!(a.attempt_acquire_lease().await.unwrap());
        assert_eq!(a.get_leader().await.unwrap().map(|l| l.name).as_deref(), Some("db-0"));

        clock.advance(Duration::from_secs(60));
        assert!(!a.is_lease_exist().await.unwrap());
        assert!(a.get_leader().await.unwrap().is_none());
        assert!(a.get_cluster().await.unwrap().leader.is_none());
        // The raw record is still in the store.
        assert!(store.get_leader().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cluster_snapshot_and_ha_config() {
        let store: Arc<dyn DcsStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let a = coordinator("db-0", store.clone(), clock);
        a.add_current_member().await.unwrap();
        assert_eq!(a.ensure_ha_config().await.unwrap(), HaConfig::default());

        let custom = HaConfig {
            ttl: 40,
            ..HaConfig::default()
        };
        a.update_ha_config(custom.clone()).await.unwrap();
        assert_eq!(a.ensure_ha_config().await.unwrap(), custom);

        a.attempt_acquire_lease().await.unwrap();
        let cluster = a.get_cluster().await.unwrap();
        assert_eq!(cluster.name, "orders");
        assert_eq!(cluster.members.len(), 1);
        assert!(cluster.member("db-0").is_some());
        assert_eq!(cluster.ha_config.ttl, 40);
        assert_eq!(cluster.live_leader(0).unwrap().ttl, 40);
    }
}
