//! The HA loop: combine the engine's observed role with lease state.
//!
//! One loop runs per process.  Each cycle takes a fresh cluster snapshot
//! and makes at most one lease transition.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::coordinator::{LeaseCoordinator, LeaseState};
use super::{Cluster, DcsError, Switchover};
use crate::engines::context::OpContext;
use crate::engines::manager::DbManager;
use crate::metrics;

/// What a single cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// HA is disabled for the cluster.
    Disabled,
    /// Released the lease because a switchover asked this node to step down.
    SteppedDown,
    /// Renewed a lease already held.
    Renewed,
    /// Took the lease.
    Acquired,
    /// A pending switchover names another candidate.
    Deferred,
    /// Nothing to do: someone else leads or this node is not eligible.
    Standby,
}

pub struct HaLoop {
    manager: Arc<dyn DbManager>,
    coordinator: Arc<LeaseCoordinator>,
    period: Duration,
    shutdown: CancellationToken,
}

impl HaLoop {
    pub fn new(
        manager: Arc<dyn DbManager>,
        coordinator: Arc<LeaseCoordinator>,
        period: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            manager,
            coordinator,
            period,
            shutdown,
        }
    }

    /// Register this member and seed the HA config.  Run once before [`run`].
    ///
    /// [`run`]: HaLoop::run
    pub async fn bootstrap(&self) -> Result<(), DcsError> {
        self.coordinator.add_current_member().await?;
        let ha = self.coordinator.ensure_ha_config().await?;
        info!(
            "HA bootstrap for {}: enable={} ttl={}s period={}s",
            self.coordinator.cluster_name(),
            ha.enable,
            ha.ttl,
            ha.health_check_period
        );
        Ok(())
    }

    /// Tick until the shutdown token fires, then release a held lease.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.run_cycle().await {
                Ok(outcome) => {
                    metrics::record_ha_cycle(true);
                    debug!("HA cycle: {:?}", outcome);
                }
                Err(e) => {
                    metrics::record_ha_cycle(false);
                    warn!("HA cycle failed: {}", e);
                }
            }
        }
        if self.coordinator.state() == LeaseState::Held {
            if let Err(e) = self.coordinator.release_lease().await {
                warn!("Failed to release lease on shutdown: {}", e);
            }
        }
        info!("HA loop stopped");
    }

    fn probe_context(&self) -> OpContext {
        OpContext::with_token(self.shutdown.clone()).child_with_timeout(self.period)
    }

    /// One coordination cycle.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, DcsError> {
        let cluster = self.coordinator.get_cluster().await?;
        if !cluster.ha_config.enable {
            return Ok(CycleOutcome::Disabled);
        }
        let me = self.coordinator.member_name();
        let mut switchover = cluster.switchover.as_ref();

        if let Some(sw) = switchover {
            if sw.leader.as_deref() == Some(me) && self.coordinator.has_lease() {
                info!("Stepping down for switchover to {:?}", sw.candidate);
                self.coordinator.release_lease().await?;
                self.coordinator.delete_switchover().await?;
                return Ok(CycleOutcome::SteppedDown);
            }
            if is_stale(sw, &cluster) {
                info!(
                    "Dropping switchover: leader {:?} no longer holds the lease and candidate {:?} is gone",
                    sw.leader, sw.candidate
                );
                self.coordinator.delete_switchover().await?;
                switchover = None;
            }
        }

        if self.coordinator.state() == LeaseState::Held {
            match self.coordinator.update_lease().await {
                Ok(()) => return Ok(CycleOutcome::Renewed),
                Err(DcsError::LeaseLost { holder }) => {
                    warn!("Lease lost to {:?}, re-evaluating", holder);
                }
                Err(e) => return Err(e),
            }
        }

        if self.coordinator.is_lease_exist().await? {
            return Ok(CycleOutcome::Standby);
        }

        let is_candidate = switchover.is_some_and(|sw| is_named_candidate(sw, me));
        if switchover.is_some() && !is_candidate {
            return Ok(CycleOutcome::Deferred);
        }

        if is_candidate {
            if !self.lag_within(cluster.ha_config.max_lag).await {
                return Ok(CycleOutcome::Standby);
            }
        } else if !self.is_leader_like().await {
            return Ok(CycleOutcome::Standby);
        }

        if !self.coordinator.attempt_acquire_lease().await? {
            return Ok(CycleOutcome::Standby);
        }
        if is_candidate {
            self.coordinator.delete_switchover().await?;
            info!("Switchover to {} complete", me);
        }
        Ok(CycleOutcome::Acquired)
    }

    async fn is_leader_like(&self) -> bool {
        let ctx = self.probe_context();
        match self.manager.get_replica_role(&ctx).await {
            Ok(role) => role.is_leader_like(),
            Err(e) => {
                debug!("Role probe failed: {}", e);
                false
            }
        }
    }

    /// Engines without lag reporting are treated as caught up.
    async fn lag_within(&self, max_lag: i64) -> bool {
        let ctx = self.probe_context();
        match self.manager.get_lag(&ctx).await {
            Ok(lag) if lag <= max_lag => true,
            Ok(lag) => {
                info!("Candidate lag {}s exceeds max_lag {}s", lag, max_lag);
                false
            }
            Err(e) if e.is_unsupported() => true,
            Err(e) => {
                warn!("Lag probe failed: {}", e);
                false
            }
        }
    }
}

fn is_named_candidate(sw: &Switchover, me: &str) -> bool {
    sw.candidate.as_deref() == Some(me)
}

/// A switchover nobody can honor: its leader does not hold the live lease
/// and it names no candidate that is still a member.
fn is_stale(sw: &Switchover, cluster: &Cluster) -> bool {
    let holder = cluster.leader.as_ref().map(|l| l.name.as_str());
    let leader_gone = sw.leader.as_deref().map_or(true, |l| holder != Some(l));
    let candidate_gone = sw
        .candidate
        .as_deref()
        .map_or(true, |c| cluster.member(c).is_none());
    leader_gone && candidate_gone
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dcs::clock::ManualClock;
    use crate::dcs::memory::MemoryStore;
    use crate::dcs::store::DcsStore;
    use crate::dcs::{HaConfig, Member};
    use crate::engines::manager::EngineManager;
    use crate::engines::role::Role;
    use crate::engines::testing::{manager_state, FakeProbe, FixedRole};
    use crate::engines::EngineType;

    struct Node {
        ha: HaLoop,
        coordinator: Arc<LeaseCoordinator>,
    }

    fn node(name: &str, role: Role, store: Arc<dyn DcsStore>, clock: Arc<ManualClock>) -> Node {
        let manager = EngineManager::builder(
            EngineType::Mysql,
            manager_state(name),
            Arc::new(FakeProbe::healthy()),
        )
        .roles(Arc::new(FixedRole(role)))
        .build();
        let coordinator = Arc::new(LeaseCoordinator::new(
            "orders",
            Member::new(name, format!("{name}.svc")).unwrap(),
            store,
            clock,
            HaConfig::default(),
        ));
        Node {
            ha: HaLoop::new(
                Arc::new(manager),
                coordinator.clone(),
                Duration::from_secs(1),
                CancellationToken::new(),
            ),
            coordinator,
        }
    }

    #[tokio::test]
    async fn test_primary_acquires_then_renews() {
        let store: Arc<dyn DcsStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let primary = node("db-0", Role::Primary, store.clone(), clock.clone());
        let replica = node("db-1", Role::Secondary, store.clone(), clock.clone());
        primary.ha.bootstrap().await.unwrap();
        replica.ha.bootstrap().await.unwrap();

        assert_eq!(replica.ha.run_cycle().await.unwrap(), CycleOutcome::Standby);
        assert_eq!(primary.ha.run_cycle().await.unwrap(), CycleOutcome::Acquired);
        clock.advance(Duration::from_secs(5));
        assert_eq!(primary.ha.run_cycle().await.unwrap(), CycleOutcome::Renewed);
        assert_eq!(replica.ha.run_cycle().await.unwrap(), CycleOutcome::Standby);
    }

    #[tokio::test]
    async fn test_switchover_hands_over() {
        let store: Arc<dyn DcsStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let old = node("db-0", Role::Primary, store.clone(), clock.clone());
        let new = node("db-1", Role::Secondary, store.clone(), clock.clone());
        old.ha.bootstrap().await.unwrap();
        new.ha.bootstrap().await.unwrap();
        assert_eq!(old.ha.run_cycle().await.unwrap(), CycleOutcome::Acquired);

        // Candidate only: the old leader keeps renewing, the candidate waits.
        old.coordinator
            .create_switchover(None, Some("db-1"))
            .await
            .unwrap();
        assert_eq!(new.ha.run_cycle().await.unwrap(), CycleOutcome::Standby);
        assert_eq!(old.ha.run_cycle().await.unwrap(), CycleOutcome::Renewed);
        old.coordinator.delete_switchover().await.unwrap();

        old.coordinator
            .create_switchover(Some("db-0"), Some("db-1"))
            .await
            .unwrap();
        assert_eq!(old.ha.run_cycle().await.unwrap(), CycleOutcome::SteppedDown);
        assert!(!old.coordinator.has_lease());
        assert!(old.coordinator.get_switchover().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_named_candidate_acquires_and_clears_switchover() {
        let store: Arc<dyn DcsStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let primary = node("db-0", Role::Primary, store.clone(), clock.clone());
        let candidate = node("db-1", Role::Secondary, store.clone(), clock.clone());
        primary.ha.bootstrap().await.unwrap();
        candidate.ha.bootstrap().await.unwrap();

        candidate
            .coordinator
            .create_switchover(None, Some("db-1"))
            .await
            .unwrap();
        // A leader-like non-candidate defers while the switchover is pending.
        assert_eq!(primary.ha.run_cycle().await.unwrap(), CycleOutcome::Deferred);
        assert_eq!(candidate.ha.run_cycle().await.unwrap(), CycleOutcome::Acquired);
        assert!(candidate.coordinator.get_switchover().await.unwrap().is_none());
        assert!(candidate.coordinator.has_lease());
    }

    #[tokio::test]
    async fn test_switchover_of_departed_leader_is_dropped() {
        let store: Arc<dyn DcsStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let a = node("db-0", Role::Primary, store.clone(), clock.clone());
        let b = node("db-1", Role::Primary, store.clone(), clock.clone());
        a.ha.bootstrap().await.unwrap();
        b.ha.bootstrap().await.unwrap();
        assert_eq!(a.ha.run_cycle().await.unwrap(), CycleOutcome::Acquired);
        a.coordinator
            .create_switchover(Some("db-0"), None)
            .await
            .unwrap();

        // db-0 dies before stepping down and its lease runs out.
        clock.advance(Duration::from_secs(30));
        assert_eq!(b.ha.run_cycle().await.unwrap(), CycleOutcome::Acquired);
        assert!(b.coordinator.get_switchover().await.unwrap().is_none());
        assert!(b.coordinator.has_lease());
    }

    #[tokio::test]
    async fn test_switchover_with_live_candidate_is_kept() {
        let store: Arc<dyn DcsStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let a = node("db-0", Role::Primary, store.clone(), clock.clone());
        let b = node("db-1", Role::Secondary, store.clone(), clock.clone());
        let c = node("db-2", Role::Primary, store.clone(), clock.clone());
        for n in [&a, &b, &c] {
            n.ha.bootstrap().await.unwrap();
        }
        assert_eq!(a.ha.run_cycle().await.unwrap(), CycleOutcome::Acquired);
        a.coordinator
            .create_switchover(Some("db-0"), Some("db-1"))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(30));
        assert_eq!(c.ha.run_cycle().await.unwrap(), CycleOutcome::Deferred);
        assert!(c.coordinator.get_switchover().await.unwrap().is_some());
        assert_eq!(b.ha.run_cycle().await.unwrap(), CycleOutcome::Acquired);
        assert!(b.coordinator.get_switchover().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_lease_taken_over() {
        let store: Arc<dyn DcsStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let a = node("db-0", Role::Primary, store.clone(), clock.clone());
        let b = node("db-1", Role::Leader, store.clone(), clock.clone());
        a.ha.bootstrap().await.unwrap();
        b.ha.bootstrap().await.unwrap();
        assert_eq!(a.ha.run_cycle().await.unwrap(), CycleOutcome::Acquired);

        clock.advance(Duration::from_secs(20));
        assert_eq!(b.ha.run_cycle().await.unwrap(), CycleOutcome::Acquired);
        // The stale holder fails to renew and stands by.
        assert_eq!(a.ha.run_cycle().await.unwrap(), CycleOutcome::Standby);
        assert_eq!(a.coordinator.state(), LeaseState::HeldByOther("db-1".to_string()));
    }

    #[tokio::test]
    async fn test_disabled_cluster_does_nothing() {
        let store: Arc<dyn DcsStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let a = node("db-0", Role::Primary, store.clone(), clock);
        a.coordinator
            .update_ha_config(HaConfig {
                enable: false,
                ..HaConfig::default()
            })
            .await
            .unwrap();
        assert_eq!(a.ha.run_cycle().await.unwrap(), CycleOutcome::Disabled);
        assert!(!a.coordinator.is_lease_exist().await.unwrap());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel_and_releases() {
        let store: Arc<dyn DcsStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let a = node("db-0", Role::Primary, store.clone(), clock);
        a.ha.bootstrap().await.unwrap();
        let token = a.ha.shutdown.clone();
        let coordinator = a.coordinator.clone();
        let handle = tokio::spawn(async move { a.ha.run().await });

        for _ in 0..50 {
            if coordinator.has_lease() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(coordinator.has_lease());
        token.cancel();
        handle.await.unwrap();
        assert!(!coordinator.is_lease_exist().await.unwrap());
    }
}
