//! In-memory lease store.
//!
//! Holds the records of one cluster with no persistence.  Useful for tests
//! and single-process deployments.  Every operation runs under one
//! `RwLock`, which makes the lease compare-and-swap trivially atomic.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::store::{DcsStore, StoreFuture};
use super::{HaConfig, Leader, Member, Switchover};

#[derive(Debug, Default)]
struct Inner {
    leader: Option<Leader>,
    members: BTreeMap<String, Member>,
    switchover: Option<Switchover>,
    ha_config: Option<HaConfig>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> anyhow::Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))
    }

    fn write(&self) -> anyhow::Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))
    }
}

impl DcsStore for MemoryStore {
    fn get_leader(&self) -> StoreFuture<'_, Option<Leader>> {
        Box::pin(async move { Ok(self.read()?.leader.clone()) })
    }

    fn acquire_lease<'a>(
        &'a self,
        holder: &'a str,
        now: i64,
        ttl: u64,
    ) -> StoreFuture<'a, Option<Leader>> {
        Box::pin(async move {
            let mut inner = self.write()?;
            if inner.leader.as_ref().is_some_and(|l| !l.is_expired(now)) {
                return Ok(None);
            }
            let leader = Leader {
                name: holder.to_string(),
                acquire_time: now,
                renew_time: now,
                ttl,
            };
            inner.leader = Some(leader.clone());
            Ok(Some(leader))
        })
    }

    fn renew_lease<'a>(
        &'a self,
        holder: &'a str,
        now: i64,
        ttl: u64,
    ) -> StoreFuture<'a, Option<Leader>> {
        Box::pin(async move {
            let mut inner = self.write()?;
            match inner.leader.as_mut() {
                Some(l) if l.name == holder && !l.is_expired(now) => {
                    l.renew_time = now;
                    l.ttl = ttl;
                    Ok(Some(l.clone()))
                }
                _ => Ok(None),
            }
        })
    }

    fn release_lease<'a>(&'a self, holder: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut inner = self.write()?;
            if inner.leader.as_ref().is_some_and(|l| l.name == holder) {
                inner.leader = None;
                return Ok(true);
            }
            Ok(false)
        })
    }

    fn list_members(&self) -> StoreFuture<'_, Vec<Member>> {
        Box::pin(async move {
            let mut members: Vec<Member> = self.read()?.members.values().cloned().collect();
            members.sort_by_key(|m| m.index);
            Ok(members)
        })
    }

    fn put_member(&self, member: Member) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.write()?.members.insert(member.name.clone(), member);
            Ok(())
        })
    }

    fn get_switchover(&self) -> StoreFuture<'_, Option<Switchover>> {
        Box::pin(async move { Ok(self.read()?.switchover.clone()) })
    }

    fn create_switchover(&self, switchover: Switchover) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let mut inner = self.write()?;
            if inner.switchover.is_some() {
                return Ok(false);
            }
            inner.switchover = Some(switchover);
            Ok(true)
        })
    }

    fn delete_switchover(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.write()?.switchover = None;
            Ok(())
        })
    }

    fn get_ha_config(&self) -> StoreFuture<'_, Option<HaConfig>> {
        Box::pin(async move { Ok(self.read()?.ha_config.clone()) })
    }

    fn put_ha_config(&self, config: HaConfig) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.write()?.ha_config = Some(config);
            Ok(())
        })
    }
}
