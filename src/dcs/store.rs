//! Abstract lease store.
//!
//! A store holds the coordination records of one cluster.  Lease methods
//! are atomic compare-and-swap operations: each one reads the current
//! lease and writes the new one as a single step, so two nodes racing for
//! the same lease can never both succeed.  Methods are manually desugared
//! into pinned futures so the trait stays object-safe.

use std::future::Future;
use std::pin::Pin;

use super::{HaConfig, Leader, Member, Switchover};

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

pub trait DcsStore: Send + Sync {
    // -- Lease -----------------------------------------------------------

    /// Current lease record, expired or not.
    fn get_leader(&self) -> StoreFuture<'_, Option<Leader>>;

    /// Write a fresh lease for `holder` if no unexpired lease exists at
    /// `now`.  Returns the written lease, or `None` when another live lease
    /// blocks the write.
    fn acquire_lease<'a>(&'a self, holder: &'a str, now: i64, ttl: u64)
        -> StoreFuture<'a, Option<Leader>>;

    /// Extend the lease if `holder` still holds it unexpired at `now`.
    /// Returns `None` when the lease expired or belongs to someone else.
    fn renew_lease<'a>(&'a self, holder: &'a str, now: i64, ttl: u64)
        -> StoreFuture<'a, Option<Leader>>;

    /// Delete the lease if `holder` holds it.  Returns whether a row went.
    fn release_lease<'a>(&'a self, holder: &'a str) -> StoreFuture<'a, bool>;

    // -- Members ---------------------------------------------------------

    fn list_members(&self) -> StoreFuture<'_, Vec<Member>>;

    /// Insert or replace a member record.
    fn put_member(&self, member: Member) -> StoreFuture<'_, ()>;

    // -- Switchover ------------------------------------------------------

    fn get_switchover(&self) -> StoreFuture<'_, Option<Switchover>>;

    /// Store `switchover` unless one is already pending.  Returns whether
    /// it was stored.
    fn create_switchover(&self, switchover: Switchover) -> StoreFuture<'_, bool>;

    fn delete_switchover(&self) -> StoreFuture<'_, ()>;

    // -- HA config -------------------------------------------------------

    fn get_ha_config(&self) -> StoreFuture<'_, Option<HaConfig>>;

    fn put_ha_config(&self, config: HaConfig) -> StoreFuture<'_, ()>;
}
