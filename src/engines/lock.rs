//! Write-protection lock/unlock protocol.
//!
//! Both operations are idempotent from the caller's side: locking a locked
//! instance and unlocking an unlocked one succeed without touching the
//! engine.  Engines with counting locks (MongoDB `fsyncLock`) need one
//! native unlock per outstanding lock, so [`unlock`] repeats the native
//! command until the engine reports zero.  The loop is bounded by the
//! context deadline and by [`LockPolicy::max_unlock_rounds`].

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::context::OpContext;
use super::manager::WriteProtection;
use super::state::ManagerState;
use crate::errors::DbError;

/// Limits applied to the unlock convergence loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockPolicy {
    /// Maximum native unlock calls per `unlock`.  `None` means the loop is
    /// bounded only by the context deadline.
    #[serde(default)]
    pub max_unlock_rounds: Option<u32>,
}

/// Put the instance into write-protected mode.
pub async fn lock(
    state: &ManagerState,
    protection: &dyn WriteProtection,
    ctx: &OpContext,
    reason: &str,
) -> Result<(), DbError> {
    if state.is_locked() {
        debug!("Instance already locked, ignoring lock request: {}", reason);
        return Ok(());
    }
    let guard = state.write_guard().await;
    if state.is_locked() {
        return Ok(());
    }
    ctx.run("lock", protection.lock_native(reason)).await?;
    state.set_locked(&guard, true);
    info!("Instance {} locked: {}", state.member_name(), reason);
    Ok(())
}

/// Lift write protection, draining every outstanding lock.
///
/// On any error the flag stays set so a retry issues the native unlock
/// again.
pub async fn unlock(
    state: &ManagerState,
    protection: &dyn WriteProtection,
    ctx: &OpContext,
    policy: &LockPolicy,
) -> Result<(), DbError> {
    if !state.is_locked() {
        debug!("Instance not locked, ignoring unlock request");
        return Ok(());
    }
    let guard = state.write_guard().await;
    if !state.is_locked() {
        return Ok(());
    }

    let mut rounds: u32 = 0;
    let mut last_remaining: u64 = 0;
    loop {
        let remaining = match ctx.run("unlock", protection.unlock_native()).await {
            Ok(n) => n,
            Err(DbError::DeadlineExceeded { .. }) if rounds > 0 => {
                warn!("Unlock deadline reached after {} rounds", rounds);
                return Err(DbError::LockPartiallyHeld {
                    remaining: last_remaining,
                    rounds,
                });
            }
            Err(e) => return Err(e),
        };
        rounds += 1;
        last_remaining = remaining;
        if remaining == 0 {
            break;
        }
        debug!("Unlock round {}: {} locks outstanding", rounds, remaining);
        let exhausted = policy
            .max_unlock_rounds
            .map(|max| rounds >= max)
            .unwrap_or(false);
        if exhausted || ctx.is_expired() {
            warn!(
                "Unlock stopped after {} rounds with {} locks outstanding",
                rounds, remaining
            );
            return Err(DbError::LockPartiallyHeld { remaining, rounds });
        }
    }

    state.set_locked(&guard, false);
    info!("Instance {} unlocked after {} rounds", state.member_name(), rounds);
    Ok(())
}
