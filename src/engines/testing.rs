//! Scripted engine fakes shared by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::manager::{DbFuture, Probe, RoleDetector, WriteProtection};
use super::role::Role;
use super::sql::SqlClient;
use super::state::ManagerState;
use super::status_row::StatusRow;
use crate::errors::DbError;
use crate::identity::{Env, Identity};

pub fn manager_state(pod_name: &str) -> ManagerState {
    let id = Identity::resolve(&Env::default(), Some(pod_name.to_string())).unwrap();
    ManagerState::new(id)
}

pub fn engine_error(code: &str, message: &str) -> DbError {
    DbError::Engine {
        code: Some(code.to_string()),
        message: message.to_string(),
    }
}

// -- Probe --------------------------------------------------------------------

enum ProbeMode {
    Healthy,
    Hanging,
    TooManyConnections,
}

pub struct FakeProbe {
    mode: ProbeMode,
    healthy: Arc<AtomicBool>,
}

impl FakeProbe {
    pub fn healthy() -> Self {
        Self {
            mode: ProbeMode::Healthy,
            healthy: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn hanging() -> Self {
        Self {
            mode: ProbeMode::Hanging,
            healthy: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn too_many_connections() -> Self {
        Self {
            mode: ProbeMode::TooManyConnections,
            healthy: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Toggle to make subsequent pings fail.
    pub fn health_handle(&self) -> Arc<AtomicBool> {
        self.healthy.clone()
    }
}

impl Probe for FakeProbe {
    fn ping(&self) -> DbFuture<'_, ()> {
        Box::pin(async move {
            match self.mode {
                ProbeMode::Hanging => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
                ProbeMode::TooManyConnections => Err(engine_error("1040", "Too many connections")),
                ProbeMode::Healthy if self.healthy.load(Ordering::SeqCst) => Ok(()),
                ProbeMode::Healthy => Err(DbError::Transient(anyhow::anyhow!("connection refused"))),
            }
        })
    }

    fn is_alive_error(&self, err: &DbError) -> bool {
        matches!(err, DbError::Engine { code: Some(c), .. } if c == "1040")
    }
}

// -- Roles --------------------------------------------------------------------

pub struct FixedRole(pub Role);

impl RoleDetector for FixedRole {
    fn detect_role(&self) -> DbFuture<'_, Role> {
        let role = self.0;
        Box::pin(async move { Ok(role) })
    }
}

// -- Counting lock ------------------------------------------------------------

/// Engine whose write lock is a counter, like `fsyncLock`.
pub struct CountingLock {
    held: AtomicU64,
    lock_calls: AtomicU64,
    unlock_calls: AtomicU64,
    fail_unlock_after: Mutex<Option<u64>>,
    hang_unlock_after: Mutex<Option<u64>>,
    hang_lock: AtomicBool,
}

impl CountingLock {
    /// Start with `preexisting` locks already held by someone else.
    pub fn new(preexisting: u64) -> Self {
        Self {
            held: AtomicU64::new(preexisting),
            lock_calls: AtomicU64::new(0),
            unlock_calls: AtomicU64::new(0),
            fail_unlock_after: Mutex::new(None),
            hang_unlock_after: Mutex::new(None),
            hang_lock: AtomicBool::new(false),
        }
    }

    pub fn held(&self) -> u64 {
        self.held.load(Ordering::SeqCst)
    }

    pub fn lock_calls(&self) -> u64 {
        self.lock_calls.load(Ordering::SeqCst)
    }

    pub fn unlock_calls(&self) -> u64 {
        self.unlock_calls.load(Ordering::SeqCst)
    }

    /// Fail every unlock attempt after `n` more successful ones.
    pub fn fail_unlock_after(&self, n: u64) {
        *self.fail_unlock_after.lock().unwrap() = Some(self.unlock_calls() + n);
    }

    /// Never answer unlock attempts after `n` more successful ones.
    pub fn hang_unlock_after(&self, n: u64) {
        *self.hang_unlock_after.lock().unwrap() = Some(self.unlock_calls() + n);
    }

    pub fn hang_lock(&self) {
        self.hang_lock.store(true, Ordering::SeqCst);
    }
}

impl WriteProtection for CountingLock {
    fn lock_native<'a>(&'a self, _reason: &'a str) -> DbFuture<'a, ()> {
        Box::pin(async move {
            self.lock_calls.fetch_add(1, Ordering::SeqCst);
            if self.hang_lock.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.held.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn unlock_native(&self) -> DbFuture<'_, u64> {
        Box::pin(async move {
            let attempt = self.unlock_calls.fetch_add(1, Ordering::SeqCst);
            let fail_at = *self.fail_unlock_after.lock().unwrap();
            if fail_at.is_some_and(|n| attempt >= n) {
                return Err(engine_error("125", "not locked"));
            }
            let hang_at = *self.hang_unlock_after.lock().unwrap();
            if hang_at.is_some_and(|n| attempt >= n) {
                std::future::pending::<()>().await;
            }
            let held = self.held.load(Ordering::SeqCst).saturating_sub(1);
            self.held.store(held, Ordering::SeqCst);
            Ok(held)
        })
    }
}

// -- Scripted SQL -------------------------------------------------------------

/// SQL client answering from a fixed script keyed by statement text.
#[derive(Default)]
pub struct ScriptedSql {
    answers: Mutex<HashMap<String, Result<Vec<StatusRow>, (String, String)>>>,
    executed: Mutex<Vec<String>>,
    queried: Mutex<Vec<String>>,
    down: AtomicBool,
}

impl ScriptedSql {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_query(&self, sql: &str, rows: Vec<StatusRow>) {
        self.answers
            .lock()
            .unwrap()
            .insert(sql.to_string(), Ok(rows));
    }

    pub fn on_query_error(&self, sql: &str, code: &str, message: &str) {
        self.answers
            .lock()
            .unwrap()
            .insert(sql.to_string(), Err((code.to_string(), message.to_string())));
    }

    /// Make every call fail as if the server were unreachable.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn queried(&self) -> Vec<String> {
        self.queried.lock().unwrap().clone()
    }

    fn check_up(&self) -> Result<(), DbError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(DbError::Transient(anyhow::anyhow!("connection refused")));
        }
        Ok(())
    }
}

impl SqlClient for ScriptedSql {
    fn ping(&self) -> DbFuture<'_, ()> {
        Box::pin(async move { self.check_up() })
    }

    fn query_rows<'a>(&'a self, sql: &'a str) -> DbFuture<'a, Vec<StatusRow>> {
        Box::pin(async move {
            self.check_up()?;
            self.queried.lock().unwrap().push(sql.to_string());
            match self.answers.lock().unwrap().get(sql) {
                Some(Ok(rows)) => Ok(rows.clone()),
                Some(Err((code, message))) => Err(engine_error(code, message)),
                None => Ok(Vec::new()),
            }
        })
    }

    fn exec<'a>(&'a self, sql: &'a str) -> DbFuture<'a, u64> {
        Box::pin(async move {
            self.check_up()?;
            self.executed.lock().unwrap().push(sql.to_string());
            match self.answers.lock().unwrap().get(sql) {
                Some(Err((code, message))) => Err(engine_error(code, message)),
                _ => Ok(0),
            }
        })
    }
}
