//! The manager capability contract and its composed implementation.
//!
//! [`DbManager`] is what the rest of the process sees.  It uses manual
//! desugaring with pinned futures so it stays object-safe and can be held
//! as `Arc<dyn DbManager>`.
//!
//! [`EngineManager`] is the only implementation.  It owns the
//! [`ManagerState`] and delegates engine-specific work to strategy objects:
//! a [`Probe`] (always present) plus optional [`RoleDetector`],
//! [`WriteProtection`], [`StatementRunner`] and [`AccountAdmin`].  A missing
//! strategy turns the corresponding operation into `NotImplemented` (or
//! `NotSupported` for write protection).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::accounts::{RoleType, UserInfo};
use super::context::{OpContext, PROBE_TIMEOUT};
use super::lock::{self, LockPolicy};
use super::role::Role;
use super::state::ManagerState;
use super::EngineType;
use crate::errors::DbError;
use crate::metrics;

/// Boxed future returned by manager and strategy methods.
pub type DbFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DbError>> + Send + 'a>>;

/// Boxed future for probes that collapse errors into `false`.
pub type BoolFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// Boxed future with no result.
pub type UnitFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

// -- Contract -----------------------------------------------------------------

/// Uniform HA control surface over one database instance.
pub trait DbManager: Send + Sync {
    fn engine(&self) -> EngineType;

    /// Pod name of the instance this manager controls.
    fn current_member_name(&self) -> &str;

    /// Whether this instance has ordinal 0.
    fn is_first_member(&self) -> bool;

    fn is_locked(&self) -> bool;

    fn get_port(&self) -> Result<u16, DbError>;

    /// Whether the engine process answers at all.
    fn is_running<'a>(&'a self, ctx: &'a OpContext) -> BoolFuture<'a>;

    /// Whether the engine has finished starting.  Sticky once true.
    fn is_startup_ready<'a>(&'a self, ctx: &'a OpContext) -> BoolFuture<'a>;

    fn get_replica_role<'a>(&'a self, ctx: &'a OpContext) -> DbFuture<'a, Role>;

    /// Replication lag in seconds.
    fn get_lag<'a>(&'a self, ctx: &'a OpContext) -> DbFuture<'a, i64>;

    fn lock<'a>(&'a self, ctx: &'a OpContext, reason: &'a str) -> DbFuture<'a, ()>;

    fn unlock<'a>(&'a self, ctx: &'a OpContext) -> DbFuture<'a, ()>;

    fn exec<'a>(&'a self, ctx: &'a OpContext, sql: &'a str) -> DbFuture<'a, u64>;

    /// Run a read statement and return its rows as a JSON array.
    fn query<'a>(&'a self, ctx: &'a OpContext, sql: &'a str) -> DbFuture<'a, Vec<u8>>;

    fn list_users<'a>(&'a self, ctx: &'a OpContext) -> DbFuture<'a, Vec<UserInfo>>;

    fn list_system_accounts<'a>(&'a self, ctx: &'a OpContext) -> DbFuture<'a, Vec<UserInfo>>;

    fn describe_user<'a>(
        &'a self,
        ctx: &'a OpContext,
        user: &'a str,
    ) -> DbFuture<'a, Option<UserInfo>>;

    fn create_user<'a>(
        &'a self,
        ctx: &'a OpContext,
        user: &'a str,
        password: &'a str,
    ) -> DbFuture<'a, ()>;

    fn delete_user<'a>(&'a self, ctx: &'a OpContext, user: &'a str) -> DbFuture<'a, ()>;

    fn grant_user_role<'a>(
        &'a self,
        ctx: &'a OpContext,
        user: &'a str,
        role: RoleType,
    ) -> DbFuture<'a, ()>;

    fn revoke_user_role<'a>(
        &'a self,
        ctx: &'a OpContext,
        user: &'a str,
        role: RoleType,
    ) -> DbFuture<'a, ()>;

    /// Release engine connections.
    fn shutdown(&self) -> UnitFuture<'_>;
}

// -- Strategies ---------------------------------------------------------------

/// Liveness and readiness checks.
pub trait Probe: Send + Sync {
    fn ping(&self) -> DbFuture<'_, ()>;

    /// Readiness check; engines with extra startup conditions override this.
    fn ready_check(&self) -> DbFuture<'_, ()> {
        self.ping()
    }

    /// Errors that still prove the server is up (e.g. "too many connections").
    fn is_alive_error(&self, _err: &DbError) -> bool {
        false
    }

    /// One-time setup run when the instance first reports ready.
    fn on_ready(&self) -> DbFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn close(&self) -> UnitFuture<'_> {
        Box::pin(async {})
    }
}

/// Engine-specific replica role detection.
pub trait RoleDetector: Send + Sync {
    fn detect_role(&self) -> DbFuture<'_, Role>;

    /// Replication lag in seconds, when the engine can report it.
    fn replication_lag(&self) -> Option<DbFuture<'_, i64>> {
        None
    }
}

/// Native write-protection commands.
pub trait WriteProtection: Send + Sync {
    fn lock_native<'a>(&'a self, reason: &'a str) -> DbFuture<'a, ()>;

    /// Issue one native unlock and return the number of locks still held.
    fn unlock_native(&self) -> DbFuture<'_, u64>;
}

/// Ad hoc statement execution.
pub trait StatementRunner: Send + Sync {
    fn exec<'a>(&'a self, sql: &'a str) -> DbFuture<'a, u64>;

    fn query<'a>(&'a self, sql: &'a str) -> DbFuture<'a, Vec<u8>>;
}

/// Account management.
pub trait AccountAdmin: Send + Sync {
    fn list_users(&self) -> DbFuture<'_, Vec<UserInfo>>;

    fn list_system_accounts(&self) -> DbFuture<'_, Vec<UserInfo>>;

    fn describe_user<'a>(&'a self, user: &'a str) -> DbFuture<'a, Option<UserInfo>>;

    fn create_user<'a>(&'a self, user: &'a str, password: &'a str) -> DbFuture<'a, ()>;

    fn delete_user<'a>(&'a self, user: &'a str) -> DbFuture<'a, ()>;

    fn grant_user_role<'a>(&'a self, user: &'a str, role: RoleType) -> DbFuture<'a, ()>;

    fn revoke_user_role<'a>(&'a self, user: &'a str, role: RoleType) -> DbFuture<'a, ()>;
}

// -- Composed manager ---------------------------------------------------------

/// [`DbManager`] assembled from strategy objects.
pub struct EngineManager {
    engine: EngineType,
    state: ManagerState,
    port: Option<u16>,
    lock_policy: LockPolicy,
    probe: Arc<dyn Probe>,
    roles: Option<Arc<dyn RoleDetector>>,
    protection: Option<Arc<dyn WriteProtection>>,
    statements: Option<Arc<dyn StatementRunner>>,
    accounts: Option<Arc<dyn AccountAdmin>>,
}

/// Builder for [`EngineManager`].
pub struct EngineManagerBuilder {
    inner: EngineManager,
}

impl EngineManagerBuilder {
    pub fn port(mut self, port: u16) -> Self {
        self.inner.port = Some(port);
        self
    }

    pub fn lock_policy(mut self, policy: LockPolicy) -> Self {
        self.inner.lock_policy = policy;
        self
    }

    pub fn roles(mut self, roles: Arc<dyn RoleDetector>) -> Self {
        self.inner.roles = Some(roles);
        self
    }

    pub fn protection(mut self, protection: Arc<dyn WriteProtection>) -> Self {
        self.inner.protection = Some(protection);
        self
    }

    pub fn statements(mut self, statements: Arc<dyn StatementRunner>) -> Self {
        self.inner.statements = Some(statements);
        self
    }

    pub fn accounts(mut self, accounts: Arc<dyn AccountAdmin>) -> Self {
        self.inner.accounts = Some(accounts);
        self
    }

    pub fn build(self) -> EngineManager {
        self.inner
    }
}

impl EngineManager {
    pub fn builder(engine: EngineType, state: ManagerState, probe: Arc<dyn Probe>) -> EngineManagerBuilder {
        EngineManagerBuilder {
            inner: EngineManager {
                engine,
                state,
                port: None,
                lock_policy: LockPolicy::default(),
                probe,
                roles: None,
                protection: None,
                statements: None,
                accounts: None,
            },
        }
    }

    pub fn state(&self) -> &ManagerState {
        &self.state
    }

    fn not_implemented(&self, operation: &'static str) -> DbError {
        DbError::NotImplemented {
            engine: self.engine.as_str(),
            operation,
        }
    }

    fn protection(&self, operation: &'static str) -> Result<&dyn WriteProtection, DbError> {
        self.protection
            .as_deref()
            .ok_or(DbError::NotSupported {
                engine: self.engine.as_str(),
                operation,
            })
    }

    fn statements(&self, operation: &'static str) -> Result<&dyn StatementRunner, DbError> {
        self.statements
            .as_deref()
            .ok_or_else(|| self.not_implemented(operation))
    }

    fn accounts(&self, operation: &'static str) -> Result<&dyn AccountAdmin, DbError> {
        self.accounts
            .as_deref()
            .ok_or_else(|| self.not_implemented(operation))
    }
}

impl DbManager for EngineManager {
    fn engine(&self) -> EngineType {
        self.engine
    }

    fn current_member_name(&self) -> &str {
        self.state.member_name()
    }

    fn is_first_member(&self) -> bool {
        self.state.identity().member_index().map(|i| i == 0).unwrap_or(false)
    }

    fn is_locked(&self) -> bool {
        self.state.is_locked()
    }

    fn get_port(&self) -> Result<u16, DbError> {
        self.port.ok_or_else(|| self.not_implemented("get_port"))
    }

    fn is_running<'a>(&'a self, ctx: &'a OpContext) -> BoolFuture<'a> {
        Box::pin(async move {
            let probe_ctx = ctx.child_with_timeout(PROBE_TIMEOUT);
            match probe_ctx.run("is_running", self.probe.ping()).await {
                Ok(()) => true,
                Err(e) if self.probe.is_alive_error(&e) => {
                    debug!("{} is running but refused the probe: {}", self.engine, e);
                    true
                }
                Err(e) => {
                    debug!("{} is not running: {}", self.engine, e);
                    false
                }
            }
        })
    }

    fn is_startup_ready<'a>(&'a self, ctx: &'a OpContext) -> BoolFuture<'a> {
        Box::pin(async move {
            if self.state.startup().is_ready() {
                return true;
            }
            let probe_ctx = ctx.child_with_timeout(PROBE_TIMEOUT);
            match probe_ctx.run("is_startup_ready", self.probe.ready_check()).await {
                Ok(()) => {
                    if self.state.startup().mark_ready() {
                        info!("{} startup ready", self.engine);
                        if let Err(e) = ctx.run("on_ready", self.probe.on_ready()).await {
                            warn!("{} post-startup setup failed: {}", self.engine, e);
                        }
                    }
                    true
                }
                Err(e) => {
                    debug!("{} not ready yet: {}", self.engine, e);
                    false
                }
            }
        })
    }

    fn get_replica_role<'a>(&'a self, ctx: &'a OpContext) -> DbFuture<'a, Role> {
        Box::pin(async move {
            let roles = self
                .roles
                .as_deref()
                .ok_or_else(|| self.not_implemented("get_replica_role"))?;
            let result = ctx.run("get_replica_role", roles.detect_role()).await;
            match &result {
                Ok(role) => {
                    debug!("{} role detected: {}", self.engine, role);
                    metrics::record_role_probe(self.engine.as_str(), role.as_str());
                }
                Err(e) => {
                    warn!("{} role detection failed: {}", self.engine, e);
                    metrics::record_role_probe(self.engine.as_str(), "error");
                }
            }
            result
        })
    }

    fn get_lag<'a>(&'a self, ctx: &'a OpContext) -> DbFuture<'a, i64> {
        Box::pin(async move {
            let fut = self
                .roles
                .as_deref()
                .and_then(|r| r.replication_lag())
                .ok_or_else(|| self.not_implemented("get_lag"))?;
            ctx.run("get_lag", fut).await
        })
    }

    fn lock<'a>(&'a self, ctx: &'a OpContext, reason: &'a str) -> DbFuture<'a, ()> {
        Box::pin(async move {
            let protection = self.protection("lock")?;
            let result = lock::lock(&self.state, protection, ctx, reason).await;
            metrics::record_lock_op(self.engine.as_str(), "lock", result.is_ok());
            result
        })
    }

    fn unlock<'a>(&'a self, ctx: &'a OpContext) -> DbFuture<'a, ()> {
        Box::pin(async move {
            let protection = self.protection("unlock")?;
            let result = lock::unlock(&self.state, protection, ctx, &self.lock_policy).await;
            metrics::record_lock_op(self.engine.as_str(), "unlock", result.is_ok());
            result
        })
    }

    fn exec<'a>(&'a self, ctx: &'a OpContext, sql: &'a str) -> DbFuture<'a, u64> {
        Box::pin(async move {
            let runner = self.statements("exec")?;
            ctx.run("exec", runner.exec(sql)).await
        })
    }

    fn query<'a>(&'a self, ctx: &'a OpContext, sql: &'a str) -> DbFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let runner = self.statements("query")?;
            ctx.run("query", runner.query(sql)).await
        })
    }

    fn list_users<'a>(&'a self, ctx: &'a OpContext) -> DbFuture<'a, Vec<UserInfo>> {
        Box::pin(async move {
            let admin = self.accounts("list_users")?;
            ctx.run("list_users", admin.list_users()).await
        })
    }

    fn list_system_accounts<'a>(&'a self, ctx: &'a OpContext) -> DbFuture<'a, Vec<UserInfo>> {
        Box::pin(async move {
            let admin = self.accounts("list_system_accounts")?;
            ctx.run("list_system_accounts", admin.list_system_accounts())
                .await
        })
    }

    fn describe_user<'a>(
        &'a self,
        ctx: &'a OpContext,
        user: &'a str,
    ) -> DbFuture<'a, Option<UserInfo>> {
        Box::pin(async move {
            let admin = self.accounts("describe_user")?;
            ctx.run("describe_user", admin.describe_user(user)).await
        })
    }

    fn create_user<'a>(
        &'a self,
        ctx: &'a OpContext,
        user: &'a str,
        password: &'a str,
    ) -> DbFuture<'a, ()> {
        Box::pin(async move {
            let admin = self.accounts("create_user")?;
            ctx.run("create_user", admin.create_user(user, password))
                .await
        })
    }

    fn delete_user<'a>(&'a self, ctx: &'a OpContext, user: &'a str) -> DbFuture<'a, ()> {
        Box::pin(async move {
            let admin = self.accounts("delete_user")?;
            ctx.run("delete_user", admin.delete_user(user)).await
        })
    }

    fn grant_user_role<'a>(
        &'a self,
        ctx: &'a OpContext,
        user: &'a str,
        role: RoleType,
    ) -> DbFuture<'a, ()> {
        Box::pin(async move {
            let admin = self.accounts("grant_user_role")?;
            ctx.run("grant_user_role", admin.grant_user_role(user, role))
                .await
        })
    }

    fn revoke_user_role<'a>(
        &'a self,
        ctx: &'a OpContext,
        user: &'a str,
        role: RoleType,
    ) -> DbFuture<'a, ()> {
        Box::pin(async move {
            let admin = self.accounts("revoke_user_role")?;
            ctx.run("revoke_user_role", admin.revoke_user_role(user, role))
                .await
        })
    }

    fn shutdown(&self) -> UnitFuture<'_> {
        Box::pin(async move {
            info!("Shutting down {} manager", self.engine);
            self.probe.close().await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::testing::{manager_state, FakeProbe, FixedRole};
    use std::time::Duration;

    fn bare_manager(probe: FakeProbe) -> EngineManager {
        EngineManager::builder(EngineType::Redis, manager_state("redis-0"), Arc::new(probe)).build()
    }

    #[tokio::test]
    async fn test_missing_strategies_report_capability_errors() {
        let mgr = bare_manager(FakeProbe::healthy());
        let ctx = OpContext::background();

        let err = mgr.get_replica_role(&ctx).await.unwrap_err();
        assert_eq!(err.code(), "NotImplemented");
        let err = mgr.exec(&ctx, "select 1").await.unwrap_err();
        assert_eq!(err.code(), "NotImplemented");
        let err = mgr.lock(&ctx, "disk full").await.unwrap_err();
        assert_eq!(err.code(), "NotSupported");
        let err = mgr.list_users(&ctx).await.unwrap_err();
        assert_eq!(err.code(), "NotImplemented");
        assert!(mgr.get_port().is_err());
        assert!(!mgr.is_locked());
    }

    #[tokio::test]
    async fn test_first_member() {
        let mgr = bare_manager(FakeProbe::healthy());
        assert!(mgr.is_first_member());
        assert_eq!(mgr.current_member_name(), "redis-0");
    }

    #[tokio::test]
    async fn test_startup_ready_is_sticky() {
        let probe = FakeProbe::healthy();
        let health = probe.health_handle();
        let mgr = bare_manager(probe);
        let ctx = OpContext::background();

        assert!(mgr.is_startup_ready(&ctx).await);
        health.store(false, std::sync::atomic::Ordering::SeqCst);
        assert!(mgr.is_startup_ready(&ctx).await);
        assert!(!mgr.is_running(&ctx).await);
    }

    #[tokio::test]
    async fn test_probe_bound_applies_to_hung_engine() {
        let mgr = bare_manager(FakeProbe::hanging());
        let ctx = OpContext::background();
        let started = tokio::time::Instant::now();
        assert!(!mgr.is_running(&ctx).await);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_alive_error_counts_as_running() {
        let mgr = bare_manager(FakeProbe::too_many_connections());
        assert!(mgr.is_running(&OpContext::background()).await);
    }

    #[tokio::test]
    async fn test_role_goes_through_detector() {
        let mgr = EngineManager::builder(
            EngineType::Mysql,
            manager_state("mysql-1"),
            Arc::new(FakeProbe::healthy()),
        )
        .roles(Arc::new(FixedRole(Role::Secondary)))
        .port(3306)
        .build();
        let ctx = OpContext::background();
        assert_eq!(mgr.get_replica_role(&ctx).await.unwrap(), Role::Secondary);
        assert_eq!(mgr.get_port().unwrap(), 3306);
        assert!(!mgr.is_first_member());
        assert_eq!(mgr.get_lag(&ctx).await.unwrap_err().code(), "NotImplemented");
    }
}
