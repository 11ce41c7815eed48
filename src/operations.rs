//! Operation envelope.
//!
//! Wraps manager calls into the response shape orchestrators consume:
//! a `data` map carrying `operation`, an `event` of `Success`, `Failed` or
//! `NotImplemented`, operation-specific fields, and an optional error.

use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::dcs::coordinator::LeaseCoordinator;
use crate::dcs::DcsError;
use crate::engines::context::OpContext;
use crate::engines::manager::DbManager;
use crate::errors::DbError;

pub const GET_ROLE: &str = "getRole";
pub const CHECK_RUNNING: &str = "checkRunning";
pub const LOCK_INSTANCE: &str = "lockInstance";
pub const UNLOCK_INSTANCE: &str = "unlockInstance";
pub const EXEC: &str = "exec";
pub const QUERY: &str = "query";
pub const SWITCHOVER: &str = "switchover";

pub const EVENT_SUCCESS: &str = "Success";
pub const EVENT_FAILED: &str = "Failed";
pub const EVENT_NOT_IMPLEMENTED: &str = "NotImplemented";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OpsResponse {
    pub data: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OpsResponse {
    fn new(operation: &str) -> Self {
        let mut data = Map::new();
        data.insert("operation".to_string(), json!(operation));
        Self { data, error: None }
    }

    fn set(&mut self, key: &str, value: Value) -> &mut Self {
        self.data.insert(key.to_string(), value);
        self
    }

    fn succeed(mut self, message: Option<String>) -> Self {
        self.set("event", json!(EVENT_SUCCESS));
        if let Some(message) = message {
            self.set("message", json!(message));
        }
        self
    }

    fn fail(self, err: &DbError) -> Self {
        let event = if err.is_unsupported() {
            EVENT_NOT_IMPLEMENTED
        } else {
            EVENT_FAILED
        };
        self.fail_with(event, err.code(), err.to_string())
    }

    fn fail_with(mut self, event: &str, code: &str, message: String) -> Self {
        self.set("event", json!(event));
        self.set("message", json!(message));
        self.error = Some(code.to_string());
        self
    }

    pub fn event(&self) -> Option<&str> {
        self.data.get("event").and_then(Value::as_str)
    }

    pub fn is_success(&self) -> bool {
        self.event() == Some(EVENT_SUCCESS)
    }
}

pub async fn get_role(manager: &dyn DbManager, ctx: &OpContext) -> OpsResponse {
    let mut resp = OpsResponse::new(GET_ROLE);
    match manager.get_replica_role(ctx).await {
        Ok(role) => {
            resp.set("role", json!(role.as_str()));
            resp.succeed(None)
        }
        Err(e) => {
            info!("executing getrole error: {}", e);
            resp.fail(&e)
        }
    }
}

/// Liveness check.  Never an error: a dead engine is a `Failed` event.
pub async fn check_running(manager: &dyn DbManager, ctx: &OpContext) -> OpsResponse {
    let resp = OpsResponse::new(CHECK_RUNNING);
    let member = manager.current_member_name().to_string();
    if manager.is_running(ctx).await {
        return resp.succeed(Some(format!("{} {} is running", manager.engine(), member)));
    }
    let mut resp = resp;
    resp.set("event", json!(EVENT_FAILED));
    resp.set("message", json!(format!("{} {} is not running", manager.engine(), member)));
    resp
}

pub async fn lock_instance(manager: &dyn DbManager, ctx: &OpContext, reason: &str) -> OpsResponse {
    let resp = OpsResponse::new(LOCK_INSTANCE);
    match manager.lock(ctx, reason).await {
        Ok(()) => resp.succeed(Some("instance is locked".to_string())),
        Err(e) => {
            warn!("Lock failed: {}", e);
            resp.fail(&e)
        }
    }
}

pub async fn unlock_instance(manager: &dyn DbManager, ctx: &OpContext) -> OpsResponse {
    let resp = OpsResponse::new(UNLOCK_INSTANCE);
    match manager.unlock(ctx).await {
        Ok(()) => resp.succeed(Some("instance is unlocked".to_string())),
        Err(e) => {
            warn!("Unlock failed: {}", e);
            resp.fail(&e)
        }
    }
}

pub async fn exec(manager: &dyn DbManager, ctx: &OpContext, sql: &str) -> OpsResponse {
    let mut resp = OpsResponse::new(EXEC);
    match manager.exec(ctx, sql).await {
        Ok(count) => {
            resp.set("count", json!(count));
            resp.succeed(None)
        }
        Err(e) => resp.fail(&e),
    }
}

pub async fn query(manager: &dyn DbManager, ctx: &OpContext, sql: &str) -> OpsResponse {
    let mut resp = OpsResponse::new(QUERY);
    let body = match manager.query(ctx, sql).await {
        Ok(body) => body,
        Err(e) => return resp.fail(&e),
    };
    match serde_json::from_slice::<Value>(&body) {
        Ok(rows) => {
            resp.set("rows", rows);
            resp.succeed(None)
        }
        Err(e) => resp.fail(&DbError::decode("query", e.to_string())),
    }
}

/// Schedule a leadership transfer through the lease store.
pub async fn switchover(
    coordinator: &LeaseCoordinator,
    leader: Option<&str>,
    candidate: Option<&str>,
) -> OpsResponse {
    let mut resp = OpsResponse::new(SWITCHOVER);
    if let Some(leader) = leader {
        resp.set("leader", json!(leader));
    }
    if let Some(candidate) = candidate {
        resp.set("candidate", json!(candidate));
    }
    match coordinator.create_switchover(leader, candidate).await {
        Ok(()) => resp.succeed(Some("switchover scheduled".to_string())),
        Err(e) => {
            warn!("Switchover rejected: {}", e);
            fail_dcs(resp, &e)
        }
    }
}

fn fail_dcs(resp: OpsResponse, err: &DcsError) -> OpsResponse {
    resp.fail_with(EVENT_FAILED, err.code(), err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::manager::EngineManager;
    use crate::engines::role::Role;
    use crate::engines::sql::SqlStatements;
    use crate::engines::status_row::StatusRow;
    use crate::engines::testing::{manager_state, CountingLock, FakeProbe, FixedRole, ScriptedSql};
    use crate::engines::EngineType;
    use std::sync::Arc;

    fn manager() -> EngineManager {
        let sql = Arc::new(ScriptedSql::new());
        sql.on_query("select 1 as one", vec![StatusRow::from_pairs([("one", "1")])]);
        EngineManager::builder(
            EngineType::Mongodb,
            manager_state("db-0"),
            Arc::new(FakeProbe::healthy()),
        )
        .roles(Arc::new(FixedRole(Role::Primary)))
        .protection(Arc::new(CountingLock::new(0)))
        .statements(Arc::new(SqlStatements::new(sql)))
        .build()
    }

    #[tokio::test]
    async fn test_get_role_success() {
        let resp = get_role(&manager(), &OpContext::background()).await;
        assert_eq!(resp.data["operation"], json!("getRole"));
        assert_eq!(resp.data["role"], json!("primary"));
        assert!(resp.is_success());
        assert!(resp.error.is_none());
    }

    #[tokio::test]
    async fn test_not_implemented_event() {
        let bare = EngineManager::builder(
            EngineType::Redis,
            manager_state("db-0"),
            Arc::new(FakeProbe::healthy()),
        )
        .build();
        let ctx = OpContext::background();
        let resp = get_role(&bare, &ctx).await;
        assert_eq!(resp.event(), Some(EVENT_NOT_IMPLEMENTED));
        assert_eq!(resp.error.as_deref(), Some("NotImplemented"));

        let resp = lock_instance(&bare, &ctx, "maintenance").await;
        assert_eq!(resp.event(), Some(EVENT_NOT_IMPLEMENTED));
        assert_eq!(resp.error.as_deref(), Some("NotSupported"));
    }

    #[tokio::test]
    async fn test_lock_unlock_envelopes() {
        let mgr = manager();
        let ctx = OpContext::background();
        let resp = lock_instance(&mgr, &ctx, "disk full").await;
        assert_eq!(resp.data["operation"], json!("lockInstance"));
        assert!(resp.is_success());
        assert!(mgr.is_locked());
        let resp = unlock_instance(&mgr, &ctx).await;
        assert_eq!(resp.data["operation"], json!("unlockInstance"));
        assert!(resp.is_success());
        assert!(!mgr.is_locked());
    }

    #[tokio::test]
    async fn test_check_running_failed_event() {
        let probe = FakeProbe::healthy();
        let health = probe.health_handle();
        let mgr = EngineManager::builder(EngineType::Mysql, manager_state("db-0"), Arc::new(probe))
            .build();
        let ctx = OpContext::background();
        assert!(check_running(&mgr, &ctx).await.is_success());
        health.store(false, std::sync::atomic::Ordering::SeqCst);
        let resp = check_running(&mgr, &ctx).await;
        assert_eq!(resp.event(), Some(EVENT_FAILED));
        assert!(resp.error.is_none());
    }

    #[tokio::test]
    async fn test_query_and_exec() {
        let mgr = manager();
        let ctx = OpContext::background();
        let resp = query(&mgr, &ctx, "select 1 as one").await;
        assert_eq!(resp.data["rows"], json!([{"one": "1"}]));
        let resp = exec(&mgr, &ctx, "delete from t").await;
        assert_eq!(resp.data["count"], json!(0));
        assert!(resp.is_success());
    }

    #[tokio::test]
    async fn test_switchover_envelope() {
        use crate::dcs::clock::ManualClock;
        use crate::dcs::memory::MemoryStore;
        use crate::dcs::{HaConfig, Member};

        let coordinator = LeaseCoordinator::new(
            "orders",
            Member::new("db-0", "db-0.svc").unwrap(),
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::new(0)),
            HaConfig::default(),
        );
        coordinator.add_current_member().await.unwrap();

        let resp = switchover(&coordinator, Some("db-0"), None).await;
        assert_eq!(resp.event(), Some(EVENT_FAILED));
        assert_eq!(resp.error.as_deref(), Some("LeaderNotHolder"));

        assert!(coordinator.attempt_acquire_lease().await.unwrap());
        let resp = switchover(&coordinator, Some("db-0"), None).await;
        assert!(resp.is_success());
        assert_eq!(resp.data["operation"], json!("switchover"));
        assert_eq!(resp.data["leader"], json!("db-0"));

        let resp = switchover(&coordinator, Some("db-0"), None).await;
        assert_eq!(resp.error.as_deref(), Some("SwitchoverPending"));
    }

    #[test]
    fn test_serialized_shape() {
        let resp = OpsResponse::new(GET_ROLE).succeed(None);
        let text = serde_json::to_string(&resp).unwrap();
        assert_eq!(text, r#"{"data":{"event":"Success","operation":"getRole"}}"#);
    }
}
