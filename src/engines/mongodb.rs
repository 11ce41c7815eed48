//! MongoDB replica-set manager.
//!
//! The role is the `stateStr` of the member `replSetGetStatus` marks as
//! `self`.  Write protection uses `fsyncLock`, which is a counting lock:
//! each `fsyncUnlock` releases one level and reports how many remain.

use std::sync::Arc;
use std::time::Duration;

use mongodb::bson::{self, doc, DateTime, Document};
use mongodb::options::{ClientOptions, Credential, ServerAddress};
use mongodb::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info};

use super::lock::LockPolicy;
use super::manager::{DbFuture, EngineManager, Probe, RoleDetector, WriteProtection};
use super::role::Role;
use super::state::ManagerState;
use super::EngineType;
use crate::config::MongoConfig;
use crate::errors::DbError;
use crate::registry::EngineSettings;

const ADMIN_DB: &str = "admin";

// -- Command transport --------------------------------------------------------

/// Runs commands against the `admin` database.
pub trait AdminCommands: Send + Sync {
    fn run_admin(&self, command: Document) -> DbFuture<'_, Document>;
}

fn map_mongo_error(err: mongodb::error::Error) -> DbError {
    use mongodb::error::ErrorKind;
    match err.kind.as_ref() {
        ErrorKind::Command(cmd) => DbError::Engine {
            code: Some(cmd.code.to_string()),
            message: cmd.message.clone(),
        },
        ErrorKind::InvalidArgument { .. } => DbError::config(err.to_string()),
        ErrorKind::BsonDeserialization(_) => DbError::decode("mongodb", err.to_string()),
        _ => DbError::Transient(anyhow::Error::new(err)),
    }
}

/// Driver-backed admin command client with a direct connection to the
/// local member.
pub struct MongoAdmin {
    client: Client,
}

impl MongoAdmin {
    /// Build the client.  The driver connects lazily on first command.
    pub fn connect(cfg: &MongoConfig) -> Result<Self, DbError> {
        let mut opts = ClientOptions::default();
        opts.hosts = vec![ServerAddress::Tcp {
            host: cfg.host.clone(),
            port: Some(cfg.port),
        }];
        opts.direct_connection = Some(true);
        opts.connect_timeout = Some(Duration::from_secs(cfg.connect_timeout_secs));
        opts.server_selection_timeout = Some(Duration::from_secs(cfg.connect_timeout_secs));
        opts.app_name = Some("dbctl".to_string());
        if !cfg.user.is_empty() {
            let mut credential = Credential::default();
            credential.username = Some(cfg.user.clone());
            credential.password = Some(cfg.password.clone());
            credential.source = Some(ADMIN_DB.to_string());
            opts.credential = Some(credential);
        }
        let client = Client::with_options(opts).map_err(map_mongo_error)?;
        debug!("MongoDB client configured for {}:{}", cfg.host, cfg.port);
        Ok(Self { client })
    }
}

impl AdminCommands for MongoAdmin {
    fn run_admin(&self, command: Document) -> DbFuture<'_, Document> {
        Box::pin(async move {
            self.client
                .database(ADMIN_DB)
                .run_command(command, None)
                .await
                .map_err(map_mongo_error)
        })
    }
}

// -- Response shapes ----------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ReplSetStatus {
    #[serde(default)]
    ok: f64,
    #[serde(default)]
    errmsg: String,
    #[serde(default)]
    members: Vec<ReplSetMember>,
}

#[derive(Debug, Deserialize)]
struct ReplSetMember {
    #[serde(rename = "stateStr", default)]
    state_str: String,
    #[serde(rename = "self", default)]
    is_self: bool,
    #[serde(rename = "optimeDate")]
    optime_date: Option<DateTime>,
}

#[derive(Debug, Deserialize)]
struct LockResp {
    #[serde(default)]
    ok: f64,
    #[serde(default)]
    errmsg: String,
    #[serde(rename = "lockCount", default)]
    lock_count: i64,
}

fn decode<T: DeserializeOwned>(doc: Document, what: &str) -> Result<T, DbError> {
    bson::from_document(doc).map_err(|e| DbError::decode("mongodb", format!("{what}: {e}")))
}

fn check_ok(ok: f64, errmsg: &str) -> Result<(), DbError> {
    if ok != 1.0 {
        return Err(DbError::Engine {
            code: None,
            message: format!("mongo says: {errmsg}"),
        });
    }
    Ok(())
}

/// Seconds the local member's last applied op trails the primary's.
fn lag_seconds(status: &ReplSetStatus) -> i64 {
    let primary = status
        .members
        .iter()
        .find(|m| m.state_str.eq_ignore_ascii_case("primary"))
        .and_then(|m| m.optime_date);
    let me = status
        .members
        .iter()
        .find(|m| m.is_self)
        .and_then(|m| m.optime_date);
    match (primary, me) {
        (Some(p), Some(s)) => ((p.timestamp_millis() - s.timestamp_millis()) / 1000).max(0),
        _ => 0,
    }
}

/// Map a replica-set member state onto the canonical set.
pub fn map_member_state(state: &str) -> Role {
    match state.to_ascii_lowercase().as_str() {
        "primary" => Role::Primary,
        "secondary" => Role::Secondary,
        _ => Role::Unknown,
    }
}

// -- Engine -------------------------------------------------------------------

pub struct MongoEngine {
    admin: Arc<dyn AdminCommands>,
}

impl MongoEngine {
    pub fn new(admin: Arc<dyn AdminCommands>) -> Self {
        Self { admin }
    }

    async fn repl_set_status(&self) -> Result<ReplSetStatus, DbError> {
        let resp = self.admin.run_admin(doc! { "replSetGetStatus": 1 }).await?;
        let status: ReplSetStatus = decode(resp, "replSetGetStatus")?;
        check_ok(status.ok, &status.errmsg)?;
        Ok(status)
    }
}

impl Probe for MongoEngine {
    fn ping(&self) -> DbFuture<'_, ()> {
        Box::pin(async move {
            self.admin.run_admin(doc! { "ping": 1 }).await.map(|_| ())
        })
    }
}

impl RoleDetector for MongoEngine {
    fn detect_role(&self) -> DbFuture<'_, Role> {
        Box::pin(async move {
            let status = self.repl_set_status().await?;
            let role = status
                .members
                .iter()
                .find(|m| m.is_self)
                .map(|m| map_member_state(&m.state_str))
                .unwrap_or(Role::Unknown);
            Ok(role)
        })
    }

    fn replication_lag(&self) -> Option<DbFuture<'_, i64>> {
        Some(Box::pin(async move {
            let status = self.repl_set_status().await?;
            Ok(lag_seconds(&status))
        }))
    }
}

impl WriteProtection for MongoEngine {
    fn lock_native<'a>(&'a self, reason: &'a str) -> DbFuture<'a, ()> {
        Box::pin(async move {
            let cmd = doc! { "fsync": 1, "lock": true, "comment": reason };
            let resp: LockResp = decode(self.admin.run_admin(cmd).await?, "fsync lock")?;
            check_ok(resp.ok, &resp.errmsg)?;
            info!("fsyncLock held {} times", resp.lock_count);
            Ok(())
        })
    }

    fn unlock_native(&self) -> DbFuture<'_, u64> {
        Box::pin(async move {
            let resp: LockResp = decode(
                self.admin.run_admin(doc! { "fsyncUnlock": 1 }).await?,
                "fsyncUnlock",
            )?;
            check_ok(resp.ok, &resp.errmsg)?;
            Ok(u64::try_from(resp.lock_count).unwrap_or(0))
        })
    }
}

pub fn manager_with_admin(
    admin: Arc<dyn AdminCommands>,
    state: ManagerState,
    port: u16,
    policy: LockPolicy,
) -> EngineManager {
    let engine = Arc::new(MongoEngine::new(admin));
    EngineManager::builder(EngineType::Mongodb, state, engine.clone())
        .port(port)
        .lock_policy(policy)
        .roles(engine.clone())
        .protection(engine)
        .build()
}

/// Registry constructor.
pub fn new_manager(settings: &EngineSettings) -> Result<EngineManager, DbError> {
    let cfg = &settings.config.mongodb;
    let admin = Arc::new(MongoAdmin::connect(cfg)?);
    Ok(manager_with_admin(
        admin,
        ManagerState::new(settings.identity.clone()),
        cfg.port,
        settings.config.lock.policy(),
    ))
}
