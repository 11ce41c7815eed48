//! MySQL manager: replication-log role detection and `read_only` locking.
//!
//! Role detection is an ordered decision:
//!
//! 1. the replica status shows the IO or SQL thread running: `Secondary`
//! 2. the server lists attached replicas: `Primary`
//! 3. `@@global.read_only` is on: `Secondary`
//! 4. otherwise `Primary`
//!
//! Each step only runs if the previous one was inconclusive, and any query
//! error aborts detection.  Servers from 8.0.22 on renamed the replication
//! statements and columns, so the server version is probed once and decides
//! which vocabulary to use.

use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::accounts::{AccountDialect, SqlAccounts};
use super::lock::LockPolicy;
use super::manager::{DbFuture, EngineManager, Probe, RoleDetector, WriteProtection};
use super::role::Role;
use super::sql::{query_first, MySqlClient, SqlClient, SqlStatements};
use super::state::ManagerState;
use super::status_row::StatusRow;
use super::EngineType;
use crate::errors::DbError;
use crate::registry::EngineSettings;

pub const VERSION_SQL: &str = "select version()";
pub const READ_ONLY_SQL: &str = "select @@global.read_only as read_only";
pub const SERVER_ID_SQL: &str = "select @@global.server_id as server_id";
pub const LOCK_SQL: &str = "set global read_only=on;";
pub const UNLOCK_SQL: &str = "set global read_only=off;";

/// "Too many connections": the server is up but refusing new sessions.
pub const ER_CON_COUNT_ERROR: &str = "1040";

// -- Replication vocabulary ---------------------------------------------------

/// Statement and column names for one replication vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaTerms {
    pub status_sql: &'static str,
    pub hosts_sql: &'static str,
    pub io_running: &'static str,
    pub sql_running: &'static str,
    pub seconds_behind: &'static str,
}

pub const LEGACY_TERMS: ReplicaTerms = ReplicaTerms {
    status_sql: "show slave status",
    hosts_sql: "show slave hosts",
    io_running: "Slave_IO_Running",
    sql_running: "Slave_SQL_Running",
    seconds_behind: "Seconds_Behind_Master",
};

pub const MODERN_TERMS: ReplicaTerms = ReplicaTerms {
    status_sql: "show replica status",
    hosts_sql: "show replicas",
    io_running: "Replica_IO_Running",
    sql_running: "Replica_SQL_Running",
    seconds_behind: "Seconds_Behind_Source",
};

/// Whether `version` (as returned by `select version()`) understands the
/// `REPLICA` statements.  True for MySQL 8.0.22 and later; MariaDB and
/// anything unparseable use the legacy vocabulary.
pub fn uses_modern_replica_terminology(version: &str) -> bool {
    if version.to_ascii_lowercase().contains("mariadb") {
        return false;
    }
    let numeric: String = version
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let mut parts = numeric.split('.').map(|p| p.parse::<u32>().ok());
    let (Some(Some(major)), Some(Some(minor)), patch) = (parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    let patch = patch.flatten().unwrap_or(0);
    (major, minor, patch) >= (8, 0, 22)
}

pub fn terms_for(version: &str) -> ReplicaTerms {
    if uses_modern_replica_terminology(version) {
        MODERN_TERMS
    } else {
        LEGACY_TERMS
    }
}

// -- Engine -------------------------------------------------------------------

/// MySQL strategies sharing one pool.
pub struct MysqlEngine {
    client: Arc<dyn SqlClient>,
    version: OnceCell<String>,
    last_replica_status: Mutex<Option<StatusRow>>,
    server_id: u32,
}

impl MysqlEngine {
    pub fn new(client: Arc<dyn SqlClient>, server_id: u32) -> Self {
        Self {
            client,
            version: OnceCell::new(),
            last_replica_status: Mutex::new(None),
            server_id,
        }
    }

    /// Server version, probed once and cached.
    pub async fn version(&self) -> Result<&str, DbError> {
        let v = self
            .version
            .get_or_try_init(|| async {
                let row = query_first(self.client.as_ref(), VERSION_SQL)
                    .await?
                    .ok_or_else(|| DbError::decode("mysql", "empty version result"))?;
                let version = row
                    .columns()
                    .next()
                    .map(|c| row.get_string(c).to_string())
                    .unwrap_or_default();
                debug!("MySQL server version {}", version);
                Ok::<_, DbError>(version)
            })
            .await?;
        Ok(v.as_str())
    }

    async fn terms(&self) -> Result<ReplicaTerms, DbError> {
        Ok(terms_for(self.version().await?))
    }

    /// Replica status from the most recent role detection.
    pub fn last_replica_status(&self) -> Option<StatusRow> {
        self.last_replica_status
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
    }

    async fn fetch_replica_status(&self, terms: &ReplicaTerms) -> Result<Option<StatusRow>, DbError> {
        let status = query_first(self.client.as_ref(), terms.status_sql).await?;
        if let Ok(mut cache) = self.last_replica_status.lock() {
            *cache = status.clone();
        }
        Ok(status)
    }

    async fn is_read_only(&self) -> Result<bool, DbError> {
        let row = query_first(self.client.as_ref(), READ_ONLY_SQL)
            .await?
            .ok_or_else(|| DbError::decode("mysql", "empty read_only result"))?;
        Ok(row.get_bool("read_only"))
    }

    async fn seconds_behind(&self) -> Result<i64, DbError> {
        let terms = self.terms().await?;
        let Some(status) = self.fetch_replica_status(&terms).await? else {
            return Ok(0);
        };
        let raw = status.get_string(terms.seconds_behind);
        if raw.is_empty() || raw.eq_ignore_ascii_case("null") {
            return Ok(0);
        }
        raw.trim().parse().map_err(|_| {
            DbError::decode(
                "mysql",
                format!("{} is not a number: {raw}", terms.seconds_behind),
            )
        })
    }

    /// Make `@@global.server_id` match this member's ordinal + 1.
    pub async fn ensure_server_id(&self) -> Result<bool, DbError> {
        let current = query_first(self.client.as_ref(), SERVER_ID_SQL)
            .await?
            .and_then(|row| row.get_int("server_id"));
        if current == Some(i64::from(self.server_id)) {
            return Ok(false);
        }
        let sql = format!("set global server_id = {}", self.server_id);
        self.client.exec(&sql).await?;
        info!("Set global server id to {}", self.server_id);
        Ok(true)
    }
}

impl Probe for MysqlEngine {
    fn ping(&self) -> DbFuture<'_, ()> {
        self.client.ping()
    }

    fn is_alive_error(&self, err: &DbError) -> bool {
        matches!(err, DbError::Engine { code: Some(code), .. } if code == ER_CON_COUNT_ERROR)
    }

    fn on_ready(&self) -> DbFuture<'_, ()> {
        Box::pin(async move { self.ensure_server_id().await.map(|_| ()) })
    }

    fn close(&self) -> super::manager::UnitFuture<'_> {
        self.client.close()
    }
}

impl RoleDetector for MysqlEngine {
    fn detect_role(&self) -> DbFuture<'_, Role> {
        Box::pin(async move {
            let terms = self.terms().await?;

            if let Some(status) = self.fetch_replica_status(&terms).await? {
                let io = status.get_string(terms.io_running);
                let sql = status.get_string(terms.sql_running);
                if io == "Yes" || sql == "Yes" {
                    return Ok(Role::Secondary);
                }
            }

            let replicas = self.client.query_rows(terms.hosts_sql).await?;
            if !replicas.is_empty() {
                return Ok(Role::Primary);
            }

            if self.is_read_only().await? {
                return Ok(Role::Secondary);
            }
            Ok(Role::Primary)
        })
    }

    fn replication_lag(&self) -> Option<DbFuture<'_, i64>> {
        Some(Box::pin(self.seconds_behind()))
    }
}

impl WriteProtection for MysqlEngine {
    fn lock_native<'a>(&'a self, _reason: &'a str) -> DbFuture<'a, ()> {
        Box::pin(async move { self.client.exec(LOCK_SQL).await.map(|_| ()) })
    }

    fn unlock_native(&self) -> DbFuture<'_, u64> {
        Box::pin(async move { self.client.exec(UNLOCK_SQL).await.map(|_| 0) })
    }
}

/// Assemble a MySQL-family manager around `client`.
pub fn manager_with_client(
    engine_type: EngineType,
    client: Arc<dyn SqlClient>,
    state: ManagerState,
    port: u16,
    policy: LockPolicy,
) -> Result<EngineManager, DbError> {
    let server_id = state.identity().member_index()? + 1;
    let engine = Arc::new(MysqlEngine::new(client.clone(), server_id));
    Ok(EngineManager::builder(engine_type, state, engine.clone())
        .port(port)
        .lock_policy(policy)
        .roles(engine.clone())
        .protection(engine)
        .statements(Arc::new(SqlStatements::new(client.clone())))
        .accounts(Arc::new(SqlAccounts::new(AccountDialect::MySql, client)))
        .build())
}

/// Registry constructor for `mysql`, `wesql` and `polardbx`.
pub fn new_manager(settings: &EngineSettings) -> Result<EngineManager, DbError> {
    let cfg = &settings.config.mysql;
    let client: Arc<dyn SqlClient> = Arc::new(MySqlClient::connect_lazy(cfg));
    manager_with_client(
        settings.engine,
        client,
        ManagerState::new(settings.identity.clone()),
        cfg.port,
        settings.config.lock.policy(),
    )
}
