//! PostgreSQL managers.
//!
//! Two flavours share the SQL layer:
//!
//! * vanilla PostgreSQL, optionally supervised by Patroni.  When a Patroni
//!   port is configured the role comes from its REST endpoint, otherwise
//!   from `pg_is_in_recovery()`.
//! * the consensus-replicated fork, whose role comes from the
//!   `consensus_member_status` view and whose readiness additionally
//!   requires the `consensus_monitor` extension.
//!
//! Neither flavour supports instance write locks.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use super::accounts::{AccountDialect, SqlAccounts};
use super::manager::{DbFuture, EngineManager, Probe, RoleDetector, UnitFuture};
use super::role::Role;
use super::sql::{query_first, PgClient, SqlClient, SqlStatements};
use super::state::ManagerState;
use super::EngineType;
use crate::errors::DbError;
use crate::registry::EngineSettings;

pub const IN_RECOVERY_SQL: &str = "select pg_is_in_recovery();";
pub const REPLAY_LAG_SQL: &str = "select case when pg_is_in_recovery() \
     then coalesce(extract(epoch from now() - pg_last_xact_replay_timestamp()), 0)::bigint \
     else 0 end as lag;";
pub const CONSENSUS_ROLE_SQL: &str = "select role from consensus_member_status;";
pub const CONSENSUS_EXTENSION_SQL: &str =
    "SELECT extname FROM pg_extension WHERE extname = 'consensus_monitor';";

/// Patroni REST calls share the probe budget of the original tooling.
const PATRONI_TIMEOUT: Duration = Duration::from_secs(2);

// -- Patroni ------------------------------------------------------------------

/// Source of the role string Patroni reports for the local member.
pub trait PatroniApi: Send + Sync {
    fn member_role(&self) -> DbFuture<'_, String>;
}

#[derive(Debug, Deserialize)]
struct PatroniStatus {
    #[serde(default)]
    role: String,
}

/// Patroni REST endpoint on the loopback interface.
pub struct PatroniHttp {
    client: reqwest::Client,
    url: String,
}

impl PatroniHttp {
    pub fn new(port: u16) -> Result<Self, DbError> {
        let client = reqwest::Client::builder()
            .timeout(PATRONI_TIMEOUT)
            .build()
            .map_err(|e| DbError::config(format!("patroni client: {e}")))?;
        Ok(Self {
            client,
            url: format!("http://127.0.0.1:{port}"),
        })
    }
}

impl PatroniApi for PatroniHttp {
    fn member_role(&self) -> DbFuture<'_, String> {
        Box::pin(async move {
            let resp = self
                .client
                .get(&self.url)
                .send()
                .await
                .map_err(|e| DbError::Transient(anyhow::Error::new(e)))?;
            let status: PatroniStatus = resp
                .json()
                .await
                .map_err(|e| DbError::decode("patroni", e.to_string()))?;
            Ok(status.role)
        })
    }
}

/// Map a Patroni role onto the canonical set.
pub fn map_patroni_role(raw: &str) -> Result<Role, DbError> {
    match raw.to_ascii_lowercase().as_str() {
        "master" | "standby_leader" | "primary" => Ok(Role::Primary),
        "replica" => Ok(Role::Secondary),
        other => Err(DbError::decode("patroni", format!("unknown role: {other}"))),
    }
}

// -- Vanilla ------------------------------------------------------------------

pub struct VanillaPostgres {
    client: Arc<dyn SqlClient>,
    patroni: Option<Arc<dyn PatroniApi>>,
}

impl VanillaPostgres {
    pub fn new(client: Arc<dyn SqlClient>, patroni: Option<Arc<dyn PatroniApi>>) -> Self {
        Self { client, patroni }
    }
}

impl Probe for VanillaPostgres {
    fn ping(&self) -> DbFuture<'_, ()> {
        self.client.ping()
    }

    fn close(&self) -> UnitFuture<'_> {
        self.client.close()
    }
}

impl RoleDetector for VanillaPostgres {
    fn detect_role(&self) -> DbFuture<'_, Role> {
        Box::pin(async move {
            if let Some(patroni) = &self.patroni {
                let raw = patroni.member_role().await?;
                debug!("Patroni reports role {}", raw);
                return map_patroni_role(&raw);
            }
            let row = query_first(self.client.as_ref(), IN_RECOVERY_SQL)
                .await?
                .ok_or_else(|| DbError::decode("postgresql", "empty pg_is_in_recovery result"))?;
            if row.get_bool("pg_is_in_recovery") {
                Ok(Role::Secondary)
            } else {
                Ok(Role::Primary)
            }
        })
    }

    fn replication_lag(&self) -> Option<DbFuture<'_, i64>> {
        Some(Box::pin(async move {
            let row = query_first(self.client.as_ref(), REPLAY_LAG_SQL).await?;
            Ok(row.and_then(|r| r.get_int("lag")).unwrap_or(0))
        }))
    }
}

// -- Consensus ----------------------------------------------------------------

pub struct ConsensusPostgres {
    client: Arc<dyn SqlClient>,
}

impl ConsensusPostgres {
    pub fn new(client: Arc<dyn SqlClient>) -> Self {
        Self { client }
    }
}

impl Probe for ConsensusPostgres {
    fn ping(&self) -> DbFuture<'_, ()> {
        self.client.ping()
    }

    fn ready_check(&self) -> DbFuture<'_, ()> {
        Box::pin(async move {
            self.client.ping().await?;
            let ext = query_first(self.client.as_ref(), CONSENSUS_EXTENSION_SQL).await?;
            match ext {
                Some(row) if !row.is_null("extname") => Ok(()),
                _ => Err(DbError::Engine {
                    code: None,
                    message: "consensus_monitor extension is not installed".to_string(),
                }),
            }
        })
    }

    fn close(&self) -> UnitFuture<'_> {
        self.client.close()
    }
}

impl RoleDetector for ConsensusPostgres {
    fn detect_role(&self) -> DbFuture<'_, Role> {
        Box::pin(async move {
            let row = query_first(self.client.as_ref(), CONSENSUS_ROLE_SQL).await?;
            Ok(row
                .map(|r| Role::from_consensus(r.get_string("role")))
                .unwrap_or(Role::Unknown))
        })
    }
}

// -- Construction -------------------------------------------------------------

fn assemble(
    engine: EngineType,
    client: Arc<dyn SqlClient>,
    state: ManagerState,
    port: u16,
    probe_and_roles: (Arc<dyn Probe>, Arc<dyn RoleDetector>),
) -> EngineManager {
    let (probe, roles) = probe_and_roles;
    EngineManager::builder(engine, state, probe)
        .port(port)
        .roles(roles)
        .statements(Arc::new(SqlStatements::new(client.clone())))
        .accounts(Arc::new(SqlAccounts::new(AccountDialect::Postgres, client)))
        .build()
}

pub fn vanilla_with_client(
    engine: EngineType,
    client: Arc<dyn SqlClient>,
    patroni: Option<Arc<dyn PatroniApi>>,
    state: ManagerState,
    port: u16,
) -> EngineManager {
    let pg = Arc::new(VanillaPostgres::new(client.clone(), patroni));
    assemble(engine, client, state, port, (pg.clone(), pg))
}

pub fn consensus_with_client(
    client: Arc<dyn SqlClient>,
    state: ManagerState,
    port: u16,
) -> EngineManager {
    let pg = Arc::new(ConsensusPostgres::new(client.clone()));
    assemble(
        EngineType::ApecloudPostgresql,
        client,
        state,
        port,
        (pg.clone(), pg),
    )
}

/// Registry constructor for `postgresql` and `vanillapostgresql`.
pub fn new_vanilla_manager(settings: &EngineSettings) -> Result<EngineManager, DbError> {
    let cfg = &settings.config.postgres;
    let patroni = match cfg.patroni_port {
        Some(port) => Some(Arc::new(PatroniHttp::new(port)?) as Arc<dyn PatroniApi>),
        None => None,
    };
    Ok(vanilla_with_client(
        settings.engine,
        Arc::new(PgClient::connect_lazy(cfg)),
        patroni,
        ManagerState::new(settings.identity.clone()),
        cfg.port,
    ))
}

/// Registry constructor for `apecloudpostgresql`.
pub fn new_consensus_manager(settings: &EngineSettings) -> Result<EngineManager, DbError> {
    let cfg = &settings.config.postgres;
    Ok(consensus_with_client(
        Arc::new(PgClient::connect_lazy(cfg)),
        ManagerState::new(settings.identity.clone()),
        cfg.port,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::context::OpContext;
    use crate::engines::manager::DbManager;
    use crate::engines::status_row::StatusRow;
    use crate::engines::testing::{manager_state, ScriptedSql};

    struct FixedPatroni(&'static str);

    impl PatroniApi for FixedPatroni {
        fn member_role(&self) -> DbFuture<'_, String> {
            let role = self.0.to_string();
            Box::pin(async move { Ok(role) })
        }
    }

    #[test]
    fn test_patroni_role_mapping() {
        assert_eq!(map_patroni_role("master").unwrap(), Role::Primary);
        assert_eq!(map_patroni_role("Standby_Leader").unwrap(), Role::Primary);
        assert_eq!(map_patroni_role("primary").unwrap(), Role::Primary);
        assert_eq!(map_patroni_role("replica").unwrap(), Role::Secondary);
        let err = map_patroni_role("uninitialized").unwrap_err();
        assert!(err.to_string().contains("unknown role"));
    }

    #[tokio::test]
    async fn test_recovery_flag_decides_role() {
        let sql = Arc::new(ScriptedSql::new());
        sql.on_query(
            IN_RECOVERY_SQL,
            vec![StatusRow::from_pairs([("pg_is_in_recovery", "true")])],
        );
        let pg = VanillaPostgres::new(sql.clone(), None);
        assert_eq!(pg.detect_role().await.unwrap(), Role::Secondary);

        sql.on_query(
            IN_RECOVERY_SQL,
            vec![StatusRow::from_pairs([("pg_is_in_recovery", "false")])],
        );
        assert_eq!(pg.detect_role().await.unwrap(), Role::Primary);
    }

    #[tokio::test]
    async fn test_patroni_takes_precedence_over_sql() {
        let sql = Arc::new(ScriptedSql::new());
        let pg = VanillaPostgres::new(sql.clone(), Some(Arc::new(FixedPatroni("replica"))));
        assert_eq!(pg.detect_role().await.unwrap(), Role::Secondary);
        assert!(sql.queried().is_empty());
    }

    #[tokio::test]
    async fn test_consensus_roles() {
        let sql = Arc::new(ScriptedSql::new());
        let pg = ConsensusPostgres::new(sql.clone());
        for (raw, role) in [
            ("Leader", Role::Leader),
            ("FOLLOWER", Role::Follower),
            ("candidate", Role::Candidate),
            ("Learner", Role::Learner),
            ("logger", Role::Unknown),
        ] {
            sql.on_query(CONSENSUS_ROLE_SQL, vec![StatusRow::from_pairs([("role", raw)])]);
            assert_eq!(pg.detect_role().await.unwrap(), role, "{raw}");
        }
    }

    #[tokio::test]
    async fn test_consensus_readiness_requires_extension() {
        let sql = Arc::new(ScriptedSql::new());
        let mgr = consensus_with_client(sql.clone(), manager_state("pg-0"), 5432);
        let ctx = OpContext::background();
        assert!(!mgr.is_startup_ready(&ctx).await);

        sql.on_query(
            CONSENSUS_EXTENSION_SQL,
            vec![StatusRow::from_pairs([("extname", "consensus_monitor")])],
        );
        assert!(mgr.is_startup_ready(&ctx).await);
    }

    #[tokio::test]
    async fn test_lock_is_not_supported() {
        let sql = Arc::new(ScriptedSql::new());
        let mgr = vanilla_with_client(
            EngineType::Postgresql,
            sql,
            None,
            manager_state("pg-1"),
            5432,
        );
        let ctx = OpContext::background();
        assert_eq!(mgr.lock(&ctx, "disk full").await.unwrap_err().code(), "NotSupported");
        assert_eq!(mgr.unlock(&ctx).await.unwrap_err().code(), "NotSupported");
    }
}
