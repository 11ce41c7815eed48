//! Redis manager with Sentinel-based role detection.
//!
//! The instance is the primary exactly when Sentinel's current master
//! address equals the address this instance advertises.  That advertised
//! address depends on how the pod is exposed, so it is resolved once at
//! construction from the environment.

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::{ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::manager::{DbFuture, EngineManager, Probe, RoleDetector};
use super::role::Role;
use super::state::ManagerState;
use super::EngineType;
use crate::config::RedisConfig;
use crate::errors::DbError;
use crate::identity::{member_index, Env, Identity, KB_ENV_HOST_IP};
use crate::registry::EngineSettings;

pub const ENV_FIXED_POD_IP_ENABLED: &str = "FIXED_POD_IP_ENABLED";
pub const ENV_LOAD_BALANCER_ENABLED: &str = "LOAD_BALANCER_ENABLED";
pub const ENV_LB_ADVERTISED_HOST: &str = "REDIS_LB_ADVERTISED_HOST";
pub const ENV_HOST_NETWORK_PORT: &str = "REDIS_HOST_NETWORK_PORT";
pub const ENV_ADVERTISED_PORT: &str = "REDIS_ADVERTISED_PORT";
pub const ENV_CLUSTER_HOST_NETWORK_PORT: &str = "REDIS_CLUSTER_HOST_NETWORK_PORT";
pub const ENV_SHARD_ADVERTISED_PORT: &str = "CURRENT_SHARD_ADVERTISED_PORT";
pub const ENV_SERVICE_PORT: &str = "SERVICE_PORT";
pub const ENV_CUSTOM_MASTER_NAME: &str = "CUSTOM_SENTINEL_MASTER_NAME";

/// First release with ACL usernames.
const MIN_USERNAME_MAJOR: u32 = 6;

// -- Advertised address -------------------------------------------------------

/// Host and port other members and Sentinel know this instance by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisedAddr {
    pub host: String,
    pub port: String,
}

/// Find the entry of a `svc-0:value,svc-1:value` list whose ordinal
/// matches `member`.
fn pick_by_ordinal<'a>(list: &'a str, member: &str) -> Option<&'a str> {
    let wanted = member_index(member)?;
    list.split(',')
        .filter_map(|entry| entry.trim().split_once(':'))
        .find(|(svc, _)| member_index(svc) == Some(wanted))
        .map(|(_, value)| value)
}

fn advertised_port(list: &str, member: &str) -> Result<String, DbError> {
    pick_by_ordinal(list, member)
        .map(str::to_string)
        .ok_or_else(|| DbError::config(format!("failed to get advertised port for {member}")))
}

/// Resolve the advertised address.  `lookup` performs DNS resolution of
/// the pod FQDN when fixed pod IPs are enabled.
///
/// Host precedence: fixed pod IP, then load balancer host, then the node
/// IP when any host-network port is configured, then the pod FQDN.  Port:
/// `SERVICE_PORT`, overridden by the per-member advertised port lists.
pub fn resolve_advertised(
    env: &Env,
    identity: &Identity,
    lookup: impl Fn(&str) -> Result<String, DbError>,
) -> Result<AdvertisedAddr, DbError> {
    let member = identity.pod_name.as_str();
    let mut host = identity.pod_fqdn.clone();

    if env.is_set(ENV_FIXED_POD_IP_ENABLED) {
        host = lookup(&identity.pod_fqdn)?;
    } else if env.is_set(ENV_LOAD_BALANCER_ENABLED) {
        let hosts = env.get_or_empty(ENV_LB_ADVERTISED_HOST);
        if let Some(lb) = pick_by_ordinal(&hosts, member) {
            host = lb.to_string();
        }
    } else if [
        ENV_HOST_NETWORK_PORT,
        ENV_ADVERTISED_PORT,
        ENV_CLUSTER_HOST_NETWORK_PORT,
        ENV_SHARD_ADVERTISED_PORT,
    ]
    .iter()
    .any(|k| env.is_set(k))
    {
        host = env.get_or_empty(KB_ENV_HOST_IP);
    }

    let mut port = env.get_or_empty(ENV_SERVICE_PORT);
    if let Some(list) = env.get(ENV_SHARD_ADVERTISED_PORT) {
        port = advertised_port(list, member)?;
    }
    if let Some(list) = env.get(ENV_ADVERTISED_PORT) {
        port = advertised_port(list, member)?;
    }

    Ok(AdvertisedAddr { host, port })
}

/// First address `fqdn` resolves to.
pub fn dns_lookup(fqdn: &str) -> Result<String, DbError> {
    (fqdn, 0)
        .to_socket_addrs()
        .map_err(|e| DbError::Transient(anyhow::anyhow!("lookup {fqdn}: {e}")))?
        .next()
        .map(|addr| addr.ip().to_string())
        .ok_or_else(|| DbError::config(format!("failed to get IP address for {fqdn}")))
}

/// Sentinel master name: the cluster component unless overridden.
pub fn master_name(env: &Env, identity: &Identity) -> String {
    env.get(ENV_CUSTOM_MASTER_NAME)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| identity.cluster_comp_name.clone())
}

// -- Transport ----------------------------------------------------------------

/// The Sentinel and data-port commands the manager needs.
pub trait SentinelApi: Send + Sync {
    /// `SENTINEL get-master-addr-by-name`; `None` when Sentinel knows no master.
    fn master_addr<'a>(&'a self, master: &'a str) -> DbFuture<'a, Option<(String, String)>>;

    /// `PING` against the local data port.
    fn ping_local(&self) -> DbFuture<'_, ()>;
}

fn map_redis_error(err: redis::RedisError) -> DbError {
    if err.is_io_error() || err.is_timeout() || err.is_connection_dropped() || err.is_connection_refusal() {
        return DbError::Transient(anyhow::Error::new(err));
    }
    if err.kind() == redis::ErrorKind::TypeError {
        return DbError::decode("redis", err.to_string());
    }
    DbError::Engine {
        code: err.code().map(str::to_string),
        message: err.to_string(),
    }
}

/// Major version from `7.2.4` or `redis-cli 7.2.4` style strings.
pub fn major_version(raw: &str) -> Result<u32, DbError> {
    let version = raw.split_whitespace().last().unwrap_or_default();
    version
        .split('.')
        .next()
        .and_then(|major| major.parse().ok())
        .ok_or_else(|| DbError::config(format!("invalid redis version info: {raw}")))
}

/// The username to authenticate with.  Servers older than 6 take only a
/// password; an unknown version keeps the username.
pub fn effective_user(user: Option<&str>, major: Option<u32>) -> Option<String> {
    match major {
        Some(major) if major < MIN_USERNAME_MAJOR => None,
        _ => user.filter(|u| !u.is_empty()).map(str::to_string),
    }
}

fn connection_info(host: &str, port: u16, user: Option<String>, password: Option<String>) -> ConnectionInfo {
    ConnectionInfo {
        addr: ConnectionAddr::Tcp(host.to_string(), port),
        redis: RedisConnectionInfo {
            username: user.filter(|u| !u.is_empty()),
            password: password.filter(|p| !p.is_empty()),
            ..Default::default()
        },
    }
}

/// Lazily-connected multiplexed connection.
struct LazyConn {
    client: redis::Client,
    conn: OnceCell<MultiplexedConnection>,
    timeout: Duration,
}

impl LazyConn {
    fn new(info: ConnectionInfo, timeout: Duration) -> Result<Self, DbError> {
        let client = redis::Client::open(info).map_err(map_redis_error)?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
            timeout,
        })
    }

    async fn get(&self) -> Result<MultiplexedConnection, DbError> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                tokio::time::timeout(self.timeout, self.client.get_multiplexed_async_connection())
                    .await
                    .map_err(|_| DbError::Transient(anyhow::anyhow!("redis connect timed out")))?
                    .map_err(map_redis_error)
            })
            .await?;
        Ok(conn.clone())
    }
}

/// Driver-backed [`SentinelApi`].
pub struct RedisSentinel {
    sentinel: LazyConn,
    local: LazyConn,
}

impl RedisSentinel {
    pub fn connect(cfg: &RedisConfig) -> Result<Self, DbError> {
        let timeout = Duration::from_secs(cfg.connect_timeout_secs);
        let major = cfg.version.as_deref().map(major_version).transpose()?;
        if let Some(m) = major.filter(|m| *m < MIN_USERNAME_MAJOR) {
            info!("Redis major version {} has no ACL users, authenticating by password only", m);
        }
        let sentinel = LazyConn::new(
            connection_info(
                &cfg.sentinel_host,
                cfg.sentinel_port,
                effective_user(cfg.sentinel_user.as_deref(), major),
                cfg.sentinel_password.clone(),
            ),
            timeout,
        )?;
        let local = LazyConn::new(
            connection_info(
                &cfg.host,
                cfg.port,
                effective_user(Some(&cfg.user), major),
                Some(cfg.password.clone()),
            ),
            timeout,
        )?;
        debug!(
            "Redis clients configured: data {}:{} sentinel {}:{}",
            cfg.host, cfg.port, cfg.sentinel_host, cfg.sentinel_port
        );
        Ok(Self { sentinel, local })
    }
}

impl SentinelApi for RedisSentinel {
    fn master_addr<'a>(&'a self, master: &'a str) -> DbFuture<'a, Option<(String, String)>> {
        Box::pin(async move {
            let mut conn = self.sentinel.get().await?;
            let reply: Option<Vec<String>> = redis::cmd("SENTINEL")
                .arg("get-master-addr-by-name")
                .arg(master)
                .query_async(&mut conn)
                .await
                .map_err(map_redis_error)?;
            match reply {
                None => Ok(None),
                Some(parts) if parts.len() == 2 => {
                    let mut it = parts.into_iter();
                    Ok(it.next().zip(it.next()))
                }
                Some(parts) => Err(DbError::decode(
                    "redis-sentinel",
                    format!("expected host and port, got {parts:?}"),
                )),
            }
        })
    }

    fn ping_local(&self) -> DbFuture<'_, ()> {
        Box::pin(async move {
            let mut conn = self.local.get().await?;
            let _: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(map_redis_error)?;
            Ok(())
        })
    }
}

// -- Engine -------------------------------------------------------------------

pub struct RedisEngine {
    api: Arc<dyn SentinelApi>,
    master_name: String,
    advertised: AdvertisedAddr,
}

impl RedisEngine {
    pub fn new(api: Arc<dyn SentinelApi>, master_name: String, advertised: AdvertisedAddr) -> Self {
        Self {
            api,
            master_name,
            advertised,
        }
    }

    pub fn advertised(&self) -> &AdvertisedAddr {
        &self.advertised
    }
}

impl Probe for RedisEngine {
    fn ping(&self) -> DbFuture<'_, ()> {
        self.api.ping_local()
    }
}

impl RoleDetector for RedisEngine {
    fn detect_role(&self) -> DbFuture<'_, Role> {
        Box::pin(async move {
            let Some((host, port)) = self.api.master_addr(&self.master_name).await? else {
                debug!("Sentinel knows no master named {}", self.master_name);
                return Ok(Role::Unknown);
            };
            if host == self.advertised.host && port == self.advertised.port {
                Ok(Role::Primary)
            } else {
                Ok(Role::Secondary)
            }
        })
    }
}

pub fn manager_with_api(
    api: Arc<dyn SentinelApi>,
    state: ManagerState,
    env: &Env,
    port: u16,
    lookup: impl Fn(&str) -> Result<String, DbError>,
) -> Result<EngineManager, DbError> {
    let advertised = resolve_advertised(env, state.identity(), lookup)?;
    let master = master_name(env, state.identity());
    info!(
        "Redis advertises {}:{} under sentinel master {}",
        advertised.host, advertised.port, master
    );
    let engine = Arc::new(RedisEngine::new(api, master, advertised));
    Ok(EngineManager::builder(EngineType::Redis, state, engine.clone())
        .port(port)
        .roles(engine)
        .build())
}

/// Registry constructor.
pub fn new_manager(settings: &EngineSettings) -> Result<EngineManager, DbError> {
    let cfg = &settings.config.redis;
    let api = Arc::new(RedisSentinel::connect(cfg)?);
    manager_with_api(
        api,
        ManagerState::new(settings.identity.clone()),
        &settings.env,
        cfg.port,
        dns_lookup,
    )
}
