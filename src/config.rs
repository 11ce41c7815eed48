//! Configuration loading and types for dbctl.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! sidecar: engine selection, logging, metrics, lease coordination, the
//! lock protocol, and per-engine connection settings.  Credentials and
//! ports injected by the orchestrator through the environment override
//! whatever the file says (see [`Config::apply_env`]).

use garde::Validate;
use serde::Deserialize;
use std::path::Path;

use crate::engines::lock::LockPolicy;
use crate::identity::{Env, KB_ENV_ENGINE_TYPE, KB_ENV_SERVICE_PASSWORD, KB_ENV_SERVICE_PORT, KB_ENV_SERVICE_USER};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct Config {
    /// Which engine this sidecar manages.
    #[serde(default)]
    #[garde(skip)]
    pub engine: EngineConfig,

    /// Logging settings.
    #[serde(default)]
    #[garde(skip)]
    pub logging: LoggingConfig,

    /// Observability settings (Prometheus exporter).
    #[serde(default)]
    #[garde(skip)]
    pub observability: ObservabilityConfig,

    /// Lease store and HA loop settings.
    #[serde(default)]
    #[garde(dive)]
    pub dcs: DcsConfig,

    /// Lock protocol settings.
    #[serde(default)]
    #[garde(dive)]
    pub lock: LockConfig,

    #[serde(default)]
    #[garde(dive)]
    pub mysql: MysqlConfig,

    #[serde(default)]
    #[garde(dive)]
    pub postgres: PostgresConfig,

    #[serde(default)]
    #[garde(dive)]
    pub mongodb: MongoConfig,

    #[serde(default)]
    #[garde(dive)]
    pub redis: RedisConfig,
}

/// Engine selection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    /// Engine type name (`mysql`, `postgresql`, `mongodb`, ...).  Usually
    /// supplied through `KB_ENGINE_TYPE`.
    #[serde(default, rename = "type")]
    pub engine_type: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Install the Prometheus recorder and serve `/metrics`.
    #[serde(default = "default_true")]
    pub metrics: bool,

    /// Listen address of the exporter.
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics: true,
            metrics_addr: default_metrics_addr(),
        }
    }
}

/// Lease store and HA loop configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct DcsConfig {
    /// Backend type: `sqlite` (shared file) or `memory` (single process,
    /// tests only).
    #[serde(default = "default_dcs_backend")]
    #[garde(pattern(r"^(memory|sqlite)$"))]
    pub backend: String,

    /// Path to the SQLite lease database.
    #[serde(default = "default_dcs_path")]
    #[garde(skip)]
    pub sqlite_path: String,

    /// Initial HA configuration written when the cluster has none.
    #[serde(default = "default_true")]
    #[garde(skip)]
    pub enable: bool,

    /// Lease time-to-live in seconds.
    #[serde(default = "default_ttl")]
    #[garde(range(min = 1))]
    pub ttl: u64,

    /// Maximum replication lag (seconds) tolerated for a candidate.
    #[serde(default = "default_max_lag")]
    #[garde(range(min = 0))]
    pub max_lag: i64,

    /// HA loop period in seconds.
    #[serde(default = "default_health_check_period")]
    #[garde(range(min = 1))]
    pub health_check_period: u64,
}

impl Default for DcsConfig {
    fn default() -> Self {
        Self {
            backend: default_dcs_backend(),
            sqlite_path: default_dcs_path(),
            enable: true,
            ttl: default_ttl(),
            max_lag: default_max_lag(),
            health_check_period: default_health_check_period(),
        }
    }
}

/// Lock protocol configuration.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct LockConfig {
    /// Cap on native unlock calls per unlock request.
    #[serde(default)]
    #[garde(range(min = 1))]
    pub max_unlock_rounds: Option<u32>,
}

impl LockConfig {
    pub fn policy(&self) -> LockPolicy {
        LockPolicy {
            max_unlock_rounds: self.max_unlock_rounds,
        }
    }
}

/// MySQL connection settings.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct MysqlConfig {
    #[serde(default = "default_local_host")]
    #[garde(length(min = 1))]
    pub host: String,
    #[serde(default = "default_mysql_port")]
    #[garde(skip)]
    pub port: u16,
    #[serde(default = "default_root_user")]
    #[garde(skip)]
    pub user: String,
    #[serde(default)]
    #[garde(skip)]
    pub password: String,
    #[serde(default)]
    #[garde(skip)]
    pub database: Option<String>,
    #[serde(default = "default_max_connections")]
    #[garde(range(min = 1))]
    pub max_connections: u32,
    #[serde(default = "default_connect_timeout")]
    #[garde(range(min = 1))]
    pub connect_timeout_secs: u64,
}

impl Default for MysqlConfig {
    fn default() -> Self {
        Self {
            host: default_local_host(),
            port: default_mysql_port(),
            user: default_root_user(),
            password: String::new(),
            database: None,
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// PostgreSQL connection settings.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PostgresConfig {
    #[serde(default = "default_local_host")]
    #[garde(length(min = 1))]
    pub host: String,
    #[serde(default = "default_postgres_port")]
    #[garde(skip)]
    pub port: u16,
    #[serde(default = "default_postgres_user")]
    #[garde(skip)]
    pub user: String,
    #[serde(default)]
    #[garde(skip)]
    pub password: String,
    #[serde(default = "default_postgres_user")]
    #[garde(length(min = 1))]
    pub database: String,
    #[serde(default = "default_max_connections")]
    #[garde(range(min = 1))]
    pub max_connections: u32,
    #[serde(default = "default_connect_timeout")]
    #[garde(range(min = 1))]
    pub connect_timeout_secs: u64,
    /// Patroni REST port; when set, vanilla PostgreSQL roles come from Patroni.
    #[serde(default)]
    #[garde(skip)]
    pub patroni_port: Option<u16>,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: default_local_host(),
            port: default_postgres_port(),
            user: default_postgres_user(),
            password: String::new(),
            database: default_postgres_user(),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout(),
            patroni_port: None,
        }
    }
}

/// MongoDB connection settings.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct MongoConfig {
    #[serde(default = "default_local_host")]
    #[garde(length(min = 1))]
    pub host: String,
    #[serde(default = "default_mongo_port")]
    #[garde(skip)]
    pub port: u16,
    #[serde(default)]
    #[garde(skip)]
    pub user: String,
    #[serde(default)]
    #[garde(skip)]
    pub password: String,
    #[serde(default = "default_connect_timeout")]
    #[garde(range(min = 1))]
    pub connect_timeout_secs: u64,
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self {
            host: default_local_host(),
            port: default_mongo_port(),
            user: String::new(),
            password: String::new(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// Redis and Sentinel connection settings.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RedisConfig {
    #[serde(default = "default_local_host")]
    #[garde(length(min = 1))]
    pub host: String,
    #[serde(default = "default_redis_port")]
    #[garde(skip)]
    pub port: u16,
    #[serde(default = "default_redis_user")]
    #[garde(skip)]
    pub user: String,
    #[serde(default)]
    #[garde(skip)]
    pub password: String,
    #[serde(default = "default_local_host")]
    #[garde(length(min = 1))]
    pub sentinel_host: String,
    #[serde(default = "default_sentinel_port")]
    #[garde(skip)]
    pub sentinel_port: u16,
    #[serde(default)]
    #[garde(skip)]
    pub sentinel_user: Option<String>,
    #[serde(default)]
    #[garde(skip)]
    pub sentinel_password: Option<String>,
    /// Server version such as `7.2.4`; below 6 no username is sent.
    #[serde(default)]
    #[garde(skip)]
    pub version: Option<String>,
    #[serde(default = "default_connect_timeout")]
    #[garde(range(min = 1))]
    pub connect_timeout_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_local_host(),
            port: default_redis_port(),
            user: default_redis_user(),
            password: String::new(),
            sentinel_host: default_local_host(),
            sentinel_port: default_sentinel_port(),
            sentinel_user: None,
            sentinel_password: None,
            version: None,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

// -- Environment overrides ---------------------------------------------------

/// Pick the first non-empty value among `keys`.
fn env_first(env: &Env, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| env.get(k))
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

fn env_port(env: &Env, keys: &[&str]) -> anyhow::Result<Option<u16>> {
    match env_first(env, keys) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid port {raw:?} in {keys:?}: {e}")),
        None => Ok(None),
    }
}

impl Config {
    /// Overlay values injected by the orchestrator.  The generic
    /// `KB_SERVICE_*` names win over engine-specific ones.
    pub fn apply_env(&mut self, env: &Env) -> anyhow::Result<()> {
        if let Some(engine) = env_first(env, &[KB_ENV_ENGINE_TYPE]) {
            self.engine.engine_type = engine;
        }

        let service_port = env_port(env, &[KB_ENV_SERVICE_PORT])?;

        if let Some(user) = env_first(env, &[KB_ENV_SERVICE_USER, "MYSQL_ROOT_USER"]) {
            self.mysql.user = user;
        }
        if let Some(pw) = env_first(env, &[KB_ENV_SERVICE_PASSWORD, "MYSQL_ROOT_PASSWORD"]) {
            self.mysql.password = pw;
        }

        if let Some(user) = env_first(env, &[KB_ENV_SERVICE_USER, "POSTGRES_USER"]) {
            self.postgres.user = user;
        }
        if let Some(pw) = env_first(env, &[KB_ENV_SERVICE_PASSWORD, "POSTGRES_PASSWORD"]) {
            self.postgres.password = pw;
        }
        if let Some(port) = env_port(env, &["PATRONI_PORT"])? {
            self.postgres.patroni_port = Some(port);
        }

        if let Some(user) = env_first(env, &[KB_ENV_SERVICE_USER, "MONGODB_ROOT_USER", "MONGODB_USER"]) {
            self.mongodb.user = user;
        }
        if let Some(pw) = env_first(
            env,
            &[KB_ENV_SERVICE_PASSWORD, "MONGODB_ROOT_PASSWORD", "MONGODB_PASSWORD"],
        ) {
            self.mongodb.password = pw;
        }

        if let Some(user) = env_first(env, &[KB_ENV_SERVICE_USER, "REDIS_DEFAULT_USER"]) {
            self.redis.user = user;
        }
        if let Some(pw) = env_first(env, &[KB_ENV_SERVICE_PASSWORD, "REDIS_DEFAULT_PASSWORD"]) {
            self.redis.password = pw;
        }
        if let Some(port) = env_port(env, &["SENTINEL_SERVICE_PORT"])? {
            self.redis.sentinel_port = port;
        }
        if let Some(user) = env_first(env, &["SENTINEL_USER"]) {
            self.redis.sentinel_user = Some(user);
        }
        if let Some(pw) = env_first(env, &["SENTINEL_PASSWORD"]) {
            self.redis.sentinel_password = Some(pw);
        }
        if let Some(version) = env_first(env, &["REDIS_VERSION"]) {
            self.redis.version = Some(version);
        }

        if let Some(port) = service_port {
            self.mysql.port = port;
            self.postgres.port = port;
            self.mongodb.port = port;
            self.redis.port = port;
        }
        Ok(())
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9501".to_string()
}

fn default_dcs_backend() -> String {
    "sqlite".to_string()
}

fn default_dcs_path() -> String {
    "./data/dcs.db".to_string()
}

fn default_ttl() -> u64 {
    15
}

fn default_max_lag() -> i64 {
    10
}

fn default_health_check_period() -> u64 {
    10
}

fn default_local_host() -> String {
    "127.0.0.1".to_string()
}

fn default_root_user() -> String {
    "root".to_string()
}

fn default_postgres_user() -> String {
    "postgres".to_string()
}

fn default_redis_user() -> String {
    "default".to_string()
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_postgres_port() -> u16 {
    5432
}

fn default_mongo_port() -> u16 {
    27017
}

fn default_redis_port() -> u16 {
    6379
}

fn default_sentinel_port() -> u16 {
    26379
}

fn default_max_connections() -> u32 {
    4
}

fn default_connect_timeout() -> u64 {
    5
}

// -- Loader ------------------------------------------------------------------

/// Parse and validate a YAML document.
pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
    let config: Config = if contents.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(contents)?
    };
    config.validate()?;
    Ok(config)
}

/// Load the configuration file at `path`, falling back to defaults when it
/// does not exist, then overlay `env`.
pub fn load_config<P: AsRef<Path>>(path: P, env: &Env) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let mut config = match std::fs::read_to_string(path) {
        Ok(contents) => parse_config(&contents)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
        Err(e) => return Err(anyhow::anyhow!("read {}: {e}", path.display())),
    };
    config.apply_env(env)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.dcs.ttl, 15);
        assert_eq!(config.dcs.max_lag, 10);
        assert_eq!(config.dcs.health_check_period, 10);
        assert_eq!(config.dcs.backend, "sqlite");
        assert_eq!(Config::default().dcs.backend, "sqlite");
        assert_eq!(config.redis.sentinel_port, 26379);
        assert!(config.lock.policy().max_unlock_rounds.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_yaml_sections() {
        let yaml = r#"
engine:
  type: mysql
dcs:
  backend: memory
  ttl: 30
lock:
  max_unlock_rounds: 8
mysql:
  port: 3307
  database: app
"#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.engine.engine_type, "mysql");
        assert_eq!(config.dcs.backend, "memory");
        assert_eq!(config.dcs.ttl, 30);
        assert_eq!(config.lock.policy().max_unlock_rounds, Some(8));
        assert_eq!(config.mysql.port, 3307);
        assert_eq!(config.mysql.database.as_deref(), Some("app"));
    }

    #[test]
    fn test_invalid_ttl_rejected() {
        assert!(parse_config("dcs:\n  ttl: 0\n").is_err());
        assert!(parse_config("dcs:\n  backend: etcd\n").is_err());
        assert!(parse_config("lock:\n  max_unlock_rounds: 0\n").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env = Env::from_pairs([
            (KB_ENV_ENGINE_TYPE, "postgresql"),
            (KB_ENV_SERVICE_PORT, "15432"),
            ("POSTGRES_USER", "admin"),
            ("POSTGRES_PASSWORD", "s3cret"),
            ("PATRONI_PORT", "8008"),
            ("REDIS_DEFAULT_PASSWORD", "r3d1s"),
            ("REDIS_VERSION", "5.0.14"),
        ]);
        let mut config = Config::default();
        config.apply_env(&env).unwrap();
        assert_eq!(config.engine.engine_type, "postgresql");
        assert_eq!(config.postgres.port, 15432);
        assert_eq!(config.postgres.user, "admin");
        assert_eq!(config.postgres.password, "s3cret");
        assert_eq!(config.postgres.patroni_port, Some(8008));
        assert_eq!(config.redis.password, "r3d1s");
        assert_eq!(config.redis.version.as_deref(), Some("5.0.14"));
        assert_eq!(config.mysql.user, "root");
    }

    #[test]
    fn test_service_user_wins() {
        let env = Env::from_pairs([(KB_ENV_SERVICE_USER, "svc"), ("MYSQL_ROOT_USER", "root2")]);
        let mut config = Config::default();
        config.apply_env(&env).unwrap();
        assert_eq!(config.mysql.user, "svc");
    }

    #[test]
    fn test_bad_port_rejected() {
        let env = Env::from_pairs([(KB_ENV_SERVICE_PORT, "abc")]);
        let mut config = Config::default();
        assert!(config.apply_env(&env).is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(dir.path().join("absent.yaml"), &Env::default()).unwrap();
        assert_eq!(config.mysql.port, 3306);
    }
}
