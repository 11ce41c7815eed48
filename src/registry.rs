//! Engine registry.
//!
//! Maps each [`EngineType`] to a constructor and builds exactly one manager
//! per registry.  The registry is an owned value handed to whoever needs
//! the manager; there is no process-global slot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::config::Config;
use crate::engines::manager::DbManager;
use crate::engines::{mongodb, mysql, postgres, redis, EngineType};
use crate::errors::DbError;
use crate::identity::{Env, Identity};

/// Everything a constructor needs to build a manager.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub engine: EngineType,
    pub config: Config,
    pub identity: Identity,
    pub env: Env,
}

/// Builds a manager for one engine type.
pub type ManagerFactory =
    Box<dyn Fn(&EngineSettings) -> Result<Arc<dyn DbManager>, DbError> + Send + Sync>;

/// Registry of engine constructors plus the single constructed manager.
pub struct ManagerRegistry {
    config: Config,
    identity: Identity,
    env: Env,
    factories: HashMap<EngineType, ManagerFactory>,
    current: Mutex<Option<Arc<dyn DbManager>>>,
}

impl ManagerRegistry {
    /// Empty registry; use [`ManagerRegistry::register`] to add engines.
    pub fn new(config: Config, identity: Identity, env: Env) -> Self {
        Self {
            config,
            identity,
            env,
            factories: HashMap::new(),
            current: Mutex::new(None),
        }
    }

    /// Registry with every built-in engine registered.
    pub fn with_default_engines(config: Config, identity: Identity, env: Env) -> Self {
        let mut registry = Self::new(config, identity, env);
        registry.register(EngineType::Mysql, |s| Ok(Arc::new(mysql::new_manager(s)?)));
        registry.register(EngineType::Wesql, |s| Ok(Arc::new(mysql::new_manager(s)?)));
        registry.register(EngineType::Polardbx, |s| Ok(Arc::new(mysql::new_manager(s)?)));
        registry.register(EngineType::Postgresql, |s| {
            Ok(Arc::new(postgres::new_vanilla_manager(s)?))
        });
        registry.register(EngineType::VanillaPostgresql, |s| {
            Ok(Arc::new(postgres::new_vanilla_manager(s)?))
        });
        registry.register(EngineType::ApecloudPostgresql, |s| {
            Ok(Arc::new(postgres::new_consensus_manager(s)?))
        });
        registry.register(EngineType::Mongodb, |s| Ok(Arc::new(mongodb::new_manager(s)?)));
        registry.register(EngineType::Redis, |s| Ok(Arc::new(redis::new_manager(s)?)));
        registry
    }

    /// Register (or replace) the constructor for `engine`.
    pub fn register<F>(&mut self, engine: EngineType, factory: F)
    where
        F: Fn(&EngineSettings) -> Result<Arc<dyn DbManager>, DbError> + Send + Sync + 'static,
    {
        self.factories.insert(engine, Box::new(factory));
    }

    pub fn is_registered(&self, engine: EngineType) -> bool {
        self.factories.contains_key(&engine)
    }

    /// Construct the manager for `engine`, or return the one already built.
    ///
    /// Once a manager exists every later call returns it regardless of the
    /// engine name passed.
    pub fn init_manager(&self, engine: &str) -> Result<Arc<dyn DbManager>, DbError> {
        let mut current = self
            .current
            .lock()
            .map_err(|_| DbError::Internal(anyhow::anyhow!("registry mutex poisoned")))?;
        if let Some(existing) = current.as_ref() {
            return Ok(existing.clone());
        }

        let engine_type: EngineType = engine.parse()?;
        let factory = self
            .factories
            .get(&engine_type)
            .ok_or_else(|| DbError::NoManagerForEngine {
                engine: engine_type.as_str().to_string(),
            })?;

        let settings = EngineSettings {
            engine: engine_type,
            config: self.config.clone(),
            identity: self.identity.clone(),
            env: self.env.clone(),
        };
        let manager = factory(&settings)?;
        info!(
            "Initialized {} manager for member {}",
            engine_type,
            manager.current_member_name()
        );
        *current = Some(manager.clone());
        Ok(manager)
    }

    /// The constructed manager, or [`DbError::NoManager`].
    pub fn get_manager(&self) -> Result<Arc<dyn DbManager>, DbError> {
        self.current
            .lock()
            .map_err(|_| DbError::Internal(anyhow::anyhow!("registry mutex poisoned")))?
            .clone()
            .ok_or(DbError::NoManager)
    }
}
