//! Per-engine managers and the pieces they are composed from.

pub mod accounts;
pub mod context;
pub mod lock;
pub mod manager;
pub mod mongodb;
pub mod mysql;
pub mod postgres;
pub mod redis;
pub mod role;
pub mod sql;
pub mod state;
pub mod status_row;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::DbError;

/// The closed set of engines a manager can be built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineType {
    Mysql,
    /// MySQL with consensus replication; managed as MySQL.
    Wesql,
    /// PolarDB-X data node; managed as MySQL.
    Polardbx,
    /// PostgreSQL managed by Patroni or plain streaming replication.
    Postgresql,
    /// Alias of [`EngineType::Postgresql`] kept for older deployments.
    VanillaPostgresql,
    /// PostgreSQL fork replicated by a consensus protocol.
    ApecloudPostgresql,
    Mongodb,
    Redis,
}

impl EngineType {
    pub const ALL: [EngineType; 8] = [
        EngineType::Mysql,
        EngineType::Wesql,
        EngineType::Polardbx,
        EngineType::Postgresql,
        EngineType::VanillaPostgresql,
        EngineType::ApecloudPostgresql,
        EngineType::Mongodb,
        EngineType::Redis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineType::Mysql => "mysql",
            EngineType::Wesql => "wesql",
            EngineType::Polardbx => "polardbx",
            EngineType::Postgresql => "postgresql",
            EngineType::VanillaPostgresql => "vanillapostgresql",
            EngineType::ApecloudPostgresql => "apecloudpostgresql",
            EngineType::Mongodb => "mongodb",
            EngineType::Redis => "redis",
        }
    }
}

impl FromStr for EngineType {
    type Err = DbError;

    /// Case-insensitive parse.  Empty input is [`DbError::EngineTypeNotSet`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        if lowered.is_empty() {
            return Err(DbError::EngineTypeNotSet);
        }
        EngineType::ALL
            .into_iter()
            .find(|e| e.as_str() == lowered)
            .ok_or(DbError::NoManagerForEngine { engine: lowered })
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
