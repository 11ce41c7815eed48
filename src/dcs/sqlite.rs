//! SQLite-backed lease store.
//!
//! Uses `rusqlite` with the `bundled` feature so no system SQLite library
//! is required.  Several sidecars on one host can share a database file:
//! every lease operation runs inside a `BEGIN IMMEDIATE` transaction, which
//! takes the database write lock before reading, so the read-check-write
//! sequence is a compare-and-swap across processes.  Rows are keyed by
//! cluster name, so one file can serve several clusters.

use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::debug;

use super::store::{DcsStore, StoreFuture};
use super::{HaConfig, Leader, Member, Switchover};

/// Current schema version.
const SCHEMA_VERSION: i64 = 1;

pub struct SqliteStore {
    cluster: String,
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` for `cluster`.
    ///
    /// Passing `":memory:"` creates a private in-memory database.
    pub fn open(path: &str, cluster: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            cluster: cluster.to_string(),
            conn: Mutex::new(conn),
        };
        store.apply_pragmas()?;
        store.init_db()?;
        debug!("Opened SQLite lease store at {} for cluster {}", path, cluster);
        Ok(store)
    }

    fn lock(&self) -> anyhow::Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("sqlite connection mutex poisoned"))
    }

    fn apply_pragmas(&self) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            ",
        )?;
        Ok(())
    }

    /// Create the tables if they do not already exist.  Idempotent.
    fn init_db(&self) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_version (
                version    INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            );

            -- One lease row per cluster
            CREATE TABLE IF NOT EXISTS leases (
                cluster      TEXT PRIMARY KEY,
                holder       TEXT NOT NULL,
                acquire_time INTEGER NOT NULL,
                renew_time   INTEGER NOT NULL,
                ttl          INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS members (
                cluster      TEXT NOT NULL,
                name         TEXT NOT NULL,
                member_index INTEGER NOT NULL,
                address      TEXT NOT NULL,
                PRIMARY KEY (cluster, name)
            );

            CREATE TABLE IF NOT EXISTS switchovers (
                cluster      TEXT PRIMARY KEY,
                leader       TEXT,
                candidate    TEXT,
                scheduled_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ha_configs (
                cluster             TEXT PRIMARY KEY,
                enable              INTEGER NOT NULL,
                ttl                 INTEGER NOT NULL,
                max_lag             INTEGER NOT NULL,
                health_check_period INTEGER NOT NULL
            );
            ",
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at)
             VALUES (?1, strftime('%s', 'now'))",
            params![SCHEMA_VERSION],
        )?;
        Ok(())
    }
}

fn leader_from_row(row: &Row<'_>) -> rusqlite::Result<Leader> {
    Ok(Leader {
        name: row.get(0)?,
        acquire_time: row.get(1)?,
        renew_time: row.get(2)?,
        ttl: row.get(3)?,
    })
}

fn read_leader(conn: &Connection, cluster: &str) -> rusqlite::Result<Option<Leader>> {
    conn.query_row(
        "SELECT holder, acquire_time, renew_time, ttl FROM leases WHERE cluster = ?1",
        params![cluster],
        leader_from_row,
    )
    .optional()
}

impl DcsStore for SqliteStore {
    fn get_leader(&self) -> StoreFuture<'_, Option<Leader>> {
        Box::pin(async move {
            let conn = self.lock()?;
            Ok(read_leader(&conn, &self.cluster)?)
        })
    }

    fn acquire_lease<'a>(
        &'a self,
        holder: &'a str,
        now: i64,
        ttl: u64,
    ) -> StoreFuture<'a, Option<Leader>> {
        Box::pin(async move {
            let mut conn = self.lock()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if read_leader(&tx, &self.cluster)?.is_some_and(|l| !l.is_expired(now)) {
                return Ok(None);
            }
            tx.execute(
                "INSERT OR REPLACE INTO leases (cluster, holder, acquire_time, renew_time, ttl)
                 VALUES (?1, ?2, ?3, ?3, ?4)",
                params![self.cluster, holder, now, ttl],
            )?;
            tx.commit()?;
            Ok(Some(Leader {
                name: holder.to_string(),
                acquire_time: now,
                renew_time: now,
                ttl,
            }))
        })
    }

    fn renew_lease<'a>(
        &'a self,
        holder: &'a str,
        now: i64,
        ttl: u64,
    ) -> StoreFuture<'a, Option<Leader>> {
        Box::pin(async move {
            let mut conn = self.lock()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(mut leader) = read_leader(&tx, &self.cluster)? else {
                return Ok(None);
            };
            if leader.name != holder || leader.is_expired(now) {
                return Ok(None);
            }
            tx.execute(
                "UPDATE leases SET renew_time = ?2, ttl = ?3 WHERE cluster = ?1",
                params![self.cluster, now, ttl],
            )?;
            tx.commit()?;
            leader.renew_time = now;
            leader.ttl = ttl;
            Ok(Some(leader))
        })
    }

    fn release_lease<'a>(&'a self, holder: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let conn = self.lock()?;
            let deleted = conn.execute(
                "DELETE FROM leases WHERE cluster = ?1 AND holder = ?2",
                params![self.cluster, holder],
            )?;
            Ok(deleted > 0)
        })
    }

    fn list_members(&self) -> StoreFuture<'_, Vec<Member>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(
                "SELECT name, member_index, address FROM members
                 WHERE cluster = ?1 ORDER BY member_index, name",
            )?;
            let members = stmt
                .query_map(params![self.cluster], |row| {
                    Ok(Member {
                        name: row.get(0)?,
                        index: row.get(1)?,
                        address: row.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(members)
        })
    }

    fn put_member(&self, member: Member) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "INSERT OR REPLACE INTO members (cluster, name, member_index, address)
                 VALUES (?1, ?2, ?3, ?4)",
                params![self.cluster, member.name, member.index, member.address],
            )?;
            Ok(())
        })
    }

    fn get_switchover(&self) -> StoreFuture<'_, Option<Switchover>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let switchover = conn
                .query_row(
                    "SELECT leader, candidate, scheduled_at FROM switchovers WHERE cluster = ?1",
                    params![self.cluster],
                    |row| {
                        Ok(Switchover {
                            leader: row.get(0)?,
                            candidate: row.get(1)?,
                            scheduled_at: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(switchover)
        })
    }

    fn create_switchover(&self, switchover: Switchover) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let conn = self.lock()?;
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO switchovers (cluster, leader, candidate, scheduled_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    self.cluster,
                    switchover.leader,
                    switchover.candidate,
                    switchover.scheduled_at
                ],
            )?;
            Ok(inserted > 0)
        })
    }

    fn delete_switchover(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "DELETE FROM switchovers WHERE cluster = ?1",
                params![self.cluster],
            )?;
            Ok(())
        })
    }

    fn get_ha_config(&self) -> StoreFuture<'_, Option<HaConfig>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let config = conn
                .query_row(
                    "SELECT enable, ttl, max_lag, health_check_period
                     FROM ha_configs WHERE cluster = ?1",
                    params![self.cluster],
                    |row| {
                        Ok(HaConfig {
                            enable: row.get(0)?,
                            ttl: row.get(1)?,
                            max_lag: row.get(2)?,
                            health_check_period: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(config)
        })
    }

    fn put_ha_config(&self, config: HaConfig) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "INSERT OR REPLACE INTO ha_configs (cluster, enable, ttl, max_lag, health_check_period)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    self.cluster,
                    config.enable,
                    config.ttl,
                    config.max_lag,
                    config.health_check_period
                ],
            )?;
            Ok(())
        })
    }
}
