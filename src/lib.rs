//! dbctl library: a high-availability sidecar for replicated databases.
//!
//! This crate provides a uniform control surface over MySQL, PostgreSQL
//! (vanilla and consensus-replicated), MongoDB replica sets and Redis with
//! Sentinel: replica role detection, write-protection locking, and
//! lease-based leader coordination across the members of a cluster.

pub mod config;
pub mod dcs;
pub mod engines;
pub mod errors;
pub mod identity;
pub mod metrics;
pub mod operations;
pub mod registry;

pub use engines::manager::DbManager;
pub use errors::DbError;
pub use registry::ManagerRegistry;
