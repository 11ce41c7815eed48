//! Canonical, engine-independent replica roles.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The role a replica plays right now.
///
/// Replication-style engines report `Primary`/`Secondary`; consensus-style
/// engines report `Leader`/`Follower`/`Candidate`/`Learner`.  `Unknown` is
/// only returned when detection completed but the data could not
/// distinguish a role.  It never stands in for an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Primary,
    Secondary,
    Leader,
    Follower,
    Candidate,
    Learner,
    Unknown,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Primary => "primary",
            Role::Secondary => "secondary",
            Role::Leader => "leader",
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Learner => "learner",
            Role::Unknown => "unknown",
        }
    }

    /// Map a consensus-protocol role name (any case) onto the canonical set.
    pub fn from_consensus(raw: &str) -> Role {
        match raw.trim().to_ascii_lowercase().as_str() {
            "leader" => Role::Leader,
            "follower" => Role::Follower,
            "candidate" => Role::Candidate,
            "learner" => Role::Learner,
            _ => Role::Unknown,
        }
    }

    /// Whether this role accepts writes for the cluster.
    pub fn is_leader_like(&self) -> bool {
        matches!(self, Role::Primary | Role::Leader)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
