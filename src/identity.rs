//! Pod identity derived from environment variables.
//!
//! Each identity field is read from a fixed precedence of names: the
//! legacy `KB_*` name first, then the newer `MY_*` name.  The pod name
//! additionally falls back to the host name.  Values are captured once
//! into an [`Env`] snapshot so that construction is deterministic and
//! tests never touch the process environment.

use std::collections::HashMap;

use crate::errors::DbError;

// -- Variable names -----------------------------------------------------------

pub const KB_ENV_ENGINE_TYPE: &str = "KB_ENGINE_TYPE";
pub const KB_ENV_SERVICE_USER: &str = "KB_SERVICE_USER";
pub const KB_ENV_SERVICE_PASSWORD: &str = "KB_SERVICE_PASSWORD";
pub const KB_ENV_SERVICE_PORT: &str = "KB_SERVICE_PORT";

pub const ENV_NAMESPACE: &str = "MY_NAMESPACE";
pub const ENV_POD_NAME: &str = "MY_POD_NAME";
pub const ENV_POD_IP: &str = "MY_POD_IP";
pub const ENV_POD_UID: &str = "MY_POD_UID";
pub const ENV_CLUSTER_NAME: &str = "MY_CLUSTER_NAME";
pub const ENV_COMPONENT_NAME: &str = "MY_COMP_NAME";
pub const ENV_CLUSTER_COMP_NAME: &str = "MY_CLUSTER_COMP_NAME";

pub const KB_ENV_NAMESPACE: &str = "KB_NAMESPACE";
pub const KB_ENV_CLUSTER_NAME: &str = "KB_CLUSTER_NAME";
pub const KB_ENV_CLUSTER_COMP_NAME: &str = "KB_CLUSTER_COMP_NAME";
pub const KB_ENV_COMP_NAME: &str = "KB_COMP_NAME";
pub const KB_ENV_POD_NAME: &str = "KB_POD_NAME";
pub const KB_ENV_POD_UID: &str = "KB_POD_UID";
pub const KB_ENV_POD_IP: &str = "KB_POD_IP";
pub const KB_ENV_POD_FQDN: &str = "KB_POD_FQDN";
pub const KB_ENV_HOST_IP: &str = "KB_HOST_IP";

// -- Env snapshot -------------------------------------------------------------

/// Immutable snapshot of environment variables.
#[derive(Debug, Clone, Default)]
pub struct Env {
    vars: HashMap<String, String>,
}

impl Env {
    /// Capture the current process environment.
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// Build a snapshot from explicit pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Whether `key` is present (even with an empty value).
    pub fn is_set(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Value of `key`, or the empty string.
    pub fn get_or_empty(&self, key: &str) -> String {
        self.get(key).unwrap_or_default().to_string()
    }

    /// First of `keys` that is set.
    pub fn first_of(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|k| self.get(k))
    }

    /// Interpret `key` as a boolean flag (`true`, `1`, `yes`, `on`).
    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key)
            .map(|v| {
                matches!(
                    v.trim().to_ascii_lowercase().as_str(),
                    "true" | "1" | "yes" | "on"
                )
            })
            .unwrap_or(false)
    }

    /// Return a copy with `key` set to `value`.
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.vars.insert(key.to_string(), value.to_string());
        self
    }
}

// -- Identity -----------------------------------------------------------------

/// Who this sidecar instance is within its cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub pod_name: String,
    pub pod_ip: String,
    pub pod_uid: String,
    pub pod_fqdn: String,
    pub host_ip: String,
    pub namespace: String,
    pub cluster_name: String,
    pub component_name: String,
    pub cluster_comp_name: String,
}

impl Identity {
    /// Resolve identity from `env`, falling back to `hostname` for the pod name.
    ///
    /// Fails when no pod name can be determined.
    pub fn resolve(env: &Env, hostname: Option<String>) -> Result<Self, DbError> {
        let pod_name = env
            .first_of(&[KB_ENV_POD_NAME, ENV_POD_NAME])
            .map(str::to_string)
            .or(hostname)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| DbError::config("pod name is not set"))?;

        let pick = |keys: &[&str]| env.first_of(keys).unwrap_or_default().to_string();

        Ok(Self {
            pod_name,
            pod_ip: pick(&[KB_ENV_POD_IP, ENV_POD_IP]),
            pod_uid: pick(&[KB_ENV_POD_UID, ENV_POD_UID]),
            pod_fqdn: pick(&[KB_ENV_POD_FQDN]),
            host_ip: pick(&[KB_ENV_HOST_IP]),
            namespace: pick(&[KB_ENV_NAMESPACE, ENV_NAMESPACE]),
            cluster_name: pick(&[KB_ENV_CLUSTER_NAME, ENV_CLUSTER_NAME]),
            component_name: pick(&[KB_ENV_COMP_NAME, ENV_COMPONENT_NAME]),
            cluster_comp_name: pick(&[KB_ENV_CLUSTER_COMP_NAME, ENV_CLUSTER_COMP_NAME]),
        })
    }

    /// Resolve identity from the process environment and host name.
    pub fn from_process(env: &Env) -> Result<Self, DbError> {
        Self::resolve(env, system_hostname())
    }

    /// Ordinal index of this pod (`"mysql-2"` -> 2).
    pub fn member_index(&self) -> Result<u32, DbError> {
        member_index(&self.pod_name)
            .ok_or_else(|| DbError::config(format!(
                "the format of member name is wrong: {}",
                self.pod_name
            )))
    }
}

/// Parse the ordinal suffix of a member name.
///
/// Returns `None` when the name has no `-N` suffix.
pub fn member_index(name: &str) -> Option<u32> {
    let (_, suffix) = name.rsplit_once('-')?;
    suffix.parse().ok()
}

fn system_hostname() -> Option<String> {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.is_empty() {
            return Some(name);
        }
    }
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
