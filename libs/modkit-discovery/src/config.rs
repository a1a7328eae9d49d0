//! Configuration for the coordination store, self-registration and resolution.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DiscoveryError, DiscoveryResult};

/// Connection and layout settings for the etcd coordination store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EtcdConfig {
    /// etcd endpoints, `host:port` or full URLs.
    #[serde(default = "default_addrs")]
    pub addrs: Vec<String>,

    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,

    /// Deadline applied to every unary store round-trip.
    #[serde(default = "default_rw_timeout_secs")]
    pub rw_timeout_secs: u64,

    /// Root under which registration keys live.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// How often a resolver re-reads the full prefix.
    #[serde(default = "default_resync_interval_secs")]
    pub resync_interval_secs: u64,

    /// Present when this process should announce itself.
    pub register: Option<RegisterConfig>,
}

fn default_addrs() -> Vec<String> {
    vec!["127.0.0.1:2379".to_owned()]
}

fn default_dial_timeout_secs() -> u64 {
    3
}

fn default_rw_timeout_secs() -> u64 {
    3
}

fn default_key_prefix() -> String {
    "/services".to_owned()
}

fn default_resync_interval_secs() -> u64 {
    60
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            addrs: default_addrs(),
            dial_timeout_secs: default_dial_timeout_secs(),
            rw_timeout_secs: default_rw_timeout_secs(),
            key_prefix: default_key_prefix(),
            resync_interval_secs: default_resync_interval_secs(),
            register: None,
        }
    }
}

impl EtcdConfig {
    #[must_use]
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    #[must_use]
    pub fn rw_timeout(&self) -> Duration {
        Duration::from_secs(self.rw_timeout_secs)
    }

    #[must_use]
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    /// # Errors
    /// Returns `InvalidConfig` when endpoints are missing or a timeout/interval is zero.
    pub fn validate(&self) -> DiscoveryResult<()> {
        if self.addrs.iter().all(String::is_empty) {
            return Err(DiscoveryError::InvalidConfig(
                "etcd.addrs must list at least one endpoint".to_owned(),
            ));
        }
        for (field, value) in [
            ("dial_timeout_secs", self.dial_timeout_secs),
            ("rw_timeout_secs", self.rw_timeout_secs),
            ("resync_interval_secs", self.resync_interval_secs),
        ] {
            if value == 0 {
                return Err(DiscoveryError::InvalidConfig(format!(
                    "etcd.{field} must be greater than zero"
                )));
            }
        }
        if let Some(register) = &self.register {
            register.validate()?;
        }
        Ok(())
    }
}

/// Identity announced by [`crate::Registrar`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterConfig {
    pub name: String,

    /// Address clients should dial, `host:port`.
    pub addr: String,

    #[serde(default = "default_weight")]
    pub weight: i32,

    #[serde(default = "default_version")]
    pub version: String,

    /// Lease TTL in seconds.
    #[serde(default = "default_ttl")]
    pub ttl: i64,
}

fn default_weight() -> i32 {
    1
}

fn default_version() -> String {
    "v1".to_owned()
}

fn default_ttl() -> i64 {
    10
}

impl RegisterConfig {
    /// # Errors
    /// Returns `InvalidConfig` when the record built from this section cannot be published.
    pub fn validate(&self) -> DiscoveryResult<()> {
        crate::record::ServiceRecord::from(self).validate()
    }
}

/// A downstream service this process dials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DomainConfig {
    /// Service name, optionally with a version: `user` or `user/v1`.
    pub name: String,

    /// Spread calls across every resolved address instead of sticking to one.
    #[serde(default = "default_load_balance")]
    pub load_balance: bool,
}

fn default_load_balance() -> bool {
    true
}

impl DomainConfig {
    /// Resolver target for this domain, e.g. `etcd:///user`.
    #[must_use]
    pub fn target(&self, scheme: &str) -> String {
        format!("{scheme}:///{}", self.name.trim_matches('/'))
    }
}
