//! Layered agent configuration: defaults, then YAML, then `APP__*` environment.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, ensure};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use modkit_discovery::{DomainConfig, EtcdConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

fn default_level() -> String {
    "info".to_owned()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub etcd: EtcdConfig,
    /// Downstream services keyed by alias.
    pub domains: BTreeMap<String, DomainConfig>,
}

impl AppConfig {
    /// Load the configuration, merging `path` (if any) and `APP__*` variables
    /// over the defaults. `APP__ETCD__KEY_PREFIX=/svc` maps to `etcd.key_prefix`.
    ///
    /// # Errors
    /// Returns an error if the file does not exist or the merged values do not
    /// deserialize.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(Self::default()));

        if let Some(path) = path {
            ensure!(
                path.is_file(),
                "config file does not exist: {}",
                path.display()
            );
            figment = figment.merge(Yaml::file(path));
        }

        figment
            .merge(Env::prefixed("APP__").split("__"))
            .extract()
            .context("failed to extract config")
    }

    /// # Errors
    /// Returns the first invalid setting found.
    pub fn validate(&self) -> Result<()> {
        self.etcd.validate().context("invalid etcd section")?;
        for (alias, domain) in &self.domains {
            ensure!(
                !domain.name.trim_matches('/').is_empty(),
                "domain '{alias}' has an empty service name"
            );
        }
        Ok(())
    }

    /// Raise the log level for `-v` flags: `-v` info, `-vv` debug, `-vvv` trace.
    pub fn apply_verbosity(&mut self, verbose: u8) {
        let level = match verbose {
            0 => return,
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        level.clone_into(&mut self.logging.level);
    }

    /// Pretty JSON of the effective configuration.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_pretty_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialize config")
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_yaml(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_without_file() {
        let cfg = AppConfig::load(None).unwrap();
        assert_eq!(cfg.etcd.key_prefix, "/services");
        assert_eq!(cfg.logging.level, "info");
        assert!(cfg.domains.is_empty());
        cfg.validate().unwrap();
    }

    #[test]
    fn yaml_overrides_defaults() {
        let file = write_yaml(
            r"
logging:
  format: json
etcd:
  addrs: ['10.0.0.5:2379', '10.0.0.6:2379']
  rw_timeout_secs: 5
  register:
    name: user
    addr: '10.0.0.1:9000'
    ttl: 15
domains:
  user:
    name: user/v1
    load_balance: false
",
        );

        let cfg = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert_eq!(cfg.etcd.addrs.len(), 2);
        assert_eq!(cfg.etcd.rw_timeout_secs, 5);
        assert_eq!(cfg.etcd.dial_timeout_secs, 3);
        let register = cfg.etcd.register.as_ref().unwrap();
        assert_eq!(register.ttl, 15);
        assert_eq!(register.version, "v1");
        assert!(!cfg.domains["user"].load_balance);
        cfg.validate().unwrap();
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = AppConfig::load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let file = write_yaml("etcd:\n  adrs: ['x']\n");
        assert!(AppConfig::load(Some(file.path())).is_err());
    }

    #[test]
    fn validate_reports_bad_register_section() {
        let file = write_yaml("etcd:\n  register:\n    name: user\n    addr: ''\n");
        let cfg = AppConfig::load(Some(file.path())).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn verbosity_raises_level() {
        let mut cfg = AppConfig::default();
        cfg.apply_verbosity(0);
        assert_eq!(cfg.logging.level, "info");
        cfg.apply_verbosity(2);
        assert_eq!(cfg.logging.level, "debug");
        cfg.apply_verbosity(5);
        assert_eq!(cfg.logging.level, "trace");
    }
}
