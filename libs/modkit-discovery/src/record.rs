//! Registration record codec.
//!
//! A running instance is published as a JSON [`ServiceRecord`] stored under
//! `<prefix>/<name>/<version>/<addr>`. Deletion events only carry the key, so the
//! key alone must be enough to recover the instance address.

use serde::{Deserialize, Serialize};

use crate::config::RegisterConfig;
use crate::error::{DiscoveryError, DiscoveryResult};

/// One running instance of one named service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub name: String,
    pub addr: String,
    pub weight: i32,
    pub version: String,
    /// Lease TTL in seconds.
    pub ttl: i64,
}

impl ServiceRecord {
    #[must_use]
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            weight: 1,
            version: "v1".to_owned(),
            ttl: 10,
        }
    }

    #[must_use]
    pub fn with_weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: i64) -> Self {
        self.ttl = ttl;
        self
    }

    /// Check that the record can be published and parsed back from its key.
    ///
    /// # Errors
    /// Returns `InvalidConfig` for empty fields, `/` inside a key segment, or a
    /// non-positive TTL.
    pub fn validate(&self) -> DiscoveryResult<()> {
        for (field, value) in [
            ("name", &self.name),
            ("version", &self.version),
            ("addr", &self.addr),
        ] {
            if value.is_empty() {
                return Err(DiscoveryError::InvalidConfig(format!(
                    "service {field} must not be empty"
                )));
            }
            if value.contains('/') {
                return Err(DiscoveryError::InvalidConfig(format!(
                    "service {field} '{value}' must not contain '/'"
                )));
            }
        }
        if self.ttl <= 0 {
            return Err(DiscoveryError::InvalidConfig(format!(
                "service ttl must be positive, got {}",
                self.ttl
            )));
        }
        Ok(())
    }

    /// Key under which this record is stored.
    #[must_use]
    pub fn key(&self, prefix: &str) -> String {
        let prefix = prefix.trim_end_matches('/');
        if prefix.is_empty() {
            format!("{}/{}/{}", self.name, self.version, self.addr)
        } else {
            format!("{prefix}/{}/{}/{}", self.name, self.version, self.addr)
        }
    }
}

impl From<&RegisterConfig> for ServiceRecord {
    fn from(cfg: &RegisterConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            addr: cfg.addr.clone(),
            weight: cfg.weight,
            version: cfg.version.clone(),
            ttl: cfg.ttl,
        }
    }
}

/// Identity recovered from a registration key without reading its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyParts {
    pub name: String,
    pub version: String,
    pub addr: String,
}

/// Serialize a record into the stored value.
///
/// # Errors
/// Returns `MalformedRecord` if serialization fails.
pub fn encode(record: &ServiceRecord) -> DiscoveryResult<Vec<u8>> {
    serde_json::to_vec(record).map_err(|e| DiscoveryError::MalformedRecord(e.to_string()))
}

/// Parse a stored value back into a record.
///
/// # Errors
/// Returns `MalformedRecord` when the bytes are not a JSON service record.
pub fn decode(bytes: &[u8]) -> DiscoveryResult<ServiceRecord> {
    serde_json::from_slice(bytes).map_err(|e| DiscoveryError::MalformedRecord(e.to_string()))
}

/// Recover `{name, version, addr}` from the trailing three segments of a key.
///
/// The prefix is not consulted, so keys written under any prefix parse the same way.
///
/// # Errors
/// Returns `MalformedKey` when fewer than three non-empty trailing segments exist.
pub fn parse_key(key: &str) -> DiscoveryResult<KeyParts> {
    let malformed = || DiscoveryError::MalformedKey {
        key: key.to_owned(),
    };

    let mut segments = key.rsplit('/');
    let addr = segments.next().filter(|s| !s.is_empty()).ok_or_else(malformed)?;
    let version = segments.next().filter(|s| !s.is_empty()).ok_or_else(malformed)?;
    let name = segments.next().filter(|s| !s.is_empty()).ok_or_else(malformed)?;

    Ok(KeyParts {
        name: name.to_owned(),
        version: version.to_owned(),
        addr: addr.to_owned(),
    })
}

/// Prefix that selects every instance matching a resolver target path
/// (`user` or `user/v1`).
#[must_use]
pub fn lookup_prefix(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let path = path.trim_matches('/');
    if prefix.is_empty() {
        format!("{path}/")
    } else {
        format!("{prefix}/{path}/")
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn user_record() -> ServiceRecord {
        ServiceRecord::new("user", "10.0.0.1:9000")
            .with_weight(5)
            .with_version("v1")
            .with_ttl(10)
    }

    #[test]
    fn decode_restores_encoded_record() {
        let record = user_record();
        let bytes = encode(&record).unwrap();
        assert_eq!(decode(&bytes).unwrap(), record);
    }

    #[test]
    fn wire_format_uses_plain_field_names() {
        let value: serde_json::Value = serde_json::from_slice(&encode(&user_record()).unwrap()).unwrap();
        assert_eq!(value["name"], "user");
        assert_eq!(value["addr"], "10.0.0.1:9000");
        assert_eq!(value["weight"], 5);
        assert_eq!(value["version"], "v1");
        assert_eq!(value["ttl"], 10);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            decode(b"not json"),
            Err(DiscoveryError::MalformedRecord(_))
        ));
        assert!(matches!(
            decode(br#"{"name":"user"}"#),
            Err(DiscoveryError::MalformedRecord(_))
        ));
    }

    #[test]
    fn key_layout() {
        let record = user_record();
        assert_eq!(record.key("/services"), "/services/user/v1/10.0.0.1:9000");
        assert_eq!(record.key("/services/"), "/services/user/v1/10.0.0.1:9000");
        assert_eq!(record.key(""), "user/v1/10.0.0.1:9000");
    }

    #[test]
    fn parse_key_recovers_address() {
        let record = user_record();
        for prefix in ["/services", "", "/a/b/c"] {
            let parts = parse_key(&record.key(prefix)).unwrap();
            assert_eq!(parts.addr, record.addr);
            assert_eq!(parts.name, record.name);
            assert_eq!(parts.version, record.version);
        }
    }

    #[test]
    fn parse_key_handles_ipv6_addresses() {
        let record = ServiceRecord::new("user", "[::1]:9000");
        let parts = parse_key(&record.key("/services")).unwrap();
        assert_eq!(parts.addr, "[::1]:9000");
    }

    #[test]
    fn parse_key_rejects_short_keys() {
        for key in ["", "user", "v1/10.0.0.1:9000", "/services/user/v1/", "//x"] {
            assert!(
                matches!(parse_key(key), Err(DiscoveryError::MalformedKey { .. })),
                "key {key:?} should be rejected"
            );
        }
    }

    #[test]
    fn distinct_addresses_never_share_a_key() {
        let a = ServiceRecord::new("user", "10.0.0.1:9000");
        let b = ServiceRecord::new("user", "10.0.0.2:9000");
        assert_ne!(a.key("/services"), b.key("/services"));
    }

    #[test]
    fn validate_rejects_bad_records() {
        assert!(user_record().validate().is_ok());
        assert!(ServiceRecord::new("", "a:1").validate().is_err());
        assert!(ServiceRecord::new("user", "").validate().is_err());
        assert!(ServiceRecord::new("us/er", "a:1").validate().is_err());
        assert!(ServiceRecord::new("user", "a:1").with_ttl(0).validate().is_err());
        assert!(ServiceRecord::new("user", "a:1").with_version("").validate().is_err());
    }

    #[test]
    fn lookup_prefix_is_slash_terminated() {
        assert_eq!(lookup_prefix("/services", "user"), "/services/user/");
        assert_eq!(lookup_prefix("/services", "/user/v1"), "/services/user/v1/");
        assert_eq!(lookup_prefix("", "user"), "user/");
        assert!(!ServiceRecord::new("user-profile", "a:1")
            .key("/services")
            .starts_with(&lookup_prefix("/services", "user")));
    }
}
