//! # Configuration
//!
//! A string key/value store in the DogRS style, plus the typed
//! [`BrokerConfig`] read out of it.
//!
//! ```rust
//! use apartment_core::{ApartmentConfig, BrokerConfig};
//!
//! let mut config = ApartmentConfig::new();
//! config.set("broker.switch_timeout_ms", "1500");
//! config.set("broker.allowed_tenants", "acme, globex");
//!
//! let broker = BrokerConfig::from_snapshot(&config.snapshot());
//! assert_eq!(broker.switch_timeout.as_millis(), 1500);
//! ```
//!
//! ## Environment overrides
//! [`ApartmentConfig::load_env`] copies every variable with the given prefix
//! into the store, lower-casing it and turning `__` into `.`:
//!
//! ```bash
//! export APARTMENT__BROKER__SWITCH_TIMEOUT_MS=2000   # broker.switch_timeout_ms
//! ```

use std::collections::HashMap;
use std::time::Duration;

use crate::schema::SchemaSwitch;
use crate::tenant::{TenantPolicy, DEFAULT_TENANT_HEADER};

/// Upper bound for the schema switch unless configured otherwise.
pub const DEFAULT_SWITCH_TIMEOUT: Duration = Duration::from_secs(3);

pub const KEY_TENANT_HEADER: &str = "broker.tenant_header";
pub const KEY_SWITCH_TIMEOUT_MS: &str = "broker.switch_timeout_ms";
pub const KEY_SCHEMA_SWITCH: &str = "broker.schema_switch";
pub const KEY_ALLOWED_TENANTS: &str = "broker.allowed_tenants";

#[derive(Debug, Default, Clone)]
pub struct ApartmentConfig {
    values: HashMap<String, String>,
}

impl ApartmentConfig {
    /// Create an empty config store.
    pub fn new() -> Self {
        Self {
            values: HashMap::new(),
        }
    }

    /// Store built from `std::env::vars()`, see [`ApartmentConfig::load_env`].
    pub fn from_env(prefix: &str) -> Self {
        let mut config = Self::new();
        config.load_env(prefix);
        config
    }

    /// `APARTMENT__HTTP__PORT` with prefix `APARTMENT__` becomes `http.port`.
    pub fn load_env(&mut self, prefix: &str) {
        self.load_vars(prefix, std::env::vars());
    }

    pub fn load_vars<I>(&mut self, prefix: &str, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            if let Some(stripped) = key.strip_prefix(prefix) {
                let normalized = stripped.to_lowercase().replace("__", ".");
                self.set(normalized, value);
            }
        }
    }

    pub fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.values.insert(key.into(), value.into());
    }

    /// Set `key` only if nothing is configured for it yet.
    pub fn set_default<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.values.entry(key.into()).or_insert_with(|| value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn snapshot(&self) -> ApartmentConfigSnapshot {
        ApartmentConfigSnapshot::new(self.values.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApartmentConfigSnapshot {
    map: HashMap<String, String>,
}

impl ApartmentConfigSnapshot {
    pub(crate) fn new(map: HashMap<String, String>) -> Self {
        Self { map }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(|s| s.as_str())
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.map.get(key).cloned()
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.trim().parse::<u64>().ok())
    }

    pub fn get_usize(&self, key: &str) -> Option<usize> {
        self.get(key).and_then(|v| v.trim().parse::<usize>().ok())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.trim().parse::<bool>().ok())
    }

    pub fn get_millis(&self, key: &str) -> Option<Duration> {
        self.get_u64(key).map(Duration::from_millis)
    }

    /// Comma separated list; blank entries are dropped.
    pub fn get_list(&self, key: &str) -> Option<Vec<String>> {
        self.get(key).map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
    }
}

/// Broker settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Metadata field the default resolver reads.
    pub tenant_header: String,
    /// Bound on the schema switch, independent of request deadlines.
    pub switch_timeout: Duration,
    pub schema_switch: SchemaSwitch,
    pub policy: TenantPolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            tenant_header: DEFAULT_TENANT_HEADER.to_string(),
            switch_timeout: DEFAULT_SWITCH_TIMEOUT,
            schema_switch: SchemaSwitch::default(),
            policy: TenantPolicy::permissive(),
        }
    }
}

impl BrokerConfig {
    /// Unknown or unparsable values fall back to the defaults.
    pub fn from_snapshot(snapshot: &ApartmentConfigSnapshot) -> Self {
        let defaults = Self::default();
        let schema_switch = match snapshot.get(KEY_SCHEMA_SWITCH).map(str::trim) {
            Some(raw) => SchemaSwitch::parse(raw).unwrap_or_else(|| {
                tracing::warn!(value = raw, "unknown schema switch, using the default");
                defaults.schema_switch
            }),
            None => defaults.schema_switch,
        };
        Self {
            tenant_header: snapshot
                .get_string(KEY_TENANT_HEADER)
                .filter(|h| !h.is_empty())
                .unwrap_or(defaults.tenant_header),
            switch_timeout: snapshot
                .get_millis(KEY_SWITCH_TIMEOUT_MS)
                .filter(|d| !d.is_zero())
                .unwrap_or(defaults.switch_timeout),
            schema_switch,
            policy: match snapshot.get_list(KEY_ALLOWED_TENANTS) {
                Some(list) if !list.is_empty() => TenantPolicy::allow_list(list),
                _ => defaults.policy,
            },
        }
    }

    pub fn with_switch_timeout(mut self, timeout: Duration) -> Self {
        self.switch_timeout = timeout;
        self
    }

    pub fn with_schema_switch(mut self, schema_switch: SchemaSwitch) -> Self {
        self.schema_switch = schema_switch;
        self
    }

    pub fn with_policy(mut self, policy: TenantPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_tenant_header<S: Into<String>>(mut self, header: S) -> Self {
        self.tenant_header = header.into();
        self
    }
}
