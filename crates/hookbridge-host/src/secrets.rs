//! Read-only secret lookup.
//!
//! Secrets come from the `[secrets.values]` config table first, then from
//! environment variables named `{env_prefix}{KEY}` (key upper-cased) when a
//! prefix is set.
//! Values are never logged.

use std::collections::BTreeMap;

use tracing::debug;

use crate::config::SecretsConfig;

pub struct SecretStore {
    values: BTreeMap<String, String>,
    env_prefix: Option<String>,
}

impl SecretStore {
    pub fn new(config: &SecretsConfig) -> Self {
        Self {
            values: config.values.clone(),
            env_prefix: config.env_prefix.clone(),
        }
    }

    /// Look up `key`; `None` when it is not configured anywhere.
    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(value) = self.values.get(key) {
            debug!(key, source = "config", "secret resolved");
            return Some(value.clone());
        }
        let prefix = self.env_prefix.as_deref()?;
        let var = format!("{prefix}{}", key.to_ascii_uppercase());
        let value = std::env::var(&var).ok()?;
        debug!(key, source = "env", "secret resolved");
        Some(value)
    }

    /// Configured secret names (never values).
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}
