//! Host configuration.
//!
//! [`HostConfig`] collects the sandbox resource limits and the settings of
//! every capability service.  It is normally read from a TOML file where
//! every section and field is optional; sensible defaults are provided via
//! [`Default`], and a builder-style API allows callers to customise
//! individual fields fluently.
//!
//! ```toml
//! [sandbox]
//! max_fuel = 5_000_000
//!
//! [database]
//! path = "data/hookbridge.db"
//!
//! [network]
//! allow = true
//! allowed_hosts = ["api.example.com"]
//!
//! [secrets]
//! env_prefix = "HOOKBRIDGE_SECRET_"
//! values = { STRIPE_KEY = "sk_test_123" }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use hookbridge_protocol::DEFAULT_MAX_FRAME_LEN;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Complete host configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub sandbox: SandboxConfig,
    pub database: DatabaseConfig,
    pub files: FilesConfig,
    pub network: NetworkConfig,
    pub secrets: SecretsConfig,
    pub kv: KvConfig,
}

/// Resource limits applied to every sandbox instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Maximum linear memory a module may grow to, in bytes.
    ///
    /// Default: **16 MiB**.
    pub max_memory: usize,

    /// Fuel (abstract instruction count) per invocation.
    ///
    /// Default: **1 000 000**.
    pub max_fuel: u64,

    /// Largest request or response envelope accepted, in bytes.
    ///
    /// Default: **4 MiB**.
    pub max_frame_len: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_memory: 16 * 1024 * 1024,
            max_fuel: 1_000_000,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Record store location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file.  A private in-memory database is used when absent.
    pub path: Option<PathBuf>,
}

/// Attachment storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    /// Root directory; files live at `{root}/{collection}/{recordId}/{filename}`.
    pub root: PathBuf,
    /// Largest file `FileSave` accepts, in bytes.
    pub max_bytes: usize,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("hookbridge_files"),
            max_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Outbound HTTP policy for `Fetch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Master switch.  Default: **false**.
    pub allow: bool,
    /// When non-empty, only these hosts may be fetched.
    pub allowed_hosts: Vec<String>,
    /// Upper bound on any single request, in seconds.
    pub timeout_secs: u64,
    /// Largest response body read, in bytes.
    pub max_body_bytes: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            allow: false,
            allowed_hosts: Vec::new(),
            timeout_secs: 30,
            max_body_bytes: 5 * 1024 * 1024,
        }
    }
}

/// Secrets exposed through `SecretGet`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// Static secrets by key.
    pub values: BTreeMap<String, String>,
    /// When set, `KEY` is also looked up as the environment variable `{prefix}KEY`.
    pub env_prefix: Option<String>,
}

/// Key-value store bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KvConfig {
    /// Live entries allowed at once.  Default: **10 000**.
    pub max_entries: usize,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
        }
    }
}

impl HostConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        tracing::info!(path = %path.display(), "loaded host config");
        Ok(config)
    }

    /// Set the maximum linear memory (in bytes).
    pub fn with_max_memory(mut self, bytes: usize) -> Self {
        self.sandbox.max_memory = bytes;
        self
    }

    /// Set the fuel budget per invocation.
    pub fn with_max_fuel(mut self, fuel: u64) -> Self {
        self.sandbox.max_fuel = fuel;
        self
    }

    /// Set the largest envelope accepted (in bytes).
    pub fn with_max_frame_len(mut self, bytes: usize) -> Self {
        self.sandbox.max_frame_len = bytes;
        self
    }

    /// Store records in a SQLite file instead of memory.
    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database.path = Some(path.into());
        self
    }

    /// Set the attachment root directory.
    pub fn with_files_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.files.root = root.into();
        self
    }

    /// Enable or disable outbound HTTP.
    pub fn with_allow_network(mut self, allow: bool) -> Self {
        self.network.allow = allow;
        self
    }

    /// Restrict `Fetch` to the given hosts.
    pub fn with_allowed_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.network.allowed_hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    /// Add a static secret.
    pub fn with_secret(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.values.insert(key.into(), value.into());
        self
    }

    /// Set the secret environment prefix.
    pub fn with_secret_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.secrets.env_prefix = Some(prefix.into());
        self
    }

    /// Set the KV entry limit.
    pub fn with_kv_max_entries(mut self, max: usize) -> Self {
        self.kv.max_entries = max;
        self
    }
}
