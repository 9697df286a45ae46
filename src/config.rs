//! Configuration parsing and structures

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::env;

/// Standard Ceph monitor port
pub const DEFAULT_CEPH_PORT: u16 = 6789;

/// Driver kind passed to the reconciliation script and used in the refs file name
pub const DRIVER_KIND: &str = "ceph";

// =============================================================================
// Raw Config (Deserialized from YAML)
// =============================================================================

/// Raw configuration as deserialized from YAML.
/// This is converted to `Config` via `resolve()`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Ceph cluster defaults applied to every volume
    #[serde(default)]
    pub ceph: RawCephDefaults,

    /// Local directory under which volumes are mounted
    pub mount_root: PathBuf,

    /// Startup reconciliation
    #[serde(default)]
    pub reconcile: RawReconcileConfig,
}

/// Ceph defaults as written in the file
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawCephDefaults {
    /// cephx user name (without the `name=` prefix)
    pub username: Option<String>,

    /// cephx secret, may reference `${ENV}`
    pub password: Option<String>,

    /// Extra auth context option, passed through verbatim
    pub context: Option<String>,

    /// Default monitor host
    pub endpoint: Option<String>,

    /// Default monitor port
    pub port: Option<u16>,

    /// Default extra mount options, comma separated
    pub options: Option<String>,
}

/// Reconciliation section as written in the file
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawReconcileConfig {
    /// Script that enumerates live volume references
    pub script: Option<PathBuf>,

    /// File the script writes `<name> <refs>` lines to
    pub refs_file: Option<PathBuf>,
}

// =============================================================================
// Resolved Config (Ready for use)
// =============================================================================

/// Top-level configuration (resolved from RawConfig)
#[derive(Debug, Clone)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Ceph defaults (fully resolved)
    pub ceph: CephDefaults,

    /// Local directory under which volumes are mounted
    pub mount_root: PathBuf,

    /// Startup reconciliation (fully resolved)
    pub reconcile: ReconcileConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Daemon-wide Ceph defaults, fixed for the process lifetime
#[derive(Clone, Default)]
pub struct CephDefaults {
    pub username: String,
    pub password: String,
    pub context: String,
    pub endpoint: String,
    pub port: u16,
    /// Default extra mount options; `None` when not configured
    pub options: Option<String>,
}

impl std::fmt::Debug for CephDefaults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CephDefaults")
            .field("username", &self.username)
            .field("password", &"****")
            .field("context", &self.context)
            .field("endpoint", &self.endpoint)
            .field("port", &self.port)
            .field("options", &self.options)
            .finish()
    }
}

/// Reconciliation configuration (resolved)
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Optional enumeration script, run as `<script> <kind> <mount_root>`
    pub script: Option<PathBuf>,

    /// Result file read after the script runs
    pub refs_file: PathBuf,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            script: None,
            refs_file: default_refs_file(),
        }
    }
}

fn default_refs_file() -> PathBuf {
    PathBuf::from(format!("/tmp/docker-volume-refs-{}", DRIVER_KIND))
}

// =============================================================================
// Resolution Logic
// =============================================================================

impl RawConfig {
    /// Resolve raw config into final config, filling defaults and expanding secrets
    pub fn resolve(self) -> Result<Config, ConfigError> {
        let RawConfig {
            logging,
            ceph,
            mount_root,
            reconcile,
        } = self;

        let password = match ceph.password {
            Some(p) => env::expand(&p)?,
            None => String::new(),
        };

        let options = ceph.options.filter(|o| !o.trim().is_empty());

        Ok(Config {
            logging,
            ceph: CephDefaults {
                username: ceph.username.unwrap_or_default(),
                password,
                context: ceph.context.unwrap_or_default(),
                endpoint: ceph.endpoint.unwrap_or_default(),
                port: ceph.port.unwrap_or(DEFAULT_CEPH_PORT),
                options,
            },
            mount_root,
            reconcile: ReconcileConfig {
                script: reconcile.script,
                refs_file: reconcile.refs_file.unwrap_or_else(default_refs_file),
            },
        })
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e.to_string()))?;

        Self::from_str(&content)
    }

    /// Parse configuration from a YAML string
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        raw.resolve()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.mount_root.is_absolute() {
            return Err(ConfigError::ValidationError(format!(
                "mount_root must be an absolute path: {:?}",
                self.mount_root
            )));
        }

        if self.ceph.port == 0 {
            return Err(ConfigError::ValidationError(
                "ceph.port cannot be 0".to_string(),
            ));
        }

        if let Some(script) = &self.reconcile.script {
            if !script.is_absolute() {
                return Err(ConfigError::ValidationError(format!(
                    "reconcile.script must be an absolute path: {:?}",
                    script
                )));
            }
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    ReadError(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}
