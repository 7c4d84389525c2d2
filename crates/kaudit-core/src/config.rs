//! Daemon configuration.
//!
//! Read from a TOML file; every section is optional:
//!
//! ```toml
//! enabled = 1
//!
//! [log]
//! path = "/data/misc/audit/audit.log"
//! rotated_path = "/data/misc/audit/audit.old"
//! max_bytes = 102400
//!
//! [[watch]]
//! path = "/data/secure"
//! permissions = ["read", "write"]
//! fields = [{ field = "uid", op = "=", value = "root" }]
//! ```

use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::client::EnabledState;
use crate::rule::{Field, Operator, Permissions, Rule, RuleError};

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DaemonConfig {
    /// Audit state to request after registering: 0 off, 1 on, 2 locked.
    /// Unset leaves the kernel's current state alone.
    #[serde(default)]
    pub enabled: Option<u32>,

    #[serde(default)]
    pub log: LogConfig,

    /// Directory watches installed at startup.
    #[serde(default)]
    pub watch: Vec<WatchConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_path")]
    pub path: PathBuf,

    #[serde(default = "default_rotated_path")]
    pub rotated_path: PathBuf,

    /// Rotate once the active file grows past this many bytes.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
}

fn default_log_path() -> PathBuf {
    PathBuf::from("/data/misc/audit/audit.log")
}

fn default_rotated_path() -> PathBuf {
    PathBuf::from("/data/misc/audit/audit.old")
}

fn default_max_bytes() -> u64 {
    100 * 1024
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: default_log_path(),
            rotated_path: default_rotated_path(),
            max_bytes: default_max_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    pub path: PathBuf,

    /// Access kinds to report; all four when omitted.
    #[serde(default)]
    pub permissions: Option<Vec<Permission>>,

    #[serde(default)]
    pub fields: Vec<FieldConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    #[serde(alias = "execute")]
    Exec,
    #[serde(alias = "attribute")]
    Attr,
}

impl From<Permission> for Permissions {
    fn from(p: Permission) -> Self {
        match p {
            Permission::Read => Permissions::READ,
            Permission::Write => Permissions::WRITE,
            Permission::Exec => Permissions::EXEC,
            Permission::Attr => Permissions::ATTR,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldConfig {
    pub field: Field,
    #[serde(default)]
    pub op: Operator,
    /// Numeral or account/group name.
    pub value: String,
}

impl WatchConfig {
    pub fn build_rule(&self) -> Result<Rule, RuleError> {
        let mut rule = Rule::directory_watch(&self.path);
        if let Some(permissions) = &self.permissions {
            let mask = permissions
                .iter()
                .fold(Permissions::empty(), |mask, &p| mask | Permissions::from(p));
            rule.set_permissions(mask)?;
        }
        for f in &self.fields {
            rule.add_field(f.field, f.op, &f.value)?;
        }
        Ok(rule)
    }
}

impl DaemonConfig {
    pub fn enabled_state(&self) -> Option<EnabledState> {
        self.enabled.and_then(|v| EnabledState::try_from(v).ok())
    }
}

// ---------------------------------------------------------------------------
// Loading and validation
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("TOML parse error: {0}")]
    Parse(String),

    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("log.max_bytes must be > 0")]
    ZeroMaxBytes,

    #[error("empty {0}")]
    EmptyPath(&'static str),

    #[error("log.path and log.rotated_path must differ")]
    SameLogPaths,

    #[error("enabled must be 0, 1 or 2 (got {0})")]
    InvalidEnabled(u32),
}

/// Parse and validate a config from TOML text.
pub fn load_config(toml_str: &str) -> Result<DaemonConfig, ConfigError> {
    let config: DaemonConfig =
        toml_edit::de::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate(&config)?;
    Ok(config)
}

/// Load the config at `path`. A missing file yields the defaults.
pub fn load_config_file(path: &Path) -> Result<DaemonConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => load_config(&contents),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            Ok(DaemonConfig::default())
        }
        Err(source) => Err(ConfigError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

pub fn validate(config: &DaemonConfig) -> Result<(), ConfigError> {
    if let Some(enabled) = config.enabled
        && enabled > EnabledState::Locked as u32
    {
        return Err(ConfigError::InvalidEnabled(enabled));
    }

    let log = &config.log;
    if log.max_bytes == 0 {
        return Err(ConfigError::ZeroMaxBytes);
    }
    if log.path.as_os_str().is_empty() {
        return Err(ConfigError::EmptyPath("log.path"));
    }
    if log.rotated_path.as_os_str().is_empty() {
        return Err(ConfigError::EmptyPath("log.rotated_path"));
    }
    if log.path == log.rotated_path {
        return Err(ConfigError::SameLogPaths);
    }

    if config.watch.iter().any(|w| w.path.as_os_str().is_empty()) {
        return Err(ConfigError::EmptyPath("watch.path"));
    }
    Ok(())
}
