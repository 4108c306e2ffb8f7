//! Per-spawn configuration snapshot.

use serde::{Deserialize, Serialize};

/// Which spawning strategy to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpawnMethod {
    Direct,
    Smart,
}

impl SpawnMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpawnMethod::Direct => "direct",
            SpawnMethod::Smart => "smart",
        }
    }
}

/// Immutable per-spawn configuration.
///
/// Built by the embedding server from its application pool options; the
/// spawner takes a snapshot per spawn and never mutates it. All strings are
/// owned so that the snapshot can outlive the pool entry it came from (it is
/// embedded into diagnostic reports).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory of the application. Must be non-empty.
    pub app_root: String,
    /// Command that starts the application (or its wrapper), run through
    /// `/bin/sh -c`.
    pub start_command: String,
    /// Entry point file, advisory (wrappers use it).
    pub startup_file: Option<String>,
    /// Application type tag, e.g. "rack", "node", "generic".
    pub app_type: String,
    /// Deployment environment, e.g. "production".
    pub app_env: String,

    /// Account to run the application as. `None` keeps the current identity.
    pub user: Option<String>,
    pub group: Option<String>,

    pub base_uri: String,
    pub environment_variables: Vec<(String, String)>,
    pub file_descriptor_ulimit: Option<u64>,
    pub load_shell_envvars: bool,

    pub starts_using_wrapper: bool,
    pub wrapper_supplied_by_third_party: bool,
    /// Generic apps do not speak the handshake protocol; readiness is
    /// detected by pinging the expected start port.
    pub generic_app: bool,
    /// Allocate a free port and export it as `PORT` even for handshaking
    /// apps.
    pub find_free_port: bool,

    /// Total startup time budget in milliseconds. Must be positive.
    pub start_timeout_msec: u64,
    /// Lowest uid that is subject to the per-user resource jail; 0 disables.
    pub lve_min_uid: u32,
    pub spawn_method: SpawnMethod,
    /// Log level string forwarded to the in-child agent ("error".."trace").
    pub log_level: String,
    /// Pre-chosen expected start port. When `None` and a port is needed, the
    /// spawner allocates an ephemeral one.
    pub expected_start_port: Option<u16>,
    /// Explicit code revision; when `None` the spawner infers one from the
    /// app root.
    pub code_revision: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            app_root: String::new(),
            start_command: String::new(),
            startup_file: None,
            app_type: "generic".to_string(),
            app_env: "production".to_string(),
            user: None,
            group: None,
            base_uri: "/".to_string(),
            environment_variables: Vec::new(),
            file_descriptor_ulimit: None,
            load_shell_envvars: false,
            starts_using_wrapper: false,
            wrapper_supplied_by_third_party: false,
            generic_app: false,
            find_free_port: false,
            start_timeout_msec: 90_000,
            lve_min_uid: 0,
            spawn_method: SpawnMethod::Direct,
            log_level: "info".to_string(),
            expected_start_port: None,
            code_revision: None,
        }
    }
}

/// A configuration that violates its invariants.
#[derive(Debug, thiserror::Error)]
#[error("invalid spawn configuration: {}", problems.join("; "))]
pub struct ConfigError {
    pub problems: Vec<String>,
}

impl Config {
    /// Checks the invariants that every spawn relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        if self.app_root.is_empty() {
            problems.push("app_root may not be empty".to_string());
        }
        if self.start_command.is_empty() {
            problems.push("start_command may not be empty".to_string());
        }
        if self.start_timeout_msec == 0 {
            problems.push("start_timeout_msec must be positive".to_string());
        }
        if self.group.is_some() && self.user.is_none() {
            problems.push("group requires user".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError { problems })
        }
    }
}
