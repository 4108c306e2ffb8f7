//! The `args.json` argument bundle, written by the parent and read by the
//! in-child agent.
//!
//! This is a serialization of the per-spawn configuration plus everything the
//! parent resolved on the child's behalf (numeric uid/gid, login shell, home
//! directory, the expected listen port). The file is the child's only input;
//! it must stay self-contained.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Contents of `args.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnArgs {
    /// Installation root of the server, for locating support files.
    pub stagehand_root: PathBuf,
    /// Absolute path of the agent binary (re-exec'd for the `--after` phase).
    pub stagehand_agent_path: PathBuf,

    pub app_root: PathBuf,
    #[serde(default)]
    pub app_type: String,
    pub app_env: String,
    pub start_command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_file: Option<String>,

    /// Account to run the application as. Absent means: keep the current
    /// identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Numeric ids and account details resolved by the parent. The child
    /// re-resolves before switching, but these are what the parent verified.
    pub uid: u32,
    pub gid: u32,
    pub shell: PathBuf,
    pub home: PathBuf,

    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
    #[serde(default)]
    pub load_shell_envvars: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_descriptor_ulimit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_start_port: Option<u16>,

    pub node_libdir: PathBuf,
    pub base_uri: String,
    pub log_level: String,
    #[serde(default)]
    pub starts_using_wrapper: bool,
}

impl SpawnArgs {
    /// Reads and parses `<work_dir>/args.json`.
    pub fn load(args_json: &std::path::Path) -> Result<SpawnArgs, ArgsError> {
        let contents = std::fs::read_to_string(args_json).map_err(|source| ArgsError::Read {
            path: args_json.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ArgsError::Parse {
            path: args_json.to_path_buf(),
            source,
        })
    }
}

/// Failure to load the argument bundle.
#[derive(Debug, thiserror::Error)]
pub enum ArgsError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}
