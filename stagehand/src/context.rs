//! Spawner-wide services and installation paths.

use std::path::{Path, PathBuf};

/// Services and paths shared by every spawner built from it.
///
/// The embedding server constructs one `Context` at startup and hands an
/// `Arc` of it to each spawner. It answers the questions that are not
/// per-spawn: where the installation lives, which binary carries the
/// `spawn-env-setupper` subcommand, and where spawn work directories go.
#[derive(Debug, Clone)]
pub struct Context {
    /// Installation root of the server.
    pub stagehand_root: PathBuf,
    /// Absolute path of the `stagehand-agent` binary.
    pub agent_path: PathBuf,
    /// Base directory for spawn work directories. Usually the instance
    /// directory; falls back to the system temp dir.
    pub spawn_dir: PathBuf,
    /// Directory with the bundled Node.js support library, exported to
    /// Node applications as `NODE_PATH`.
    pub node_libdir: PathBuf,
}

impl Context {
    /// Creates a context rooted at `stagehand_root`, with conventional
    /// locations for everything else.
    pub fn new(stagehand_root: impl Into<PathBuf>) -> Self {
        let stagehand_root = stagehand_root.into();
        Context {
            agent_path: stagehand_root.join("bin").join("stagehand-agent"),
            node_libdir: stagehand_root.join("support").join("node"),
            spawn_dir: std::env::temp_dir(),
            stagehand_root,
        }
    }

    pub fn with_agent_path(mut self, agent_path: impl Into<PathBuf>) -> Self {
        self.agent_path = agent_path.into();
        self
    }

    pub fn with_spawn_dir(mut self, spawn_dir: impl Into<PathBuf>) -> Self {
        self.spawn_dir = spawn_dir.into();
        self
    }

    /// Checks that the context points at a usable installation.
    pub fn validate(&self) -> Result<(), ContextError> {
        if !self.agent_path.is_file() {
            return Err(ContextError::AgentMissing(self.agent_path.clone()));
        }
        if !self.spawn_dir.is_dir() {
            return Err(ContextError::SpawnDirMissing(self.spawn_dir.clone()));
        }
        Ok(())
    }

    pub fn agent_path(&self) -> &Path {
        &self.agent_path
    }
}

/// A context that does not point at a usable installation.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("agent binary not found at {0}")]
    AgentMissing(PathBuf),
    #[error("spawn directory {0} does not exist")]
    SpawnDirMissing(PathBuf),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conventional_paths_derive_from_root() {
        let ctx = Context::new("/opt/stagehand");
        assert_eq!(
            ctx.agent_path,
            PathBuf::from("/opt/stagehand/bin/stagehand-agent")
        );
        assert_eq!(
            ctx.node_libdir,
            PathBuf::from("/opt/stagehand/support/node")
        );
    }

    #[test]
    fn validate_requires_existing_agent() {
        let ctx = Context::new("/nonexistent");
        assert!(matches!(ctx.validate(), Err(ContextError::AgentMissing(_))));
    }
}
