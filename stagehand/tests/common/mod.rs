//! Shared fixtures for the spawner integration tests.
#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use stagehand::{Config, Context};
use tempfile::TempDir;

/// Isolated spawn environment: a temp tree with an app root, pointing at
/// the freshly built agent binary.
pub struct TestHarness {
    pub ctx: Arc<Context>,
    pub app_root: PathBuf,
    _temp: TempDir,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp = TempDir::new().expect("failed to create temp dir");
        // Spawned children may run as another user; the tree must stay
        // traversable for them.
        let mut perms = fs::metadata(temp.path()).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(temp.path(), perms).unwrap();

        let app_root = temp.path().join("app");
        fs::create_dir_all(&app_root).unwrap();

        let ctx = Arc::new(
            Context::new(temp.path().join("install"))
                .with_agent_path(env!("CARGO_BIN_EXE_stagehand-agent"))
                .with_spawn_dir(temp.path().to_path_buf()),
        );
        TestHarness {
            ctx,
            app_root,
            _temp: temp,
        }
    }

    pub fn temp_path(&self) -> &Path {
        self._temp.path()
    }

    /// A valid baseline configuration running `start_command` in the
    /// harness app root.
    pub fn config(&self, start_command: &str) -> Config {
        Config {
            app_root: self.app_root.to_string_lossy().into_owned(),
            start_command: start_command.to_string(),
            start_timeout_msec: 15_000,
            ..Config::default()
        }
    }

    /// Writes an executable script into the harness and returns its path.
    pub fn write_script(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.temp_path().join(name);
        fs::write(&path, contents).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }
}

/// A start command that reports `properties_json`, signals readiness, and
/// stays alive (ready processes must not exit).
pub fn ready_app_command(properties_json: &str) -> String {
    format!(
        "printf '%s' '{properties_json}' > \"$STAGEHAND_SPAWN_WORK_DIR/response/properties.json\"; \
         printf 1 > \"$STAGEHAND_SPAWN_WORK_DIR/response/finish\"; \
         exec sleep 60"
    )
}

pub fn kill_process(pid: i32) {
    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }
}

pub fn process_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}
