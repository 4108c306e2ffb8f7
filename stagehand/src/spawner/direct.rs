//! Direct spawning: one fork+exec per application process.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use stagehand_shared::journey::JourneyType;

use crate::config::{Config, SpawnMethod};
use crate::context::Context;
use crate::handshake::perform::HandshakePerform;
use crate::handshake::prepare;
use crate::report::SpawnResult;
use crate::result::SpawnedProcess;

use super::{KillGuard, Spawner, finish_journey, fork_env_setupper};

/// Spawns every application process with its own fork+exec. Simple and
/// robust; pays the full application warm-up cost per process.
pub struct DirectSpawner {
    ctx: Arc<Context>,
    last_used: Mutex<Instant>,
}

impl DirectSpawner {
    pub fn new(ctx: Arc<Context>) -> DirectSpawner {
        DirectSpawner {
            ctx,
            last_used: Mutex::new(Instant::now()),
        }
    }

    fn spawn_inner(&self, config: &Config) -> SpawnResult<SpawnedProcess> {
        let mut config = config.clone();
        config.spawn_method = SpawnMethod::Direct;

        tracing::debug!(app_root = %config.app_root, "spawning application process directly");
        let mut session = prepare::prepare(&self.ctx, config, JourneyType::SpawnDirectly)?;

        let forked = fork_env_setupper(&self.ctx, &mut session)?;
        let mut guard = KillGuard::new(forked.pid);

        let process = HandshakePerform::new(
            &mut session,
            forked.pid,
            Some(forked.stdin),
            Some(forked.output),
            Vec::new(),
        )
        .execute()?;

        // The child is now the application; its exit watcher thread stays
        // behind as the reaper, so no explicit detach is needed.
        guard.disarm();
        finish_journey(&mut session);
        tracing::info!(
            pid = process.pid,
            gupid = %process.gupid,
            app_root = %session.config.app_root,
            "application process spawned"
        );
        Ok(process)
    }
}

impl Spawner for DirectSpawner {
    fn spawn(&self, config: &Config) -> SpawnResult<SpawnedProcess> {
        *self.last_used.lock().unwrap() = Instant::now();
        config
            .validate()
            .map_err(|e| super::config_error_report(config, JourneyType::SpawnDirectly, e).finalize())?;
        self.spawn_inner(config).map_err(|e| e.finalize())
    }

    fn last_used(&self) -> Instant {
        *self.last_used.lock().unwrap()
    }
}
