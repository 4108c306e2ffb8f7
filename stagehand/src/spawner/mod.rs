//! The two spawning strategies and the machinery they share.

mod direct;
mod smart;

use std::os::fd::OwnedFd;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::time::Instant;

use stagehand_shared::journey::JourneyStep;

use crate::config::Config;
use crate::context::Context;
use crate::handshake::session::HandshakeSession;
use crate::jail::ScopedJailEntry;
use crate::report::{Failure, SpawnError, SpawnResult};
use crate::result::SpawnedProcess;
use crate::system;

pub use direct::DirectSpawner;
pub use smart::SmartSpawner;

/// A strategy for turning a [`Config`] into a running, ready application
/// process.
pub trait Spawner: Send + Sync {
    /// Spawns one application process and waits until it is ready.
    fn spawn(&self, config: &Config) -> SpawnResult<SpawnedProcess>;

    /// When this spawner last did work, for idle cleanup by the pool.
    fn last_used(&self) -> Instant;

    /// Releases long-lived resources (the smart spawner's preloader).
    fn cleanup(&self) {}
}

/// A freshly forked env-setupper child, not yet handshaken.
pub(crate) struct ForkedChild {
    pub pid: i32,
    /// Write end of the child's stdin pipe.
    pub stdin: OwnedFd,
    /// Read end of the child's merged stdout/stderr pipe.
    pub output: OwnedFd,
}

/// Forks a child that execs `<agent> spawn-env-setupper <workdir> --before`.
///
/// The child gets a pipe as stdin and one merged pipe as stdout+stderr.
/// Between fork and exec only the async-signal-safe `pre_exec` hook runs
/// (signal state reset); every other piece of setup happens inside the
/// exec'd agent. All parent-side descriptors are close-on-exec, so the
/// child starts with exactly the three stdio fds.
pub(crate) fn fork_env_setupper(
    ctx: &Context,
    session: &mut HandshakeSession,
) -> SpawnResult<ForkedChild> {
    session
        .journey
        .set_in_progress(JourneyStep::ForkSubprocess)
        .expect("fork step starts once");

    match fork_env_setupper_inner(ctx, session) {
        Ok(forked) => {
            session
                .journey
                .set_performed(JourneyStep::ForkSubprocess)
                .expect("in-progress fork step can be performed");
            tracing::debug!(
                pid = forked.pid,
                app_root = %session.config.app_root,
                "forked env-setupper subprocess"
            );
            Ok(forked)
        }
        Err((failure, failed_step)) => {
            if failed_step != JourneyStep::ForkSubprocess {
                session
                    .journey
                    .set_performed(JourneyStep::ForkSubprocess)
                    .expect("in-progress fork step can be performed");
            }
            session
                .journey
                .set_errored(failed_step, true)
                .expect("declared step can be marked errored");
            Err(Box::new(SpawnError::from_failure(
                &failure,
                &session.journey,
                &session.config,
            )))
        }
    }
}

fn fork_env_setupper_inner(
    ctx: &Context,
    session: &mut HandshakeSession,
) -> Result<ForkedChild, (Failure, JourneyStep)> {
    use nix::fcntl::OFlag;

    let (output_read, output_write) = nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(|errno| {
        (
            Failure::syscall("creating the output pipe", errno),
            JourneyStep::ForkSubprocess,
        )
    })?;
    let output_write_dup = output_write.try_clone().map_err(|e| {
        (
            Failure::io("duplicating the output pipe", e),
            JourneyStep::ForkSubprocess,
        )
    })?;

    let mut cmd = Command::new(ctx.agent_path());
    cmd.arg("spawn-env-setupper")
        .arg(session.work_dir.path())
        .arg("--before")
        .stdin(Stdio::piped())
        .stdout(Stdio::from(output_write_dup))
        .stderr(Stdio::from(output_write));
    // SAFETY: the hook only resets signal dispositions and the signal
    // mask, which are async-signal-safe operations.
    unsafe {
        cmd.pre_exec(reset_signal_state);
    }

    // Enter the resource jail before forking so the child inherits it; the
    // parent leaves again right after.
    let mut jail_entry = ScopedJailEntry::enter(session.uid, session.config.lve_min_uid);
    let spawn_result = cmd.spawn();
    jail_entry.exit();
    // Dropping the Command closes the parent's copies of the child's pipe
    // ends; without this the output pipe would never report EOF.
    drop(cmd);

    let mut child = spawn_result.map_err(|e| {
        // The agent binary could not be executed at all (as opposed to the
        // fork itself failing): that is the subprocess's first-exec step.
        let step = match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                JourneyStep::BeforeFirstExec
            }
            _ => JourneyStep::ForkSubprocess,
        };
        (Failure::io("spawning the env-setupper subprocess", e), step)
    })?;

    let stdin = child
        .stdin
        .take()
        .map(OwnedFd::from)
        .expect("stdin was configured as piped");
    let pid = child.id() as i32;

    Ok(ForkedChild {
        pid,
        stdin,
        output: output_read,
    })
}

/// Resets signal dispositions and the signal mask in the freshly forked
/// child. Runs in the pre-exec context: async-signal-safe calls only, no
/// allocation, no locking.
fn reset_signal_state() -> std::io::Result<()> {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::pthread_sigmask(libc::SIG_SETMASK, &set, std::ptr::null_mut());
        for signal in 1..32 {
            if signal == libc::SIGKILL || signal == libc::SIGSTOP {
                continue;
            }
            libc::signal(signal, libc::SIG_DFL);
        }
    }
    Ok(())
}

/// Kills and reaps a child on drop unless disarmed. Armed for the window
/// between fork and handshake success, so no spawn failure leaks a
/// half-started process.
pub(crate) struct KillGuard {
    pid: i32,
    armed: bool,
}

impl KillGuard {
    pub(crate) fn new(pid: i32) -> KillGuard {
        KillGuard { pid, armed: true }
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for KillGuard {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!(pid = self.pid, "killing half-spawned process");
            system::kill_and_waitpid(self.pid);
        }
    }
}

/// Marks the journey's FINISH step done. Called by both spawners after a
/// successful handshake.
pub(crate) fn finish_journey(session: &mut HandshakeSession) {
    let _ = session.journey.set_performed(JourneyStep::Finish);
}

/// Builds the report for a configuration that fails validation: the spawn
/// never gets past preparation, and the bug is in the caller.
pub(crate) fn config_error_report(
    config: &Config,
    journey_type: stagehand_shared::journey::JourneyType,
    error: crate::config::ConfigError,
) -> Box<SpawnError> {
    let mut journey = stagehand_shared::journey::Journey::new(journey_type, false);
    journey
        .set_errored(JourneyStep::Preparation, false)
        .expect("fresh journey accepts an error mark");
    Box::new(SpawnError::new(
        stagehand_shared::category::ErrorCategory::InternalError,
        &journey,
        config,
        format!("Invalid spawn configuration: {error}"),
    ))
}
