//! Smart spawning: a long-lived preloader forks workers on command.
//!
//! The first spawn starts the preloader through the direct mechanism; the
//! application-specific launcher loads the app once and then listens on a
//! socket. Every subsequent spawn sends one `spawn` command over that
//! socket, and the preloader forks an already-warmed-up worker, writing its
//! response into the per-spawn work directory. The parent then performs the
//! normal readiness handshake against the reported worker pid.
//!
//! Because the preloader is untrusted input for the parent, its response is
//! validated structurally, capped in size, and the reported pid's UID is
//! verified against the expected one before the parent accepts it.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use stagehand_shared::category::ErrorCategory;
use stagehand_shared::constants::MAX_PRELOADER_RESPONSE_BYTES;
use stagehand_shared::journey::{Journey, JourneyStep, JourneyType};
use stagehand_shared::protocol::{ProtocolError, SocketAddress, SpawnCommand, SpawnReply};

use crate::capture::OutputCapturer;
use crate::config::{Config, SpawnMethod};
use crate::context::Context;
use crate::handshake::perform::HandshakePerform;
use crate::handshake::prepare;
use crate::handshake::session::HandshakeSession;
use crate::report::{Failure, SpawnError, SpawnResult, templates};
use crate::result::SpawnedProcess;
use crate::system;

use super::{KillGuard, Spawner, finish_journey, fork_env_setupper};

/// How long a stopping preloader gets to exit after its stdin closes
/// before being killed.
const PRELOADER_STOP_GRACE: Duration = Duration::from_secs(5);

/// Quick-access fields, readable without serializing against a running
/// spawn.
struct PreloaderFields {
    pid: Option<i32>,
    last_used: Instant,
}

/// Everything else about the running preloader; guarded by the lifecycle
/// lock, which also serializes spawns.
struct PreloaderLifecycle {
    socket_address: Option<String>,
    /// Write end of the preloader's stdin; closing it asks the preloader
    /// to shut down.
    stdin: Option<OwnedFd>,
    /// Snapshot of the preloader's work directory at startup, attached to
    /// later spawn failures for context.
    annotations: BTreeMap<String, String>,
}

/// What `invoke_fork_command` hands to the readiness handshake.
#[derive(Debug)]
struct ForkCommandResult {
    pid: i32,
    stdin: Option<OwnedFd>,
    stdout_and_err: Option<OwnedFd>,
    already_read: Vec<u8>,
}

/// Spawner that amortizes application warm-up through a preloader.
pub struct SmartSpawner {
    ctx: Arc<Context>,
    /// Command that starts the preloader, argv-style.
    preloader_command: Vec<String>,
    fields: Mutex<PreloaderFields>,
    lifecycle: Mutex<PreloaderLifecycle>,
}

impl SmartSpawner {
    pub fn new(ctx: Arc<Context>, preloader_command: Vec<String>) -> SmartSpawner {
        assert!(
            !preloader_command.is_empty(),
            "the preloader command must name an executable"
        );
        SmartSpawner {
            ctx,
            preloader_command,
            fields: Mutex::new(PreloaderFields {
                pid: None,
                last_used: Instant::now(),
            }),
            lifecycle: Mutex::new(PreloaderLifecycle {
                socket_address: None,
                stdin: None,
                annotations: BTreeMap::new(),
            }),
        }
    }

    /// Pid of the running preloader, if any.
    pub fn preloader_pid(&self) -> Option<i32> {
        self.fields.lock().unwrap().pid
    }

    fn preloader_started(&self) -> bool {
        self.preloader_pid().is_some()
    }

    // -----------------------------------------------------------------
    // Preloader lifecycle
    // -----------------------------------------------------------------

    fn start_preloader(
        &self,
        lifecycle: &mut PreloaderLifecycle,
        base_config: &Config,
    ) -> SpawnResult<()> {
        let mut config = base_config.clone();
        config.spawn_method = SpawnMethod::Smart;
        config.start_command = shell_join(&self.preloader_command);
        // The preloader itself always speaks the handshake protocol.
        config.generic_app = false;

        tracing::debug!(
            app_root = %config.app_root,
            command = %config.start_command,
            "starting preloader"
        );
        let mut session = prepare::prepare(&self.ctx, config, JourneyType::StartPreloader)?;
        let forked = fork_env_setupper(&self.ctx, &mut session)?;
        let mut guard = KillGuard::new(forked.pid);

        // The handshake borrows a dup of the preloader's stdin; the
        // original stays with us because closing it later is the shutdown
        // signal.
        let stdin_for_perform = forked.stdin.try_clone().ok();
        let process = HandshakePerform::new(
            &mut session,
            forked.pid,
            stdin_for_perform,
            Some(forked.output),
            Vec::new(),
        )
        .execute()?;

        let socket_address = process
            .sockets
            .first()
            .map(|socket| socket.address.clone())
            .expect("a validated spawn result carries at least one socket");

        guard.disarm();
        finish_journey(&mut session);

        lifecycle.socket_address = Some(socket_address.clone());
        lifecycle.stdin = Some(forked.stdin);
        lifecycle.annotations = session.work_dir.read_all();
        {
            let mut fields = self.fields.lock().unwrap();
            fields.pid = Some(process.pid);
            fields.last_used = Instant::now();
        }

        drain_preloader_output(process);
        tracing::info!(
            pid = self.preloader_pid().unwrap_or(-1),
            socket = %socket_address,
            "preloader started"
        );
        Ok(())
    }

    fn stop_preloader(&self, lifecycle: &mut PreloaderLifecycle) {
        let pid = self.fields.lock().unwrap().pid.take();
        let Some(pid) = pid else {
            // Nothing running; stopping is a no-op.
            lifecycle.socket_address = None;
            lifecycle.stdin = None;
            lifecycle.annotations.clear();
            return;
        };

        tracing::debug!(pid, "stopping preloader");
        // Closing stdin is the shutdown request.
        drop(lifecycle.stdin.take());
        if !system::timed_waitpid(pid, PRELOADER_STOP_GRACE) {
            tracing::warn!(pid, "preloader did not exit in time, killing it");
            system::kill_and_waitpid(pid);
        }

        // Remove the socket only after the process is gone, so it never
        // observes its own socket disappearing.
        if let Some(address) = lifecycle.socket_address.take() {
            if let Ok(SocketAddress::Unix(path)) = SocketAddress::parse(&address) {
                let _ = std::fs::remove_file(path);
            }
        }
        lifecycle.annotations.clear();
    }

    // -----------------------------------------------------------------
    // The fork command
    // -----------------------------------------------------------------

    /// Sends the spawn command, with one restart-and-retry when the
    /// preloader appears to have died. Timeouts are never retried: the
    /// budget is already gone.
    fn invoke_fork_command(
        &self,
        lifecycle: &mut PreloaderLifecycle,
        session: &mut HandshakeSession,
    ) -> SpawnResult<ForkCommandResult> {
        match self.invoke_fork_command_once(lifecycle, session) {
            Ok(result) => Ok(result),
            Err(error) if error.category() == ErrorCategory::TimeoutError => Err(error),
            Err(error) => {
                tracing::warn!(error = %error, "an error occurred while spawning a process");
                tracing::warn!(
                    "the application preloader seems to have crashed, restarting it and trying again"
                );
                self.stop_preloader(lifecycle);
                self.start_preloader(lifecycle, &session.config)?;

                // Fresh attempt, fresh journey bookkeeping for the
                // protocol steps.
                session.journey =
                    Journey::new(session.journey.journey_type(), session.config.starts_using_wrapper);
                session
                    .journey
                    .set_performed(JourneyStep::Preparation)
                    .expect("fresh journey accepts the preparation mark");

                match self.invoke_fork_command_once(lifecycle, session) {
                    Ok(result) => Ok(result),
                    Err(second_error) => {
                        self.stop_preloader(lifecycle);
                        Err(second_error)
                    }
                }
            }
        }
    }

    fn invoke_fork_command_once(
        &self,
        lifecycle: &mut PreloaderLifecycle,
        session: &mut HandshakeSession,
    ) -> SpawnResult<ForkCommandResult> {
        let mut conn = self.connect_to_preloader(lifecycle, session)?;
        self.send_fork_command(&mut conn, session)?;
        let line = self.read_fork_command_response(&mut conn, session)?;
        let reply = self.parse_fork_command_response(&line, session)?;
        self.process_fork_command_response(reply, session)
    }

    fn connect_to_preloader(
        &self,
        lifecycle: &mut PreloaderLifecycle,
        session: &mut HandshakeSession,
    ) -> SpawnResult<PreloaderConnection> {
        mark_in_progress(session, JourneyStep::ConnectToPreloader);
        let address = lifecycle.socket_address.clone().ok_or_else(|| {
            fail_step(
                session,
                JourneyStep::ConnectToPreloader,
                &Failure::Internal("no preloader is running".to_string()),
            )
        })?;

        let began = Instant::now();
        let conn = PreloaderConnection::connect(&address, session.remaining_timeout())
            .map_err(|e| {
                fail_step(
                    session,
                    JourneyStep::ConnectToPreloader,
                    &Failure::io(format!("connecting to the preloader at {address}"), e),
                )
            })?;
        session.consume_budget(began);
        mark_performed(session, JourneyStep::ConnectToPreloader);
        Ok(conn)
    }

    fn send_fork_command(
        &self,
        conn: &mut PreloaderConnection,
        session: &mut HandshakeSession,
    ) -> SpawnResult<()> {
        mark_in_progress(session, JourneyStep::SendCommandToPreloader);
        let line = SpawnCommand::new(session.work_dir.path()).to_line();

        let began = Instant::now();
        conn.set_write_timeout(session.remaining_timeout());
        let result = conn.write_all(line.as_bytes());
        session.consume_budget(began);

        result.map_err(|e| {
            fail_step(
                session,
                JourneyStep::SendCommandToPreloader,
                &Failure::io("sending the spawn command to the preloader", e),
            )
        })?;
        mark_performed(session, JourneyStep::SendCommandToPreloader);
        Ok(())
    }

    fn read_fork_command_response(
        &self,
        conn: &mut PreloaderConnection,
        session: &mut HandshakeSession,
    ) -> SpawnResult<String> {
        mark_in_progress(session, JourneyStep::ReadResponseFromPreloader);
        conn.set_read_timeout(session.remaining_timeout());

        let began = Instant::now();
        let outcome = read_response_line(conn);
        session.consume_budget(began);

        match outcome {
            Ok(line) => {
                mark_performed(session, JourneyStep::ReadResponseFromPreloader);
                Ok(line)
            }
            Err(ReadLineError::Io(e)) => Err(fail_step(
                session,
                JourneyStep::ReadResponseFromPreloader,
                &Failure::io("receiving a response from the preloader", e),
            )),
            Err(ReadLineError::TooLong) => {
                // An oversized response is judged as unparseable payload:
                // the read leg worked, the content is the problem.
                mark_performed(session, JourneyStep::ReadResponseFromPreloader);
                mark_in_progress(session, JourneyStep::ParseResponseFromPreloader);
                let _ = session
                    .journey
                    .set_errored(JourneyStep::ParseResponseFromPreloader, true);
                Err(Box::new(
                    SpawnError::new(
                        ErrorCategory::InternalError,
                        &session.journey,
                        &session.config,
                        "The preloader process sent a response that exceeds the maximum \
                         size limit.",
                    )
                    .with_problem_html(templates::problem_preloader_oversized_response_html())
                    .with_solution_html(templates::solution_report_preloader_bug_html()),
                ))
            }
        }
    }

    fn parse_fork_command_response(
        &self,
        line: &str,
        session: &mut HandshakeSession,
    ) -> SpawnResult<SpawnReply> {
        mark_in_progress(session, JourneyStep::ParseResponseFromPreloader);
        match SpawnReply::parse(line) {
            Ok(reply) => {
                mark_performed(session, JourneyStep::ParseResponseFromPreloader);
                Ok(reply)
            }
            Err(ProtocolError::Unparseable(e)) => {
                let _ = session
                    .journey
                    .set_errored(JourneyStep::ParseResponseFromPreloader, true);
                Err(Box::new(
                    SpawnError::new(
                        ErrorCategory::InternalError,
                        &session.journey,
                        &session.config,
                        format!("The preloader process sent an unparseable response: {e}"),
                    )
                    .with_problem_html(templates::problem_preloader_gibberish_html())
                    .with_solution_html(templates::solution_report_preloader_bug_html()),
                ))
            }
            Err(ProtocolError::Structure(reason)) => {
                let _ = session
                    .journey
                    .set_errored(JourneyStep::ParseResponseFromPreloader, true);
                Err(Box::new(
                    SpawnError::new(
                        ErrorCategory::InternalError,
                        &session.journey,
                        &session.config,
                        format!(
                            "The preloader process sent a response that does not match \
                             the expected structure: {reason}"
                        ),
                    )
                    .with_problem_html(templates::problem_preloader_bad_structure_html(
                        line.trim_end(),
                    ))
                    .with_solution_html(templates::solution_report_preloader_bug_html()),
                ))
            }
        }
    }

    fn process_fork_command_response(
        &self,
        reply: SpawnReply,
        session: &mut HandshakeSession,
    ) -> SpawnResult<ForkCommandResult> {
        mark_in_progress(session, JourneyStep::ProcessResponseFromPreloader);
        match reply {
            SpawnReply::Error { message } => {
                let _ = session
                    .journey
                    .set_errored(JourneyStep::ProcessResponseFromPreloader, true);
                Err(Box::new(
                    SpawnError::new(
                        ErrorCategory::InternalError,
                        &session.journey,
                        &session.config,
                        format!(
                            "An error occurred while starting the web application: {message}"
                        ),
                    )
                    .with_low_level_message(message.clone())
                    .with_problem_html(templates::problem_preloader_reported_error_html(&message)),
                ))
            }
            SpawnReply::Ok { pid } => self.accept_spawned_worker(pid, session),
        }
    }

    /// Opens the worker's stdio FIFOs and verifies that the reported pid
    /// really is the user's worker and not some unrelated process a rogue
    /// preloader points us at.
    fn accept_spawned_worker(
        &self,
        pid: i32,
        session: &mut HandshakeSession,
    ) -> SpawnResult<ForkCommandResult> {
        let mut guard = KillGuard::new(pid);
        let layout = session.work_dir.layout().clone();

        let stdin = open_fifo_with_timeout(&layout.stdin_fifo(), true, session).map_err(|f| {
            fail_step(session, JourneyStep::ProcessResponseFromPreloader, &f)
        })?;
        let stdout_and_err = open_fifo_with_timeout(&layout.stdout_and_err_fifo(), false, session)
            .map_err(|f| fail_step(session, JourneyStep::ProcessResponseFromPreloader, &f))?;

        // Capture worker output while we scrutinize it; whatever arrives
        // belongs in the report if we reject the worker.
        let capturer = stdout_and_err
            .try_clone()
            .ok()
            .and_then(|dup| OutputCapturer::start(dup, &[], None).ok());
        let captured = |capturer: &Option<OutputCapturer>| {
            capturer.as_ref().map(|c| c.data()).unwrap_or_default()
        };

        match system::process_uid(pid) {
            Ok(Some(uid)) if uid == session.uid => {}
            Ok(Some(uid)) => {
                let _ = session
                    .journey
                    .set_errored(JourneyStep::ProcessResponseFromPreloader, true);
                return Err(Box::new(
                    SpawnError::new(
                        ErrorCategory::InternalError,
                        &session.journey,
                        &session.config,
                        format!(
                            "The process that the preloader said it spawned, PID {pid}, \
                             has UID {uid}, but the expected UID is {}",
                            session.uid
                        ),
                    )
                    .with_problem_html(templates::problem_preloader_wrong_uid_html(
                        session.uid,
                        uid,
                    ))
                    .with_solution_html(templates::solution_report_preloader_bug_html())
                    .with_stdout_and_err(captured(&capturer)),
                ));
            }
            Ok(None) => {
                let _ = session
                    .journey
                    .set_errored(JourneyStep::ProcessResponseFromPreloader, true);
                let (summary, problem) = if system::os_process_exists(pid) {
                    (
                        format!(
                            "Unable to query the UID of spawned application process {pid}: \
                             the process table returned no information about it"
                        ),
                        templates::problem_uid_query_no_info_html(),
                    )
                } else {
                    (
                        "The application process spawned from the preloader seems to have \
                         exited prematurely"
                            .to_string(),
                        templates::problem_uid_query_no_info_html(),
                    )
                };
                return Err(Box::new(
                    SpawnError::new(
                        ErrorCategory::InternalError,
                        &session.journey,
                        &session.config,
                        summary,
                    )
                    .with_problem_html(problem)
                    .with_solution_html(templates::solution_uid_query_html())
                    .with_stdout_and_err(captured(&capturer)),
                ));
            }
            Err(e) => {
                let _ = session
                    .journey
                    .set_errored(JourneyStep::ProcessResponseFromPreloader, true);
                return Err(Box::new(
                    SpawnError::new(
                        ErrorCategory::OperatingSystemError,
                        &session.journey,
                        &session.config,
                        format!(
                            "Unable to query the UID of spawned application process {pid}: {e}"
                        ),
                    )
                    .with_low_level_message(e.to_string())
                    .with_problem_html(templates::problem_uid_query_failed_html(&e.to_string()))
                    .with_solution_html(templates::solution_uid_query_html())
                    .with_stdout_and_err(captured(&capturer)),
                ));
            }
        }

        let mut already_read = Vec::new();
        if let Some(mut capturer) = capturer {
            capturer.stop();
            already_read = capturer.data().into_bytes();
        }

        mark_performed(session, JourneyStep::ProcessResponseFromPreloader);
        guard.disarm();
        Ok(ForkCommandResult {
            pid,
            stdin: Some(stdin),
            stdout_and_err: Some(stdout_and_err),
            already_read,
        })
    }

    fn spawn_inner(&self, config: &Config) -> SpawnResult<SpawnedProcess> {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        if !self.preloader_started() {
            self.start_preloader(&mut lifecycle, config)?;
        }
        // Snapshot now: a retry may stop this preloader before a failure
        // gets reported.
        let preloader_annotations = lifecycle.annotations.clone();

        let mut config = config.clone();
        config.spawn_method = SpawnMethod::Smart;
        let mut session =
            prepare::prepare(&self.ctx, config, JourneyType::SpawnThroughPreloader)?;

        let result = (|| {
            let fork_result = self.invoke_fork_command(&mut lifecycle, &mut session)?;
            let mut guard = KillGuard::new(fork_result.pid);
            let process = HandshakePerform::new(
                &mut session,
                fork_result.pid,
                fork_result.stdin,
                fork_result.stdout_and_err,
                fork_result.already_read,
            )
            .execute()?;
            guard.disarm();
            finish_journey(&mut session);
            Ok(process)
        })();

        result.map_err(|mut error: Box<SpawnError>| {
            // Preloader context helps diagnose worker failures.
            error.add_annotations(preloader_annotations);
            error
        })
    }
}

impl Spawner for SmartSpawner {
    fn spawn(&self, config: &Config) -> SpawnResult<SpawnedProcess> {
        self.fields.lock().unwrap().last_used = Instant::now();
        config.validate().map_err(|e| {
            super::config_error_report(config, JourneyType::SpawnThroughPreloader, e).finalize()
        })?;
        let result = self.spawn_inner(config).map_err(|e| e.finalize());
        if let Ok(process) = &result {
            tracing::info!(
                pid = process.pid,
                gupid = %process.gupid,
                "application process spawned through preloader"
            );
        }
        result
    }

    fn last_used(&self) -> Instant {
        self.fields.lock().unwrap().last_used
    }

    fn cleanup(&self) {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        self.stop_preloader(&mut lifecycle);
    }
}

impl Drop for SmartSpawner {
    fn drop(&mut self) {
        self.cleanup();
    }
}

// ---------------------------------------------------------------------------
// Journey bookkeeping helpers
// ---------------------------------------------------------------------------

fn mark_in_progress(session: &mut HandshakeSession, step: JourneyStep) {
    session
        .journey
        .set_in_progress(step)
        .expect("protocol steps advance in order");
}

fn mark_performed(session: &mut HandshakeSession, step: JourneyStep) {
    session
        .journey
        .set_performed(step)
        .expect("in-progress protocol step can be performed");
}

fn fail_step(
    session: &mut HandshakeSession,
    step: JourneyStep,
    failure: &Failure,
) -> Box<SpawnError> {
    let _ = session.journey.set_errored(step, true);
    Box::new(SpawnError::from_failure(
        failure,
        &session.journey,
        &session.config,
    ))
}

// ---------------------------------------------------------------------------
// Wire plumbing
// ---------------------------------------------------------------------------

enum PreloaderConnection {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl PreloaderConnection {
    fn connect(address: &str, timeout: Duration) -> std::io::Result<PreloaderConnection> {
        match SocketAddress::parse(address)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?
        {
            SocketAddress::Unix(path) => Ok(PreloaderConnection::Unix(UnixStream::connect(path)?)),
            SocketAddress::Tcp { host, port } => {
                use std::net::ToSocketAddrs;
                let addr = (host.as_str(), port)
                    .to_socket_addrs()?
                    .next()
                    .ok_or_else(|| {
                        std::io::Error::new(
                            std::io::ErrorKind::AddrNotAvailable,
                            "address resolves to nothing",
                        )
                    })?;
                Ok(PreloaderConnection::Tcp(TcpStream::connect_timeout(
                    &addr,
                    timeout.max(Duration::from_millis(1)),
                )?))
            }
        }
    }

    fn set_read_timeout(&mut self, timeout: Duration) {
        let timeout = Some(timeout.max(Duration::from_millis(1)));
        let _ = match self {
            PreloaderConnection::Unix(stream) => stream.set_read_timeout(timeout),
            PreloaderConnection::Tcp(stream) => stream.set_read_timeout(timeout),
        };
    }

    fn set_write_timeout(&mut self, timeout: Duration) {
        let timeout = Some(timeout.max(Duration::from_millis(1)));
        let _ = match self {
            PreloaderConnection::Unix(stream) => stream.set_write_timeout(timeout),
            PreloaderConnection::Tcp(stream) => stream.set_write_timeout(timeout),
        };
    }
}

impl Read for PreloaderConnection {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            PreloaderConnection::Unix(stream) => stream.read(buf),
            PreloaderConnection::Tcp(stream) => stream.read(buf),
        }
    }
}

impl Write for PreloaderConnection {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            PreloaderConnection::Unix(stream) => stream.write(buf),
            PreloaderConnection::Tcp(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            PreloaderConnection::Unix(stream) => stream.flush(),
            PreloaderConnection::Tcp(stream) => stream.flush(),
        }
    }
}

enum ReadLineError {
    Io(std::io::Error),
    TooLong,
}

/// Reads one newline-terminated response line, capped at the protocol
/// maximum. The connection is one-shot, so reading byte-wise is fine.
fn read_response_line(conn: &mut PreloaderConnection) -> Result<String, ReadLineError> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match conn.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => {
                if byte[0] == b'\n' {
                    break;
                }
                line.push(byte[0]);
                if line.len() > MAX_PRELOADER_RESPONSE_BYTES {
                    return Err(ReadLineError::TooLong);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ReadLineError::Io(e)),
        }
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

/// Opens a FIFO end within the session's remaining budget. The blocking
/// open happens on a helper thread; on timeout the helper is abandoned
/// (it exits once the FIFO rendezvous completes or the work dir is gone).
fn open_fifo_with_timeout(
    path: &Path,
    for_writing: bool,
    session: &mut HandshakeSession,
) -> Result<OwnedFd, Failure> {
    let began = Instant::now();
    let (tx, rx) = std::sync::mpsc::channel();
    let path_buf = path.to_path_buf();
    std::thread::Builder::new()
        .name("fifo opener".to_string())
        .stack_size(64 * 1024)
        .spawn(move || {
            let result = if for_writing {
                std::fs::OpenOptions::new().write(true).open(&path_buf)
            } else {
                std::fs::File::open(&path_buf)
            };
            let _ = tx.send(result);
        })
        .map_err(|e| Failure::io("starting the FIFO opener thread", e))?;

    let outcome = rx.recv_timeout(session.remaining_timeout());
    session.consume_budget(began);
    match outcome {
        Ok(Ok(file)) => Ok(OwnedFd::from(file)),
        Ok(Err(e)) => Err(Failure::io(format!("opening FIFO {}", path.display()), e)),
        Err(_) => Err(Failure::Timeout(format!(
            "timed out opening FIFO {}",
            path.display()
        ))),
    }
}

/// Streams the preloader's own output into our log, the way subprocess
/// logs are normally forwarded. The thread ends when the preloader does.
fn drain_preloader_output(mut process: SpawnedProcess) {
    let Some(fd) = process.stdout_and_err_fd.take() else {
        return;
    };
    let pid = process.pid;
    let result = std::thread::Builder::new()
        .name("preloader output".to_string())
        .spawn(move || {
            use std::io::BufRead;
            let reader = std::io::BufReader::new(std::fs::File::from(fd));
            for line in reader.lines() {
                match line {
                    Ok(line) => tracing::info!(target: "preloader", pid, "{}", line),
                    Err(_) => break,
                }
            }
            tracing::debug!(target: "preloader", pid, "output stream closed");
        });
    if let Err(e) = result {
        tracing::warn!(error = %e, "failed to start the preloader output thread");
    }
}

/// Joins an argv into a `/bin/sh -c` compatible command line.
fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|part| shell_quote(part))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(part: &str) -> String {
    let safe = !part.is_empty()
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=+,".contains(c));
    if safe {
        part.to_string()
    } else {
        format!("'{}'", part.replace('\'', "'\\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::os::unix::net::UnixListener;
    use std::process::Command;

    fn test_context(base: &Path) -> Arc<Context> {
        Arc::new(
            Context::new(base.join("install"))
                .with_agent_path("/bin/sh")
                .with_spawn_dir(base.to_path_buf()),
        )
    }

    fn test_config() -> Config {
        Config {
            app_root: "/srv/app".into(),
            start_command: "./start.sh".into(),
            spawn_method: SpawnMethod::Smart,
            start_timeout_msec: 10_000,
            ..Config::default()
        }
    }

    fn spawner(ctx: &Arc<Context>) -> SmartSpawner {
        SmartSpawner::new(Arc::clone(ctx), vec!["./preloader".to_string()])
    }

    fn session_for(ctx: &Arc<Context>, config: Config) -> HandshakeSession {
        prepare::prepare(ctx, config, JourneyType::SpawnThroughPreloader).unwrap()
    }

    fn lifecycle_at(address: &str) -> PreloaderLifecycle {
        PreloaderLifecycle {
            socket_address: Some(address.to_string()),
            stdin: None,
            annotations: BTreeMap::new(),
        }
    }

    /// A single-shot fake preloader: accepts one connection, reads the
    /// command line, replies, and (for ok-replies) completes the FIFO
    /// rendezvous the way a real preloader's worker would.
    fn fake_preloader(
        listener: UnixListener,
        reply: String,
        open_fifos: bool,
    ) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut request = String::new();
            reader.read_line(&mut request).unwrap();
            let request: serde_json::Value = serde_json::from_str(&request).unwrap();
            assert_eq!(request["command"], "spawn");
            let work_dir = request["work_dir"].as_str().unwrap().to_string();

            let mut stream = stream;
            stream.write_all(reply.as_bytes()).unwrap();
            stream.flush().unwrap();

            if open_fifos {
                // Mirror of the parent's open order: it opens stdin for
                // writing first, then stdout_and_err for reading.
                let layout = stagehand_shared::layout::WorkDirLayout::new(&work_dir);
                let _stdin = std::fs::File::open(layout.stdin_fifo()).unwrap();
                let _output = std::fs::OpenOptions::new()
                    .write(true)
                    .open(layout.stdout_and_err_fifo())
                    .unwrap();
                // Hold both ends briefly so the parent's opens complete.
                std::thread::sleep(Duration::from_millis(200));
            }
        })
    }

    fn unix_address(base: &Path) -> (UnixListener, String) {
        let path = base.join("preloader.sock");
        let listener = UnixListener::bind(&path).unwrap();
        (listener, format!("unix:{}", path.display()))
    }

    #[test]
    fn error_reply_marks_the_process_response_step() {
        let base = tempfile::tempdir().unwrap();
        let ctx = test_context(base.path());
        let (listener, address) = unix_address(base.path());
        let preloader = fake_preloader(
            listener,
            "{\"result\":\"error\",\"message\":\"no space left\"}\n".to_string(),
            false,
        );

        let spawner = spawner(&ctx);
        let mut lifecycle = lifecycle_at(&address);
        let mut session = session_for(&ctx, test_config());
        let error = spawner
            .invoke_fork_command_once(&mut lifecycle, &mut session)
            .unwrap_err();

        assert_eq!(error.category(), ErrorCategory::InternalError);
        assert_eq!(
            error.first_failed_step(),
            Some(JourneyStep::ProcessResponseFromPreloader)
        );
        assert!(error.summary().contains("no space left"));
        preloader.join().unwrap();
    }

    #[test]
    fn oversized_reply_is_charged_to_the_parse_step() {
        let base = tempfile::tempdir().unwrap();
        let ctx = test_context(base.path());
        let (listener, address) = unix_address(base.path());
        let mut reply = "x".repeat(2 * MAX_PRELOADER_RESPONSE_BYTES);
        reply.push('\n');
        let preloader = fake_preloader(listener, reply, false);

        let spawner = spawner(&ctx);
        let mut lifecycle = lifecycle_at(&address);
        let mut session = session_for(&ctx, test_config());
        let error = spawner
            .invoke_fork_command_once(&mut lifecycle, &mut session)
            .unwrap_err();

        assert_eq!(error.category(), ErrorCategory::InternalError);
        assert_eq!(
            error.first_failed_step(),
            Some(JourneyStep::ParseResponseFromPreloader)
        );
        assert!(error.summary().contains("maximum size"));
        preloader.join().unwrap();
    }

    #[test]
    fn structurally_invalid_reply_is_charged_to_the_parse_step() {
        let base = tempfile::tempdir().unwrap();
        let ctx = test_context(base.path());
        let (listener, address) = unix_address(base.path());
        let preloader =
            fake_preloader(listener, "{\"result\":\"maybe\"}\n".to_string(), false);

        let spawner = spawner(&ctx);
        let mut lifecycle = lifecycle_at(&address);
        let mut session = session_for(&ctx, test_config());
        let error = spawner
            .invoke_fork_command_once(&mut lifecycle, &mut session)
            .unwrap_err();

        assert_eq!(
            error.first_failed_step(),
            Some(JourneyStep::ParseResponseFromPreloader)
        );
        assert!(error.summary().contains("expected structure"));
        preloader.join().unwrap();
    }

    #[test]
    fn connect_failure_to_a_missing_socket_is_a_filesystem_error() {
        let base = tempfile::tempdir().unwrap();
        let ctx = test_context(base.path());
        let spawner = spawner(&ctx);
        let mut lifecycle =
            lifecycle_at(&format!("unix:{}/nonexistent.sock", base.path().display()));
        let mut session = session_for(&ctx, test_config());
        let error = spawner
            .invoke_fork_command_once(&mut lifecycle, &mut session)
            .unwrap_err();

        assert_eq!(error.category(), ErrorCategory::FileSystemError);
        assert_eq!(
            error.first_failed_step(),
            Some(JourneyStep::ConnectToPreloader)
        );
    }

    #[test]
    fn accepted_worker_passes_uid_verification() {
        let base = tempfile::tempdir().unwrap();
        let ctx = test_context(base.path());
        let (listener, address) = unix_address(base.path());

        let worker = Command::new("/bin/sleep").arg("60").spawn().unwrap();
        let worker_pid = worker.id() as i32;
        let preloader = fake_preloader(
            listener,
            format!("{{\"result\":\"ok\",\"pid\":{worker_pid}}}\n"),
            true,
        );

        let spawner = spawner(&ctx);
        let mut lifecycle = lifecycle_at(&address);
        let mut session = session_for(&ctx, test_config());
        let result = spawner
            .invoke_fork_command_once(&mut lifecycle, &mut session)
            .unwrap();

        assert_eq!(result.pid, worker_pid);
        assert!(result.stdin.is_some());
        assert!(result.stdout_and_err.is_some());
        preloader.join().unwrap();
        system::kill_and_waitpid(worker_pid);
    }

    #[test]
    fn uid_mismatch_is_rejected_with_a_preloader_bug_verdict() {
        let base = tempfile::tempdir().unwrap();
        let ctx = test_context(base.path());
        let (listener, address) = unix_address(base.path());

        let mut config = test_config();
        let mut cleanup_pid = None;
        let reported_pid;
        if nix::unistd::Uid::effective().is_root() {
            // Running as root: expect a non-root uid and report our own
            // root-owned child.
            if system::lookup_user("nobody").ok().flatten().is_none() {
                return;
            }
            config.user = Some("nobody".to_string());
            let child = Command::new("/bin/sleep").arg("60").spawn().unwrap();
            reported_pid = child.id() as i32;
            cleanup_pid = Some(reported_pid);
        } else {
            // Not root: pid 1 belongs to root, never to us.
            reported_pid = 1;
        }

        let preloader = fake_preloader(
            listener,
            format!("{{\"result\":\"ok\",\"pid\":{reported_pid}}}\n"),
            true,
        );

        let spawner = spawner(&ctx);
        let mut lifecycle = lifecycle_at(&address);
        let mut session = session_for(&ctx, config);
        let error = spawner
            .invoke_fork_command_once(&mut lifecycle, &mut session)
            .unwrap_err();

        assert_eq!(error.category(), ErrorCategory::InternalError);
        assert_eq!(
            error.first_failed_step(),
            Some(JourneyStep::ProcessResponseFromPreloader)
        );
        assert!(error.summary().contains("UID"));
        assert!(error.solution_description_html().contains("preloader"));
        preloader.join().unwrap();
        if let Some(pid) = cleanup_pid {
            system::kill_and_waitpid(pid);
        }
    }

    #[test]
    fn vanished_worker_is_reported_as_premature_exit() {
        let base = tempfile::tempdir().unwrap();
        let ctx = test_context(base.path());
        let (listener, address) = unix_address(base.path());
        let preloader = fake_preloader(
            listener,
            "{\"result\":\"ok\",\"pid\":999999999}\n".to_string(),
            true,
        );

        let spawner = spawner(&ctx);
        let mut lifecycle = lifecycle_at(&address);
        let mut session = session_for(&ctx, test_config());
        let error = spawner
            .invoke_fork_command_once(&mut lifecycle, &mut session)
            .unwrap_err();

        assert_eq!(
            error.first_failed_step(),
            Some(JourneyStep::ProcessResponseFromPreloader)
        );
        assert!(error.summary().contains("exited prematurely"));
        preloader.join().unwrap();
    }

    #[test]
    fn stopping_without_a_preloader_is_a_noop() {
        let base = tempfile::tempdir().unwrap();
        let ctx = test_context(base.path());
        let spawner = spawner(&ctx);
        spawner.cleanup();
        spawner.cleanup();
        assert!(spawner.preloader_pid().is_none());
    }

    #[test]
    fn shell_join_quotes_only_what_needs_quoting() {
        assert_eq!(
            shell_join(&["ruby".into(), "preloader.rb".into()]),
            "ruby preloader.rb"
        );
        assert_eq!(
            shell_join(&["ruby".into(), "my app.rb".into()]),
            "ruby 'my app.rb'"
        );
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }
}
