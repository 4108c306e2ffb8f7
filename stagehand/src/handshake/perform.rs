//! Parent-side readiness wait.
//!
//! After the fork, the parent has no business looking at the child other
//! than through three signals: the child exiting, the finish byte arriving
//! on the `finish` FIFO, and (for port-probed apps) the expected port
//! accepting connections. Each signal gets a dedicated watcher thread with a
//! small stack; a coordinator multiplexes them under one mutex/condvar and
//! enforces the spawn's remaining time budget. The first definitive signal
//! wins; later ones are ignored.

use std::io::Read;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use nix::errno::Errno;
use nix::sys::wait::waitpid;
use nix::unistd::Pid;

use stagehand_shared::category::ErrorCategory;
use stagehand_shared::journey::JourneyStep;
use stagehand_shared::layout::WorkDirLayout;

use crate::capture::OutputCapturer;
use crate::report::{Failure, SpawnError, SpawnResult, templates};
use crate::result::{ResponseProperties, ResultSocket, SpawnedProcess};

use super::session::HandshakeSession;

/// Stack size for watcher threads; they do nothing but block in a syscall.
const WATCHER_STACK_SIZE: usize = 64 * 1024;

/// Grace period before assembling an error report, giving the child a last
/// chance to flush output into the capturer.
const PRE_REPORT_SLEEP: Duration = Duration::from_millis(50);

/// Per-attempt connect timeout of the pingability watcher.
const PING_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(100);

/// Pause between pingability attempts.
const PING_RETRY_SLEEP: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FinishState {
    NotFinished,
    Success,
    Error,
    InternalError,
}

#[derive(Debug)]
struct Flags {
    process_exited: bool,
    finish: FinishState,
    socket_pingable: bool,
    /// Set alongside `FinishState::InternalError`: what broke inside the
    /// finish watcher itself.
    watcher_failure: Option<(ErrorCategory, String)>,
    /// Once true, watcher updates are ignored: the verdict is final.
    done: bool,
}

struct WatchState {
    flags: Mutex<Flags>,
    cond: Condvar,
    ping_stop: AtomicBool,
}

enum WaitOutcome {
    Ready(FinishState),
    ChildGone,
    Timeout,
}

/// Runs the readiness wait for one spawned process.
pub(crate) struct HandshakePerform<'a> {
    session: &'a mut HandshakeSession,
    pid: i32,
    /// Kept open for the child's lifetime on the direct path; dropped when
    /// the handshake ends.
    stdin_fd: Option<OwnedFd>,
    stdout_and_err_fd: Option<OwnedFd>,
    already_read_output: Vec<u8>,

    state: Arc<WatchState>,
    capturer: Option<OutputCapturer>,
    exit_watcher: Option<JoinHandle<()>>,
    finish_watcher: Option<JoinHandle<()>>,
    ping_watcher: Option<JoinHandle<()>>,
}

impl<'a> HandshakePerform<'a> {
    pub(crate) fn new(
        session: &'a mut HandshakeSession,
        pid: i32,
        stdin_fd: Option<OwnedFd>,
        stdout_and_err_fd: Option<OwnedFd>,
        already_read_output: Vec<u8>,
    ) -> Self {
        HandshakePerform {
            session,
            pid,
            stdin_fd,
            stdout_and_err_fd,
            already_read_output,
            state: Arc::new(WatchState {
                flags: Mutex::new(Flags {
                    process_exited: false,
                    finish: FinishState::NotFinished,
                    socket_pingable: false,
                    watcher_failure: None,
                    done: false,
                }),
                cond: Condvar::new(),
                ping_stop: AtomicBool::new(false),
            }),
            capturer: None,
            exit_watcher: None,
            finish_watcher: None,
            ping_watcher: None,
        }
    }

    /// Waits until the child is ready, has failed, or the budget is gone.
    pub(crate) fn execute(mut self) -> SpawnResult<SpawnedProcess> {
        self.session
            .journey
            .set_in_progress(JourneyStep::HandshakePerform)
            .expect("handshake step starts exactly once");

        if let Err(failure) = self.start_watchers() {
            let error = self.report_from_failure(&failure, JourneyStep::HandshakePerform);
            self.cleanup();
            return Err(error);
        }

        let outcome = self.wait_until_finished();
        let result = match outcome {
            WaitOutcome::Ready(FinishState::Success) => self.handle_success(),
            WaitOutcome::Ready(FinishState::Error) => Err(self.handle_error_response()),
            WaitOutcome::Ready(FinishState::InternalError) => Err(self.handle_internal_error()),
            WaitOutcome::Ready(FinishState::NotFinished) => Err(self.handle_internal_error()),
            WaitOutcome::ChildGone => Err(self.handle_child_gone()),
            WaitOutcome::Timeout => Err(self.handle_timeout()),
        };
        self.cleanup();
        result
    }

    // -----------------------------------------------------------------
    // Watchers
    // -----------------------------------------------------------------

    fn start_watchers(&mut self) -> Result<(), Failure> {
        if let Some(fd) = &self.stdout_and_err_fd {
            let dup = fd
                .try_clone()
                .map_err(|e| Failure::io("duplicating the output capture fd", e))?;
            let state = Arc::clone(&self.state);
            self.capturer = Some(
                OutputCapturer::start(
                    dup,
                    &self.already_read_output,
                    Some(Box::new(move || {
                        // Taking the lock orders this notify after the
                        // coordinator's condition check; without it the
                        // wakeup could fall between check and wait.
                        let _flags = state.flags.lock().unwrap();
                        state.cond.notify_all();
                    })),
                )
                .map_err(|e| Failure::io("starting the output capturer", e))?,
            );
        }

        self.exit_watcher = Some(spawn_watcher("spawn exit watcher", {
            let state = Arc::clone(&self.state);
            let pid = self.pid;
            move || watch_process_exit(pid, &state)
        })?);

        if self.session.config.generic_app || self.session.config.find_free_port {
            if let Some(port) = self.session.expected_start_port {
                self.ping_watcher = Some(spawn_watcher("spawn ping watcher", {
                    let state = Arc::clone(&self.state);
                    move || watch_socket_pingability(port, &state)
                })?);
            }
        }

        // Generic apps do not speak the handshake protocol, so there is no
        // finish signal to wait for.
        if !self.session.config.generic_app {
            let fifo = self.session.work_dir.layout().finish_fifo();
            self.finish_watcher = Some(spawn_watcher("spawn finish watcher", {
                let state = Arc::clone(&self.state);
                move || watch_finish_signal(&fifo, &state)
            })?);
        }

        Ok(())
    }

    // -----------------------------------------------------------------
    // Coordinator
    // -----------------------------------------------------------------

    fn wait_until_finished(&mut self) -> WaitOutcome {
        let state = Arc::clone(&self.state);
        let mut flags = state.flags.lock().unwrap();
        loop {
            let capturer_stopped = self.capturer.as_ref().is_some_and(|c| c.is_stopped());
            if capturer_stopped || flags.process_exited {
                flags.done = true;
                return WaitOutcome::ChildGone;
            }
            if self.session.timed_out() {
                flags.done = true;
                return WaitOutcome::Timeout;
            }

            let ready = if self.session.config.generic_app {
                flags.socket_pingable
            } else {
                flags.finish != FinishState::NotFinished
            };
            if ready {
                flags.done = true;
                return WaitOutcome::Ready(flags.finish);
            }

            let began = Instant::now();
            let (reacquired, _) = state
                .cond
                .wait_timeout(flags, self.session.remaining_timeout())
                .unwrap();
            flags = reacquired;
            self.session.consume_budget(began);
        }
    }

    // -----------------------------------------------------------------
    // Verdict handlers
    // -----------------------------------------------------------------

    fn handle_success(&mut self) -> SpawnResult<SpawnedProcess> {
        let layout = self.session.work_dir.layout().clone();
        let socket_pingable = self.state.flags.lock().unwrap().socket_pingable;

        let properties = match ResponseProperties::load(&layout.properties_json()) {
            Ok(Some(properties)) => properties,
            Ok(None) => {
                if socket_pingable {
                    // Port-probed apps are not obliged to write properties.
                    ResponseProperties::default()
                } else {
                    return Err(self.validation_error(
                        Vec::new(),
                        vec![format!(
                            "required response file {} is missing",
                            layout.properties_json().display()
                        )],
                    ));
                }
            }
            Err(message) => return Err(self.validation_error(Vec::new(), vec![message])),
        };

        let mut sockets = properties.sockets;
        if socket_pingable && sockets.is_empty() {
            let port = self
                .session
                .expected_start_port
                .expect("pingability implies an expected start port");
            sockets.push(ResultSocket {
                name: "main".to_string(),
                address: format!("tcp://127.0.0.1:{port}"),
                protocol: "http_session".to_string(),
                concurrency: -1,
                accept_http_requests: true,
            });
        }
        if sockets.is_empty() {
            return Err(self.no_sockets_error());
        }

        let process = SpawnedProcess {
            pid: self.pid,
            gupid: self.session.gupid.clone(),
            spawn_start_time: self.session.spawn_start_time,
            spawn_end_time: SystemTime::now(),
            spawn_start_time_monotonic: self.session.spawn_start_time_monotonic,
            spawn_end_time_monotonic: Instant::now(),
            stdout_and_err_fd: self.stdout_and_err_fd.take(),
            sockets,
            code_revision: properties
                .code_revision
                .or_else(|| self.session.code_revision.clone()),
        };

        let errors = process.validate();
        if !errors.is_empty() {
            return Err(self.validation_error(errors.internal, errors.app_supplied));
        }

        self.session
            .journey
            .set_performed(JourneyStep::HandshakePerform)
            .expect("in-progress handshake step can be performed");
        tracing::debug!(
            pid = self.pid,
            gupid = %process.gupid,
            sockets = process.sockets.len(),
            "application process is ready"
        );
        Ok(process)
    }

    /// The child announced failure through the finish FIFO. Its own report
    /// files carry the story; defaults fill the gaps.
    fn handle_error_response(&mut self) -> Box<SpawnError> {
        std::thread::sleep(PRE_REPORT_SLEEP);
        let layout = self.session.work_dir.layout().clone();

        if let Err(journey_error) = self
            .session
            .journey
            .load_from_response_dir(self.session.work_dir.path())
        {
            return self.report_from_failure(
                &Failure::Internal(journey_error.to_string()),
                JourneyStep::HandshakePerform,
            );
        }
        self.charge_failure_to_reported_step();

        let category = SpawnError::child_reported_category(&layout)
            .unwrap_or(ErrorCategory::InternalError);
        let mut error = SpawnError::new(
            category,
            &self.session.journey,
            &self.session.config,
            "The web application aborted with an error during startup.",
        )
        .with_stdout_and_err(self.captured_output());
        error.load_child_error_texts(&layout);
        error.load_subprocess_dumps(&layout);
        Box::new(error)
    }

    /// The finish watcher itself broke; the child may be fine, but we can
    /// no longer tell.
    fn handle_internal_error(&mut self) -> Box<SpawnError> {
        std::thread::sleep(PRE_REPORT_SLEEP);
        let (category, message) = self
            .state
            .flags
            .lock()
            .unwrap()
            .watcher_failure
            .clone()
            .unwrap_or((
                ErrorCategory::InternalError,
                "the readiness watcher failed without details".to_string(),
            ));

        self.session
            .journey
            .set_errored(JourneyStep::HandshakePerform, true)
            .expect("handshake step can be marked errored");
        let layout = self.session.work_dir.layout().clone();
        let mut error = SpawnError::new(
            category,
            &self.session.journey,
            &self.session.config,
            format!("An internal error occurred while spawning an application process: {message}"),
        )
        .with_low_level_message(message)
        .with_stdout_and_err(self.captured_output());
        error.load_subprocess_dumps(&layout);
        Box::new(error)
    }

    /// The child exited (or its output stream closed) before readiness.
    fn handle_child_gone(&mut self) -> Box<SpawnError> {
        std::thread::sleep(PRE_REPORT_SLEEP);
        let layout = self.session.work_dir.layout().clone();

        if let Err(journey_error) = self
            .session
            .journey
            .load_from_response_dir(self.session.work_dir.path())
        {
            return self.report_from_failure(
                &Failure::Internal(journey_error.to_string()),
                JourneyStep::HandshakePerform,
            );
        }
        self.charge_failure_to_reported_step();

        let category = SpawnError::child_reported_category(&layout)
            .unwrap_or(ErrorCategory::InternalError);
        let mut error = SpawnError::new(
            category,
            &self.session.journey,
            &self.session.config,
            "An error occurred while spawning an application process.",
        )
        .with_stdout_and_err(self.captured_output());
        error.load_child_error_texts(&layout);
        error.load_subprocess_dumps(&layout);
        Box::new(error)
    }

    fn handle_timeout(&mut self) -> Box<SpawnError> {
        std::thread::sleep(PRE_REPORT_SLEEP);
        let layout = self.session.work_dir.layout().clone();
        // Step timings from the child make timeout reports debuggable;
        // an unreadable state file must not mask the timeout itself.
        let _ = self
            .session
            .journey
            .load_from_response_dir(self.session.work_dir.path());
        self.session
            .journey
            .set_errored(JourneyStep::HandshakePerform, true)
            .expect("handshake step can be marked errored");

        let summary = templates::default_summary(
            ErrorCategory::TimeoutError,
            &self.session.journey,
            "",
        );
        let mut error = SpawnError::new(
            ErrorCategory::TimeoutError,
            &self.session.journey,
            &self.session.config,
            summary,
        )
        .with_stdout_and_err(self.captured_output());
        error.load_subprocess_dumps(&layout);
        Box::new(error)
    }

    // -----------------------------------------------------------------
    // Error assembly helpers
    // -----------------------------------------------------------------

    /// Ensures exactly one step carries the blame after loading the child's
    /// journey: the child's own errored step if it reported one, otherwise
    /// the furthest step that was still in progress when it died (the
    /// parent's handshake step is in progress throughout, so it only wins
    /// when the child never reported anything), otherwise the handshake
    /// itself.
    fn charge_failure_to_reported_step(&mut self) {
        let journey = &mut self.session.journey;
        if journey.first_failed_step().is_some() {
            return;
        }
        let step = journey
            .last_in_progress_step()
            .unwrap_or(JourneyStep::HandshakePerform);
        journey
            .set_errored(step, true)
            .expect("forced error marking always succeeds on a declared step");
    }

    fn report_from_failure(&mut self, failure: &Failure, step: JourneyStep) -> Box<SpawnError> {
        std::thread::sleep(PRE_REPORT_SLEEP);
        let _ = self.session.journey.set_errored(step, true);
        let layout = self.session.work_dir.layout().clone();
        let mut error =
            SpawnError::from_failure(failure, &self.session.journey, &self.session.config)
                .with_stdout_and_err(self.captured_output());
        error.load_subprocess_dumps(&layout);
        Box::new(error)
    }

    /// The step that gets blamed for bad child-supplied payload. Wrapper
    /// journeys blame the wrapper, direct journeys the application, and
    /// preloader-forked workers their post-fork preparation; the step must
    /// exist in the journey at hand.
    fn blame_step_for_bad_payload(&self) -> JourneyStep {
        let journey = &self.session.journey;
        let candidates = if self.session.config.starts_using_wrapper {
            [
                JourneyStep::WrapperPreparation,
                JourneyStep::AppLoadOrExec,
                JourneyStep::PrepareAfterForkingFromPreloader,
            ]
        } else {
            [
                JourneyStep::AppLoadOrExec,
                JourneyStep::PrepareAfterForkingFromPreloader,
                JourneyStep::SubprocessFinish,
            ]
        };
        candidates
            .into_iter()
            .find(|step| journey.contains(*step))
            .unwrap_or(JourneyStep::HandshakePerform)
    }

    fn validation_error(
        &mut self,
        internal: Vec<String>,
        app_supplied: Vec<String>,
    ) -> Box<SpawnError> {
        std::thread::sleep(PRE_REPORT_SLEEP);
        let config = self.session.config.clone();
        let layout = self.session.work_dir.layout().clone();
        let blamed_step = self.blame_step_for_bad_payload();

        let error = if !internal.is_empty() {
            self.session
                .journey
                .set_errored(JourneyStep::HandshakePerform, true)
                .expect("handshake step can be marked errored");
            SpawnError::new(
                ErrorCategory::InternalError,
                &self.session.journey,
                &config,
                format!(
                    "Error spawning the web application: a bug in Stagehand caused the \
                     spawn result to be invalid: {}",
                    internal.join("; ")
                ),
            )
            .with_problem_html(templates::problem_field_errors_html(
                &templates::intro_internal_field_errors(),
                &internal,
            ))
            .with_solution_html(templates::solution_report_bug_html())
        } else if config.starts_using_wrapper {
            self.session
                .journey
                .set_errored(blamed_step, true)
                .expect("the blamed step belongs to this journey");
            SpawnError::new(
                ErrorCategory::InternalError,
                &self.session.journey,
                &config,
                format!(
                    "Error spawning the web application: the wrapper's spawn response \
                     is invalid: {}",
                    app_supplied.join("; ")
                ),
            )
            .with_problem_html(templates::problem_field_errors_html(
                &templates::intro_wrapper_field_errors(),
                &app_supplied,
            ))
            .with_solution_html(templates::solution_report_wrapper_bug_html(
                config.wrapper_supplied_by_third_party,
            ))
        } else {
            self.session
                .journey
                .set_errored(blamed_step, true)
                .expect("the blamed step belongs to this journey");
            SpawnError::new(
                ErrorCategory::InternalError,
                &self.session.journey,
                &config,
                format!(
                    "Error spawning the web application: the application's spawn \
                     response is invalid: {}",
                    app_supplied.join("; ")
                ),
            )
            .with_problem_html(templates::problem_field_errors_html(
                &templates::intro_app_field_errors(),
                &app_supplied,
            ))
            .with_solution_html(templates::solution_report_app_bug_html())
        };

        let mut error = error.with_stdout_and_err(self.captured_output());
        error.load_subprocess_dumps(&layout);
        Box::new(error)
    }

    fn no_sockets_error(&mut self) -> Box<SpawnError> {
        std::thread::sleep(PRE_REPORT_SLEEP);
        let config = self.session.config.clone();
        let layout = self.session.work_dir.layout().clone();
        let blamed_step = self.blame_step_for_bad_payload();

        let error = if config.starts_using_wrapper {
            self.session
                .journey
                .set_errored(blamed_step, true)
                .expect("the blamed step belongs to this journey");
            SpawnError::new(
                ErrorCategory::InternalError,
                &self.session.journey,
                &config,
                "Error spawning the web application: the application wrapper did not \
                 report any sockets to receive requests on.",
            )
            .with_problem_html(templates::problem_wrapper_no_sockets_html())
            .with_solution_html(templates::solution_report_bug_html())
        } else {
            self.session
                .journey
                .set_errored(blamed_step, true)
                .expect("the blamed step belongs to this journey");
            SpawnError::new(
                ErrorCategory::InternalError,
                &self.session.journey,
                &config,
                "Error spawning the web application: the application did not report \
                 any sockets to receive requests on.",
            )
            .with_problem_html(templates::problem_app_no_sockets_html())
            .with_solution_html(templates::solution_report_app_bug_html())
        };

        let mut error = error.with_stdout_and_err(self.captured_output());
        error.load_subprocess_dumps(&layout);
        Box::new(error)
    }

    fn captured_output(&self) -> String {
        match &self.capturer {
            Some(capturer) => capturer.data(),
            None => String::from_utf8_lossy(&self.already_read_output).into_owned(),
        }
    }

    // -----------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------

    fn cleanup(&mut self) {
        if let Some(capturer) = &mut self.capturer {
            capturer.stop();
        }

        if let Some(handle) = self.finish_watcher.take() {
            // The watcher may still be blocked on the FIFO; opening the
            // write side and feeding it one byte unblocks it. The verdict
            // is already final, so the byte is ignored.
            poke_finish_fifo(self.session.work_dir.layout());
            let _ = handle.join();
        }

        if let Some(handle) = self.ping_watcher.take() {
            self.state.ping_stop.store(true, Ordering::SeqCst);
            let _ = handle.join();
        }

        // The exit watcher stays blocked in waitpid until the child dies.
        // Detached, it doubles as the reaper: when the child eventually
        // exits (or the unwind guard kills it), the thread reaps and ends.
        drop(self.exit_watcher.take());

        // Closing our stdin write end signals EOF to a child that reads it.
        drop(self.stdin_fd.take());
    }
}

fn spawn_watcher(
    name: &str,
    body: impl FnOnce() + Send + 'static,
) -> Result<JoinHandle<()>, Failure> {
    std::thread::Builder::new()
        .name(name.to_string())
        .stack_size(WATCHER_STACK_SIZE)
        .spawn(body)
        .map_err(|e| Failure::io(format!("starting the {name} thread"), e))
}

fn watch_process_exit(pid: i32, state: &WatchState) {
    loop {
        match waitpid(Pid::from_raw(pid), None) {
            Err(Errno::EINTR) => continue,
            Ok(_) | Err(Errno::EPERM) => {
                let mut flags = state.flags.lock().unwrap();
                if !flags.done {
                    flags.process_exited = true;
                    state.cond.notify_all();
                }
                return;
            }
            // Not our child (smart path) or already reaped: nothing to
            // report.
            Err(_) => return,
        }
    }
}

fn watch_finish_signal(fifo: &std::path::Path, state: &WatchState) {
    let verdict = read_finish_byte(fifo);
    let mut flags = state.flags.lock().unwrap();
    if flags.done {
        return;
    }
    match verdict {
        Ok(b'1') => flags.finish = FinishState::Success,
        Ok(_) => flags.finish = FinishState::Error,
        Err(failure) => {
            flags.finish = FinishState::InternalError;
            flags.watcher_failure = Some(failure);
        }
    }
    state.cond.notify_all();
}

/// Blocks until the child opens the FIFO and writes its verdict byte.
/// EOF without a byte counts as an error verdict.
fn read_finish_byte(fifo: &std::path::Path) -> Result<u8, (ErrorCategory, String)> {
    let classify = |context: &str, e: std::io::Error| {
        let category = if e.raw_os_error().is_some() {
            ErrorCategory::OperatingSystemError
        } else {
            ErrorCategory::InternalError
        };
        (category, format!("{context} {}: {e}", fifo.display()))
    };

    let mut file = std::fs::File::open(fifo).map_err(|e| classify("error opening FIFO", e))?;
    let mut buf = [0u8; 1];
    let n = file
        .read(&mut buf)
        .map_err(|e| classify("error reading from FIFO", e))?;
    if n == 0 { Ok(b'0') } else { Ok(buf[0]) }
}

fn watch_socket_pingability(port: u16, state: &WatchState) {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    loop {
        if state.ping_stop.load(Ordering::SeqCst) {
            return;
        }
        match TcpStream::connect_timeout(&addr, PING_ATTEMPT_TIMEOUT) {
            Ok(_) => {
                let mut flags = state.flags.lock().unwrap();
                if !flags.done {
                    flags.socket_pingable = true;
                    flags.finish = FinishState::Success;
                    state.cond.notify_all();
                }
                return;
            }
            Err(_) => std::thread::sleep(PING_RETRY_SLEEP),
        }
    }
}

/// Unblocks a finish watcher stuck on the FIFO by briefly becoming the
/// writer. A failure to open means no reader is waiting, which is fine.
fn poke_finish_fifo(layout: &WorkDirLayout) {
    use std::io::Write;
    let result = std::fs::OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(layout.finish_fifo());
    if let Ok(mut fifo) = result {
        let _ = fifo.write_all(b"0");
    }
}
