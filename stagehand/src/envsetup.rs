//! The in-child environment setupper.
//!
//! Between fork and exec only async-signal-safe calls are allowed, so the
//! spawner execs this program first and lets it do the unsafe-after-fork
//! work in a fresh process: setting ulimits, entering the resource jail,
//! dropping privileges, loading the login shell environment, validating and
//! entering the working directory, exporting environment variables, and
//! finally exec'ing the application (or its wrapper).
//!
//! It runs in two phases because the optional login shell sits between
//! them: `--before` does everything up to the shell, then execs
//! `<shell> -lc 'exec "$@"'` chaining into `--after`, which finishes the
//! environment and execs the start command. Every failure is written into
//! the work directory (`response/error/*` plus the errored step state file)
//! before exiting 1; the parent folds those files into its diagnostic
//! report.

use std::convert::Infallible;
use std::ffi::CString;
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;

use nix::unistd::{Gid, Uid, User};

use stagehand_shared::args::SpawnArgs;
use stagehand_shared::category::ErrorCategory;
use stagehand_shared::constants::{IN_STAGEHAND_ENV, SPAWN_WORK_DIR_ENV};
use stagehand_shared::journey::{JourneyStep, JourneyStepState};
use stagehand_shared::layout::WorkDirLayout;

use crate::jail;
use crate::system;

/// Which half of the setup this invocation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupPhase {
    Before,
    After,
}

/// Entry point for `stagehand-agent spawn-env-setupper`.
///
/// Does not return on success (the process image is replaced); returns the
/// exit code on failure, after the diagnostic files have been written.
pub fn run(work_dir: &Path, phase: SetupPhase) -> i32 {
    let layout = WorkDirLayout::new(work_dir);

    set_env(IN_STAGEHAND_ENV, "1");
    set_env(SPAWN_WORK_DIR_ENV, &work_dir.to_string_lossy());
    dump_envvars(&layout);
    dump_ulimits(&layout);
    dump_user_info(&layout);

    let args = match SpawnArgs::load(&layout.args_json()) {
        Ok(args) => args,
        Err(e) => {
            // Without args.json there is no configuration to report with;
            // stderr is all we have. The parent sees the exit.
            eprintln!("Error: {e}");
            return 1;
        }
    };

    let result = match phase {
        SetupPhase::Before => phase_before(&layout, &args),
        SetupPhase::After => phase_after(&layout, &args),
    };
    match result {
        Ok(never) => match never {},
        Err(failure) => {
            failure.write(&layout);
            1
        }
    }
}

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

fn phase_before(layout: &WorkDirLayout, args: &SpawnArgs) -> Result<Infallible, SetupFailure> {
    let begun = Instant::now();
    let step = JourneyStep::SpawnEnvSetupperBeforeShell;
    write_step_state(layout, step, JourneyStepState::InProgress);

    set_default_envvars(args);
    dump_envvars(layout);

    let switching = args.user.is_some() && Uid::effective().is_root();
    let (shell, user_entry) = if switching {
        let user_entry = resolve_user_entry(args, step)?;
        let shell = user_entry
            .as_ref()
            .map(|u| u.shell.clone())
            .unwrap_or_else(|| PathBuf::from("/bin/sh"));
        (shell, user_entry)
    } else {
        (system::current_user_shell(), None)
    };

    if apply_fd_ulimit(args) {
        dump_ulimits(layout);
    }

    if switching {
        if let Some(user) = &user_entry {
            if let Err(message) = jail::enter_jail_for_user(&user.name) {
                return Err(SetupFailure::new(
                    step,
                    ErrorCategory::InternalError,
                    format!("Failed to enter the resource jail: {message}"),
                ));
            }
        }
        switch_group(args, user_entry.as_ref(), step)?;
        dump_user_info(layout);
        switch_user(args, user_entry.as_ref(), step)?;
        dump_envvars(layout);
        dump_user_info(layout);
    }

    enter_app_root(args, step)?;
    dump_envvars(layout);

    write_step_state(layout, step, JourneyStepState::Performed);
    write_step_duration(layout, step, begun);

    // The --after phase runs either under the user's login shell (so its
    // startup scripts contribute environment) or directly.
    let agent = &args.stagehand_agent_path;
    let work_dir = layout.root();
    if should_load_shell_envvars(args, &shell) {
        write_step_state(layout, JourneyStep::OsShell, JourneyStepState::InProgress);
        let error = Command::new(&shell)
            .arg("-lc")
            .arg("exec \"$@\"")
            .arg("StagehandEnvSetupperShell")
            .arg(agent)
            .arg("spawn-env-setupper")
            .arg(work_dir)
            .arg("--after")
            .exec();
        Err(SetupFailure::new(
            JourneyStep::OsShell,
            ErrorCategory::OperatingSystemError,
            format!(
                "Unable to execute the login shell {}: {error}",
                shell.display()
            ),
        ))
    } else {
        let error = Command::new(agent)
            .arg("spawn-env-setupper")
            .arg(work_dir)
            .arg("--after")
            .exec();
        Err(SetupFailure::new(
            step,
            ErrorCategory::OperatingSystemError,
            format!("Unable to execute {}: {error}", agent.display()),
        ))
    }
}

fn phase_after(layout: &WorkDirLayout, args: &SpawnArgs) -> Result<Infallible, SetupFailure> {
    let begun = Instant::now();
    let step = JourneyStep::SpawnEnvSetupperAfterShell;

    // If we got here through the login shell, the shell leg is done.
    if step_state(layout, JourneyStep::OsShell) == Some(JourneyStepState::InProgress) {
        write_step_state(layout, JourneyStep::OsShell, JourneyStepState::Performed);
    }
    write_step_state(layout, step, JourneyStepState::InProgress);
    dump_envvars(layout);

    // Login shell scripts may have changed the working directory and
    // overridden environment defaults; restore both.
    enter_app_root(args, step)?;
    set_default_envvars(args);
    for (key, value) in &args.environment_variables {
        set_env(key, value);
    }
    dump_envvars(layout);

    write_step_state(layout, step, JourneyStepState::Performed);
    write_step_duration(layout, step, begun);

    let next_step = if args.starts_using_wrapper {
        JourneyStep::ExecWrapper
    } else {
        JourneyStep::AppLoadOrExec
    };
    write_step_state(layout, next_step, JourneyStepState::InProgress);

    let error = Command::new("/bin/sh")
        .arg("-c")
        .arg(&args.start_command)
        .exec();
    Err(SetupFailure::new(
        next_step,
        ErrorCategory::OperatingSystemError,
        format!(
            "Unable to execute command '/bin/sh -c {}': {error}",
            args.start_command
        ),
    ))
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// The setupper is the sole thread of a freshly exec'd process, which is
/// the one situation where mutating the process environment is sound.
fn set_env(key: &str, value: &str) {
    unsafe { std::env::set_var(key, value) };
}

fn unset_env(key: &str) {
    unsafe { std::env::remove_var(key) };
}

fn set_default_envvars(args: &SpawnArgs) {
    set_env("PYTHONUNBUFFERED", "1");
    set_env("NODE_PATH", &args.node_libdir.to_string_lossy());

    set_env("RAILS_ENV", &args.app_env);
    set_env("RACK_ENV", &args.app_env);
    set_env("WSGI_ENV", &args.app_env);
    set_env("NODE_ENV", &args.app_env);
    set_env("STAGEHAND_APP_ENV", &args.app_env);

    if let Some(port) = args.expected_start_port {
        set_env("PORT", &port.to_string());
    }

    if args.base_uri != "/" {
        set_env("RAILS_RELATIVE_URL_ROOT", &args.base_uri);
        set_env("RACK_BASE_URI", &args.base_uri);
        set_env("STAGEHAND_BASE_URI", &args.base_uri);
    } else {
        unset_env("RAILS_RELATIVE_URL_ROOT");
        unset_env("RACK_BASE_URI");
        unset_env("STAGEHAND_BASE_URI");
    }
}

/// Whether the `--after` phase should be reached through a login shell.
/// Only shells whose `-lc` behavior is known to be sane are eligible.
fn should_load_shell_envvars(args: &SpawnArgs, shell: &Path) -> bool {
    if !args.load_shell_envvars {
        return false;
    }
    matches!(
        shell.file_name().and_then(|n| n.to_str()),
        Some("bash") | Some("zsh") | Some("ksh")
    )
}

// ---------------------------------------------------------------------------
// Identity transition
// ---------------------------------------------------------------------------

/// Re-resolves the configured user inside the child. Numeric-looking names
/// that miss the user database fall back to the raw id with a warning,
/// like the parent-side resolution.
fn resolve_user_entry(args: &SpawnArgs, step: JourneyStep) -> Result<Option<User>, SetupFailure> {
    let name = args.user.as_deref().expect("caller checked user presence");
    match system::lookup_user(name) {
        Ok(Some(user)) => Ok(Some(user)),
        lookup_result => {
            if name.parse::<u32>().is_ok() {
                eprintln!(
                    "Warning: user {name:?} not found in the system user database, \
                     using the numeric id"
                );
                Ok(None)
            } else {
                let detail = match lookup_result {
                    Err(errno) => errno.to_string(),
                    _ => "no such entry".to_string(),
                };
                Err(SetupFailure::new(
                    step,
                    ErrorCategory::FileSystemError,
                    format!(
                        "Cannot lookup system user database entry for user {name:?}: {detail}"
                    ),
                ))
            }
        }
    }
}

fn target_ids(args: &SpawnArgs, user_entry: Option<&User>) -> (Uid, Gid) {
    match user_entry {
        Some(user) => (user.uid, Gid::from_raw(args.gid)),
        None => (Uid::from_raw(args.uid), Gid::from_raw(args.gid)),
    }
}

fn switch_group(
    args: &SpawnArgs,
    user_entry: Option<&User>,
    step: JourneyStep,
) -> Result<(), SetupFailure> {
    let (_, gid) = target_ids(args, user_entry);

    if let Some(user) = user_entry {
        let name = CString::new(user.name.as_str()).map_err(|_| {
            SetupFailure::new(
                step,
                ErrorCategory::InternalError,
                format!("user name {:?} contains a NUL byte", user.name),
            )
        })?;

        let groups = nix::unistd::getgrouplist(&name, gid).map_err(|errno| {
            SetupFailure::new(
                step,
                ErrorCategory::OperatingSystemError,
                format!("getgrouplist({}, {gid}) failed: {errno}", user.name),
            )
        })?;

        // setgroups takes at most NGROUPS_MAX entries; very long group
        // lists go through initgroups, which applies the limit itself.
        let max_groups = nix::unistd::sysconf(nix::unistd::SysconfVar::NGROUPS_MAX)
            .ok()
            .flatten()
            .unwrap_or(65536) as usize;
        if groups.len() <= max_groups {
            nix::unistd::setgroups(&groups).map_err(|errno| {
                SetupFailure::new(
                    step,
                    ErrorCategory::OperatingSystemError,
                    format!("setgroups({}, ...) failed: {errno}", groups.len()),
                )
            })?;
        } else {
            nix::unistd::initgroups(&name, gid).map_err(|errno| {
                SetupFailure::new(
                    step,
                    ErrorCategory::OperatingSystemError,
                    format!("initgroups({}, {gid}) failed: {errno}", user.name),
                )
            })?;
        }
    }

    nix::unistd::setgid(gid).map_err(|errno| {
        SetupFailure::new(
            step,
            ErrorCategory::OperatingSystemError,
            format!("setgid({gid}) failed: {errno}"),
        )
    })?;
    Ok(())
}

fn switch_user(
    args: &SpawnArgs,
    user_entry: Option<&User>,
    step: JourneyStep,
) -> Result<(), SetupFailure> {
    let (uid, _) = target_ids(args, user_entry);
    nix::unistd::setuid(uid).map_err(|errno| {
        SetupFailure::new(
            step,
            ErrorCategory::OperatingSystemError,
            format!("setuid({uid}) failed: {errno}"),
        )
    })?;

    match user_entry {
        Some(user) => {
            set_env("USER", &user.name);
            set_env("LOGNAME", &user.name);
            set_env("SHELL", &user.shell.to_string_lossy());
            set_env("HOME", &user.dir.to_string_lossy());
        }
        None => {
            unset_env("USER");
            unset_env("LOGNAME");
            unset_env("SHELL");
            unset_env("HOME");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Working directory
// ---------------------------------------------------------------------------

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Every ancestor of `path`, from the root down to `path` itself.
fn ancestor_chain(path: &Path) -> Vec<PathBuf> {
    let mut chain: Vec<PathBuf> = path.ancestors().map(Path::to_path_buf).collect();
    chain.reverse();
    // Skip the bare root: stat'ing "/" never tells us anything useful.
    chain.retain(|p| p != Path::new("/"));
    chain
}

/// Validates that the post-switch identity can reach the app root, then
/// chdirs into it and exports the logical (unresolved) path as `PWD`.
fn enter_app_root(args: &SpawnArgs, step: JourneyStep) -> Result<(), SetupFailure> {
    let app_root = absolutize(&args.app_root);
    let user = system::current_user_name();
    let group = system::group_name(nix::unistd::Gid::effective().as_raw());

    for dir in ancestor_chain(&app_root) {
        match std::fs::metadata(&dir) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                let parent = dir
                    .parent()
                    .unwrap_or(Path::new("/"))
                    .to_string_lossy()
                    .into_owned();
                return Err(SetupFailure::new(
                    step,
                    ErrorCategory::FileSystemError,
                    format!(
                        "Directory '{parent}' is inaccessible because of a filesystem \
                         permission error."
                    ),
                )
                .with_problem_html(format!(
                    "<p>The Stagehand application server tried to start the web \
                     application as user '{user}' and group '{group}'. During this \
                     process, Stagehand must be able to access its application root \
                     directory '{}'. However, the parent directory '{parent}' has wrong \
                     permissions, thereby preventing this process from accessing its \
                     application root directory.</p>",
                    app_root.display()
                ))
                .with_solution_html(format!(
                    "<p class=\"sole-solution\">Please fix the permissions of the \
                     directory '{parent}' in such a way that the directory is accessible \
                     by user '{user}' and group '{group}'.</p>"
                )));
            }
            Err(e) => {
                return Err(SetupFailure::new(
                    step,
                    ErrorCategory::OperatingSystemError,
                    format!("Unable to stat() directory '{}': {e}", dir.display()),
                ));
            }
        }
    }

    if let Err(errno) = nix::unistd::chdir(&app_root) {
        let permission = matches!(errno, nix::errno::Errno::EACCES | nix::errno::Errno::EPERM);
        let flavor = if permission {
            "filesystem permission error"
        } else {
            "filesystem error"
        };
        return Err(SetupFailure::new(
            step,
            ErrorCategory::OperatingSystemError,
            format!(
                "Unable to change working directory to '{}': {errno}",
                app_root.display()
            ),
        )
        .with_problem_html(format!(
            "<p>The Stagehand application server tried to start the web application \
             as user '{user}' and group '{group}', with a working directory of '{}'. \
             However, it encountered a {flavor} while doing this.</p>",
            app_root.display()
        )));
    }

    // The app root may contain symlinks. getcwd() would hand the app the
    // resolved path; the logical path is an illusion shells maintain via
    // PWD, so maintain it the same way.
    set_env("PWD", &app_root.to_string_lossy());
    Ok(())
}

// ---------------------------------------------------------------------------
// Ulimits
// ---------------------------------------------------------------------------

/// Applies the configured file descriptor limit. A failure is reported on
/// stderr but does not abort the spawn.
fn apply_fd_ulimit(args: &SpawnArgs) -> bool {
    let Some(limit) = args.file_descriptor_ulimit else {
        return false;
    };
    let rlim = libc::rlimit {
        rlim_cur: limit as libc::rlim_t,
        rlim_max: limit as libc::rlim_t,
    };
    loop {
        let ret = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) };
        if ret == 0 {
            return true;
        }
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            continue;
        }
        eprintln!("Error: unable to set file descriptor ulimit to {limit}: {err}");
        return false;
    }
}

// ---------------------------------------------------------------------------
// Work directory bookkeeping
// ---------------------------------------------------------------------------

fn step_state(layout: &WorkDirLayout, step: JourneyStep) -> Option<JourneyStepState> {
    let raw = std::fs::read_to_string(layout.step_state_file(step)).ok()?;
    JourneyStepState::from_name(raw.trim())
}

/// Replaces a file instead of overwriting it in place. Files written
/// before the privilege drop belong to the old identity; the directories
/// are ours after the drop, so unlink-and-create always works.
fn replace_file(path: &std::path::Path, contents: &str) -> std::io::Result<()> {
    let _ = std::fs::remove_file(path);
    std::fs::write(path, contents)
}

fn write_step_state(layout: &WorkDirLayout, step: JourneyStep, state: JourneyStepState) {
    let dir = layout.step_dir(step);
    let result = std::fs::create_dir_all(&dir)
        .and_then(|_| replace_file(&layout.step_state_file(step), state.as_str()));
    if let Err(e) = result {
        eprintln!(
            "Warning: unable to write step state {} for {}: {e}",
            state.as_str(),
            step.as_str()
        );
    }
}

fn write_step_duration(layout: &WorkDirLayout, step: JourneyStep, begun: Instant) {
    let usec = begun.elapsed().as_micros() as u64;
    if let Err(e) = replace_file(&layout.step_duration_file(step), &usec.to_string()) {
        eprintln!(
            "Warning: unable to write step duration for {}: {e}",
            step.as_str()
        );
    }
}

fn dump_envvars(layout: &WorkDirLayout) {
    let _ = replace_file(&layout.envdump_envvars(), &system::environment_dump());
}

fn dump_ulimits(layout: &WorkDirLayout) {
    let _ = replace_file(&layout.envdump_ulimits(), &system::capture_ulimits());
}

fn dump_user_info(layout: &WorkDirLayout) {
    let _ = replace_file(&layout.envdump_user_info(), &system::capture_user_info());
}

// ---------------------------------------------------------------------------
// Failure reporting
// ---------------------------------------------------------------------------

/// A fatal setup failure on its way into the work directory.
#[derive(Debug)]
struct SetupFailure {
    step: JourneyStep,
    category: ErrorCategory,
    summary: String,
    problem_html: Option<String>,
    solution_html: Option<String>,
}

impl SetupFailure {
    fn new(step: JourneyStep, category: ErrorCategory, summary: impl Into<String>) -> Self {
        SetupFailure {
            step,
            category,
            summary: summary.into(),
            problem_html: None,
            solution_html: None,
        }
    }

    fn with_problem_html(mut self, html: impl Into<String>) -> Self {
        self.problem_html = Some(html.into());
        self
    }

    fn with_solution_html(mut self, html: impl Into<String>) -> Self {
        self.solution_html = Some(html.into());
        self
    }

    /// Writes the failure into `response/error/` and marks the step
    /// errored. Also echoes the summary to stderr, which the parent's
    /// output capturer picks up.
    fn write(&self, layout: &WorkDirLayout) {
        eprintln!("Error: {}", self.summary);
        let _ = std::io::stderr().flush();

        let write_file = |path: std::path::PathBuf, contents: &str| {
            if let Err(e) = std::fs::create_dir_all(path.parent().unwrap_or(Path::new("/")))
                .and_then(|_| replace_file(&path, contents))
            {
                eprintln!("Warning: unable to create {}: {e}", path.display());
            }
        };

        write_file(layout.error_summary(), &self.summary);
        write_file(layout.error_category(), self.category.as_str());
        if let Some(problem) = &self.problem_html {
            write_file(layout.error_problem_description_html(), problem);
        }
        if let Some(solution) = &self.solution_html {
            write_file(layout.error_solution_description_html(), solution);
        }
        write_step_state(layout, self.step, JourneyStepState::Errored);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_with(shell_loading: bool) -> SpawnArgs {
        SpawnArgs {
            stagehand_root: "/opt/stagehand".into(),
            stagehand_agent_path: "/opt/stagehand/bin/stagehand-agent".into(),
            app_root: "/srv/app".into(),
            app_type: "rack".into(),
            app_env: "staging".into(),
            start_command: "./start.sh".into(),
            startup_file: None,
            user: None,
            group: None,
            uid: 1000,
            gid: 1000,
            shell: "/bin/bash".into(),
            home: "/home/app".into(),
            environment_variables: Default::default(),
            load_shell_envvars: shell_loading,
            file_descriptor_ulimit: None,
            expected_start_port: Some(5123),
            node_libdir: "/opt/stagehand/support/node".into(),
            base_uri: "/".into(),
            log_level: "info".into(),
            starts_using_wrapper: false,
        }
    }

    #[test]
    fn shell_loading_requires_flag_and_known_shell() {
        let args = args_with(true);
        assert!(should_load_shell_envvars(&args, Path::new("/bin/bash")));
        assert!(should_load_shell_envvars(&args, Path::new("/usr/bin/zsh")));
        assert!(!should_load_shell_envvars(&args, Path::new("/bin/fish")));
        assert!(!should_load_shell_envvars(&args, Path::new("/bin/sh")));
        let args = args_with(false);
        assert!(!should_load_shell_envvars(&args, Path::new("/bin/bash")));
    }

    #[test]
    fn ancestor_chain_walks_root_to_leaf() {
        let chain = ancestor_chain(Path::new("/srv/apps/demo"));
        assert_eq!(
            chain,
            vec![
                PathBuf::from("/srv"),
                PathBuf::from("/srv/apps"),
                PathBuf::from("/srv/apps/demo"),
            ]
        );
    }

    #[test]
    fn default_envvars_cover_the_runtime_conventions() {
        set_default_envvars(&args_with(false));
        assert_eq!(std::env::var("STAGEHAND_APP_ENV").unwrap(), "staging");
        assert_eq!(std::env::var("RAILS_ENV").unwrap(), "staging");
        assert_eq!(std::env::var("PYTHONUNBUFFERED").unwrap(), "1");
        assert_eq!(std::env::var("PORT").unwrap(), "5123");
        // Root base URI clears the relative-root variables.
        assert!(std::env::var("STAGEHAND_BASE_URI").is_err());

        let mut args = args_with(false);
        args.base_uri = "/subapp".into();
        set_default_envvars(&args);
        assert_eq!(std::env::var("STAGEHAND_BASE_URI").unwrap(), "/subapp");
        assert_eq!(std::env::var("RAILS_RELATIVE_URL_ROOT").unwrap(), "/subapp");
    }

    #[test]
    fn failure_write_populates_the_error_files() {
        let dir = tempfile::tempdir().unwrap();
        let layout = WorkDirLayout::new(dir.path());
        std::fs::create_dir_all(layout.error_dir()).unwrap();
        std::fs::create_dir_all(layout.steps_dir()).unwrap();

        SetupFailure::new(
            JourneyStep::SpawnEnvSetupperBeforeShell,
            ErrorCategory::FileSystemError,
            "cannot reach the app root",
        )
        .with_solution_html("<p>fix it</p>")
        .write(&layout);

        assert_eq!(
            std::fs::read_to_string(layout.error_summary()).unwrap(),
            "cannot reach the app root"
        );
        assert_eq!(
            std::fs::read_to_string(layout.error_category()).unwrap(),
            "FILE_SYSTEM_ERROR"
        );
        assert_eq!(
            std::fs::read_to_string(
                layout.step_state_file(JourneyStep::SpawnEnvSetupperBeforeShell)
            )
            .unwrap(),
            "ERRORED"
        );
        assert!(!layout.error_problem_description_html().exists());
    }

    #[test]
    fn step_state_round_trips_through_the_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let layout = WorkDirLayout::new(dir.path());
        write_step_state(&layout, JourneyStep::OsShell, JourneyStepState::InProgress);
        assert_eq!(
            step_state(&layout, JourneyStep::OsShell),
            Some(JourneyStepState::InProgress)
        );
    }
}
