//! Parent-side spawn preparation.
//!
//! Everything that must be true before the fork happens here: the identity
//! the child will assume is resolved, an expected listen port is allocated
//! when readiness will be probed, the code revision is inferred, and the
//! work directory with its `args.json` bundle is laid out. Failures are
//! charged to the `PREPARATION` journey step.

use std::collections::BTreeMap;
use std::io;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime};

use stagehand_shared::args::SpawnArgs;
use stagehand_shared::journey::{Journey, JourneyStep, JourneyType};

use crate::config::Config;
use crate::context::Context;
use crate::report::{Failure, SpawnError, SpawnResult};
use crate::system;
use crate::workdir::WorkDir;

/// Identity and account details the child will assume.
#[derive(Debug)]
struct UserSwitching {
    user: Option<String>,
    group: Option<String>,
    uid: u32,
    gid: u32,
    home: PathBuf,
    shell: PathBuf,
}

/// Runs the preparation phase and produces a ready-to-fork session.
pub(crate) fn prepare(
    ctx: &Context,
    config: Config,
    journey_type: JourneyType,
) -> SpawnResult<super::session::HandshakeSession> {
    let mut journey = Journey::new(journey_type, config.starts_using_wrapper);
    let begun = Instant::now();
    journey
        .set_in_progress(JourneyStep::Preparation)
        .expect("fresh journey accepts the first step");

    match prepare_inner(ctx, &config, journey_type) {
        Ok((work_dir, switching, expected_start_port, code_revision)) => {
            journey
                .set_performed(JourneyStep::Preparation)
                .expect("in-progress step can be performed");
            let timeout_usec = config.start_timeout_msec.saturating_mul(1_000);
            tracing::debug!(
                app_root = %config.app_root,
                work_dir = %work_dir.path().display(),
                uid = switching.uid,
                port = ?expected_start_port,
                elapsed_usec = begun.elapsed().as_micros() as u64,
                "spawn preparation done"
            );
            Ok(super::session::HandshakeSession {
                config,
                journey,
                work_dir,
                uid: switching.uid,
                gid: switching.gid,
                expected_start_port,
                timeout_usec,
                gupid: uuid::Uuid::new_v4().simple().to_string(),
                spawn_start_time: SystemTime::now(),
                spawn_start_time_monotonic: Instant::now(),
                code_revision,
            })
        }
        Err(failure) => {
            journey
                .set_errored(JourneyStep::Preparation, false)
                .expect("in-progress step can error");
            Err(Box::new(SpawnError::from_failure(
                &failure, &journey, &config,
            )))
        }
    }
}

#[allow(clippy::type_complexity)]
fn prepare_inner(
    ctx: &Context,
    config: &Config,
    journey_type: JourneyType,
) -> Result<(WorkDir, UserSwitching, Option<u16>, Option<String>), Failure> {
    let switching = resolve_user_switching(config)?;
    let expected_start_port = resolve_expected_start_port(config)?;
    let code_revision = config
        .code_revision
        .clone()
        .or_else(|| infer_code_revision(Path::new(&config.app_root)));

    let smart = journey_type == JourneyType::SpawnThroughPreloader;
    let work_dir = WorkDir::create(&ctx.spawn_dir, smart)
        .map_err(|e| Failure::io("creating spawn work directory", e))?;
    // After the privilege drop the child still has to write its response
    // files, so the tree must belong to the target identity.
    if nix::unistd::Uid::effective().is_root() && switching.user.is_some() {
        work_dir
            .grant_to(switching.uid, switching.gid)
            .map_err(|e| Failure::io("granting the work directory to the application user", e))?;
    }

    write_args_json(ctx, config, &work_dir, &switching, expected_start_port)?;

    Ok((work_dir, switching, expected_start_port, code_revision))
}

/// Resolves the configured user/group to concrete ids and account details.
///
/// A configured name that is missing from the user database is accepted
/// when it looks like a number (the numeric id is used as-is); otherwise it
/// is a filesystem-flavored failure, since the usual cause is a missing or
/// unreadable passwd/group entry.
fn resolve_user_switching(config: &Config) -> Result<UserSwitching, Failure> {
    let Some(user_name) = &config.user else {
        // No switching: the child keeps our identity.
        return Ok(UserSwitching {
            user: None,
            group: None,
            uid: nix::unistd::Uid::effective().as_raw(),
            gid: nix::unistd::Gid::effective().as_raw(),
            home: std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/")),
            shell: system::current_user_shell(),
        });
    };

    let (uid, home, shell, default_gid) = match system::lookup_user(user_name) {
        Ok(Some(user)) => (
            user.uid.as_raw(),
            user.dir,
            user.shell,
            Some(user.gid.as_raw()),
        ),
        lookup_result => {
            let Ok(numeric) = user_name.parse::<u32>() else {
                return Err(Failure::io(
                    format!("looking up system user database entry for user {user_name:?}"),
                    lookup_error(lookup_result.err()),
                ));
            };
            tracing::warn!(
                user = %user_name,
                "user not found in the system user database, using the numeric id"
            );
            (numeric, PathBuf::from("/"), PathBuf::from("/bin/sh"), None)
        }
    };

    let gid = match &config.group {
        Some(group_name) => match system::lookup_group(group_name) {
            Ok(Some(group)) => group.gid.as_raw(),
            lookup_result => {
                let Ok(numeric) = group_name.parse::<u32>() else {
                    return Err(Failure::io(
                        format!("looking up system group database entry for group {group_name:?}"),
                        lookup_error(lookup_result.err()),
                    ));
                };
                tracing::warn!(
                    group = %group_name,
                    "group not found in the system group database, using the numeric id"
                );
                numeric
            }
        },
        None => default_gid.unwrap_or_else(|| nix::unistd::Gid::effective().as_raw()),
    };

    Ok(UserSwitching {
        user: Some(user_name.clone()),
        group: config.group.clone(),
        uid,
        gid,
        home,
        shell,
    })
}

fn lookup_error(errno: Option<nix::errno::Errno>) -> io::Error {
    match errno {
        Some(errno) => io::Error::from(errno),
        None => io::Error::new(io::ErrorKind::NotFound, "no such entry"),
    }
}

/// Allocates the port the application is expected to bind, when readiness
/// will be probed. Binding and immediately closing leaves a small window in
/// which another process can steal the port; that race is accepted.
fn resolve_expected_start_port(config: &Config) -> Result<Option<u16>, Failure> {
    if !(config.generic_app || config.find_free_port) {
        return Ok(None);
    }
    if let Some(port) = config.expected_start_port {
        return Ok(Some(port));
    }
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .map_err(|e| Failure::io("allocating a free port for the application", e))?;
    let port = listener
        .local_addr()
        .map_err(|e| Failure::io("reading back the allocated port", e))?
        .port();
    drop(listener);
    Ok(Some(port))
}

/// Infers the deployed code revision from the application root.
///
/// A `REVISION` file wins; otherwise an app root whose last component is a
/// `current` symlink (Capistrano-style layout) yields the symlink target's
/// basename. When both apply, the `REVISION` file is authoritative: it is
/// the deploy tool's explicit statement.
pub(crate) fn infer_code_revision(app_root: &Path) -> Option<String> {
    if let Ok(contents) = std::fs::read_to_string(app_root.join("REVISION")) {
        let first_line = contents.lines().next().unwrap_or("").trim();
        if !first_line.is_empty() {
            return Some(first_line.to_string());
        }
    }

    if app_root.file_name().is_some_and(|n| n == "current") {
        if let Ok(metadata) = std::fs::symlink_metadata(app_root) {
            if metadata.file_type().is_symlink() {
                if let Ok(target) = std::fs::read_link(app_root) {
                    if let Some(basename) = target.file_name() {
                        return Some(basename.to_string_lossy().into_owned());
                    }
                }
            }
        }
    }

    None
}

fn write_args_json(
    ctx: &Context,
    config: &Config,
    work_dir: &WorkDir,
    switching: &UserSwitching,
    expected_start_port: Option<u16>,
) -> Result<(), Failure> {
    let args = SpawnArgs {
        stagehand_root: ctx.stagehand_root.clone(),
        stagehand_agent_path: ctx.agent_path.clone(),
        app_root: PathBuf::from(&config.app_root),
        app_type: config.app_type.clone(),
        app_env: config.app_env.clone(),
        start_command: config.start_command.clone(),
        startup_file: config.startup_file.clone(),
        user: switching.user.clone(),
        group: switching.group.clone(),
        uid: switching.uid,
        gid: switching.gid,
        shell: switching.shell.clone(),
        home: switching.home.clone(),
        environment_variables: config
            .environment_variables
            .iter()
            .cloned()
            .collect::<BTreeMap<String, String>>(),
        load_shell_envvars: config.load_shell_envvars,
        file_descriptor_ulimit: config.file_descriptor_ulimit,
        expected_start_port,
        node_libdir: ctx.node_libdir.clone(),
        base_uri: config.base_uri.clone(),
        log_level: config.log_level.clone(),
        starts_using_wrapper: config.starts_using_wrapper,
    };
    let json = serde_json::to_string_pretty(&args)
        .map_err(|e| Failure::Internal(format!("serializing args.json: {e}")))?;
    std::fs::write(work_dir.layout().args_json(), json)
        .map_err(|e| Failure::io("writing args.json", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_shared::category::ErrorCategory;

    fn test_context(base: &Path) -> Context {
        // Any existing file works as the "agent" for preparation purposes.
        Context::new(base.join("install"))
            .with_agent_path("/bin/sh")
            .with_spawn_dir(base.to_path_buf())
    }

    fn test_config() -> Config {
        Config {
            app_root: "/srv/app".into(),
            start_command: "./start.sh".into(),
            ..Config::default()
        }
    }

    #[test]
    fn prepare_marks_preparation_performed_and_writes_args() {
        let base = tempfile::tempdir().unwrap();
        let ctx = test_context(base.path());
        let session = prepare(&ctx, test_config(), JourneyType::SpawnDirectly).unwrap();

        assert_eq!(
            session.journey.state_of(JourneyStep::Preparation),
            Some(stagehand_shared::journey::JourneyStepState::Performed)
        );
        assert!(session.timeout_usec > 0);
        assert!(!session.gupid.is_empty());

        let args = SpawnArgs::load(&session.work_dir.layout().args_json()).unwrap();
        assert_eq!(args.app_root, PathBuf::from("/srv/app"));
        assert_eq!(args.uid, nix::unistd::Uid::effective().as_raw());
        assert_eq!(args.stagehand_agent_path, PathBuf::from("/bin/sh"));
    }

    #[test]
    fn generic_app_gets_a_port_allocated() {
        let base = tempfile::tempdir().unwrap();
        let ctx = test_context(base.path());
        let config = Config {
            generic_app: true,
            ..test_config()
        };
        let session = prepare(&ctx, config, JourneyType::SpawnDirectly).unwrap();
        assert!(session.expected_start_port.is_some());
    }

    #[test]
    fn preconfigured_port_is_respected() {
        let base = tempfile::tempdir().unwrap();
        let ctx = test_context(base.path());
        let config = Config {
            generic_app: true,
            expected_start_port: Some(45678),
            ..test_config()
        };
        let session = prepare(&ctx, config, JourneyType::SpawnDirectly).unwrap();
        assert_eq!(session.expected_start_port, Some(45678));
    }

    #[test]
    fn missing_named_user_fails_preparation_as_filesystem_error() {
        let base = tempfile::tempdir().unwrap();
        let ctx = test_context(base.path());
        let config = Config {
            user: Some("no-such-user-snozzberry".into()),
            ..test_config()
        };
        let err = prepare(&ctx, config, JourneyType::SpawnDirectly).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::FileSystemError);
        assert_eq!(err.first_failed_step(), Some(JourneyStep::Preparation));
    }

    #[test]
    fn numeric_user_falls_back_to_the_raw_id() {
        let base = tempfile::tempdir().unwrap();
        let ctx = test_context(base.path());
        let config = Config {
            user: Some("54321".into()),
            group: Some("54321".into()),
            ..test_config()
        };
        // 54321 is unlikely to be a real account; the numeric fallback
        // must kick in either way.
        let session = prepare(&ctx, config, JourneyType::SpawnDirectly).unwrap();
        assert_eq!(session.uid, 54321);
        assert_eq!(session.gid, 54321);
    }

    #[test]
    fn revision_file_wins_over_current_symlink() {
        let base = tempfile::tempdir().unwrap();
        // Layout: releases/today plus current -> releases/today, and a
        // REVISION file inside the release.
        let release = base.path().join("releases").join("today");
        std::fs::create_dir_all(&release).unwrap();
        let current = base.path().join("current");
        std::os::unix::fs::symlink(&release, &current).unwrap();

        assert_eq!(
            infer_code_revision(&current).as_deref(),
            Some("today"),
            "symlink basename applies without a REVISION file"
        );

        std::fs::write(release.join("REVISION"), "hello\n").unwrap();
        assert_eq!(
            infer_code_revision(&current).as_deref(),
            Some("hello"),
            "an explicit REVISION file beats the symlink rule"
        );
    }

    #[test]
    fn no_revision_sources_means_none() {
        let base = tempfile::tempdir().unwrap();
        assert_eq!(infer_code_revision(base.path()), None);
    }
}
