//! Pure classification of low-level failures into the error taxonomy.

use std::io;

use nix::errno::Errno;

use stagehand_shared::category::ErrorCategory;
use stagehand_shared::journey::JourneyStep;

/// A low-level failure on its way to becoming a diagnostic report.
///
/// Components wrap syscall and I/O failures into this enum at their
/// boundaries; [`classify`] maps it to a category using the failed journey
/// step as context.
#[derive(Debug, thiserror::Error)]
pub(crate) enum Failure {
    /// A syscall failed with an errno.
    #[error("{context}: {errno}")]
    Syscall { context: String, errno: Errno },

    /// An I/O operation failed.
    #[error("{context}: {source}")]
    Io {
        context: String,
        source: io::Error,
    },

    /// A time budget ran out.
    #[error("{0}")]
    Timeout(String),

    /// Anything that has no external explanation.
    #[error("{0}")]
    Internal(String),
}

impl Failure {
    pub(crate) fn syscall(context: impl Into<String>, errno: Errno) -> Failure {
        Failure::Syscall {
            context: context.into(),
            errno,
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Failure {
        Failure::Io {
            context: context.into(),
            source,
        }
    }
}

/// Whether a syscall failure during this step is really a communication
/// failure with the preloader rather than a local OS problem.
fn step_makes_syscall_failure_an_io_error(step: Option<JourneyStep>) -> bool {
    matches!(
        step,
        Some(JourneyStep::ConnectToPreloader)
            | Some(JourneyStep::SendCommandToPreloader)
            | Some(JourneyStep::ReadResponseFromPreloader)
    )
}

fn errno_is_file_system_error(errno: Errno) -> bool {
    matches!(
        errno,
        Errno::ENOENT | Errno::ENAMETOOLONG | Errno::EEXIST | Errno::EACCES
    )
}

fn io_kind_is_file_system_error(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied | io::ErrorKind::AlreadyExists
    )
}

/// Maps a failure to its error category.
///
/// Rules, in order: filesystem-shaped errnos/kinds are filesystem errors;
/// syscall failures while talking to the preloader are I/O errors; other
/// syscall failures are operating system errors; other I/O failures are I/O
/// errors; timeouts are timeouts; everything else is internal.
pub(crate) fn classify(failure: &Failure, failed_step: Option<JourneyStep>) -> ErrorCategory {
    match failure {
        Failure::Syscall { errno, .. } => {
            if errno_is_file_system_error(*errno) {
                ErrorCategory::FileSystemError
            } else if step_makes_syscall_failure_an_io_error(failed_step) {
                ErrorCategory::IoError
            } else {
                ErrorCategory::OperatingSystemError
            }
        }
        Failure::Io { source, .. } => {
            if io_kind_is_file_system_error(source.kind()) {
                ErrorCategory::FileSystemError
            } else if source.kind() == io::ErrorKind::TimedOut
                || source.kind() == io::ErrorKind::WouldBlock
            {
                // Socket read/write deadlines surface as these kinds.
                ErrorCategory::TimeoutError
            } else if step_makes_syscall_failure_an_io_error(failed_step) {
                ErrorCategory::IoError
            } else if source.raw_os_error().is_some() {
                ErrorCategory::OperatingSystemError
            } else {
                ErrorCategory::IoError
            }
        }
        Failure::Timeout(_) => ErrorCategory::TimeoutError,
        Failure::Internal(_) => ErrorCategory::InternalError,
    }
}
