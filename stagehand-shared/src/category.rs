//! The closed error taxonomy of the spawner.
//!
//! Every spawn failure is filed under exactly one of these categories. The
//! category decides which default problem/solution text a diagnostic report
//! gets, and it is the only piece of classification the child communicates
//! back to the parent (as a string in `response/error/category`).

use serde::{Deserialize, Serialize};

/// Category of a spawn failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// A bug or unexplainable condition inside Stagehand or a helper tool.
    InternalError,
    /// Missing files/directories or filesystem permission problems.
    FileSystemError,
    /// A syscall failure that is not better explained as I/O or filesystem.
    OperatingSystemError,
    /// A failure on a communication channel (pipe, socket, FIFO).
    IoError,
    /// The startup journey did not finish within the configured time budget.
    TimeoutError,
    /// Placeholder for an unclassified failure. Never attached to a report.
    UnknownErrorCategory,
}

impl ErrorCategory {
    /// Canonical string form, bijective with [`ErrorCategory::from_name`].
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::InternalError => "INTERNAL_ERROR",
            ErrorCategory::FileSystemError => "FILE_SYSTEM_ERROR",
            ErrorCategory::OperatingSystemError => "OPERATING_SYSTEM_ERROR",
            ErrorCategory::IoError => "IO_ERROR",
            ErrorCategory::TimeoutError => "TIMEOUT_ERROR",
            ErrorCategory::UnknownErrorCategory => "UNKNOWN_ERROR_CATEGORY",
        }
    }

    /// Parses the canonical string form.
    pub fn from_name(name: &str) -> Option<ErrorCategory> {
        match name {
            "INTERNAL_ERROR" => Some(ErrorCategory::InternalError),
            "FILE_SYSTEM_ERROR" => Some(ErrorCategory::FileSystemError),
            "OPERATING_SYSTEM_ERROR" => Some(ErrorCategory::OperatingSystemError),
            "IO_ERROR" => Some(ErrorCategory::IoError),
            "TIMEOUT_ERROR" => Some(ErrorCategory::TimeoutError),
            "UNKNOWN_ERROR_CATEGORY" => Some(ErrorCategory::UnknownErrorCategory),
            _ => None,
        }
    }

    /// English phrase with an indefinite article, e.g. "an internal error".
    ///
    /// `begin_of_sentence` capitalizes the article.
    pub fn phrase_with_article(&self, begin_of_sentence: bool) -> &'static str {
        match (self, begin_of_sentence) {
            (ErrorCategory::InternalError, true) => "An internal error",
            (ErrorCategory::InternalError, false) => "an internal error",
            (ErrorCategory::FileSystemError, true) => "A file system error",
            (ErrorCategory::FileSystemError, false) => "a file system error",
            (ErrorCategory::OperatingSystemError, true) => "An operating system error",
            (ErrorCategory::OperatingSystemError, false) => "an operating system error",
            (ErrorCategory::IoError, true) => "An I/O error",
            (ErrorCategory::IoError, false) => "an I/O error",
            (ErrorCategory::TimeoutError, true) => "A timeout error",
            (ErrorCategory::TimeoutError, false) => "a timeout error",
            (ErrorCategory::UnknownErrorCategory, true) => "An error",
            (ErrorCategory::UnknownErrorCategory, false) => "an error",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: &[ErrorCategory] = &[
        ErrorCategory::InternalError,
        ErrorCategory::FileSystemError,
        ErrorCategory::OperatingSystemError,
        ErrorCategory::IoError,
        ErrorCategory::TimeoutError,
        ErrorCategory::UnknownErrorCategory,
    ];

    #[test]
    fn name_round_trip_is_bijective() {
        for category in ALL {
            assert_eq!(ErrorCategory::from_name(category.as_str()), Some(*category));
        }
        assert_eq!(ErrorCategory::from_name("NOT_A_CATEGORY"), None);
    }

    #[test]
    fn phrases_start_with_article() {
        for category in ALL {
            assert!(category.phrase_with_article(false).starts_with(['a', 'A']));
        }
    }
}
