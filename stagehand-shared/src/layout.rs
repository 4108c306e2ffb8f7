//! On-disk layout of a spawn work directory.
//!
//! The work directory is the only channel between the spawner and the child
//! until the child is ready to serve. Every path below is addressed through
//! this type so that the parent-side spawner and the in-child agent can never
//! disagree about where a file lives.
//!
//! ```text
//! stagehand.spawn.<id>/
//!   args.json                  parent -> child argument bundle
//!   response/                  child -> parent outputs
//!     properties.json
//!     finish                   FIFO: '1' ready, anything else error
//!     stdin, stdout_and_err    FIFOs (preloader-spawned workers only)
//!     steps/<STEP>/state
//!     steps/<STEP>/duration
//!     error/...
//!   envdump/
//!     envvars, ulimits, user_info
//!     annotations/<key>
//! ```

use std::path::{Path, PathBuf};

use crate::journey::JourneyStep;

/// Path helpers rooted at one spawn work directory.
#[derive(Debug, Clone)]
pub struct WorkDirLayout {
    root: PathBuf,
}

impl WorkDirLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        WorkDirLayout { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn args_json(&self) -> PathBuf {
        self.root.join("args.json")
    }

    pub fn response_dir(&self) -> PathBuf {
        self.root.join("response")
    }

    pub fn properties_json(&self) -> PathBuf {
        self.response_dir().join("properties.json")
    }

    pub fn finish_fifo(&self) -> PathBuf {
        self.response_dir().join("finish")
    }

    pub fn stdin_fifo(&self) -> PathBuf {
        self.response_dir().join("stdin")
    }

    pub fn stdout_and_err_fifo(&self) -> PathBuf {
        self.response_dir().join("stdout_and_err")
    }

    pub fn steps_dir(&self) -> PathBuf {
        self.response_dir().join("steps")
    }

    pub fn step_dir(&self, step: JourneyStep) -> PathBuf {
        self.steps_dir().join(step.as_str())
    }

    pub fn step_state_file(&self, step: JourneyStep) -> PathBuf {
        self.step_dir(step).join("state")
    }

    pub fn step_duration_file(&self, step: JourneyStep) -> PathBuf {
        self.step_dir(step).join("duration")
    }

    pub fn error_dir(&self) -> PathBuf {
        self.response_dir().join("error")
    }

    pub fn error_summary(&self) -> PathBuf {
        self.error_dir().join("summary")
    }

    pub fn error_category(&self) -> PathBuf {
        self.error_dir().join("category")
    }

    pub fn error_problem_description_html(&self) -> PathBuf {
        self.error_dir().join("problem_description.html")
    }

    pub fn error_problem_description_txt(&self) -> PathBuf {
        self.error_dir().join("problem_description.txt")
    }

    pub fn error_solution_description_html(&self) -> PathBuf {
        self.error_dir().join("solution_description.html")
    }

    pub fn error_solution_description_txt(&self) -> PathBuf {
        self.error_dir().join("solution_description.txt")
    }

    pub fn envdump_dir(&self) -> PathBuf {
        self.root.join("envdump")
    }

    pub fn envdump_envvars(&self) -> PathBuf {
        self.envdump_dir().join("envvars")
    }

    pub fn envdump_ulimits(&self) -> PathBuf {
        self.envdump_dir().join("ulimits")
    }

    pub fn envdump_user_info(&self) -> PathBuf {
        self.envdump_dir().join("user_info")
    }

    pub fn annotations_dir(&self) -> PathBuf {
        self.envdump_dir().join("annotations")
    }

    pub fn annotation_file(&self, key: &str) -> PathBuf {
        self.annotations_dir().join(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_rooted_at_the_work_dir() {
        let layout = WorkDirLayout::new("/tmp/stagehand.spawn.abc");
        assert_eq!(
            layout.args_json(),
            PathBuf::from("/tmp/stagehand.spawn.abc/args.json")
        );
        assert_eq!(
            layout.step_state_file(JourneyStep::OsShell),
            PathBuf::from("/tmp/stagehand.spawn.abc/response/steps/OS_SHELL/state")
        );
        assert_eq!(
            layout.annotation_file("preloader"),
            PathBuf::from("/tmp/stagehand.spawn.abc/envdump/annotations/preloader")
        );
    }
}
