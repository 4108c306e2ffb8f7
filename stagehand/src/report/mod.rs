//! The diagnostic record every failed spawn produces.
//!
//! A spawn failure travels as a single typed value: [`SpawnError`]. It is a
//! plain data record; classification lives in [`classifier`] and the default
//! prose in [`templates`]. Components construct a partially filled record at
//! the failure site and the outermost caller finalizes it exactly once,
//! which fills in defaults and captures the environment. Nothing in the
//! record borrows from the work directory: the report must survive its
//! cleanup.

pub(crate) mod classifier;
pub(crate) mod templates;

use std::collections::BTreeMap;

use stagehand_shared::category::ErrorCategory;
use stagehand_shared::journey::{Journey, JourneyStep};
use stagehand_shared::layout::WorkDirLayout;

use crate::config::Config;
use crate::system;
pub(crate) use classifier::Failure;

/// Result alias used throughout the spawner.
pub type SpawnResult<T> = Result<T, Box<SpawnError>>;

/// A richly annotated spawn failure.
#[derive(Debug, Clone)]
pub struct SpawnError {
    category: ErrorCategory,
    journey: Journey,
    config: Config,

    summary: String,
    low_level_error_message: String,
    problem_description_html: String,
    solution_description_html: String,
    /// Free-form technical detail for the "advanced" section of an error
    /// page.
    advanced_problem_details: String,

    stdout_and_err_data: String,
    subprocess_envvars: String,
    subprocess_ulimits: String,
    subprocess_user_info: String,
    annotations: BTreeMap<String, String>,

    parent_envvars: String,
    parent_ulimits: String,
    system_metrics: String,

    finalized: bool,
}

impl SpawnError {
    /// Creates a report with an explicit category and summary.
    pub fn new(
        category: ErrorCategory,
        journey: &Journey,
        config: &Config,
        summary: impl Into<String>,
    ) -> SpawnError {
        SpawnError {
            category,
            journey: journey.clone(),
            config: config.clone(),
            summary: summary.into(),
            low_level_error_message: String::new(),
            problem_description_html: String::new(),
            solution_description_html: String::new(),
            advanced_problem_details: String::new(),
            stdout_and_err_data: String::new(),
            subprocess_envvars: String::new(),
            subprocess_ulimits: String::new(),
            subprocess_user_info: String::new(),
            annotations: BTreeMap::new(),
            parent_envvars: String::new(),
            parent_ulimits: String::new(),
            system_metrics: String::new(),
            finalized: false,
        }
    }

    /// Creates a report from a low-level failure: the category comes from
    /// the classifier and the summary from the default templates.
    pub(crate) fn from_failure(
        failure: &Failure,
        journey: &Journey,
        config: &Config,
    ) -> SpawnError {
        let category = classifier::classify(failure, journey.first_failed_step());
        let low_level = failure.to_string();
        let summary = templates::default_summary(category, journey, &low_level);
        let mut report = SpawnError::new(category, journey, config, summary);
        report.low_level_error_message = low_level;
        report
    }

    pub fn with_low_level_message(mut self, message: impl Into<String>) -> Self {
        self.low_level_error_message = message.into();
        self
    }

    pub fn with_problem_html(mut self, html: impl Into<String>) -> Self {
        self.problem_description_html = html.into();
        self
    }

    pub fn with_solution_html(mut self, html: impl Into<String>) -> Self {
        self.solution_description_html = html.into();
        self
    }

    pub fn with_advanced_details(mut self, details: impl Into<String>) -> Self {
        self.advanced_problem_details = details.into();
        self
    }

    pub fn with_stdout_and_err(mut self, data: impl Into<String>) -> Self {
        self.stdout_and_err_data = data.into();
        self
    }

    pub fn add_annotation(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.annotations.insert(key.into(), value.into());
    }

    pub fn add_annotations(&mut self, annotations: BTreeMap<String, String>) {
        self.annotations.extend(annotations);
    }

    /// Category the child wrote into `response/error/category`, if any.
    pub(crate) fn child_reported_category(layout: &WorkDirLayout) -> Option<ErrorCategory> {
        let raw = std::fs::read_to_string(layout.error_category()).ok()?;
        ErrorCategory::from_name(raw.trim())
    }

    /// Applies child-written error texts from `response/error/`. Explicit
    /// child texts beat the defaults that `finalize` would synthesize.
    pub(crate) fn load_child_error_texts(&mut self, layout: &WorkDirLayout) {
        if let Ok(summary) = std::fs::read_to_string(layout.error_summary()) {
            let summary = summary.trim();
            if !summary.is_empty() {
                self.summary = summary.to_string();
            }
        }
        if let Some(html) = read_html_or_txt(
            &layout.error_problem_description_html(),
            &layout.error_problem_description_txt(),
        ) {
            self.problem_description_html = html;
        }
        if let Some(html) = read_html_or_txt(
            &layout.error_solution_description_html(),
            &layout.error_solution_description_txt(),
        ) {
            self.solution_description_html = html;
        }
    }

    /// Loads the child's environment dumps and annotations from `envdump/`.
    pub(crate) fn load_subprocess_dumps(&mut self, layout: &WorkDirLayout) {
        if let Ok(envvars) = std::fs::read_to_string(layout.envdump_envvars()) {
            self.subprocess_envvars = envvars;
        }
        if let Ok(ulimits) = std::fs::read_to_string(layout.envdump_ulimits()) {
            self.subprocess_ulimits = ulimits;
        }
        if let Ok(user_info) = std::fs::read_to_string(layout.envdump_user_info()) {
            self.subprocess_user_info = user_info;
        }
        if let Ok(entries) = std::fs::read_dir(layout.annotations_dir()) {
            for entry in entries.flatten() {
                if let (Ok(name), Ok(value)) = (
                    entry.file_name().into_string(),
                    std::fs::read_to_string(entry.path()),
                ) {
                    self.annotations.insert(name, value.trim().to_string());
                }
            }
        }
    }

    /// Fills missing texts from the default templates and captures the
    /// parent environment, ulimits and a system metrics snapshot. Called
    /// exactly once, at the outermost failure site; calling it again is a
    /// no-op. Defaults never overwrite explicit values.
    pub fn finalize(mut self: Box<Self>) -> Box<Self> {
        if self.finalized {
            return self;
        }
        self.finalized = true;

        if self.summary.is_empty() {
            self.summary = templates::default_summary(
                self.category,
                &self.journey,
                &self.low_level_error_message,
            );
        }
        if self.problem_description_html.is_empty() {
            self.problem_description_html = templates::default_problem_html(
                self.category,
                &self.journey,
                &self.low_level_error_message,
            );
        }
        if self.solution_description_html.is_empty() {
            self.solution_description_html =
                templates::default_solution_html(self.category, &self.journey, &self.config);
        }
        if self.advanced_problem_details.is_empty() {
            self.advanced_problem_details = self.low_level_error_message.clone();
        }

        if self.parent_envvars.is_empty() {
            self.parent_envvars = system::environment_dump();
        }
        if self.parent_ulimits.is_empty() {
            self.parent_ulimits = system::capture_ulimits();
        }
        if self.system_metrics.is_empty() {
            self.system_metrics = system::system_metrics_snapshot();
        }

        self
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn journey(&self) -> &Journey {
        &self.journey
    }

    pub fn first_failed_step(&self) -> Option<JourneyStep> {
        self.journey.first_failed_step()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn low_level_error_message(&self) -> &str {
        &self.low_level_error_message
    }

    pub fn problem_description_html(&self) -> &str {
        &self.problem_description_html
    }

    pub fn solution_description_html(&self) -> &str {
        &self.solution_description_html
    }

    pub fn advanced_problem_details(&self) -> &str {
        &self.advanced_problem_details
    }

    pub fn stdout_and_err_data(&self) -> &str {
        &self.stdout_and_err_data
    }

    pub fn subprocess_envvars(&self) -> &str {
        &self.subprocess_envvars
    }

    pub fn subprocess_ulimits(&self) -> &str {
        &self.subprocess_ulimits
    }

    pub fn subprocess_user_info(&self) -> &str {
        &self.subprocess_user_info
    }

    pub fn annotations(&self) -> &BTreeMap<String, String> {
        &self.annotations
    }

    pub fn parent_envvars(&self) -> &str {
        &self.parent_envvars
    }

    pub fn parent_ulimits(&self) -> &str {
        &self.parent_ulimits
    }

    pub fn system_metrics(&self) -> &str {
        &self.system_metrics
    }
}

fn read_html_or_txt(html_path: &std::path::Path, txt_path: &std::path::Path) -> Option<String> {
    if let Ok(html) = std::fs::read_to_string(html_path) {
        if !html.trim().is_empty() {
            return Some(html);
        }
    }
    if let Ok(txt) = std::fs::read_to_string(txt_path) {
        if !txt.trim().is_empty() {
            return Some(format!("<pre>{}</pre>", templates::html_escape(txt.trim())));
        }
    }
    None
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.summary)
    }
}

impl std::error::Error for SpawnError {}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_shared::journey::JourneyType;

    fn failed_journey() -> Journey {
        let mut journey = Journey::new(JourneyType::SpawnDirectly, false);
        journey
            .set_errored(JourneyStep::AppLoadOrExec, false)
            .unwrap();
        journey
    }

    fn config() -> Config {
        Config {
            app_root: "/srv/app".into(),
            start_command: "./start.sh".into(),
            ..Config::default()
        }
    }

    #[test]
    fn finalize_fills_defaults_and_captures_environment() {
        let report = Box::new(SpawnError::new(
            ErrorCategory::InternalError,
            &failed_journey(),
            &config(),
            "",
        ))
        .finalize();
        assert!(!report.summary().is_empty());
        assert!(!report.problem_description_html().is_empty());
        assert!(!report.solution_description_html().is_empty());
        assert!(report.parent_envvars().contains("PATH="));
        assert!(report.system_metrics().contains("RAM:"));
        assert_ne!(report.category(), ErrorCategory::UnknownErrorCategory);
    }

    #[test]
    fn finalize_is_idempotent_and_never_overwrites() {
        let report = Box::new(
            SpawnError::new(
                ErrorCategory::InternalError,
                &failed_journey(),
                &config(),
                "explicit summary",
            )
            .with_problem_html("<p>explicit problem</p>"),
        )
        .finalize();
        let metrics_before = report.system_metrics().to_string();
        let report = report.finalize();
        assert_eq!(report.summary(), "explicit summary");
        assert_eq!(report.problem_description_html(), "<p>explicit problem</p>");
        assert_eq!(report.system_metrics(), metrics_before);
    }

    #[test]
    fn from_failure_classifies_and_summarizes() {
        let failure = Failure::syscall("fork", nix::errno::Errno::ENOMEM);
        let mut journey = Journey::new(JourneyType::SpawnDirectly, false);
        journey
            .set_errored(JourneyStep::ForkSubprocess, false)
            .unwrap();
        let report = SpawnError::from_failure(&failure, &journey, &config());
        assert_eq!(report.category(), ErrorCategory::OperatingSystemError);
        assert!(report.summary().contains("forking"));
        assert!(report.low_level_error_message().contains("fork"));
    }

    #[test]
    fn child_error_texts_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let layout = WorkDirLayout::new(dir.path());
        std::fs::create_dir_all(layout.error_dir()).unwrap();
        std::fs::write(layout.error_summary(), "child says: broken\n").unwrap();
        std::fs::write(layout.error_category(), "FILE_SYSTEM_ERROR").unwrap();
        std::fs::write(
            layout.error_solution_description_txt(),
            "chmod the thing",
        )
        .unwrap();

        assert_eq!(
            SpawnError::child_reported_category(&layout),
            Some(ErrorCategory::FileSystemError)
        );

        let mut report = SpawnError::new(
            ErrorCategory::FileSystemError,
            &failed_journey(),
            &config(),
            "",
        );
        report.load_child_error_texts(&layout);
        let report = Box::new(report).finalize();
        assert_eq!(report.summary(), "child says: broken");
        assert_eq!(
            report.solution_description_html(),
            "<pre>chmod the thing</pre>"
        );
    }

    #[test]
    fn subprocess_dumps_and_annotations_are_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let layout = WorkDirLayout::new(dir.path());
        std::fs::create_dir_all(layout.annotations_dir()).unwrap();
        std::fs::write(layout.envdump_envvars(), "HOME=/home/app\n").unwrap();
        std::fs::write(layout.annotation_file("hint"), "check this\n").unwrap();

        let mut report = SpawnError::new(
            ErrorCategory::InternalError,
            &failed_journey(),
            &config(),
            "x",
        );
        report.load_subprocess_dumps(&layout);
        assert!(report.subprocess_envvars().contains("HOME=/home/app"));
        assert_eq!(report.annotations()["hint"], "check this");
    }
}
