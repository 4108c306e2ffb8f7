//! The startup journey: every observable step of spawning a process.
//!
//! A journey is a partially ordered set of steps, each with a progress state
//! and optional timing. The parent instruments its own steps directly; the
//! child reports its steps by writing state files into the work directory
//! (`response/steps/<STEP>/state`), which the parent folds back in with
//! [`Journey::load_from_response_dir`]. When a spawn fails, the first errored
//! step in declaration order names the culprit in the diagnostic report.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use crate::layout::WorkDirLayout;

/// Which spawning strategy this journey describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JourneyType {
    /// One fork+exec per application process.
    SpawnDirectly,
    /// Starting the long-lived preloader (same mechanics as a direct spawn).
    StartPreloader,
    /// Asking a running preloader to fork a worker.
    SpawnThroughPreloader,
}

/// One observable step of the startup journey.
///
/// Declaration order is the journey order: "first failed step" means the
/// lowest declared step in the `Errored` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JourneyStep {
    // Parent side.
    Preparation,
    ForkSubprocess,
    ConnectToPreloader,
    SendCommandToPreloader,
    ReadResponseFromPreloader,
    ParseResponseFromPreloader,
    ProcessResponseFromPreloader,
    HandshakePerform,
    Finish,

    // Preloader side.
    PreloaderPreparation,
    PreloaderForkSubprocess,
    PreloaderSendResponse,
    PreloaderFinish,

    // Subprocess side.
    BeforeFirstExec,
    SpawnEnvSetupperBeforeShell,
    OsShell,
    SpawnEnvSetupperAfterShell,
    ExecWrapper,
    WrapperPreparation,
    AppLoadOrExec,
    PrepareAfterForkingFromPreloader,
    Listen,
    SubprocessFinish,
}

impl JourneyStep {
    /// All steps, in journey order.
    pub const ALL: [JourneyStep; 23] = [
        JourneyStep::Preparation,
        JourneyStep::ForkSubprocess,
        JourneyStep::ConnectToPreloader,
        JourneyStep::SendCommandToPreloader,
        JourneyStep::ReadResponseFromPreloader,
        JourneyStep::ParseResponseFromPreloader,
        JourneyStep::ProcessResponseFromPreloader,
        JourneyStep::HandshakePerform,
        JourneyStep::Finish,
        JourneyStep::PreloaderPreparation,
        JourneyStep::PreloaderForkSubprocess,
        JourneyStep::PreloaderSendResponse,
        JourneyStep::PreloaderFinish,
        JourneyStep::BeforeFirstExec,
        JourneyStep::SpawnEnvSetupperBeforeShell,
        JourneyStep::OsShell,
        JourneyStep::SpawnEnvSetupperAfterShell,
        JourneyStep::ExecWrapper,
        JourneyStep::WrapperPreparation,
        JourneyStep::AppLoadOrExec,
        JourneyStep::PrepareAfterForkingFromPreloader,
        JourneyStep::Listen,
        JourneyStep::SubprocessFinish,
    ];

    /// Canonical string form, bijective with [`JourneyStep::from_name`].
    pub fn as_str(&self) -> &'static str {
        match self {
            JourneyStep::Preparation => "PREPARATION",
            JourneyStep::ForkSubprocess => "FORK_SUBPROCESS",
            JourneyStep::ConnectToPreloader => "CONNECT_TO_PRELOADER",
            JourneyStep::SendCommandToPreloader => "SEND_COMMAND_TO_PRELOADER",
            JourneyStep::ReadResponseFromPreloader => "READ_RESPONSE_FROM_PRELOADER",
            JourneyStep::ParseResponseFromPreloader => "PARSE_RESPONSE_FROM_PRELOADER",
            JourneyStep::ProcessResponseFromPreloader => "PROCESS_RESPONSE_FROM_PRELOADER",
            JourneyStep::HandshakePerform => "HANDSHAKE_PERFORM",
            JourneyStep::Finish => "FINISH",
            JourneyStep::PreloaderPreparation => "PRELOADER_PREPARATION",
            JourneyStep::PreloaderForkSubprocess => "PRELOADER_FORK_SUBPROCESS",
            JourneyStep::PreloaderSendResponse => "PRELOADER_SEND_RESPONSE",
            JourneyStep::PreloaderFinish => "PRELOADER_FINISH",
            JourneyStep::BeforeFirstExec => "BEFORE_FIRST_EXEC",
            JourneyStep::SpawnEnvSetupperBeforeShell => "SPAWN_ENV_SETUPPER_BEFORE_SHELL",
            JourneyStep::OsShell => "OS_SHELL",
            JourneyStep::SpawnEnvSetupperAfterShell => "SPAWN_ENV_SETUPPER_AFTER_SHELL",
            JourneyStep::ExecWrapper => "EXEC_WRAPPER",
            JourneyStep::WrapperPreparation => "WRAPPER_PREPARATION",
            JourneyStep::AppLoadOrExec => "APP_LOAD_OR_EXEC",
            JourneyStep::PrepareAfterForkingFromPreloader => {
                "PREPARE_AFTER_FORKING_FROM_PRELOADER"
            }
            JourneyStep::Listen => "LISTEN",
            JourneyStep::SubprocessFinish => "SUBPROCESS_FINISH",
        }
    }

    /// Parses the canonical string form.
    pub fn from_name(name: &str) -> Option<JourneyStep> {
        JourneyStep::ALL.iter().copied().find(|s| s.as_str() == name)
    }
}

impl std::fmt::Display for JourneyStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress state of a single journey step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JourneyStepState {
    NotStarted,
    InProgress,
    Performed,
    Errored,
}

impl JourneyStepState {
    /// Canonical string form, bijective with [`JourneyStepState::from_name`].
    pub fn as_str(&self) -> &'static str {
        match self {
            JourneyStepState::NotStarted => "NOT_STARTED",
            JourneyStepState::InProgress => "IN_PROGRESS",
            JourneyStepState::Performed => "PERFORMED",
            JourneyStepState::Errored => "ERRORED",
        }
    }

    /// Parses the canonical string form.
    pub fn from_name(name: &str) -> Option<JourneyStepState> {
        match name {
            "NOT_STARTED" => Some(JourneyStepState::NotStarted),
            "IN_PROGRESS" => Some(JourneyStepState::InProgress),
            "PERFORMED" => Some(JourneyStepState::Performed),
            "ERRORED" => Some(JourneyStepState::Errored),
            _ => None,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, JourneyStepState::Performed | JourneyStepState::Errored)
    }
}

impl std::fmt::Display for JourneyStepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by journey bookkeeping.
#[derive(Debug, thiserror::Error)]
pub enum JourneyError {
    /// The step does not belong to this journey's step set.
    #[error("step {0} does not belong to this journey")]
    UnknownStep(JourneyStep),

    /// The requested state change violates the legal transition graph.
    #[error("illegal transition for step {step}: {from} -> {to}")]
    InvalidTransition {
        step: JourneyStep,
        from: JourneyStepState,
        to: JourneyStepState,
    },

    /// A different step is already errored and `force` was not given.
    #[error("cannot mark {step} errored: {existing} is already errored")]
    AlreadyErrored {
        step: JourneyStep,
        existing: JourneyStep,
    },

    /// A child-written state file did not contain a recognizable state.
    #[error("step {step} reported unparseable state {value:?}")]
    InvalidStateFile { step: JourneyStep, value: String },
}

#[derive(Debug, Clone)]
struct StepRecord {
    state: JourneyStepState,
    begun: Option<Instant>,
    duration_usec: Option<u64>,
}

impl StepRecord {
    fn new() -> Self {
        StepRecord {
            state: JourneyStepState::NotStarted,
            begun: None,
            duration_usec: None,
        }
    }
}

/// The startup journey of one spawn attempt.
#[derive(Debug, Clone)]
pub struct Journey {
    journey_type: JourneyType,
    using_wrapper: bool,
    steps: BTreeMap<JourneyStep, StepRecord>,
}

impl Journey {
    /// Creates a journey with the step set implied by `journey_type` and
    /// `using_wrapper`, all steps `NotStarted`.
    pub fn new(journey_type: JourneyType, using_wrapper: bool) -> Self {
        let mut journey = Journey {
            journey_type,
            using_wrapper,
            steps: BTreeMap::new(),
        };
        match journey_type {
            JourneyType::SpawnDirectly | JourneyType::StartPreloader => {
                journey.fill_in_direct_steps();
            }
            JourneyType::SpawnThroughPreloader => {
                journey.fill_in_through_preloader_steps();
            }
        }
        journey
    }

    fn fill_in_direct_steps(&mut self) {
        self.insert(JourneyStep::Preparation);
        self.insert(JourneyStep::ForkSubprocess);
        self.insert(JourneyStep::HandshakePerform);
        self.insert(JourneyStep::Finish);

        self.insert(JourneyStep::BeforeFirstExec);
        self.insert(JourneyStep::SpawnEnvSetupperBeforeShell);
        self.insert(JourneyStep::OsShell);
        self.insert(JourneyStep::SpawnEnvSetupperAfterShell);
        if self.using_wrapper {
            self.insert(JourneyStep::ExecWrapper);
            self.insert(JourneyStep::WrapperPreparation);
        }
        self.insert(JourneyStep::AppLoadOrExec);
        self.insert(JourneyStep::Listen);
        self.insert(JourneyStep::SubprocessFinish);
    }

    fn fill_in_through_preloader_steps(&mut self) {
        self.insert(JourneyStep::Preparation);
        self.insert(JourneyStep::ForkSubprocess);
        self.insert(JourneyStep::ConnectToPreloader);
        self.insert(JourneyStep::SendCommandToPreloader);
        self.insert(JourneyStep::ReadResponseFromPreloader);
        self.insert(JourneyStep::ParseResponseFromPreloader);
        self.insert(JourneyStep::ProcessResponseFromPreloader);
        self.insert(JourneyStep::HandshakePerform);
        self.insert(JourneyStep::Finish);

        self.insert(JourneyStep::PreloaderPreparation);
        self.insert(JourneyStep::PreloaderForkSubprocess);
        self.insert(JourneyStep::PreloaderSendResponse);
        self.insert(JourneyStep::PreloaderFinish);

        self.insert(JourneyStep::PrepareAfterForkingFromPreloader);
        self.insert(JourneyStep::Listen);
        self.insert(JourneyStep::SubprocessFinish);
    }

    fn insert(&mut self, step: JourneyStep) {
        self.steps.insert(step, StepRecord::new());
    }

    pub fn journey_type(&self) -> JourneyType {
        self.journey_type
    }

    pub fn using_wrapper(&self) -> bool {
        self.using_wrapper
    }

    /// Whether `step` belongs to this journey's step set.
    pub fn contains(&self, step: JourneyStep) -> bool {
        self.steps.contains_key(&step)
    }

    /// State of `step`, or `None` if it does not belong to this journey.
    pub fn state_of(&self, step: JourneyStep) -> Option<JourneyStepState> {
        self.steps.get(&step).map(|r| r.state)
    }

    /// Recorded duration of `step` in microseconds, if any.
    pub fn duration_of(&self, step: JourneyStep) -> Option<u64> {
        self.steps.get(&step).and_then(|r| r.duration_usec)
    }

    /// Iterates over `(step, state)` in journey order.
    pub fn steps(&self) -> impl Iterator<Item = (JourneyStep, JourneyStepState)> + '_ {
        self.steps.iter().map(|(step, record)| (*step, record.state))
    }

    /// The lowest-ordered errored step, if any.
    pub fn first_failed_step(&self) -> Option<JourneyStep> {
        self.steps
            .iter()
            .find(|(_, record)| record.state == JourneyStepState::Errored)
            .map(|(step, _)| *step)
    }

    /// The highest-ordered step currently in progress, if any. After a
    /// crash this is how far the startup demonstrably got.
    pub fn last_in_progress_step(&self) -> Option<JourneyStep> {
        self.steps
            .iter()
            .rev()
            .find(|(_, record)| record.state == JourneyStepState::InProgress)
            .map(|(step, _)| *step)
    }

    /// Marks `step` as in progress and records its begin time.
    pub fn set_in_progress(&mut self, step: JourneyStep) -> Result<(), JourneyError> {
        self.transition(step, JourneyStepState::InProgress)?;
        if let Some(record) = self.steps.get_mut(&step) {
            record.begun = Some(Instant::now());
        }
        Ok(())
    }

    /// Marks `step` as performed, recording its duration when a begin time
    /// is known and no explicit duration was set.
    pub fn set_performed(&mut self, step: JourneyStep) -> Result<(), JourneyError> {
        self.transition(step, JourneyStepState::Performed)?;
        self.record_elapsed(step);
        Ok(())
    }

    /// Marks `step` as errored.
    ///
    /// At most one step per journey may be errored; `force` overwrites a
    /// previously errored step (used when classification refines mid-flight,
    /// e.g. a timeout superseding a child-reported failure).
    pub fn set_errored(&mut self, step: JourneyStep, force: bool) -> Result<(), JourneyError> {
        if let Some(existing) = self.first_failed_step() {
            if existing != step && !force {
                return Err(JourneyError::AlreadyErrored { step, existing });
            }
            if existing != step {
                // Refinement: the previous culprit reverts to performed so
                // that exactly one step stays errored.
                if let Some(record) = self.steps.get_mut(&existing) {
                    record.state = JourneyStepState::Performed;
                }
            }
        }
        let record = self
            .steps
            .get_mut(&step)
            .ok_or(JourneyError::UnknownStep(step))?;
        if record.state.is_terminal() && record.state != JourneyStepState::Errored && !force {
            return Err(JourneyError::InvalidTransition {
                step,
                from: record.state,
                to: JourneyStepState::Errored,
            });
        }
        record.state = JourneyStepState::Errored;
        self.record_elapsed(step);
        Ok(())
    }

    fn transition(&mut self, step: JourneyStep, to: JourneyStepState) -> Result<(), JourneyError> {
        let record = self
            .steps
            .get_mut(&step)
            .ok_or(JourneyError::UnknownStep(step))?;
        let legal = match record.state {
            // A step may also jump straight to a terminal state; the
            // in-progress phase is optional instrumentation.
            JourneyStepState::NotStarted => true,
            JourneyStepState::InProgress => to.is_terminal(),
            JourneyStepState::Performed | JourneyStepState::Errored => false,
        };
        if !legal {
            return Err(JourneyError::InvalidTransition {
                step,
                from: record.state,
                to,
            });
        }
        record.state = to;
        Ok(())
    }

    fn record_elapsed(&mut self, step: JourneyStep) {
        if let Some(record) = self.steps.get_mut(&step) {
            if record.duration_usec.is_none() {
                if let Some(begun) = record.begun {
                    record.duration_usec = Some(begun.elapsed().as_micros() as u64);
                }
            }
        }
    }

    /// Sets an explicit duration for `step`, overriding measured timing.
    pub fn set_step_duration(&mut self, step: JourneyStep, usec: u64) -> Result<(), JourneyError> {
        let record = self
            .steps
            .get_mut(&step)
            .ok_or(JourneyError::UnknownStep(step))?;
        record.duration_usec = Some(usec);
        Ok(())
    }

    /// Folds child-reported step states and durations into this journey.
    ///
    /// For every step declared in this journey, reads
    /// `response/steps/<STEP>/state` and `.../duration` below `work_dir` when
    /// present. Step directories that do not name a declared step are
    /// ignored; an unparseable state string is an error the caller charges to
    /// its own step. Loaded states are applied verbatim: they are the child's
    /// serialized journey, not transitions of ours.
    pub fn load_from_response_dir(&mut self, work_dir: &Path) -> Result<(), JourneyError> {
        let layout = WorkDirLayout::new(work_dir);
        for step in JourneyStep::ALL {
            if !self.contains(step) {
                continue;
            }
            let state_file = layout.step_state_file(step);
            if let Ok(raw) = std::fs::read_to_string(&state_file) {
                let value = raw.trim();
                let state = JourneyStepState::from_name(value).ok_or_else(|| {
                    JourneyError::InvalidStateFile {
                        step,
                        value: value.to_string(),
                    }
                })?;
                if let Some(record) = self.steps.get_mut(&step) {
                    record.state = state;
                }
            }
            if let Ok(raw) = std::fs::read_to_string(layout.step_duration_file(step)) {
                if let Ok(usec) = raw.trim().parse::<u64>() {
                    if let Some(record) = self.steps.get_mut(&step) {
                        record.duration_usec = Some(usec);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn step_name_round_trip_is_bijective() {
        for step in JourneyStep::ALL {
            assert_eq!(JourneyStep::from_name(step.as_str()), Some(step));
        }
        assert_eq!(JourneyStep::from_name("NOT_A_STEP"), None);
    }

    #[test]
    fn direct_journey_has_no_preloader_steps() {
        let journey = Journey::new(JourneyType::SpawnDirectly, false);
        assert!(journey.contains(JourneyStep::Preparation));
        assert!(journey.contains(JourneyStep::AppLoadOrExec));
        assert!(!journey.contains(JourneyStep::ConnectToPreloader));
        assert!(!journey.contains(JourneyStep::PreloaderPreparation));
        assert!(!journey.contains(JourneyStep::ExecWrapper));
    }

    #[test]
    fn wrapper_steps_appear_only_when_using_wrapper() {
        let journey = Journey::new(JourneyType::SpawnDirectly, true);
        assert!(journey.contains(JourneyStep::ExecWrapper));
        assert!(journey.contains(JourneyStep::WrapperPreparation));
    }

    #[test]
    fn through_preloader_journey_has_protocol_and_preloader_steps() {
        let journey = Journey::new(JourneyType::SpawnThroughPreloader, false);
        assert!(journey.contains(JourneyStep::ConnectToPreloader));
        assert!(journey.contains(JourneyStep::PreloaderSendResponse));
        assert!(journey.contains(JourneyStep::PrepareAfterForkingFromPreloader));
        assert!(!journey.contains(JourneyStep::SpawnEnvSetupperBeforeShell));
    }

    #[test]
    fn transitions_follow_the_legal_graph() {
        let mut journey = Journey::new(JourneyType::SpawnDirectly, false);
        journey.set_in_progress(JourneyStep::Preparation).unwrap();
        journey.set_performed(JourneyStep::Preparation).unwrap();
        // Terminal states are terminal.
        assert!(journey.set_in_progress(JourneyStep::Preparation).is_err());
        assert!(journey.set_performed(JourneyStep::Preparation).is_err());
        // NotStarted may jump straight to a terminal state.
        journey.set_performed(JourneyStep::ForkSubprocess).unwrap();
    }

    #[test]
    fn unknown_step_is_rejected() {
        let mut journey = Journey::new(JourneyType::SpawnDirectly, false);
        assert!(matches!(
            journey.set_in_progress(JourneyStep::ConnectToPreloader),
            Err(JourneyError::UnknownStep(_))
        ));
    }

    #[test]
    fn only_one_step_may_be_errored() {
        let mut journey = Journey::new(JourneyType::SpawnDirectly, false);
        journey.set_errored(JourneyStep::Preparation, false).unwrap();
        assert!(journey
            .set_errored(JourneyStep::HandshakePerform, false)
            .is_err());
        // Forced refinement moves the blame and keeps a single culprit.
        journey
            .set_errored(JourneyStep::HandshakePerform, true)
            .unwrap();
        assert_eq!(
            journey.first_failed_step(),
            Some(JourneyStep::HandshakePerform)
        );
        assert_eq!(
            journey.state_of(JourneyStep::Preparation),
            Some(JourneyStepState::Performed)
        );
    }

    #[test]
    fn last_in_progress_step_prefers_the_furthest_step() {
        let mut journey = Journey::new(JourneyType::SpawnDirectly, false);
        journey.set_in_progress(JourneyStep::HandshakePerform).unwrap();
        assert_eq!(
            journey.last_in_progress_step(),
            Some(JourneyStep::HandshakePerform)
        );
        journey.set_in_progress(JourneyStep::AppLoadOrExec).unwrap();
        assert_eq!(
            journey.last_in_progress_step(),
            Some(JourneyStep::AppLoadOrExec)
        );
    }

    #[test]
    fn first_failed_step_uses_declaration_order() {
        let mut journey = Journey::new(JourneyType::SpawnDirectly, false);
        journey.set_errored(JourneyStep::AppLoadOrExec, false).unwrap();
        assert_eq!(journey.first_failed_step(), Some(JourneyStep::AppLoadOrExec));
    }

    #[test]
    fn load_from_response_dir_applies_states_and_durations() {
        let dir = tempfile::tempdir().unwrap();
        let layout = WorkDirLayout::new(dir.path());
        let step = JourneyStep::SpawnEnvSetupperBeforeShell;
        fs::create_dir_all(layout.step_dir(step)).unwrap();
        fs::write(layout.step_state_file(step), "PERFORMED\n").unwrap();
        fs::write(layout.step_duration_file(step), "1234\n").unwrap();
        // Unknown step directories are ignored.
        fs::create_dir_all(layout.steps_dir().join("SOMETHING_ELSE")).unwrap();
        fs::write(layout.steps_dir().join("SOMETHING_ELSE/state"), "ERRORED").unwrap();

        let mut journey = Journey::new(JourneyType::SpawnDirectly, false);
        journey.load_from_response_dir(dir.path()).unwrap();
        assert_eq!(journey.state_of(step), Some(JourneyStepState::Performed));
        assert_eq!(journey.duration_of(step), Some(1234));
        assert_eq!(journey.first_failed_step(), None);
    }

    #[test]
    fn load_from_response_dir_rejects_garbage_states() {
        let dir = tempfile::tempdir().unwrap();
        let layout = WorkDirLayout::new(dir.path());
        let step = JourneyStep::AppLoadOrExec;
        fs::create_dir_all(layout.step_dir(step)).unwrap();
        fs::write(layout.step_state_file(step), "HALF_DONE").unwrap();

        let mut journey = Journey::new(JourneyType::SpawnDirectly, false);
        assert!(matches!(
            journey.load_from_response_dir(dir.path()),
            Err(JourneyError::InvalidStateFile { .. })
        ));
    }
}
