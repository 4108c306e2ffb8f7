//! Stagehand shared contract - code common to the spawner and the in-child agent
//!
//! The Stagehand spawner talks to the processes it launches through the
//! filesystem: a per-spawn work directory carries the argument bundle from
//! parent to child and the readiness/diagnostic responses from child to
//! parent. Both sides must agree on the directory layout, the journey step
//! vocabulary, the error taxonomy and the preloader wire protocol. This crate
//! is that agreement.

pub mod args;
pub mod category;
pub mod constants;
pub mod journey;
pub mod layout;
pub mod protocol;

pub use args::SpawnArgs;
pub use category::ErrorCategory;
pub use journey::{Journey, JourneyError, JourneyStep, JourneyStepState, JourneyType};
pub use layout::WorkDirLayout;
pub use protocol::{SocketAddress, SpawnCommand, SpawnReply};
