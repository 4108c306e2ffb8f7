//! # stagehand
//!
//! Application process spawner for the Stagehand application server.
//!
//! Given a [`Config`] describing one application, a spawner launches the
//! application process, drives it through its startup journey, and verifies
//! it is ready to serve requests. On success the caller receives a
//! [`SpawnedProcess`]; on failure a [`SpawnError`] with a classified
//! category, the journey trace, the child's captured output and environment
//! dumps, and renderable problem/solution descriptions.
//!
//! Two strategies exist:
//! - [`DirectSpawner`]: one fork+exec per application process.
//! - [`SmartSpawner`]: a long-lived preloader process forks workers on
//!   command, amortizing the application's warm-up cost.
//!
//! Parent and child communicate exclusively through a per-spawn work
//! directory (see `stagehand-shared`); the in-child half of the dance is
//! the `spawn-env-setupper` subcommand of the `stagehand-agent` binary.

pub mod capture;
pub mod config;
pub mod context;
pub mod envsetup;
pub mod jail;
pub mod report;
pub mod result;
pub mod spawner;
pub mod workdir;

mod handshake;
mod system;

pub use config::{Config, SpawnMethod};
pub use context::Context;
pub use report::{SpawnError, SpawnResult};
pub use result::{ResultSocket, SpawnedProcess};
pub use spawner::{DirectSpawner, SmartSpawner, Spawner};

pub use stagehand_shared::category::ErrorCategory;
pub use stagehand_shared::journey::{Journey, JourneyStep, JourneyStepState, JourneyType};
