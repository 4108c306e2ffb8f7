//! Product-wide constants used in user-visible text and on-disk names.

/// Full product name, used in diagnostic prose.
pub const PROGRAM_NAME: &str = "Stagehand";

/// Short product name, used mid-sentence in diagnostic prose.
pub const SHORT_PROGRAM_NAME: &str = "Stagehand";

/// Where users should report spawner bugs.
pub const SUPPORT_URL: &str = "https://github.com/stagehand-server/stagehand/issues";

/// Prefix of every spawn work directory name.
pub const WORK_DIR_PREFIX: &str = "stagehand.spawn.";

/// Marker variable exported into every spawned application's environment.
pub const IN_STAGEHAND_ENV: &str = "IN_STAGEHAND";

/// Environment variable carrying the work directory path into the child.
pub const SPAWN_WORK_DIR_ENV: &str = "STAGEHAND_SPAWN_WORK_DIR";

/// Maximum accepted length of a preloader response line, in bytes.
pub const MAX_PRELOADER_RESPONSE_BYTES: usize = 10240;
