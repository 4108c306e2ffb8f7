//! What a successful spawn hands back to the caller.

use std::os::fd::OwnedFd;
use std::path::Path;
use std::time::{Instant, SystemTime};

use serde::{Deserialize, Serialize};

use stagehand_shared::protocol::SocketAddress;

/// One listen socket reported by the application (or synthesized for
/// generic apps).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSocket {
    #[serde(default = "default_socket_name")]
    pub name: String,
    /// `tcp://host:port` or `unix:/path`.
    pub address: String,
    /// Session protocol spoken on the socket, e.g. "http", "http_session".
    pub protocol: String,
    /// Maximum concurrent requests; -1 means unknown/unbounded.
    #[serde(default = "default_concurrency")]
    pub concurrency: i32,
    #[serde(default)]
    pub accept_http_requests: bool,
}

fn default_socket_name() -> String {
    "main".to_string()
}

fn default_concurrency() -> i32 {
    1
}

/// Child-written `response/properties.json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseProperties {
    #[serde(default)]
    pub sockets: Vec<ResultSocket>,
    #[serde(default)]
    pub code_revision: Option<String>,
}

impl ResponseProperties {
    /// Loads `properties.json`. `Ok(None)` when the file does not exist;
    /// `Err` carries a message suitable for an app-supplied-field error.
    pub fn load(path: &Path) -> Result<Option<ResponseProperties>, String> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(format!("cannot read {}: {e}", path.display())),
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| format!("cannot parse {}: {e}", path.display()))
    }
}

/// A successfully spawned, ready-to-serve application process.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub pid: i32,
    /// Globally unique process id, assigned by the spawner.
    pub gupid: String,
    pub spawn_start_time: SystemTime,
    pub spawn_end_time: SystemTime,
    pub spawn_start_time_monotonic: Instant,
    pub spawn_end_time_monotonic: Instant,
    /// Read end of the process's merged stdout/stderr. Owned by the caller
    /// from here on.
    pub stdout_and_err_fd: Option<OwnedFd>,
    pub sockets: Vec<ResultSocket>,
    pub code_revision: Option<String>,
}

/// Outcome of [`SpawnedProcess::validate`]: problems split by whose fault
/// they are.
#[derive(Debug, Default)]
pub struct ValidationErrors {
    /// Bugs in the spawner itself.
    pub internal: Vec<String>,
    /// Bad payload supplied by the child (application or wrapper).
    pub app_supplied: Vec<String>,
}

impl ValidationErrors {
    pub fn is_empty(&self) -> bool {
        self.internal.is_empty() && self.app_supplied.is_empty()
    }
}

impl SpawnedProcess {
    /// Checks the result invariants. An empty [`ValidationErrors`] means
    /// the result is safe to hand to the request router.
    pub fn validate(&self) -> ValidationErrors {
        let mut errors = ValidationErrors::default();

        if self.pid <= 0 {
            errors.internal.push(format!("pid {} is not valid", self.pid));
        }
        if self.gupid.is_empty() {
            errors.internal.push("gupid is empty".to_string());
        }
        if self.spawn_end_time < self.spawn_start_time {
            errors
                .internal
                .push("spawn end time precedes start time".to_string());
        }
        if self.spawn_end_time_monotonic < self.spawn_start_time_monotonic {
            errors
                .internal
                .push("monotonic spawn end time precedes start time".to_string());
        }

        if self.sockets.is_empty() {
            errors
                .app_supplied
                .push("no sockets to receive requests on were reported".to_string());
        }
        for (i, socket) in self.sockets.iter().enumerate() {
            if socket.name.is_empty() {
                errors.app_supplied.push(format!("socket {i} has no name"));
            }
            if socket.protocol.is_empty() {
                errors
                    .app_supplied
                    .push(format!("socket {i} has no protocol"));
            }
            if socket.concurrency < -1 {
                errors.app_supplied.push(format!(
                    "socket {i} has invalid concurrency {}",
                    socket.concurrency
                ));
            }
            if let Err(e) = SocketAddress::parse(&socket.address) {
                errors.app_supplied.push(format!("socket {i}: {e}"));
            }
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_process() -> SpawnedProcess {
        let now = SystemTime::now();
        let mono = Instant::now();
        SpawnedProcess {
            pid: 42,
            gupid: "abc123".to_string(),
            spawn_start_time: now,
            spawn_end_time: now,
            spawn_start_time_monotonic: mono,
            spawn_end_time_monotonic: mono,
            stdout_and_err_fd: None,
            sockets: vec![ResultSocket {
                name: "main".into(),
                address: "tcp://127.0.0.1:3000".into(),
                protocol: "http".into(),
                concurrency: 1,
                accept_http_requests: true,
            }],
            code_revision: None,
        }
    }

    #[test]
    fn a_complete_result_validates_cleanly() {
        assert!(valid_process().validate().is_empty());
    }

    #[test]
    fn bad_pid_is_an_internal_error() {
        let mut process = valid_process();
        process.pid = 0;
        let errors = process.validate();
        assert_eq!(errors.internal.len(), 1);
        assert!(errors.app_supplied.is_empty());
    }

    #[test]
    fn missing_sockets_and_bad_addresses_are_app_supplied_errors() {
        let mut process = valid_process();
        process.sockets.clear();
        assert_eq!(process.validate().app_supplied.len(), 1);

        let mut process = valid_process();
        process.sockets[0].address = "nonsense".into();
        process.sockets[0].concurrency = -7;
        let errors = process.validate();
        assert!(errors.internal.is_empty());
        assert_eq!(errors.app_supplied.len(), 2);
    }

    #[test]
    fn properties_parse_fills_defaults() {
        let json = r#"{"sockets":[{"address":"tcp://127.0.0.1:3000","protocol":"http","concurrency":1,"accept_http_requests":true}]}"#;
        let props: ResponseProperties = serde_json::from_str(json).unwrap();
        assert_eq!(props.sockets[0].name, "main");
        assert!(props.code_revision.is_none());
    }

    #[test]
    fn properties_load_distinguishes_missing_from_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("properties.json");
        assert!(ResponseProperties::load(&path).unwrap().is_none());
        std::fs::write(&path, "{not json").unwrap();
        assert!(ResponseProperties::load(&path).is_err());
    }
}
