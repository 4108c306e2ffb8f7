//! The preloader wire protocol and socket address notation.
//!
//! The smart spawn path talks to the preloader over a one-shot connection:
//! one newline-terminated JSON request, one newline-terminated JSON response
//! of at most [`crate::constants::MAX_PRELOADER_RESPONSE_BYTES`] bytes. The
//! response is validated structurally here so that every deviation gets its
//! own diagnostic text on the parent side.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The one command the parent sends to the preloader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnCommand {
    pub command: String,
    pub work_dir: PathBuf,
}

impl SpawnCommand {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        SpawnCommand {
            command: "spawn".to_string(),
            work_dir: work_dir.into(),
        }
    }

    /// Serializes to a single newline-terminated line.
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).expect("SpawnCommand is always serializable");
        line.push('\n');
        line
    }
}

/// A structurally valid preloader response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnReply {
    Ok { pid: i32 },
    Error { message: String },
}

/// Why a preloader response line was rejected.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Not parseable as JSON at all.
    #[error("unparseable response: {0}")]
    Unparseable(serde_json::Error),
    /// Parsed, but does not match the expected structure.
    #[error("response does not match the expected structure: {0}")]
    Structure(String),
}

impl SpawnReply {
    /// Parses and structurally validates one response line.
    ///
    /// Requirements: a JSON object with a string `result` of `"ok"` or
    /// `"error"`; `"ok"` carries an integer `pid`, `"error"` a string
    /// `message`.
    pub fn parse(line: &str) -> Result<SpawnReply, ProtocolError> {
        let doc: serde_json::Value =
            serde_json::from_str(line.trim_end()).map_err(ProtocolError::Unparseable)?;
        let obj = doc
            .as_object()
            .ok_or_else(|| ProtocolError::Structure("response is not an object".into()))?;
        let result = obj
            .get("result")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProtocolError::Structure("missing string field 'result'".into()))?;
        match result {
            "ok" => {
                let pid = obj
                    .get("pid")
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| ProtocolError::Structure("missing integer field 'pid'".into()))?;
                Ok(SpawnReply::Ok { pid: pid as i32 })
            }
            "error" => {
                let message = obj.get("message").and_then(|v| v.as_str()).ok_or_else(|| {
                    ProtocolError::Structure("missing string field 'message'".into())
                })?;
                Ok(SpawnReply::Error {
                    message: message.to_string(),
                })
            }
            other => Err(ProtocolError::Structure(format!(
                "unknown result value {other:?}"
            ))),
        }
    }
}

/// A parsed socket address in the server's notation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketAddress {
    /// `tcp://host:port`
    Tcp { host: String, port: u16 },
    /// `unix:/path`
    Unix(PathBuf),
}

impl SocketAddress {
    /// Parses the `tcp://host:port` / `unix:/path` notation.
    pub fn parse(address: &str) -> Result<SocketAddress, AddressError> {
        if let Some(rest) = address.strip_prefix("tcp://") {
            let (host, port) = rest
                .rsplit_once(':')
                .ok_or_else(|| AddressError::new(address, "missing port"))?;
            if host.is_empty() {
                return Err(AddressError::new(address, "missing host"));
            }
            let port = port
                .parse::<u16>()
                .map_err(|_| AddressError::new(address, "invalid port"))?;
            Ok(SocketAddress::Tcp {
                host: host.to_string(),
                port,
            })
        } else if let Some(path) = address.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(AddressError::new(address, "empty socket path"));
            }
            Ok(SocketAddress::Unix(PathBuf::from(path)))
        } else {
            Err(AddressError::new(address, "unknown address scheme"))
        }
    }
}

impl std::fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocketAddress::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            SocketAddress::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// An address string that does not follow the notation.
#[derive(Debug, thiserror::Error)]
#[error("invalid socket address {address:?}: {reason}")]
pub struct AddressError {
    pub address: String,
    pub reason: &'static str,
}

impl AddressError {
    fn new(address: &str, reason: &'static str) -> Self {
        AddressError {
            address: address.to_string(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_serializes_to_one_line() {
        let line = SpawnCommand::new("/tmp/wd").to_line();
        assert!(line.ends_with('\n'));
        assert!(!line.trim_end().contains('\n'));
        let parsed: SpawnCommand = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(parsed.command, "spawn");
    }

    #[test]
    fn parses_ok_and_error_replies() {
        assert_eq!(
            SpawnReply::parse("{\"result\":\"ok\",\"pid\":12345}\n").unwrap(),
            SpawnReply::Ok { pid: 12345 }
        );
        assert_eq!(
            SpawnReply::parse("{\"result\":\"error\",\"message\":\"boom\"}").unwrap(),
            SpawnReply::Error {
                message: "boom".into()
            }
        );
    }

    #[test]
    fn rejects_structural_deviations() {
        assert!(matches!(
            SpawnReply::parse("gibberish"),
            Err(ProtocolError::Unparseable(_))
        ));
        assert!(matches!(
            SpawnReply::parse("[1,2]"),
            Err(ProtocolError::Structure(_))
        ));
        assert!(matches!(
            SpawnReply::parse("{\"result\":\"ok\"}"),
            Err(ProtocolError::Structure(_))
        ));
        assert!(matches!(
            SpawnReply::parse("{\"result\":\"error\"}"),
            Err(ProtocolError::Structure(_))
        ));
        assert!(matches!(
            SpawnReply::parse("{\"result\":\"maybe\"}"),
            Err(ProtocolError::Structure(_))
        ));
    }

    #[test]
    fn parses_socket_addresses() {
        assert_eq!(
            SocketAddress::parse("tcp://127.0.0.1:3000").unwrap(),
            SocketAddress::Tcp {
                host: "127.0.0.1".into(),
                port: 3000
            }
        );
        assert_eq!(
            SocketAddress::parse("unix:/tmp/sock").unwrap(),
            SocketAddress::Unix(PathBuf::from("/tmp/sock"))
        );
        assert!(SocketAddress::parse("http://x").is_err());
        assert!(SocketAddress::parse("tcp://:3000").is_err());
        assert!(SocketAddress::parse("tcp://h:x").is_err());
    }

    #[test]
    fn address_display_round_trips() {
        for addr in ["tcp://127.0.0.1:3000", "unix:/tmp/sock"] {
            assert_eq!(SocketAddress::parse(addr).unwrap().to_string(), addr);
        }
    }
}
