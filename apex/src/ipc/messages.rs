//! IPC message types for daemon communication
//!
//! Simple JSON-over-newline protocol. Each message is a single line of JSON followed by `\n`.

use serde::{Deserialize, Serialize};

/// Messages from the CLI to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum DaemonMessage {
    /// Ping to check if the daemon is alive.
    Ping,

    /// Request the current status report (task counts, uptime, capacity).
    Status,

    /// Request the last `lines` lines of the daemon log.
    Logs { lines: usize },

    /// Request the daemon to stop gracefully.
    Shutdown,
}

/// Responses from the daemon to the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum DaemonResponse {
    /// Acknowledgment.
    Ok,

    /// Pong response to `Ping`.
    Pong { version: String },

    /// Status report, serialized as opaque JSON so the wire format doesn't
    /// couple the CLI binary to every internal status field.
    Status { report: serde_json::Value },

    /// Tail of the daemon log file.
    Logs { lines: Vec<String> },

    /// Error response.
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_round_trips() {
        let msg = DaemonMessage::Ping;
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"Ping"}"#);
        let parsed: DaemonMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn logs_request_round_trips() {
        let msg = DaemonMessage::Logs { lines: 50 };
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: DaemonMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn status_response_carries_opaque_json() {
        let resp = DaemonResponse::Status {
            report: serde_json::json!({"uptime_secs": 42}),
        };
        let json = serde_json::to_string(&resp).unwrap();
        let parsed: DaemonResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, resp);
    }

    #[test]
    fn error_response_round_trips() {
        let resp = DaemonResponse::Error {
            message: "boom".to_string(),
        };
        let json = serde_json::to_string(&resp).unwrap();
        let parsed: DaemonResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, resp);
    }
}
