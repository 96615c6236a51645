//! Message Payloads
//!
//! The `data` shapes carried by each message type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// Session payloads

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthPayload {
    pub token: String,
    /// Identity the agent asks for; a signed token's subject takes precedence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl AuthPayload {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            agent_id: None,
            name: None,
            hostname: None,
            version: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthSuccessPayload {
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub server_time: Option<DateTime<Utc>>,
}

/// Shared by `error` and every `*_error` message type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorPayload {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PingPayload {
    #[serde(default)]
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PongPayload {
    #[serde(default)]
    pub server_time: Option<DateTime<Utc>>,
}

/// Unsolicited periodic status pushed by the agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub uptime_secs: u64,
    #[serde(default)]
    pub shell: ShellStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShellStatus {
    #[serde(default)]
    pub state: String,
    /// Advisory only; the interpreter's own state is authoritative.
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub commands_run: u64,
}

// Command execution

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Seconds; zero selects the agent's default.
    #[serde(default)]
    pub timeout: u64,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = secs;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub exit_code: i32,
    /// Milliseconds.
    pub duration: u64,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

// Files

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChunk {
    pub path: String,
    pub offset: u64,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    /// Hex SHA-256 of `data`; empty skips verification.
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub is_last: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileChunkResult {
    pub path: String,
    pub offset: u64,
    pub bytes_written: u64,
    pub complete: bool,
    /// Whole-file hex SHA-256, present once the upload is complete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileListRequest {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    #[serde(default)]
    pub modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileListResult {
    pub path: String,
    pub entries: Vec<FileEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDeleteRequest {
    pub path: String,
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMkdirRequest {
    pub path: String,
    #[serde(default)]
    pub parents: bool,
}

/// Result for delete and mkdir.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilePathResult {
    pub path: String,
}

// Services

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceListRequest {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub load_state: String,
    #[serde(default)]
    pub active_state: String,
    #[serde(default)]
    pub sub_state: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceListResult {
    pub services: Vec<ServiceInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatusRequest {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatusResult {
    pub service: ServiceInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
    Reload,
    Enable,
    Disable,
}

impl ServiceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
            ServiceAction::Restart => "restart",
            ServiceAction::Reload => "reload",
            ServiceAction::Enable => "enable",
            ServiceAction::Disable => "disable",
        }
    }
}

impl std::fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceActionRequest {
    pub name: String,
    pub action: ServiceAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceActionResult {
    pub name: String,
    pub action: ServiceAction,
    pub success: bool,
    #[serde(default)]
    pub output: String,
}

// Logs

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogListRequest {
    #[serde(default)]
    pub directory: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogFile {
    pub name: String,
    pub path: String,
    pub size: u64,
    #[serde(default)]
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogListResult {
    pub files: Vec<LogFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogContentRequest {
    pub path: String,
    /// Tail length; the agent caps it.
    #[serde(default)]
    pub lines: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogContentResult {
    pub path: String,
    pub content: String,
    pub lines: usize,
    pub truncated: bool,
}

/// Bytes travel as standard base64 strings.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_chunk_data_is_base64() {
        let chunk = FileChunk {
            path: "/tmp/a".to_string(),
            offset: 0,
            data: b"hello".to_vec(),
            checksum: String::new(),
            is_last: true,
        };
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["data"], "aGVsbG8=");

        let back: FileChunk = serde_json::from_value(json).unwrap();
        assert_eq!(back.data, b"hello");
    }

    #[test]
    fn test_command_request_defaults() {
        let req: CommandRequest = serde_json::from_str(r#"{"command":"ls"}"#).unwrap();
        assert_eq!(req.command, "ls");
        assert!(req.args.is_empty());
        assert!(req.env.is_empty());
        assert_eq!(req.timeout, 0);
    }

    #[test]
    fn test_invalid_base64_is_rejected() {
        let json = r#"{"path":"/x","offset":0,"data":"!!!","is_last":false}"#;
        assert!(serde_json::from_str::<FileChunk>(json).is_err());
    }
}
