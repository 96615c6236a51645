//! Wire Envelope
//!
//! Every frame on an Outpost connection is one JSON envelope:
//! `{type, id, data, timestamp, agent_id}`. The `data` object is decoded
//! into a typed [`Payload`] by matching on `type`, never by inspecting the
//! shape of the JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::payloads::*;

macro_rules! message_types {
    ($($(#[$meta:meta])* $variant:ident($payload:ty) = $wire:literal,)*) => {
        /// Message type tag, serialized as the envelope's `type` field.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum MessageType {
            $(
                $(#[$meta])*
                #[serde(rename = $wire)]
                $variant,
            )*
        }

        impl MessageType {
            /// Wire name of this type.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(MessageType::$variant => $wire,)*
                }
            }
        }

        /// Typed envelope body, one variant per message type.
        #[derive(Debug, Clone, PartialEq)]
        pub enum Payload {
            $($variant($payload),)*
        }

        impl Payload {
            /// The message type this payload travels under.
            pub fn kind(&self) -> MessageType {
                match self {
                    $(Payload::$variant(_) => MessageType::$variant,)*
                }
            }

            /// Decode `data` as the shape declared by `kind`.
            pub fn decode(kind: MessageType, data: Value) -> Result<Self, ProtocolError> {
                // A null body is accepted for payloads whose fields all default.
                let data = match data {
                    Value::Null => Value::Object(Default::default()),
                    other => other,
                };
                let decoded = match kind {
                    $(MessageType::$variant => {
                        serde_json::from_value::<$payload>(data).map(Payload::$variant)
                    })*
                };
                decoded.map_err(|source| ProtocolError::InvalidPayload { kind, source })
            }

            /// Encode into the envelope's `data` value.
            pub fn to_data(&self) -> Result<Value, ProtocolError> {
                let encoded = match self {
                    $(Payload::$variant(p) => serde_json::to_value(p),)*
                };
                encoded.map_err(ProtocolError::Encode)
            }
        }
    };
}

message_types! {
    Auth(AuthPayload) = "auth",
    AuthSuccess(AuthSuccessPayload) = "auth_success",
    AuthError(ErrorPayload) = "auth_error",
    /// Liveness pulse; the server echoes its id in a `pong`.
    Ping(PingPayload) = "ping",
    Pong(PongPayload) = "pong",
    Error(ErrorPayload) = "error",
    /// Unsolicited agent status push.
    Status(StatusReport) = "status",

    CommandExecute(CommandRequest) = "command_execute",
    CommandResult(CommandResult) = "command_result",
    CommandError(ErrorPayload) = "command_error",

    FileChunk(FileChunk) = "file_chunk",
    FileChunkResult(FileChunkResult) = "file_chunk_result",
    FileList(FileListRequest) = "file_list",
    FileListResult(FileListResult) = "file_list_result",
    FileDelete(FileDeleteRequest) = "file_delete",
    FileDeleteResult(FilePathResult) = "file_delete_result",
    FileMkdir(FileMkdirRequest) = "file_mkdir",
    FileMkdirResult(FilePathResult) = "file_mkdir_result",
    FileError(ErrorPayload) = "file_error",

    ServiceList(ServiceListRequest) = "service_list",
    ServiceListResult(ServiceListResult) = "service_list_result",
    ServiceStatus(ServiceStatusRequest) = "service_status",
    ServiceStatusResult(ServiceStatusResult) = "service_status_result",
    ServiceAction(ServiceActionRequest) = "service_action",
    ServiceActionResult(ServiceActionResult) = "service_action_result",
    ServiceError(ErrorPayload) = "service_error",

    LogList(LogListRequest) = "log_list",
    LogListResult(LogListResult) = "log_list_result",
    LogContent(LogContentRequest) = "log_content",
    LogContentResult(LogContentResult) = "log_content_result",
    LogError(ErrorPayload) = "log_error",
}

impl MessageType {
    /// `(result, error)` types answering this request type, or `None` when
    /// this is not a request.
    pub fn response_types(&self) -> Option<(MessageType, MessageType)> {
        use MessageType as M;
        let pair = match self {
            M::Auth => (M::AuthSuccess, M::AuthError),
            M::Ping => (M::Pong, M::Error),
            M::CommandExecute => (M::CommandResult, M::CommandError),
            M::FileChunk => (M::FileChunkResult, M::FileError),
            M::FileList => (M::FileListResult, M::FileError),
            M::FileDelete => (M::FileDeleteResult, M::FileError),
            M::FileMkdir => (M::FileMkdirResult, M::FileError),
            M::ServiceList => (M::ServiceListResult, M::ServiceError),
            M::ServiceStatus => (M::ServiceStatusResult, M::ServiceError),
            M::ServiceAction => (M::ServiceActionResult, M::ServiceError),
            M::LogList => (M::LogListResult, M::LogError),
            M::LogContent => (M::LogContentResult, M::LogError),
            _ => return None,
        };
        Some(pair)
    }

    pub fn is_request(&self) -> bool {
        self.response_types().is_some()
    }

    /// Whether this type reports a failure.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            MessageType::AuthError
                | MessageType::Error
                | MessageType::CommandError
                | MessageType::FileError
                | MessageType::ServiceError
                | MessageType::LogError
        )
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One self-describing protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,

    /// Correlation key; empty for fire-and-forget and unsolicited pushes.
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub data: Value,

    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub agent_id: String,
}

impl Envelope {
    /// Wrap a payload in a fresh envelope with no correlation id.
    pub fn new(payload: Payload) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind: payload.kind(),
            id: String::new(),
            data: payload.to_data()?,
            timestamp: Utc::now(),
            agent_id: String::new(),
        })
    }

    /// Wrap a payload under a newly generated correlation id.
    pub fn request(payload: Payload) -> Result<Self, ProtocolError> {
        Ok(Self::new(payload)?.with_id(new_request_id()))
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }

    /// Build the response to this envelope, echoing its id and agent id.
    pub fn reply(&self, payload: Payload) -> Result<Self, ProtocolError> {
        Ok(Self::new(payload)?
            .with_id(self.id.clone())
            .with_agent_id(self.agent_id.clone()))
    }

    /// Decode the typed payload.
    pub fn payload(&self) -> Result<Payload, ProtocolError> {
        Payload::decode(self.kind, self.data.clone())
    }

    /// Decode the payload, failing if the envelope is not of type `expected`.
    pub fn expect(&self, expected: MessageType) -> Result<Payload, ProtocolError> {
        if self.kind != expected {
            return Err(ProtocolError::UnexpectedType {
                expected,
                actual: self.kind,
            });
        }
        self.payload()
    }

    /// True for pushes that answer no request.
    pub fn is_unsolicited(&self) -> bool {
        self.id.is_empty()
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(json).map_err(ProtocolError::Malformed)
    }
}

/// Generate a requester-side correlation id.
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let env = Envelope::new(Payload::Auth(AuthPayload::new("secret")))
            .unwrap()
            .with_agent_id("agent-1");
        let json: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();

        assert_eq!(json["type"], "auth");
        assert_eq!(json["id"], "");
        assert_eq!(json["data"]["token"], "secret");
        assert_eq!(json["agent_id"], "agent-1");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_decode_by_tag() {
        let json = r#"{
            "type": "command_execute",
            "id": "req-1",
            "data": {"command": "pwd", "timeout": 5},
            "timestamp": "2024-01-01T00:00:00Z",
            "agent_id": ""
        }"#;

        let env = Envelope::from_json(json).unwrap();
        match env.payload().unwrap() {
            Payload::CommandExecute(req) => {
                assert_eq!(req.command, "pwd");
                assert_eq!(req.timeout, 5);
            }
            other => panic!("Expected CommandExecute, got {:?}", other),
        }
    }

    #[test]
    fn test_shape_mismatch_is_protocol_error() {
        let json = r#"{"type": "command_result", "id": "x", "data": {"command": "ls"}}"#;
        let env = Envelope::from_json(json).unwrap();
        assert!(matches!(
            env.payload(),
            Err(ProtocolError::InvalidPayload { kind: MessageType::CommandResult, .. })
        ));
    }

    #[test]
    fn test_unknown_type_is_malformed() {
        let json = r#"{"type": "launch_missiles", "id": "", "data": null}"#;
        assert!(matches!(
            Envelope::from_json(json),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_null_data_for_defaulted_payload() {
        let json = r#"{"type": "auth_success", "data": null}"#;
        let env = Envelope::from_json(json).unwrap();
        assert!(matches!(env.payload(), Ok(Payload::AuthSuccess(_))));
    }

    #[test]
    fn test_reply_echoes_id() {
        let req = Envelope::request(Payload::CommandExecute(CommandRequest::new("ls")))
            .unwrap()
            .with_agent_id("a");
        let resp = req
            .reply(Payload::CommandResult(CommandResult::default()))
            .unwrap();
        assert_eq!(resp.id, req.id);
        assert_eq!(resp.agent_id, "a");
        assert!(!resp.is_unsolicited());
    }

    #[test]
    fn test_every_request_has_result_and_error() {
        let requests = [
            MessageType::CommandExecute,
            MessageType::FileChunk,
            MessageType::FileList,
            MessageType::FileDelete,
            MessageType::FileMkdir,
            MessageType::ServiceList,
            MessageType::ServiceStatus,
            MessageType::ServiceAction,
            MessageType::LogList,
            MessageType::LogContent,
        ];
        for kind in requests {
            let (result, error) = kind.response_types().unwrap();
            assert!(!result.is_error(), "{kind} result");
            assert!(error.is_error(), "{kind} error");
        }
        assert!(MessageType::Status.response_types().is_none());
    }

    #[test]
    fn test_expect_rejects_other_type() {
        let env = Envelope::new(Payload::Ping(PingPayload::default())).unwrap();
        assert!(matches!(
            env.expect(MessageType::Pong),
            Err(ProtocolError::UnexpectedType { .. })
        ));
    }
}
