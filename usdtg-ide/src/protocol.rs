//! Wire protocol: newline-delimited JSON envelopes.
//!
//! Inbound: `{"id": <any>?, "type": "<Request>", "payload": {...}}`.
//! Outbound: `{"seq": n, "client": c, "id": <echoed>?, "type": "<Event>", "payload": ...}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use usdtg_core::CompilationMode;

use crate::error::{ErrorKind, ErrorStage, IdeError};
use crate::loader::{FileContent, FileEntry, FileVersion};
use crate::sandbox::ProcessOutput;
use crate::session::{CompileOutcome, TerminateOutcome};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveFileParams {
    pub path: String,
    pub content: String,
    /// Version the client edited; a mismatch is a conflict.
    #[serde(default)]
    pub base_version: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PathParams {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileParams {
    pub file_path: String,
    #[serde(default = "default_mode")]
    pub mode: CompilationMode,
    #[serde(default)]
    pub optimization_level: Option<u8>,
    #[serde(default)]
    pub quantum_safety: Option<bool>,
    #[serde(default)]
    pub gas_optimization: Option<bool>,
}

fn default_mode() -> CompilationMode {
    CompilationMode::Debug
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunParams {
    pub file_path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalParams {
    pub command: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Request {
    SaveFile(SaveFileParams),
    LoadFile(PathParams),
    Compile(CompileParams),
    Run(RunParams),
    Debug(RunParams),
    GetFiles,
    CreateFile(PathParams),
    DeleteFile(PathParams),
    TerminalCommand(TerminalParams),
    /// Cancel the in-flight compile and kill the running process.
    Terminate,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::SaveFile(_) => "SaveFile",
            Request::LoadFile(_) => "LoadFile",
            Request::Compile(_) => "Compile",
            Request::Run(_) => "Run",
            Request::Debug(_) => "Debug",
            Request::GetFiles => "GetFiles",
            Request::CreateFile(_) => "CreateFile",
            Request::DeleteFile(_) => "DeleteFile",
            Request::TerminalCommand(_) => "TerminalCommand",
            Request::Terminate => "Terminate",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Client-chosen correlation id, echoed in the response.
    pub id: Option<Value>,
    pub request: Request,
}

/// A message that could not be decoded, with whatever id it carried.
#[derive(Debug)]
pub struct DecodeError {
    pub id: Option<Value>,
    pub error: IdeError,
}

pub fn decode(line: &str) -> Result<Envelope, DecodeError> {
    let mut value: Value = serde_json::from_str(line).map_err(|err| DecodeError {
        id: None,
        error: IdeError::Protocol(err.to_string()),
    })?;
    let Some(object) = value.as_object_mut() else {
        return Err(DecodeError {
            id: None,
            error: IdeError::Protocol("message must be a JSON object".to_string()),
        });
    };
    let id = object.remove("id").filter(|id| !id.is_null());
    object.entry("payload").or_insert(Value::Null);
    match serde_json::from_value(value) {
        Ok(request) => Ok(Envelope { id, request }),
        Err(err) => Err(DecodeError {
            id,
            error: IdeError::Protocol(err.to_string()),
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub stage: ErrorStage,
    pub message: String,
}

impl From<&IdeError> for ErrorPayload {
    fn from(err: &IdeError) -> Self {
        ErrorPayload {
            kind: err.kind(),
            stage: err.stage(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum EventBody {
    FileSaved(FileVersion),
    FileLoaded(FileContent),
    CompileResult(CompileOutcome),
    RunResult(ProcessOutput),
    DebugResult(ProcessOutput),
    FileList(Vec<FileEntry>),
    FileCreated(FileVersion),
    FileDeleted(FileVersion),
    TerminalOutput(ProcessOutput),
    TerminateResult(TerminateOutcome),
    Error(ErrorPayload),
}

impl EventBody {
    pub fn error(err: &IdeError) -> Self {
        EventBody::Error(ErrorPayload::from(err))
    }
}

/// Identifies one connected client within a broker.
pub type ClientId = u64;

/// A response, broadcast to every subscriber of the session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Per-session sequence number, in broadcast order.
    pub seq: u64,
    /// Client whose request produced this event.
    pub client: ClientId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(flatten)]
    pub body: EventBody,
}

pub fn encode(event: &Event) -> Result<String, IdeError> {
    serde_json::to_string(event).map_err(|err| IdeError::Protocol(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_requests_with_and_without_payload() {
        let envelope = decode(
            r#"{"id": 7, "type": "Compile", "payload": {"filePath": "a.usdtg", "mode": "release", "optimizationLevel": 3}}"#,
        )
        .expect("decode");
        assert_eq!(envelope.id, Some(json!(7)));
        let Request::Compile(params) = envelope.request else {
            panic!("expected Compile");
        };
        assert_eq!(params.mode, CompilationMode::Release);
        assert_eq!(params.optimization_level, Some(3));
        assert_eq!(params.quantum_safety, None);

        let envelope = decode(r#"{"type": "GetFiles"}"#).expect("decode");
        assert_eq!(envelope.request, Request::GetFiles);
        assert_eq!(envelope.id, None);

        let envelope = decode(r#"{"type":"SaveFile","payload":{"path":"a","content":"x","baseVersion":2}}"#)
            .expect("decode");
        assert!(matches!(
            envelope.request,
            Request::SaveFile(SaveFileParams { base_version: Some(2), .. })
        ));
    }

    #[test]
    fn malformed_messages_keep_their_id() {
        let err = decode(r#"{"id": "abc", "type": "Explode"}"#).unwrap_err();
        assert_eq!(err.id, Some(json!("abc")));
        assert_eq!(err.error.kind(), ErrorKind::Protocol);

        let err = decode(r#"{"id": 1, "type": "LoadFile"}"#).unwrap_err();
        assert_eq!(err.id, Some(json!(1)));

        assert!(decode("not json").is_err());
        assert!(decode("[1, 2]").is_err());
    }

    #[test]
    fn events_flatten_type_and_payload() {
        let event = Event {
            seq: 3,
            client: 1,
            id: Some(json!("req-1")),
            body: EventBody::error(&IdeError::QueueFull),
        };
        let value: Value = serde_json::from_str(&encode(&event).expect("encode")).expect("json");
        assert_eq!(
            value,
            json!({
                "seq": 3,
                "client": 1,
                "id": "req-1",
                "type": "Error",
                "payload": {"kind": "resource", "stage": "protocol", "message": "request queue is full"}
            })
        );
    }
}
