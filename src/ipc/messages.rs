//! Command protocol between the Controller and Tool Meisters.
//!
//! Uses JSON Lines over TCP. Message schema uses familiar field names
//! (id, result, error) but does NOT implement JSON-RPC 2.0.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{SampleId, ToolInvocation};
use crate::error::{Result, ToolMeisterError};
use crate::meister::MeisterState;
use crate::tools::ToolSpec;

/// Request sent from the Controller to a Tool Meister.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeisterRequest {
    /// Unique request ID for correlating responses.
    pub id: u64,
    pub command: Command,
}

impl MeisterRequest {
    pub fn new(id: u64, command: Command) -> Self {
        Self { id, command }
    }
}

/// Commands understood by a Tool Meister
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Command {
    /// Install the resolved tools of a group and run their install checks
    Register { group: String, tools: Vec<ToolSpec> },
    Start { sample: SampleId, group: String },
    Stop { sample: SampleId },
    Status,
    /// Return one page of the output files of a stopped sample
    Collect {
        sample: SampleId,
        /// Where the previous page ended; `None` for the first page
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cursor: Option<CollectCursor>,
    },
    /// Gather system information for a run, at its beginning or its end
    Sysinfo {
        run: String,
        phase: SysinfoPhase,
        items: Vec<String>,
    },
    /// Stop everything and shut the Meister down
    Terminate,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Register { .. } => CommandKind::Register,
            Self::Start { .. } => CommandKind::Start,
            Self::Stop { .. } => CommandKind::Stop,
            Self::Status => CommandKind::Status,
            Self::Collect { .. } => CommandKind::Collect,
            Self::Sysinfo { .. } => CommandKind::Sysinfo,
            Self::Terminate => CommandKind::Terminate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Register,
    Start,
    Stop,
    Status,
    Collect,
    Sysinfo,
    Terminate,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Register => "register",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Status => "status",
            Self::Collect => "collect",
            Self::Sysinfo => "sysinfo",
            Self::Terminate => "terminate",
        };
        f.write_str(s)
    }
}

/// When during a run system information is gathered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SysinfoPhase {
    Beg,
    End,
}

impl SysinfoPhase {
    /// Directory name under `<run>/sysinfo/`
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Beg => "beg",
            Self::End => "end",
        }
    }
}

/// Position in the sorted file list of a sample's output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectCursor {
    /// Index into the file list
    pub file: usize,
    /// Byte offset within that file
    pub offset: u64,
}

/// Response sent from a Tool Meister to the Controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeisterResponse {
    /// Request ID this response corresponds to.
    pub id: u64,
    /// Result value on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error details on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<MeisterError>,
}

impl MeisterResponse {
    /// Create a success response.
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create a success response from any serializable payload.
    pub fn from_payload<T: Serialize>(id: u64, payload: &T) -> Self {
        match serde_json::to_value(payload) {
            Ok(value) => Self::success(id, value),
            Err(e) => Self::error(id, MeisterError::internal_error(e.to_string())),
        }
    }

    /// Create an error response.
    pub fn error(id: u64, error: MeisterError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Check if this response indicates success.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Decode the result payload, turning a remote error into `Ipc`
    pub fn into_result<T: DeserializeOwned>(self) -> Result<T> {
        if let Some(err) = self.error {
            return Err(ToolMeisterError::Ipc(format!("[{}] {}", err.code, err.message)));
        }
        let value = self.result.unwrap_or(Value::Null);
        Ok(serde_json::from_value(value)?)
    }
}

/// Error details in a Meister response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeisterError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl MeisterError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(code: i32, message: impl Into<String>, data: Value) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(data),
        }
    }

    /// Parse error (-32700).
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PARSE_ERROR, message)
    }

    /// Internal error (-32603).
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::INTERNAL_ERROR, message)
    }

    /// Group was never registered on this Meister
    pub fn not_registered(group: &str) -> Self {
        Self::new(ErrorCode::NOT_REGISTERED, format!("group {} is not registered", group))
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::INVALID_STATE, message)
    }
}

impl From<&ToolMeisterError> for MeisterError {
    fn from(err: &ToolMeisterError) -> Self {
        let code = match err {
            ToolMeisterError::NotFound(_) => ErrorCode::NOT_REGISTERED,
            ToolMeisterError::InvalidState(_) => ErrorCode::INVALID_STATE,
            ToolMeisterError::Io(_) | ToolMeisterError::SpawnError { .. } => ErrorCode::SAMPLE_FAILED,
            _ => ErrorCode::INTERNAL_ERROR,
        };
        Self::new(code, err.to_string())
    }
}

/// Standard error codes.
pub struct ErrorCode;

impl ErrorCode {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const INTERNAL_ERROR: i32 = -32603;
    pub const NOT_REGISTERED: i32 = 1001;
    pub const INVALID_STATE: i32 = 1002;
    /// The Meister cannot serve the sample at all
    pub const SAMPLE_FAILED: i32 = 1003;
}

/// Per-tool result inside an acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Installed,
    NotInstalled,
    Started,
    SpawnFailed,
    Stopped,
    Forced,
    AlreadyExited,
    /// Stop found no handle for the tool
    NotRunning,
    Failed,
}

impl OutcomeKind {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::NotInstalled | Self::SpawnFailed | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub tool: String,
    pub outcome: OutcomeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation: Option<ToolInvocation>,
}

impl ToolOutcome {
    pub fn new(tool: impl Into<String>, outcome: OutcomeKind) -> Self {
        Self {
            tool: tool.into(),
            outcome,
            pid: None,
            exit_code: None,
            error: None,
            truncated: false,
            invocation: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_invocation(mut self, invocation: ToolInvocation) -> Self {
        self.pid = invocation.pid;
        self.exit_code = invocation.exit_code;
        self.truncated = invocation.truncated;
        if self.error.is_none() {
            self.error = invocation.error.clone();
        }
        self.invocation = Some(invocation);
        self
    }
}

/// Reply to REGISTER, START and STOP
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<SampleId>,
    pub state: MeisterState,
    #[serde(default)]
    pub tools: Vec<ToolOutcome>,
}

impl Acknowledgement {
    pub fn new(host: &str, sample: Option<&SampleId>, state: MeisterState) -> Self {
        Self {
            host: host.to_string(),
            sample: sample.cloned(),
            state,
            tools: Vec::new(),
        }
    }

    /// Tools whose outcome is a failure
    pub fn failures(&self) -> impl Iterator<Item = &ToolOutcome> {
        self.tools.iter().filter(|t| t.outcome.is_failure())
    }
}

/// Reply to STATUS
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub host: String,
    pub groups: Vec<String>,
    /// Sample display id → state
    pub samples: BTreeMap<String, MeisterState>,
    pub uptime_ms: u64,
}

/// One file, or one chunk of a file, carried by COLLECT or SYSINFO
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferFile {
    /// Relative to the sample directory, `/`-separated
    pub path: String,
    /// Where `data` starts in the file; chunks of a file arrive in order
    #[serde(default)]
    pub offset: u64,
    /// base64 standard encoding
    pub data: String,
}

/// Reply to COLLECT: one page of output chunks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectedFiles {
    pub host: String,
    pub sample: SampleId,
    pub state: MeisterState,
    pub files: Vec<TransferFile>,
    /// Cursor for the next page; `None` once everything was sent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<CollectCursor>,
}

/// Reply to SYSINFO
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SysinfoDump {
    pub host: String,
    pub phase: SysinfoPhase,
    pub files: Vec<TransferFile>,
    /// Item name to reason, for items that failed or are unknown
    #[serde(default)]
    pub failed: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_format() {
        let req = MeisterRequest::new(
            7,
            Command::Start {
                sample: SampleId::new("fio", 1, 2),
                group: "default".to_string(),
            },
        );
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["command"]["kind"], "start");
        assert_eq!(json["command"]["sample"]["run"], "fio");
        assert_eq!(json["command"]["group"], "default");

        let status: MeisterRequest = serde_json::from_str(r#"{"id":1,"command":{"kind":"status"}}"#).unwrap();
        assert_eq!(status.command, Command::Status);
        assert_eq!(status.command.kind(), CommandKind::Status);
    }

    #[test]
    fn test_collect_cursor_wire_format() {
        let first: Command = serde_json::from_str(r#"{"kind":"collect","sample":{"run":"r","iteration":1,"sample":1}}"#).unwrap();
        assert_eq!(
            first,
            Command::Collect {
                sample: SampleId::new("r", 1, 1),
                cursor: None
            }
        );

        let next = Command::Collect {
            sample: SampleId::new("r", 1, 1),
            cursor: Some(CollectCursor { file: 2, offset: 4096 }),
        };
        let json = serde_json::to_value(&next).unwrap();
        assert_eq!(json["cursor"]["file"], 2);
        assert_eq!(json["cursor"]["offset"], 4096);

        let sysinfo = Command::Sysinfo {
            run: "r".into(),
            phase: SysinfoPhase::End,
            items: vec!["kernel".into()],
        };
        assert_eq!(serde_json::to_value(&sysinfo).unwrap()["phase"], "end");
        assert_eq!(sysinfo.kind().to_string(), "sysinfo");
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let result = serde_json::from_str::<MeisterRequest>(r#"{"id":1,"command":{"kind":"reboot"}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_into_result() {
        let ack = Acknowledgement::new("h1", None, MeisterState::Idle);
        let resp = MeisterResponse::from_payload(3, &ack);
        assert!(resp.is_success());
        let back: Acknowledgement = resp.into_result().unwrap();
        assert_eq!(back.host, "h1");

        let resp = MeisterResponse::error(4, MeisterError::not_registered("default"));
        let err = resp.into_result::<Acknowledgement>().unwrap_err();
        assert!(err.to_string().contains("1001"));
    }

    #[test]
    fn test_error_code_mapping() {
        let err = ToolMeisterError::NotFound("group x".into());
        assert_eq!(MeisterError::from(&err).code, ErrorCode::NOT_REGISTERED);
        let err = ToolMeisterError::Io(std::io::Error::other("disk full"));
        assert_eq!(MeisterError::from(&err).code, ErrorCode::SAMPLE_FAILED);
    }

    #[test]
    fn test_acknowledgement_failures() {
        let mut ack = Acknowledgement::new("h1", None, MeisterState::Running);
        ack.tools.push(ToolOutcome::new("sar", OutcomeKind::Started));
        ack.tools
            .push(ToolOutcome::new("iostat", OutcomeKind::NotInstalled).with_error("exit 1"));
        let failed: Vec<_> = ack.failures().map(|t| t.tool.as_str()).collect();
        assert_eq!(failed, vec!["iostat"]);

        let json = serde_json::to_string(&ack).unwrap();
        assert!(json.contains(r#""outcome":"not_installed""#));
        assert!(!json.contains("\"pid\""));
    }
}
