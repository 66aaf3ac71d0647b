use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const TIMEOUT_ERROR: &str = "timeout";
pub const CANCELLED_ERROR: &str = "cancelled";

/// A unit of work waiting to be picked up by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
}

/// Outcome of a command as seen by the original caller. Timeouts and
/// cancellations use the same shape so callers never branch on transport
/// failures separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResult {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    pub fn timeout() -> Self {
        Self::failed(TIMEOUT_ERROR)
    }

    pub fn cancelled() -> Self {
        Self::failed(CANCELLED_ERROR)
    }

    pub fn is_timeout(&self) -> bool {
        !self.success && self.error.as_deref() == Some(TIMEOUT_ERROR)
    }
}

/// One entry of a `submitResults` batch. Both fields are optional on the
/// wire so a single broken entry never fails deserialization of the batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSubmission {
    #[serde(default)]
    pub command_id: Option<String>,
    #[serde(default)]
    pub result: Option<CommandResult>,
}

impl ResultSubmission {
    pub fn new(command_id: impl Into<String>, result: CommandResult) -> Self {
        Self {
            command_id: Some(command_id.into()),
            result: Some(result),
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP request / response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    pub command_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollQuery {
    #[serde(default)]
    pub max_batch: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitQuery {
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollResponse {
    pub commands: Vec<Command>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResultsRequest {
    #[serde(default)]
    pub results: Vec<ResultSubmission>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResultsResponse {
    pub accepted_count: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub accepted: bool,
}

// ---------------------------------------------------------------------------
// Push transport frames
// ---------------------------------------------------------------------------

/// Frames the agent sends over the push socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentFrame {
    Results {
        #[serde(default)]
        results: Vec<ResultSubmission>,
    },
    Heartbeat {
        #[serde(default)]
        timestamp: Option<i64>,
    },
}

/// Frames the broker sends over the push socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerFrame {
    Commands {
        commands: Vec<Command>,
    },
    Ack {
        #[serde(rename = "acceptedCount")]
        accepted_count: usize,
    },
    Error {
        message: String,
    },
}
