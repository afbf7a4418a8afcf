//! Agent stream events
//!
//! One event per NDJSON line. The `type` tag uses SCREAMING_SNAKE_CASE;
//! payload fields are camelCase with snake_case aliases tolerated.
//! Unknown event kinds and malformed lines parse to `None` so the stream
//! reader can drop them without stalling.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{Activity, ActivityPatch, Message, Role, StatePatch};

/// Events delivered on a thread's live stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentEvent {
    #[serde(rename = "RUN_STARTED", rename_all = "camelCase")]
    RunStarted {
        #[serde(default, alias = "thread_id", skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        #[serde(default, alias = "run_id", skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
    },

    #[serde(rename = "RUN_FINISHED", rename_all = "camelCase")]
    RunFinished {
        #[serde(default, alias = "run_id", skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },

    #[serde(rename = "RUN_ERROR", rename_all = "camelCase")]
    RunError {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },

    #[serde(rename = "STEP_STARTED", rename_all = "camelCase")]
    StepStarted {
        #[serde(default, alias = "step_name", skip_serializing_if = "Option::is_none")]
        step_name: Option<String>,
    },

    #[serde(rename = "STEP_FINISHED", rename_all = "camelCase")]
    StepFinished {
        #[serde(default, alias = "step_name", skip_serializing_if = "Option::is_none")]
        step_name: Option<String>,
    },

    #[serde(rename = "TEXT_MESSAGE_START", rename_all = "camelCase")]
    TextMessageStart {
        #[serde(default, alias = "message_id", skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<Role>,
    },

    #[serde(rename = "TEXT_MESSAGE_CONTENT", rename_all = "camelCase")]
    TextMessageContent {
        #[serde(default, alias = "message_id", skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        delta: String,
    },

    #[serde(rename = "TEXT_MESSAGE_END", rename_all = "camelCase")]
    TextMessageEnd {
        #[serde(default, alias = "message_id", skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },

    #[serde(rename = "TOOL_CALL_START", rename_all = "camelCase")]
    ToolCallStart {
        #[serde(alias = "tool_call_id")]
        tool_call_id: String,
        #[serde(default, alias = "tool_call_name")]
        tool_call_name: String,
        #[serde(
            default,
            alias = "parent_tool_use_id",
            skip_serializing_if = "Option::is_none"
        )]
        parent_tool_use_id: Option<String>,
    },

    #[serde(rename = "TOOL_CALL_ARGS", rename_all = "camelCase")]
    ToolCallArgs {
        #[serde(alias = "tool_call_id")]
        tool_call_id: String,
        delta: String,
    },

    #[serde(rename = "TOOL_CALL_END", rename_all = "camelCase")]
    ToolCallEnd {
        #[serde(alias = "tool_call_id")]
        tool_call_id: String,
        #[serde(
            default,
            alias = "tool_call_name",
            skip_serializing_if = "Option::is_none"
        )]
        tool_call_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(
            default,
            alias = "duration_ms",
            skip_serializing_if = "Option::is_none"
        )]
        duration_ms: Option<u64>,
    },

    #[serde(rename = "STATE_SNAPSHOT", rename_all = "camelCase")]
    StateSnapshot { state: Map<String, Value> },

    #[serde(rename = "STATE_DELTA", rename_all = "camelCase")]
    StateDelta { delta: Vec<StatePatch> },

    #[serde(rename = "MESSAGES_SNAPSHOT", rename_all = "camelCase")]
    MessagesSnapshot { messages: Vec<Message> },

    #[serde(rename = "ACTIVITY_SNAPSHOT", rename_all = "camelCase")]
    ActivitySnapshot { activities: Vec<Activity> },

    #[serde(rename = "ACTIVITY_DELTA", rename_all = "camelCase")]
    ActivityDelta { delta: Vec<ActivityPatch> },

    #[serde(rename = "RAW", rename_all = "camelCase")]
    Raw {
        #[serde(default, alias = "event", skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
}

/// Parse one stream line into an event.
///
/// Returns `None` for blank lines, malformed JSON, and unknown event
/// kinds. Callers decide how loudly to log the drop.
pub fn parse_event_line(line: &str) -> Option<AgentEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str::<AgentEvent>(trimmed).ok()
}
