//! Pure event reducer
//!
//! `reduce` folds one stream event into `ClientState` and returns the new
//! state. No I/O, no clocks, no randomness beyond minting ids for
//! synthesized messages. The stream is at-least-once, so every handler
//! tolerates duplicates and out-of-order tool-call ends.

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use groundstation_protocol::{
    new_id, ActivityOp, AgentEvent, Message, PatchOp, Role, StatePatch, ToolCall, ToolCallStatus,
};
use groundstation_protocol::{Activity, ActivityPatch};

/// Where the client currently stands relative to the live stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Connected,
    Completed,
    Error,
}

/// An open text message still receiving content deltas
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
}

/// A tool call that has started but not yet ended
#[derive(Debug, Clone, PartialEq)]
pub struct PendingToolCall {
    pub id: String,
    pub name: String,
    pub args: String,
    pub parent_tool_use_id: Option<String>,
}

/// Reduced view of one agent thread
#[derive(Debug, Clone, PartialEq)]
pub struct ClientState {
    pub thread_id: String,
    pub active_run_id: Option<String>,
    pub connection_status: ConnectionStatus,
    pub messages: Vec<Message>,
    pub kv_state: Map<String, Value>,
    pub activity_log: Vec<Activity>,
    pub in_progress: Option<StreamingMessage>,
    pub pending_tool_calls: HashMap<String, PendingToolCall>,
    pub pending_children: HashMap<String, Vec<ToolCall>>,
    pub hidden_message_ids: HashSet<String>,
    pub interrupt_requested: bool,
    pub last_error: Option<String>,
}

impl ClientState {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            active_run_id: None,
            connection_status: ConnectionStatus::Idle,
            messages: Vec::new(),
            kv_state: Map::new(),
            activity_log: Vec::new(),
            in_progress: None,
            pending_tool_calls: HashMap::new(),
            pending_children: HashMap::new(),
            hidden_message_ids: HashSet::new(),
            interrupt_requested: false,
            last_error: None,
        }
    }
}

/// Fold one event into the state.
pub fn reduce(mut state: ClientState, event: AgentEvent) -> ClientState {
    match event {
        AgentEvent::RunStarted { thread_id, run_id } => {
            if let Some(thread_id) = thread_id {
                state.thread_id = thread_id;
            }
            state.active_run_id = run_id;
            state.interrupt_requested = false;
            state.last_error = None;
            state.connection_status = ConnectionStatus::Connected;
        }

        AgentEvent::RunFinished { .. } => {
            finalize_streaming(&mut state);
            state.active_run_id = None;
            state.interrupt_requested = false;
        }

        AgentEvent::RunError { message, code } => {
            let detail = match code {
                Some(code) => format!("[{code}] {message}"),
                None => message,
            };
            state.last_error = Some(detail);
            state.active_run_id = None;
            state.interrupt_requested = false;
            state.connection_status = ConnectionStatus::Error;
            // in_progress is kept so partial content survives the error
        }

        AgentEvent::StepStarted { step_name } => {
            let value = step_name.map(Value::String).unwrap_or(Value::Null);
            state.kv_state.insert("currentStep".to_string(), value);
        }

        AgentEvent::StepFinished { .. } => {
            state.kv_state.remove("currentStep");
        }

        AgentEvent::TextMessageStart { message_id, role } => {
            // an unterminated previous message still gets flushed
            finalize_streaming(&mut state);
            state.in_progress = Some(StreamingMessage {
                id: message_id.unwrap_or_else(new_id),
                role: role.unwrap_or(Role::Assistant),
                content: String::new(),
            });
        }

        AgentEvent::TextMessageContent { message_id, delta } => match &mut state.in_progress {
            Some(open) => open.content.push_str(&delta),
            None => {
                debug!(
                    component = "reducer",
                    event = "stream.text_content.no_open_message",
                    message_id = message_id.as_deref().unwrap_or(""),
                );
            }
        },

        AgentEvent::TextMessageEnd { message_id } => {
            if state.in_progress.is_none() {
                debug!(
                    component = "reducer",
                    event = "stream.text_end.no_open_message",
                    message_id = message_id.as_deref().unwrap_or(""),
                );
            }
            finalize_streaming(&mut state);
        }

        AgentEvent::ToolCallStart {
            tool_call_id,
            tool_call_name,
            parent_tool_use_id,
        } => {
            // at-least-once delivery: a redelivered start must not revive
            // a finalized call or wipe an accumulator mid-flight
            if state.pending_tool_calls.contains_key(&tool_call_id)
                || tool_call_known(&state, &tool_call_id)
            {
                warn!(
                    component = "reducer",
                    event = "stream.tool_start.duplicate",
                    tool_call_id = %tool_call_id,
                );
                return state;
            }
            state.pending_tool_calls.insert(
                tool_call_id.clone(),
                PendingToolCall {
                    id: tool_call_id,
                    name: tool_call_name,
                    args: String::new(),
                    parent_tool_use_id,
                },
            );
        }

        AgentEvent::ToolCallArgs {
            tool_call_id,
            delta,
        } => match state.pending_tool_calls.get_mut(&tool_call_id) {
            Some(pending) => pending.args.push_str(&delta),
            None => {
                debug!(
                    component = "reducer",
                    event = "stream.tool_args.unknown_tool_call",
                    tool_call_id = %tool_call_id,
                );
            }
        },

        AgentEvent::ToolCallEnd {
            tool_call_id,
            tool_call_name,
            args,
            result,
            error,
            duration_ms,
        } => {
            if tool_call_known(&state, &tool_call_id) {
                warn!(
                    component = "reducer",
                    event = "stream.tool_end.duplicate",
                    tool_call_id = %tool_call_id,
                );
                // a redelivered start may have left an accumulator behind;
                // children keyed on it would otherwise buffer forever
                state.pending_tool_calls.remove(&tool_call_id);
                return state;
            }
            let (name, args, parent_tool_use_id) =
                match state.pending_tool_calls.remove(&tool_call_id) {
                    Some(pending) => {
                        let args = if pending.args.is_empty() {
                            None
                        } else {
                            Some(pending.args)
                        };
                        (pending.name, args, pending.parent_tool_use_id)
                    }
                    None => {
                        debug!(
                            component = "reducer",
                            event = "stream.tool_end.no_start",
                            tool_call_id = %tool_call_id,
                        );
                        (tool_call_name.unwrap_or_default(), args, None)
                    }
                };
            let status = if error.is_some() {
                ToolCallStatus::Error
            } else {
                ToolCallStatus::Completed
            };
            let finished = ToolCall {
                id: tool_call_id,
                name,
                args,
                status: Some(status),
                result,
                error,
                parent_tool_use_id,
                duration_ms,
            };
            attach_finished_tool_call(&mut state, finished);
        }

        AgentEvent::StateSnapshot { state: snapshot } => {
            state.kv_state = snapshot;
        }

        AgentEvent::StateDelta { delta } => {
            for patch in delta {
                apply_state_patch(&mut state.kv_state, patch);
            }
        }

        AgentEvent::MessagesSnapshot { messages } => {
            let mut merged: Vec<Message> = messages
                .into_iter()
                .filter(|message| !state.hidden_message_ids.contains(&message.id))
                .collect();
            let local = std::mem::take(&mut state.messages);
            for message in local {
                if !merged.iter().any(|m| m.id == message.id) {
                    merged.push(message);
                }
            }
            state.messages = merged;
        }

        AgentEvent::ActivitySnapshot { activities } => {
            state.activity_log = activities;
        }

        AgentEvent::ActivityDelta { delta } => {
            for patch in delta {
                apply_activity_patch(&mut state.activity_log, patch);
            }
        }

        AgentEvent::Raw { data } => {
            if let Some(data) = data {
                apply_raw(&mut state, data);
            }
        }
    }
    state
}

/// Move the open streaming message into the finalized history.
///
/// Empty and hidden messages are dropped. Tool-call accumulators are
/// untouched; a tool call may outlive the text turn that announced it.
fn finalize_streaming(state: &mut ClientState) {
    let Some(open) = state.in_progress.take() else {
        return;
    };
    if open.content.is_empty() {
        return;
    }
    if state.hidden_message_ids.contains(&open.id) {
        debug!(
            component = "reducer",
            event = "stream.text_end.hidden",
            message_id = %open.id,
        );
        return;
    }
    match state.messages.iter_mut().find(|m| m.id == open.id) {
        Some(existing) => {
            if existing.content != open.content {
                existing.content = open.content;
            }
        }
        None => {
            state
                .messages
                .push(Message::new(open.id, open.role, open.content));
        }
    }
}

/// True if this tool call id is already finalized somewhere.
fn tool_call_known(state: &ClientState, tool_call_id: &str) -> bool {
    state
        .messages
        .iter()
        .any(|m| m.tool_calls.iter().any(|tc| tc.id == tool_call_id))
        || state
            .pending_children
            .values()
            .any(|children| children.iter().any(|tc| tc.id == tool_call_id))
}

/// Place a finished tool call in the conversation.
///
/// Children whose parent is still pending are buffered until the parent
/// lands. Otherwise the call goes to the message holding its parent, or
/// to the latest assistant message, or to a synthesized standalone tool
/// message when no assistant message exists yet.
fn attach_finished_tool_call(state: &mut ClientState, tool_call: ToolCall) {
    if let Some(parent_id) = tool_call.parent_tool_use_id.clone() {
        if state.pending_tool_calls.contains_key(&parent_id) {
            state
                .pending_children
                .entry(parent_id)
                .or_default()
                .push(tool_call);
            return;
        }
        if let Some(index) = state
            .messages
            .iter()
            .rposition(|m| m.tool_calls.iter().any(|tc| tc.id == parent_id))
        {
            attach_at(state, index, tool_call);
            return;
        }
        debug!(
            component = "reducer",
            event = "stream.tool_end.orphaned_child",
            tool_call_id = %tool_call.id,
            parent_tool_use_id = %parent_id,
        );
    }
    match state
        .messages
        .iter()
        .rposition(|m| m.role == Role::Assistant)
    {
        Some(index) => attach_at(state, index, tool_call),
        None => {
            let index = state.messages.len();
            let parent_id = tool_call.id.clone();
            let mut message = Message::new(new_id(), Role::Tool, "");
            message.tool_calls.push(tool_call);
            state.messages.push(message);
            flush_buffered_children(state, index, &parent_id);
        }
    }
}

fn attach_at(state: &mut ClientState, index: usize, tool_call: ToolCall) {
    let id = tool_call.id.clone();
    let message = &mut state.messages[index];
    if !message.tool_calls.iter().any(|tc| tc.id == id) {
        message.tool_calls.push(tool_call);
    }
    flush_buffered_children(state, index, &id);
}

/// Drain children buffered under `parent_id` into the message at `index`,
/// recursing so grandchildren buffered under those children land too.
fn flush_buffered_children(state: &mut ClientState, index: usize, parent_id: &str) {
    let Some(children) = state.pending_children.remove(parent_id) else {
        return;
    };
    for child in children {
        let child_id = child.id.clone();
        let message = &mut state.messages[index];
        if !message.tool_calls.iter().any(|tc| tc.id == child_id) {
            message.tool_calls.push(child);
        }
        flush_buffered_children(state, index, &child_id);
    }
}

/// Apply one patch to the key/value state.
///
/// Paths are JSON-pointer-shaped ("/a/b"). Add and replace create missing
/// intermediate objects; remove of a missing path is a logged no-op.
fn apply_state_patch(root: &mut Map<String, Value>, patch: StatePatch) {
    let segments: Vec<&str> = patch.path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        warn!(
            component = "reducer",
            event = "stream.state_delta.empty_path",
            op = ?patch.op,
        );
        return;
    }
    match patch.op {
        PatchOp::Add | PatchOp::Replace => {
            set_path(root, &segments, patch.value.unwrap_or(Value::Null));
        }
        PatchOp::Remove => {
            if !remove_path(root, &segments) {
                debug!(
                    component = "reducer",
                    event = "stream.state_delta.remove_missing",
                    path = %patch.path,
                );
            }
        }
    }
}

fn set_path(root: &mut Map<String, Value>, segments: &[&str], value: Value) {
    let (last, parents) = match segments.split_last() {
        Some(split) => split,
        None => return,
    };
    let mut current = root;
    for segment in parents {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = match entry.as_object_mut() {
            Some(map) => map,
            None => return,
        };
    }
    current.insert(last.to_string(), value);
}

fn remove_path(root: &mut Map<String, Value>, segments: &[&str]) -> bool {
    let (last, parents) = match segments.split_last() {
        Some(split) => split,
        None => return false,
    };
    let mut current = root;
    for segment in parents {
        current = match current.get_mut(*segment).and_then(Value::as_object_mut) {
            Some(map) => map,
            None => return false,
        };
    }
    current.remove(*last).is_some()
}

fn apply_activity_patch(log: &mut Vec<Activity>, patch: ActivityPatch) {
    let id = patch.activity.id.clone();
    match patch.op {
        ActivityOp::Add => match log.iter_mut().find(|a| a.id == id) {
            Some(existing) => *existing = patch.activity,
            None => log.push(patch.activity),
        },
        ActivityOp::Update => match log.iter_mut().find(|a| a.id == id) {
            Some(existing) => *existing = patch.activity,
            None => {
                debug!(
                    component = "reducer",
                    event = "stream.activity_delta.update_missing",
                    activity_id = %id,
                );
            }
        },
        ActivityOp::Remove => log.retain(|a| a.id != id),
    }
}

/// RAW events carry provider passthrough payloads. Two shapes matter:
/// message metadata (hidden markers) and finalized message payloads.
/// Everything else is ignored.
fn apply_raw(state: &mut ClientState, data: Value) {
    let Some(payload) = data.as_object() else {
        return;
    };
    if payload.get("type").and_then(Value::as_str) == Some("message_metadata") {
        let hidden = payload
            .get("hidden")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let message_id = payload
            .get("messageId")
            .or_else(|| payload.get("message_id"))
            .and_then(Value::as_str);
        if hidden {
            if let Some(message_id) = message_id {
                state.hidden_message_ids.insert(message_id.to_string());
            }
        }
        return;
    }
    let Some(role) = payload.get("role").and_then(Value::as_str) else {
        return;
    };
    let Ok(role) = serde_json::from_value::<Role>(Value::String(role.to_string())) else {
        debug!(
            component = "reducer",
            event = "stream.raw.unknown_role",
            role = %role,
        );
        return;
    };
    let id = payload
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(new_id);
    if state.hidden_message_ids.contains(&id) {
        return;
    }
    if state.messages.iter().any(|m| m.id == id) {
        return;
    }
    let content = payload
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default();
    state.messages.push(Message::new(id, role, content));
}

// ── local transitions ──────────────────────────────────────────────────
// Driven by the connection manager and control channel rather than by
// stream events, but kept here so every state change is a pure function.

pub fn mark_connecting(mut state: ClientState) -> ClientState {
    state.connection_status = ConnectionStatus::Connecting;
    state
}

pub fn mark_connected(mut state: ClientState) -> ClientState {
    state.connection_status = ConnectionStatus::Connected;
    state.last_error = None;
    state
}

pub fn mark_completed(mut state: ClientState) -> ClientState {
    finalize_streaming(&mut state);
    state.connection_status = ConnectionStatus::Completed;
    state
}

pub fn mark_error(mut state: ClientState, detail: impl Into<String>) -> ClientState {
    state.connection_status = ConnectionStatus::Error;
    state.last_error = Some(detail.into());
    state
}

pub fn record_run(mut state: ClientState, run_id: impl Into<String>) -> ClientState {
    state.active_run_id = Some(run_id.into());
    state.interrupt_requested = false;
    state
}

/// Optimistic half of the two-phase interrupt: the run is treated as
/// inactive as soon as the interrupt is accepted, while the flag stays
/// up until a terminal event confirms it.
pub fn mark_interrupt_requested(mut state: ClientState) -> ClientState {
    state.interrupt_requested = true;
    state.active_run_id = None;
    state
}

/// Clear live-stream bookkeeping on manual disconnect. History, key/value
/// state, and the activity log survive.
pub fn reset_live(mut state: ClientState) -> ClientState {
    state.connection_status = ConnectionStatus::Idle;
    state.in_progress = None;
    state.pending_tool_calls.clear();
    state.pending_children.clear();
    state.active_run_id = None;
    state.interrupt_requested = false;
    state.last_error = None;
    state
}
