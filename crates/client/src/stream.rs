//! Live event stream subscription
//!
//! One subscription per client. Events arrive as NDJSON on a chunked HTTP
//! response; each line is parsed and folded into the shared state. A lost
//! stream schedules a single delayed reconnect that resumes with the same
//! run id. Every spawned task carries the generation it was started
//! under and goes quiet once a newer connect or disconnect supersedes it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tracing::{info, warn};

use groundstation_protocol::parse_event_line;

use crate::reduce;
use crate::ClientInner;

/// Open a fresh subscription, superseding any existing one.
pub(crate) async fn connect(inner: &Arc<ClientInner>, run_id: Option<String>) {
    let mut conn = inner.conn.lock().await;
    conn.generation += 1;
    let generation = conn.generation;
    if let Some(task) = conn.stream_task.take() {
        task.abort();
    }
    if let Some(task) = conn.reconnect_task.take() {
        task.abort();
    }
    inner.apply(reduce::mark_connecting);
    let task_inner = Arc::clone(inner);
    conn.stream_task = Some(tokio::spawn(async move {
        run_stream(task_inner, generation, run_id).await;
    }));
}

/// Tear down the subscription and clear live bookkeeping.
pub(crate) async fn disconnect(inner: &Arc<ClientInner>) {
    let mut conn = inner.conn.lock().await;
    conn.generation += 1;
    if let Some(task) = conn.stream_task.take() {
        task.abort();
    }
    if let Some(task) = conn.reconnect_task.take() {
        task.abort();
    }
    info!(
        component = "stream",
        event = "stream.disconnected_by_caller",
        thread_id = %inner.config.thread_id,
    );
    inner.apply(reduce::reset_live);
}

async fn run_stream(inner: Arc<ClientInner>, generation: u64, run_id: Option<String>) {
    let mut request = inner.http.get(inner.config.events_url());
    if let Some(run_id) = &run_id {
        request = request.query(&[("runId", run_id.as_str())]);
    }
    let response = match request.send().await {
        Ok(response) => response,
        Err(error) => {
            stream_failed(&inner, generation, run_id, error.to_string()).await;
            return;
        }
    };
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let detail = format!("stream rejected with status {status}: {}", preview(&body));
        stream_failed(&inner, generation, run_id, detail).await;
        return;
    }
    if !inner.is_current(generation).await {
        return;
    }
    inner.apply(reduce::mark_connected);
    info!(
        component = "stream",
        event = "stream.connected",
        thread_id = %inner.config.thread_id,
        run_id = run_id.as_deref().unwrap_or(""),
    );

    let mut body = response.bytes_stream();
    let mut line_buffer: Vec<u8> = Vec::new();
    while let Some(chunk) = body.next().await {
        let chunk: Bytes = match chunk {
            Ok(chunk) => chunk,
            Err(error) => {
                stream_failed(&inner, generation, run_id, error.to_string()).await;
                return;
            }
        };
        line_buffer.extend_from_slice(&chunk);
        while let Some(newline) = line_buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = line_buffer.drain(..=newline).collect();
            handle_line(&inner, &line);
        }
    }
    if !line_buffer.is_empty() {
        handle_line(&inner, &line_buffer);
    }
    // server closed the stream cleanly
    if inner.is_current(generation).await {
        info!(
            component = "stream",
            event = "stream.completed",
            thread_id = %inner.config.thread_id,
        );
        inner.apply(reduce::mark_completed);
    }
}

fn handle_line(inner: &Arc<ClientInner>, raw: &[u8]) {
    let line = String::from_utf8_lossy(raw);
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return;
    }
    match parse_event_line(trimmed) {
        Some(event) => inner.apply(|state| reduce::reduce(state, event)),
        None => {
            warn!(
                component = "stream",
                event = "stream.parse_error",
                line = %preview(trimmed),
            );
        }
    }
}

/// Record the failure and schedule one delayed reconnect, unless a newer
/// connection already took over or a reconnect is already pending.
async fn stream_failed(
    inner: &Arc<ClientInner>,
    generation: u64,
    run_id: Option<String>,
    detail: String,
) {
    let mut conn = inner.conn.lock().await;
    if conn.generation != generation {
        return;
    }
    warn!(
        component = "stream",
        event = "stream.lost",
        thread_id = %inner.config.thread_id,
        error = %detail,
    );
    inner.apply(|state| reduce::mark_error(state, detail));
    if conn.reconnect_task.is_some() {
        return;
    }
    let delay = inner.config.reconnect_delay;
    let task_inner = Arc::clone(inner);
    conn.reconnect_task = Some(tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        {
            let mut conn = task_inner.conn.lock().await;
            if conn.generation != generation {
                return;
            }
            conn.reconnect_task = None;
        }
        info!(
            component = "stream",
            event = "stream.reconnecting",
            thread_id = %task_inner.config.thread_id,
            run_id = run_id.as_deref().unwrap_or(""),
        );
        connect_boxed(task_inner, run_id).await;
    }));
}

// Recursive edge: the reconnect task re-enters connect, whose reader can
// schedule another reconnect. The boxed future erases the cycle of
// opaque async types.
fn connect_boxed(
    inner: Arc<ClientInner>,
    run_id: Option<String>,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move { connect(&inner, run_id).await })
}

fn preview(text: &str) -> String {
    const MAX_CHARS: usize = 200;
    if text.chars().count() <= MAX_CHARS {
        text.to_string()
    } else {
        text.chars().take(MAX_CHARS).collect()
    }
}
