//! Control channel
//!
//! Plain JSON POSTs paired with the event stream: submit a user turn to
//! start a run, or interrupt the active one. Neither call waits for the
//! resulting events; those arrive on the stream subscription.

use std::sync::Arc;

use tracing::{debug, info, warn};

use groundstation_protocol::{new_id, InterruptRequest, Message, Role, RunAgentInput, RunAgentOutput};

use crate::error::ClientError;
use crate::reduce;
use crate::stream;
use crate::ClientInner;

/// Submit a user turn and record the run id the service assigns.
pub(crate) async fn submit_turn(
    inner: &Arc<ClientInner>,
    content: String,
) -> Result<String, ClientError> {
    let input = {
        let snapshot = inner.snapshot.load();
        RunAgentInput {
            thread_id: inner.config.thread_id.clone(),
            run_id: None,
            parent_run_id: snapshot.active_run_id.clone(),
            messages: vec![Message::new(new_id(), Role::User, content)],
            state: None,
        }
    };
    inner.apply(reduce::mark_connecting);
    let response = inner
        .http
        .post(inner.config.run_url())
        .timeout(inner.config.request_timeout)
        .json(&input)
        .send()
        .await;
    let response = match response {
        Ok(response) => response,
        Err(error) => {
            inner.apply(|state| reduce::mark_error(state, error.to_string()));
            return Err(ClientError::Http(error));
        }
    };
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        warn!(
            component = "control",
            event = "control.run_rejected",
            thread_id = %inner.config.thread_id,
            status = %status,
        );
        inner.apply(|state| {
            reduce::mark_error(state, format!("run request rejected with status {status}"))
        });
        return Err(ClientError::Status { status, body });
    }
    let body = response.text().await?;
    let output: RunAgentOutput = serde_json::from_str(&body)?;
    info!(
        component = "control",
        event = "control.run_accepted",
        thread_id = %inner.config.thread_id,
        run_id = %output.run_id,
    );
    inner.apply(|state| reduce::record_run(state, output.run_id.clone()));
    ensure_subscribed(inner, output.run_id.clone()).await;
    Ok(output.run_id)
}

/// Interrupt the active run, if any.
///
/// The run is marked inactive as soon as the service accepts the request;
/// the `interrupt_requested` flag stays up until a terminal event for the
/// run arrives on the stream.
pub(crate) async fn interrupt(inner: &Arc<ClientInner>) -> Result<(), ClientError> {
    let run_id = match inner.snapshot.load().active_run_id.clone() {
        Some(run_id) => run_id,
        None => {
            debug!(
                component = "control",
                event = "control.interrupt.no_active_run",
                thread_id = %inner.config.thread_id,
            );
            return Ok(());
        }
    };
    let response = inner
        .http
        .post(inner.config.interrupt_url())
        .timeout(inner.config.request_timeout)
        .json(&InterruptRequest {
            run_id: run_id.clone(),
        })
        .send()
        .await;
    let response = match response {
        Ok(response) => response,
        Err(error) => {
            inner.apply(|state| reduce::mark_error(state, error.to_string()));
            return Err(ClientError::Http(error));
        }
    };
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        warn!(
            component = "control",
            event = "control.interrupt_rejected",
            thread_id = %inner.config.thread_id,
            run_id = %run_id,
            status = %status,
        );
        inner.apply(|state| {
            reduce::mark_error(
                state,
                format!("interrupt request rejected with status {status}"),
            )
        });
        return Err(ClientError::Status { status, body });
    }
    info!(
        component = "control",
        event = "control.interrupt_accepted",
        thread_id = %inner.config.thread_id,
        run_id = %run_id,
    );
    inner.apply(reduce::mark_interrupt_requested);
    Ok(())
}

/// Events for a freshly accepted run arrive on the stream, so make sure a
/// live subscription exists.
async fn ensure_subscribed(inner: &Arc<ClientInner>, run_id: String) {
    let needs_connect = {
        let conn = inner.conn.lock().await;
        conn.stream_task
            .as_ref()
            .map(|task| task.is_finished())
            .unwrap_or(true)
    };
    if needs_connect {
        stream::connect(inner, Some(run_id)).await;
    }
}
