use std::time::Duration;

/// Connection settings for one thread's client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the agent service, e.g. `http://localhost:8080/api`.
    pub base_url: String,
    /// Thread whose stream and control endpoints this client drives.
    pub thread_id: String,
    /// Delay before the single automatic reconnect attempt.
    pub reconnect_delay: Duration,
    /// Timeout applied to control requests. The event stream itself is
    /// long-lived and never times out.
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            thread_id: thread_id.into(),
            reconnect_delay: Duration::from_secs(3),
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn events_url(&self) -> String {
        format!(
            "{}/threads/{}/events",
            self.base_url.trim_end_matches('/'),
            self.thread_id
        )
    }

    pub fn run_url(&self) -> String {
        format!(
            "{}/threads/{}/run",
            self.base_url.trim_end_matches('/'),
            self.thread_id
        )
    }

    pub fn interrupt_url(&self) -> String {
        format!(
            "{}/threads/{}/interrupt",
            self.base_url.trim_end_matches('/'),
            self.thread_id
        )
    }
}
