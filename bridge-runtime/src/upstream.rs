//! The upstream session: one SSE subscription to the JetBrains MCP proxy,
//! endpoint discovery, and correlation of outbound JSON-RPC submissions
//! with the asynchronous responses pushed back on the event channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::error::BridgeError;
use crate::sse::{SseBuffer, SseEvent, parse_event};

/// Path of the proxy's SSE subscription, relative to the base URL.
pub const SSE_PATH: &str = "/sse";

/// Bound on waiting for the proxy's one-time endpoint announcement.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on waiting for a pushed response to one submission.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One invocable capability announced by the proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(
        default,
        rename = "inputSchema",
        skip_serializing_if = "Option::is_none"
    )]
    pub input_schema: Option<Value>,
}

type PendingSender = oneshot::Sender<Result<Value, BridgeError>>;

/// Mutable session state. Mutated only under the one mutex, by the
/// listener task and by `submit` bookkeeping.
#[derive(Default)]
struct SessionState {
    /// Submission path announced by the proxy; fixed once discovered.
    message_endpoint: Option<String>,
    connected: bool,
    tools: Vec<Tool>,
    pending: HashMap<u64, PendingSender>,
}

/// The single logical connection to the proxy. Created once at startup and
/// shared (via `Arc`) between the listener task and the stdio server.
pub struct ProxySession {
    base_url: String,
    http: reqwest::Client,
    state: Mutex<SessionState>,
    next_id: AtomicU64,
}

impl ProxySession {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
            state: Mutex::new(SessionState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn is_connected(&self) -> bool {
        self.lock_state().connected
    }

    /// Cached tool catalog; never touches the network.
    pub fn tools(&self) -> Vec<Tool> {
        self.lock_state().tools.clone()
    }

    /// Subscribe to the proxy's event channel and wait for the one-time
    /// `endpoint` announcement. On success the open stream is handed to a
    /// background listener task for the rest of the session; discovery is
    /// never re-run.
    pub async fn connect(self: &Arc<Self>) -> Result<(), BridgeError> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, SSE_PATH))
            .header("Accept", "text/event-stream")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BridgeError::Status(response.status().as_u16()));
        }

        let mut stream = response.bytes_stream();
        let mut buffer = SseBuffer::new();

        let endpoint = timeout(DISCOVERY_TIMEOUT, async {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| BridgeError::Channel(e.to_string()))?;
                buffer.push_chunk(&chunk);
                while let Some(block) = buffer.next_event_block() {
                    let Some(event) = parse_event(&block) else {
                        continue;
                    };
                    if event.name.as_deref() == Some("endpoint") {
                        return Ok(event.data);
                    }
                    // Anything the proxy pushes before the announcement
                    // (e.g. an early catalog) is still worth dispatching.
                    self.dispatch(&event);
                }
            }
            Err(BridgeError::Channel(
                "event channel closed before the endpoint announcement".to_string(),
            ))
        })
        .await
        .map_err(|_| BridgeError::DiscoveryTimeout(DISCOVERY_TIMEOUT))??;

        {
            let mut state = self.lock_state();
            state.message_endpoint = Some(endpoint.clone());
            state.connected = true;
        }
        tracing::info!(endpoint = %endpoint, "proxy announced its message endpoint");

        let session = Arc::clone(self);
        tokio::spawn(async move {
            session.listen(stream, buffer).await;
        });
        Ok(())
    }

    /// Demultiplex inbound events for the lifetime of the session. A
    /// channel error is logged but not fatal: in-flight submissions time
    /// out individually, and there is no reconnect in this version.
    async fn listen<S, B>(self: Arc<Self>, mut stream: S, mut buffer: SseBuffer)
    where
        S: Stream<Item = Result<B, reqwest::Error>> + Unpin,
        B: AsRef<[u8]>,
    {
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => {
                    buffer.push_chunk(chunk.as_ref());
                    while let Some(block) = buffer.next_event_block() {
                        if let Some(event) = parse_event(&block) {
                            self.dispatch(&event);
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "event channel error");
                    break;
                }
            }
        }
        tracing::warn!("event channel closed; in-flight requests will time out");
    }

    fn dispatch(&self, event: &SseEvent) {
        match event.name.as_deref() {
            // Discovery already consumed the first announcement; a repeat
            // is informational only.
            Some("endpoint") => {
                tracing::debug!(data = %event.data, "repeated endpoint announcement ignored");
            }
            // Some proxy builds push catalog updates outside the generic
            // message envelope.
            Some("tools") => match serde_json::from_str::<Vec<Tool>>(&event.data) {
                Ok(tools) => self.replace_tools(tools),
                Err(err) => tracing::debug!(error = %err, "unparseable tools event dropped"),
            },
            Some(other) => {
                tracing::debug!(event = other, "unrecognized event ignored");
            }
            None => self.dispatch_message(&event.data),
        }
    }

    /// A generic message frame: resolve a pending submission if the id
    /// matches, and pick up an embedded catalog either way.
    fn dispatch_message(&self, data: &str) {
        let envelope: Value = match serde_json::from_str(data) {
            Ok(value) => value,
            Err(err) => {
                tracing::debug!(error = %err, "unparseable message frame dropped");
                return;
            }
        };

        let mut state = self.lock_state();

        if let Some(id) = envelope.get("id").and_then(Value::as_u64) {
            // Removing before sending makes double settlement impossible.
            if let Some(sender) = state.pending.remove(&id) {
                let outcome = match envelope.get("error") {
                    Some(error) => Err(BridgeError::Upstream(
                        error
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("unspecified proxy error")
                            .to_string(),
                    )),
                    None => Ok(envelope.get("result").cloned().unwrap_or(Value::Null)),
                };
                // The waiter may already have timed out and dropped its end.
                let _ = sender.send(outcome);
            } else {
                tracing::debug!(id, "response for unknown request id");
            }
        }

        if let Some(tools) = envelope.pointer("/result/tools") {
            match serde_json::from_value::<Vec<Tool>>(tools.clone()) {
                Ok(tools) => {
                    tracing::info!(count = tools.len(), "tool catalog updated");
                    state.tools = tools;
                }
                Err(err) => tracing::debug!(error = %err, "unparseable embedded catalog dropped"),
            }
        }
    }

    /// Send one JSON-RPC request to the discovered endpoint and wait for
    /// the matching response on the event channel. The 2xx body of the
    /// POST is informational only.
    pub async fn submit(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        let endpoint = self
            .lock_state()
            .message_endpoint
            .clone()
            .ok_or(BridgeError::NotConnected)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        self.lock_state().pending.insert(id, sender);

        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let response = match self
            .http
            .post(format!("{}{}", self.base_url, endpoint))
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                self.remove_pending(id);
                return Err(BridgeError::Transport(err));
            }
        };
        if !response.status().is_success() {
            self.remove_pending(id);
            return Err(BridgeError::Status(response.status().as_u16()));
        }

        self.await_response(id, receiver).await
    }

    async fn await_response(
        &self,
        id: u64,
        receiver: oneshot::Receiver<Result<Value, BridgeError>>,
    ) -> Result<Value, BridgeError> {
        match timeout(REQUEST_TIMEOUT, receiver).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without settling; only happens if the session
            // itself is torn down.
            Ok(Err(_)) => {
                self.remove_pending(id);
                Err(BridgeError::Channel(
                    "pending request abandoned".to_string(),
                ))
            }
            Err(_) => {
                self.remove_pending(id);
                Err(BridgeError::RequestTimeout(REQUEST_TIMEOUT))
            }
        }
    }

    /// `tools/list` round-trip; replaces the cached catalog wholesale on
    /// success and returns the new tool count.
    pub async fn refresh_tools(&self) -> Result<usize, BridgeError> {
        let result = self.submit("tools/list", json!({})).await?;
        let count = match result.get("tools") {
            Some(tools) => {
                let tools: Vec<Tool> = serde_json::from_value(tools.clone())
                    .map_err(|e| BridgeError::Upstream(format!("malformed tool catalog: {e}")))?;
                let count = tools.len();
                self.replace_tools(tools);
                count
            }
            None => 0,
        };
        Ok(count)
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, BridgeError> {
        self.submit("tools/call", json!({ "name": name, "arguments": arguments }))
            .await
    }

    pub(crate) fn replace_tools(&self, tools: Vec<Tool>) {
        tracing::info!(count = tools.len(), "tool catalog updated");
        self.lock_state().tools = tools;
    }

    fn remove_pending(&self, id: u64) {
        self.lock_state().pending.remove(&id);
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
