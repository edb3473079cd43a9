use std::time::Duration;

use thiserror::Error;

/// Failures of the upstream session: bootstrap, the event channel, and
/// individual submissions. Downstream protocol faults (`RpcError`) are a
/// separate surface in `server`.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The proxy never announced its message endpoint within the bound.
    #[error("no endpoint announcement from the proxy within {0:?}")]
    DiscoveryTimeout(Duration),

    /// The event channel failed before the session was usable.
    #[error("event channel error: {0}")]
    Channel(String),

    /// A submission was attempted before an endpoint was discovered.
    #[error("not connected to the JetBrains MCP proxy")]
    NotConnected,

    /// No matching response arrived on the event channel within the bound.
    #[error("no response from the proxy within {0:?}")]
    RequestTimeout(Duration),

    /// The outbound HTTP call itself failed at the network level.
    #[error("request to the proxy failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The proxy answered the outbound HTTP call with a non-success status.
    #[error("proxy returned HTTP {0}")]
    Status(u16),

    /// The proxy delivered an error envelope for this request id.
    #[error("proxy error: {0}")]
    Upstream(String),
}
