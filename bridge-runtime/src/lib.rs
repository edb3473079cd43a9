//! Bridge between the JetBrains IDE MCP proxy and MCP clients.
//!
//! The proxy publishes responses asynchronously over a long-lived SSE
//! channel after announcing a session-specific submission endpoint; MCP
//! clients expect synchronous request/response over stdio. This crate
//! makes the former look like the latter: `upstream` owns the session
//! (discovery, listening, correlation, the tool catalog), `server` speaks
//! MCP to the client, and `run` wires them together.

use std::sync::Arc;

pub mod error;
pub mod server;
pub mod sse;
pub mod upstream;

pub use error::BridgeError;
pub use server::McpServer;
pub use upstream::{ProxySession, Tool};

pub const DEFAULT_PROXY_HOST: &str = "127.0.0.1";
pub const DEFAULT_PROXY_PORT: u16 = 64342;

/// Where to find the JetBrains MCP proxy.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub host: String,
    pub port: u16,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_PROXY_HOST.to_string(),
            port: DEFAULT_PROXY_PORT,
        }
    }
}

impl BridgeConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Bootstrap the upstream session, then serve MCP over stdio. A failed
/// bootstrap is logged and tolerated: the server still starts, so the
/// client sees an empty tool list and in-band call errors instead of a
/// process that refuses to come up. The returned code is the process exit
/// code; only a failure of the stdio loop itself is fatal.
pub async fn run(config: BridgeConfig) -> i32 {
    let session = Arc::new(ProxySession::new(config.base_url()));

    tracing::info!(
        url = %format!("{}{}", session.base_url(), upstream::SSE_PATH),
        "connecting to the JetBrains MCP proxy"
    );
    match session.connect().await {
        Ok(()) => tracing::info!("connected to the JetBrains MCP proxy"),
        Err(err) => {
            tracing::warn!(error = %err, "could not connect to the JetBrains MCP proxy");
            tracing::warn!(
                "serving anyway with an empty tool catalog; make sure a JetBrains IDE \
                 is running with the MCP plugin enabled"
            );
        }
    }

    let server = McpServer::new(session);
    match server.serve_stdio().await {
        Ok(()) => 0,
        Err(err) => {
            tracing::error!(error = %err, "MCP server failed");
            1
        }
    }
}
