use clap::Parser;

use jb_bridge_runtime::{BridgeConfig, run};

#[derive(Parser)]
#[command(
    name = "jb-bridge",
    version,
    about = "Bridges the JetBrains IDE MCP proxy (SSE) to MCP clients over stdio"
)]
struct Cli {
    /// JetBrains MCP proxy host
    #[arg(long, env = "JETBRAINS_MCP_HOST", default_value = "127.0.0.1")]
    host: String,

    /// JetBrains MCP proxy port
    #[arg(long, env = "JETBRAINS_MCP_PORT", default_value_t = 64342)]
    port: u16,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // stdout carries the MCP transport; all diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let code = run(BridgeConfig {
        host: cli.host,
        port: cli.port,
    })
    .await;
    std::process::exit(code);
}
