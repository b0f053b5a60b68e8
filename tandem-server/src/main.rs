//! tandem-server: serves collaborative editing sessions over WebSocket.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tandem_collab::{HttpAnalysisService, ServerConfig, SyncServer};

#[derive(Parser)]
#[command(name = "tandem-server")]
#[command(about = "Operation-sequenced collaborative text session server")]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "TANDEM_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// Members allowed per session
    #[arg(long, env = "TANDEM_MAX_MEMBERS", default_value_t = 100)]
    max_members: usize,

    /// Frames buffered per member before it is evicted
    #[arg(long, env = "TANDEM_OUTBOX_CAPACITY", default_value_t = 256)]
    outbox_capacity: usize,

    /// Commands buffered per session
    #[arg(long, env = "TANDEM_MAILBOX_CAPACITY", default_value_t = 1024)]
    mailbox_capacity: usize,

    /// Seconds between WebSocket pings
    #[arg(long, env = "TANDEM_HEARTBEAT_SECS", default_value_t = 30)]
    heartbeat_secs: u64,

    /// Endpoint for run-neurolint requests
    #[arg(long, env = "TANDEM_ANALYSIS_URL")]
    analysis_url: Option<String>,

    /// Analysis request timeout in seconds
    #[arg(long, env = "TANDEM_ANALYSIS_TIMEOUT_SECS", default_value_t = 30)]
    analysis_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let config = ServerConfig {
        bind_addr: cli.bind,
        max_members_per_session: cli.max_members,
        outbox_capacity: cli.outbox_capacity,
        mailbox_capacity: cli.mailbox_capacity,
        heartbeat_interval_secs: cli.heartbeat_secs,
    };

    let mut server = SyncServer::new(config);
    match cli.analysis_url {
        Some(url) => {
            log::info!("Relaying analysis requests to {url}");
            let service = HttpAnalysisService::new(url, Duration::from_secs(cli.analysis_timeout_secs))?;
            server = server.with_analysis(Arc::new(service));
        }
        None => log::info!("No analysis service configured"),
    }

    server.run().await
}
