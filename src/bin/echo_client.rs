//! Minimal demo client: connects to an echo server, sends one message per
//! line read from stdin, and prints whatever comes back.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use bcp::{Config, SessionCallbacks};

#[derive(Parser)]
struct Args {
    /// address to connect to
    #[arg(long, default_value = "127.0.0.1:9292")]
    server: SocketAddr,

    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

struct PrintCallbacks;

#[async_trait]
impl SessionCallbacks for PrintCallbacks {
    async fn received(&self, message: Vec<Vec<u8>>) {
        for buf in message {
            println!("< {}", String::from_utf8_lossy(&buf));
        }
    }

    async fn available(&self) {
        info!("session available");
    }

    async fn unavailable(&self) {
        info!("session unavailable, buffering sends offline");
    }

    async fn shut_down(&self) {
        info!("session shut down");
    }

    async fn interrupted(&self) {
        info!("session interrupted");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bcp::init_logging()?;
    let args = Args::parse();

    let config = Arc::new(match args.config {
        Some(path) => Config::open(&path).await?,
        None => Config::default(),
    });

    let handle = bcp::connect(args.server, config, Arc::new(PrintCallbacks)).await?;
    info!(server = %args.server, "connected");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        handle.send(vec![line.into_bytes()]).await;
    }

    handle.shut_down().await;
    handle.closed().await;
    Ok(())
}
