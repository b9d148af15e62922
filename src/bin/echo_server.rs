//! Minimal demo server: echoes every received message back on the same
//! session it arrived on.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use bcp::{Config, SessionCallbacks, SessionHandle, SessionId};

#[derive(Parser)]
struct Args {
    /// address to listen on
    #[arg(long, default_value = "127.0.0.1:9292")]
    listen: SocketAddr,

    /// path to a TOML config file; falls back to built-in defaults
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

struct EchoCallbacks {
    handle: OnceLock<SessionHandle>,
    session_id: SessionId,
}

#[async_trait]
impl SessionCallbacks for EchoCallbacks {
    async fn received(&self, message: Vec<Vec<u8>>) {
        info!(session = %self.session_id, messages = message.len(), "echoing message back");
        if let Some(handle) = self.handle.get() {
            handle.send(message).await;
        }
    }

    async fn attach_handle(&self, handle: SessionHandle) {
        let _ = self.handle.set(handle);
    }

    async fn accepted(&self) {
        info!(session = %self.session_id, "new session accepted");
    }

    async fn shut_down(&self) {
        info!(session = %self.session_id, "session shut down gracefully");
    }

    async fn interrupted(&self) {
        info!(session = %self.session_id, "session interrupted");
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

    let listener = TcpListener::bind(args.listen).await?;
    info!(addr = %args.listen, "echo server listening");

    let serve = bcp::serve(
        listener,
        config,
        Arc::new(|session_id: SessionId, peer: SocketAddr| {
            info!(%peer, session = %session_id, "accepted connection");
            Arc::new(EchoCallbacks {
                handle: OnceLock::new(),
                session_id,
            }) as Arc<dyn SessionCallbacks>
        }),
    );

    tokio::select! {
        res = serve => res?,
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl+c received, shutting down");
        }
    }

    Ok(())
}
