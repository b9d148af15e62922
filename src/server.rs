//! Server-side role overlay: a listener that multiplexes inbound streams
//! into a table of live sessions keyed by `SessionId`, creating a new
//! session on a non-renew handshake for an unknown id and routing renew
//! handshakes to the matching existing session. Grounded in
//! `haysel::dispatch::Controller`'s accept loop, which also reads an initial
//! handshake record off each new connection before deciding what to do with
//! it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Mutex;

use crate::callbacks::SessionCallbacks;
use crate::codec::{self, SessionId};
use crate::config::Config;
use crate::error::ProtocolError;
use crate::payload::{IdentityCodec, PayloadCodec};
use crate::session::{SessionActor, SessionHandle};

/// Constructs the callbacks for a brand new inbound session. Called once per
/// `accepted()` session, not per connection, so the application can give
/// each peer its own state.
pub trait SessionFactory: Send + Sync + 'static {
    fn make(&self, session_id: SessionId, peer: SocketAddr) -> Arc<dyn SessionCallbacks>;
}

impl<F> SessionFactory for F
where
    F: Fn(SessionId, SocketAddr) -> Arc<dyn SessionCallbacks> + Send + Sync + 'static,
{
    fn make(&self, session_id: SessionId, peer: SocketAddr) -> Arc<dyn SessionCallbacks> {
        self(session_id, peer)
    }
}

/// Accepts connections on `listener` forever, dispatching each into the
/// session table. Returns only if accepting itself fails (the listener's
/// socket was closed or errored); individual bad handshakes are logged and
/// dropped.
pub async fn serve(
    listener: TcpListener,
    config: Arc<Config>,
    factory: Arc<dyn SessionFactory>,
) -> std::io::Result<()> {
    serve_with_codec(listener, config, factory, Arc::new(IdentityCodec)).await
}

/// like [`serve`], but every session spawned from this listener uses
/// `payload_codec` to transform message buffers on the way out and in
/// (spec.md §1's "optional payload crypto hooks").
pub async fn serve_with_codec(
    listener: TcpListener,
    config: Arc<Config>,
    factory: Arc<dyn SessionFactory>,
    payload_codec: Arc<dyn PayloadCodec>,
) -> std::io::Result<()> {
    let sessions: Arc<Mutex<HashMap<SessionId, SessionHandle>>> = Arc::new(Mutex::new(HashMap::new()));
    loop {
        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true).ok();
        let sessions = sessions.clone();
        let config = config.clone();
        let factory = factory.clone();
        let payload_codec = payload_codec.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_incoming(stream, peer, sessions, config, factory, payload_codec).await {
                warn!(%peer, %err, "dropping inbound connection after handshake failure");
            }
        });
    }
}

async fn handle_incoming(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    sessions: Arc<Mutex<HashMap<SessionId, SessionHandle>>>,
    config: Arc<Config>,
    factory: Arc<dyn SessionFactory>,
    payload_codec: Arc<dyn PayloadCodec>,
) -> std::io::Result<()> {
    let (mut read_half, write_half) = stream.into_split();
    let head = codec::read_connection_head(&mut read_half).await.map_err(|err| {
        let err = ProtocolError::BadHandshake(err);
        warn!(%peer, %err, "dropping connection after a malformed handshake");
        std::io::Error::other(err)
    })?;

    let mut table = sessions.lock().await;
    if let Some(existing) = table.get(&head.session_id) {
        if head.is_renew {
            debug!(session = %head.session_id, "renew handshake for a known session, discarding its prior connections");
        }
        let handle = existing.clone();
        drop(table);
        handle.add_stream(head, read_half, write_half).await;
        return Ok(());
    }

    let callbacks = factory.make(head.session_id, peer);
    let handle = SessionActor::spawn_with_codec(head.session_id, config, callbacks.clone(), payload_codec);
    table.insert(head.session_id, handle.clone());
    drop(table);

    callbacks.attach_handle(handle.clone()).await;
    handle.add_stream(head, read_half, write_half).await;
    callbacks.accepted().await;

    let session_id = head.session_id;
    tokio::spawn(async move {
        handle.closed().await;
        sessions.lock().await.remove(&session_id);
    });
    Ok(())
}
