//! Client-side role overlay: opens the initial connection, adapts the
//! connection count to load (Idle/Busy/Slow classification driving
//! `increaseConnection`), and retires excess idle connections. The core
//! session engine knows nothing about any of this — it only exposes the
//! generic `busy`/`idle` hooks; this module is a `SessionCallbacks`
//! decorator that reacts to them, the same shape as
//! `haysel::dispatch::transport::TransportClient` wrapping a per-peer state
//! machine and reacting to its `DispatchEvent`s.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::callbacks::SessionCallbacks;
use crate::codec::{self, ConnectionHead, SessionId};
use crate::config::Config;
use crate::connection::Connection;
use crate::payload::{IdentityCodec, PayloadCodec};
use crate::session::{SessionActor, SessionHandle};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ConnState {
    Idle,
    Busy,
    Slow,
}

struct ClientOverlay {
    self_ref: Weak<ClientOverlay>,
    inner: Arc<dyn SessionCallbacks>,
    handle: OnceLock<SessionHandle>,
    addr: SocketAddr,
    config: Arc<Config>,
    states: Mutex<HashMap<u32, ConnState>>,
    busy_timers: Mutex<HashMap<u32, JoinHandle<()>>>,
    idle_timer: Mutex<Option<JoinHandle<()>>>,
    connecting: std::sync::atomic::AtomicBool,
}

impl ClientOverlay {
    fn new(inner: Arc<dyn SessionCallbacks>, addr: SocketAddr, config: Arc<Config>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| ClientOverlay {
            self_ref: self_ref.clone(),
            inner,
            handle: OnceLock::new(),
            addr,
            config,
            states: Mutex::new(HashMap::new()),
            busy_timers: Mutex::new(HashMap::new()),
            idle_timer: Mutex::new(None),
            connecting: std::sync::atomic::AtomicBool::new(false),
        })
    }

    fn handle(&self) -> &SessionHandle {
        self.handle.get().expect("handle installed right after the actor is spawned")
    }

    fn cancel_busy_timer(&self, conn_id: u32) {
        if let Some(task) = self.busy_timers.lock().unwrap().remove(&conn_id) {
            task.abort();
        }
    }

    fn cancel_idle_timer(&self) {
        if let Some(task) = self.idle_timer.lock().unwrap().take() {
            task.abort();
        }
    }

    /// cancels every timer this overlay owns — busy timers for each tracked
    /// connection plus the idle trim timer. Run on session teardown so
    /// `shut_down()`/`interrupt()` never leaves a timer armed (spec.md §8 P4).
    fn cancel_all_timers(&self) {
        self.cancel_idle_timer();
        let ids: Vec<u32> = self.busy_timers.lock().unwrap().keys().copied().collect();
        for id in ids {
            self.cancel_busy_timer(id);
        }
    }

    /// picks an arbitrary connection currently classified Idle, if one
    /// exists alongside at least one other open connection.
    fn an_idle_connection(&self) -> Option<u32> {
        let states = self.states.lock().unwrap();
        if states.len() <= 1 {
            return None;
        }
        states
            .iter()
            .find(|(_, s)| **s == ConnState::Idle)
            .map(|(&id, _)| id)
    }

    /// arms the session-wide idle trim: if at least one connection is still
    /// idle once `IdleTimeout` elapses (with more than one connection open),
    /// retire it.
    fn maybe_arm_idle_timer(self: &Arc<Self>) {
        self.cancel_idle_timer();
        if self.an_idle_connection().is_none() {
            return;
        }
        let this = self.clone();
        let timeout = self.config.idle_timeout();
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(conn_id) = this.an_idle_connection() {
                this.handle().retire_connection(conn_id).await;
            }
        });
        *self.idle_timer.lock().unwrap() = Some(task);
    }

    /// opens a new underlying stream iff no dial is already in flight, the
    /// session is below `MaxConnectionsPerSession`, and every tracked
    /// connection has degraded to `Slow` (a single slow connection is not
    /// enough — the others might still be soaking up load).
    async fn increase_connection(this: Arc<Self>) {
        {
            let states = this.states.lock().unwrap();
            let below_cap = (states.len() as u32) <= this.config.max_connections_per_session;
            let all_slow = !states.is_empty() && states.values().all(|s| *s == ConnState::Slow);
            if !below_cap || !all_slow {
                return;
            }
        }
        if this
            .connecting
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }
        let handle = this.handle().clone();
        let addr = this.addr;
        let session_id = handle.session_id();
        let retry = this.clone();
        tokio::spawn(async move {
            // `is_renew=false`: this is another connection joining the same
            // live session, not a full session restart — that flag is
            // reserved for resuming a session id from a fresh process.
            let result = open_connection(&handle, addr, session_id, false).await;
            this.connecting.store(false, std::sync::atomic::Ordering::SeqCst);
            if let Err(err) = result {
                let timeout = jittered_backoff(retry.config.busy_timeout());
                warn!(%err, delay_ms = %timeout.as_millis(), "client failed to open an additional connection, retrying after a backoff");
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    ClientOverlay::increase_connection(retry).await;
                });
            }
        });
    }
}

#[async_trait]
impl SessionCallbacks for ClientOverlay {
    async fn received(&self, message: Vec<Vec<u8>>) {
        self.inner.received(message).await;
    }

    async fn attach_handle(&self, handle: SessionHandle) {
        let _ = self.handle.set(handle.clone());
        self.inner.attach_handle(handle).await;
    }

    async fn available(&self) {
        self.inner.available().await;
    }

    async fn unavailable(&self) {
        self.inner.unavailable().await;
    }

    async fn busy(&self, connection: &Connection) {
        let conn_id = connection.id;
        self.states.lock().unwrap().insert(conn_id, ConnState::Busy);
        self.cancel_idle_timer();
        self.cancel_busy_timer(conn_id);
        if let Some(this) = self.self_ref.upgrade() {
            let timeout = self.config.busy_timeout();
            let task = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let still_busy = this.states.lock().unwrap().get(&conn_id).copied() == Some(ConnState::Busy);
                if still_busy {
                    this.states.lock().unwrap().insert(conn_id, ConnState::Slow);
                    debug!(conn_id, "connection slow, requesting an additional connection");
                    ClientOverlay::increase_connection(this.clone()).await;
                }
            });
            self.busy_timers.lock().unwrap().insert(conn_id, task);
        }
        self.inner.busy(connection).await;
    }

    async fn idle(&self, connection: &Connection) {
        let conn_id = connection.id;
        self.cancel_busy_timer(conn_id);
        self.states.lock().unwrap().insert(conn_id, ConnState::Idle);
        if let Some(this) = self.self_ref.upgrade() {
            this.maybe_arm_idle_timer();
        }
        self.inner.idle(connection).await;
    }

    async fn shut_down(&self) {
        self.cancel_all_timers();
        self.inner.shut_down().await;
    }

    async fn interrupted(&self) {
        self.cancel_all_timers();
        self.inner.interrupted().await;
    }

    async fn accepted(&self) {
        self.inner.accepted().await;
    }
}

/// adds up to 50% random jitter on top of a base backoff delay, so a burst
/// of clients whose connections die at the same moment don't all redial in
/// lockstep.
fn jittered_backoff(base: Duration) -> Duration {
    let extra = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
    base + Duration::from_millis(extra)
}

/// connects to `addr` and opens a brand new BCP session.
pub async fn connect(
    addr: SocketAddr,
    config: Arc<Config>,
    callbacks: Arc<dyn SessionCallbacks>,
) -> std::io::Result<SessionHandle> {
    connect_with_codec(addr, config, callbacks, Arc::new(IdentityCodec)).await
}

/// like [`connect`], but with an explicit [`PayloadCodec`] applied to every
/// message's buffers on the way out and in (spec.md §1's "optional payload
/// crypto hooks").
pub async fn connect_with_codec(
    addr: SocketAddr,
    config: Arc<Config>,
    callbacks: Arc<dyn SessionCallbacks>,
    payload_codec: Arc<dyn PayloadCodec>,
) -> std::io::Result<SessionHandle> {
    let session_id = SessionId::new_random();
    let overlay = ClientOverlay::new(callbacks, addr, config.clone());
    let handle = SessionActor::spawn_with_codec(session_id, config.clone(), overlay.clone(), payload_codec);
    overlay.attach_handle(handle.clone()).await;
    open_connection(&handle, addr, session_id, false).await?;
    Ok(handle)
}

/// reconnects under a previously-issued `session_id`, instructing the peer
/// (if it still has that session open) to discard all of its connections and
/// counters and restart clean. For a client process that kept the session id
/// but lost every other piece of state — a crash, or a deliberate hard
/// resync — rather than the normal multi-connection bundling `connect` does.
pub async fn resume(
    addr: SocketAddr,
    session_id: SessionId,
    config: Arc<Config>,
    callbacks: Arc<dyn SessionCallbacks>,
) -> std::io::Result<SessionHandle> {
    resume_with_codec(addr, session_id, config, callbacks, Arc::new(IdentityCodec)).await
}

/// like [`resume`], but with an explicit [`PayloadCodec`].
pub async fn resume_with_codec(
    addr: SocketAddr,
    session_id: SessionId,
    config: Arc<Config>,
    callbacks: Arc<dyn SessionCallbacks>,
    payload_codec: Arc<dyn PayloadCodec>,
) -> std::io::Result<SessionHandle> {
    let overlay = ClientOverlay::new(callbacks, addr, config.clone());
    let handle = SessionActor::spawn_with_codec(session_id, config.clone(), overlay.clone(), payload_codec);
    overlay.attach_handle(handle.clone()).await;
    open_connection(&handle, addr, session_id, true).await?;
    Ok(handle)
}

async fn open_connection(
    handle: &SessionHandle,
    addr: SocketAddr,
    session_id: SessionId,
    is_renew: bool,
) -> std::io::Result<()> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true).ok();
    let (read_half, mut write_half) = stream.into_split();
    let connection_id = handle.allocate_connection_id().await;
    let head = ConnectionHead {
        session_id,
        is_renew,
        connection_id,
    };
    codec::write_connection_head(&mut write_half, &head)
        .await
        .map_err(std::io::Error::other)?;
    handle.add_stream(head, read_half, write_half).await;
    Ok(())
}
