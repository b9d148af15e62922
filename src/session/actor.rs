//! The actor that owns a `SessionState` plus everything the pure engine
//! can't: per-connection I/O tasks, and the application's callbacks. Each
//! command or inbound event is one "transaction" — mutate `SessionState`
//! synchronously, then run the `Effect`s it returned. Grounded in
//! `haysel::dispatch::Controller`, which owns a socket and a per-peer map
//! the same way and reacts to background-task results fed back over a
//! channel (see `haysel::ipc`'s `bg_spawn`/`Take` pattern, mirrored here by
//! `stream::run_connection_io` reporting back over `events_tx`).

use std::collections::HashMap;
use std::sync::Arc;

use flume::{Receiver, Sender};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::callbacks::SessionCallbacks;
use crate::codec::{ConnectionHead, Frame, SessionId};
use crate::config::Config;
use crate::error::{HandshakeError, TransportError};
use crate::payload::{IdentityCodec, PayloadCodec};
use crate::session::handle::SessionHandle;
use crate::session::state::{Effect, SessionState};
use crate::stream;

pub(crate) enum SessionCommand {
    Send(Vec<Vec<u8>>),
    AddStream(ConnectionHead, OwnedReadHalf, OwnedWriteHalf),
    AllocateConnectionId(tokio::sync::oneshot::Sender<u32>),
    RetireConnection(u32),
    ShutDown,
    Interrupt,
}

pub(crate) enum SessionEvent {
    FrameReceived(u32, Frame),
    ConnectionFailed(u32, TransportError),
}

/// cloneable handle a connection's I/O task uses to report back to the
/// session actor, without exposing the actor's internal command/event enums.
#[derive(Clone)]
pub struct SessionEventSender(Sender<SessionEvent>);

impl SessionEventSender {
    fn new(inner: Sender<SessionEvent>) -> Self {
        Self(inner)
    }

    pub async fn frame_received(&self, conn_id: u32, frame: Frame) {
        let _ = self.0.send_async(SessionEvent::FrameReceived(conn_id, frame)).await;
    }

    pub async fn connection_failed(&self, conn_id: u32, err: TransportError) {
        let _ = self.0.send_async(SessionEvent::ConnectionFailed(conn_id, err)).await;
    }
}

pub struct SessionActor {
    state: SessionState,
    callbacks: Arc<dyn SessionCallbacks>,
    payload_codec: Arc<dyn PayloadCodec>,
    config: Arc<Config>,
    io_senders: HashMap<u32, Sender<Frame>>,
    io_tasks: HashMap<u32, JoinHandle<()>>,
    events_tx: Sender<SessionEvent>,
    events_rx: Receiver<SessionEvent>,
    commands_rx: Receiver<SessionCommand>,
    closed_tx: watch::Sender<bool>,
}

impl SessionActor {
    pub fn spawn(session_id: SessionId, config: Arc<Config>, callbacks: Arc<dyn SessionCallbacks>) -> SessionHandle {
        Self::spawn_with_codec(session_id, config, callbacks, Arc::new(IdentityCodec))
    }

    pub fn spawn_with_codec(
        session_id: SessionId,
        config: Arc<Config>,
        callbacks: Arc<dyn SessionCallbacks>,
        payload_codec: Arc<dyn PayloadCodec>,
    ) -> SessionHandle {
        let (commands_tx, commands_rx) = flume::unbounded();
        let (events_tx, events_rx) = flume::unbounded();
        let (closed_tx, closed_rx) = watch::channel(false);
        let actor = SessionActor {
            state: SessionState::new(session_id, config.clone()),
            callbacks,
            payload_codec,
            config,
            io_senders: HashMap::new(),
            io_tasks: HashMap::new(),
            events_tx,
            events_rx,
            commands_rx,
            closed_tx,
        };
        tokio::spawn(actor.run());
        SessionHandle::new(session_id, commands_tx, closed_rx)
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands_rx.recv_async() => {
                    match cmd {
                        Ok(cmd) => self.handle_command(cmd).await,
                        Err(_) => break,
                    }
                }
                ev = self.events_rx.recv_async() => {
                    if let Ok(ev) = ev {
                        self.handle_event(ev).await;
                    }
                }
            }
            if self.state.is_interrupted() || self.state.is_shut_down() {
                break;
            }
        }
        for task in self.io_tasks.values() {
            task.abort();
        }
        let _ = self.closed_tx.send(true);
        trace!(session = %self.state.session_id(), "session actor exiting");
    }

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Send(buffers) => {
                let buffers = self.payload_codec.encode(buffers);
                let effects = self.state.enqueue(buffers);
                self.run_effects(effects).await;
            }
            SessionCommand::AddStream(head, read, write) => match self.state.add_stream(head) {
                Ok((effects, conn_id)) => {
                    self.spawn_connection_io(conn_id, read, write);
                    self.run_effects(effects).await;
                }
                Err(HandshakeError::Session(err)) => {
                    // a connection id regression (or the ghost-fill cap it
                    // would take to accept it) is never expected from a
                    // well-behaved peer — don't trust the rest of the
                    // session either.
                    warn!(%err, "handshake violated a session-wide invariant, interrupting");
                    let effects = self.state.internal_interrupt();
                    self.run_effects(effects).await;
                }
                Err(err) => {
                    warn!(%err, "rejected incoming stream handshake, session continues");
                }
            },
            SessionCommand::AllocateConnectionId(reply) => {
                let _ = reply.send(self.state.next_connection_id());
            }
            SessionCommand::RetireConnection(conn_id) => {
                let effects = self.state.retire_connection(conn_id);
                self.run_effects(effects).await;
            }
            SessionCommand::ShutDown => {
                let effects = self.state.shut_down();
                self.run_effects(effects).await;
            }
            SessionCommand::Interrupt => {
                let effects = self.state.internal_interrupt();
                self.run_effects(effects).await;
            }
        }
    }

    async fn handle_event(&mut self, ev: SessionEvent) {
        match ev {
            SessionEvent::FrameReceived(conn_id, frame) => {
                let effects = self.state.handle_frame_received(conn_id, frame);
                self.run_effects(effects).await;
            }
            SessionEvent::ConnectionFailed(conn_id, err) => {
                debug!(conn_id, %err, "connection failed, running cleanup");
                let effects = self.state.handle_connection_failed(conn_id);
                self.run_effects(effects).await;
            }
        }
    }

    fn spawn_connection_io(&mut self, conn_id: u32, read: OwnedReadHalf, write: OwnedWriteHalf) {
        let (outgoing_tx, outgoing_rx) = flume::unbounded();
        let events_tx = SessionEventSender::new(self.events_tx.clone());
        let config = self.config.clone();
        let task = tokio::spawn(stream::run_connection_io(conn_id, read, write, outgoing_rx, events_tx, config));
        self.io_senders.insert(conn_id, outgoing_tx);
        self.io_tasks.insert(conn_id, task);
    }

    async fn run_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::WriteFrame(conn_id, frame) => {
                    if let Some(sender) = self.io_senders.get(&conn_id) {
                        let _ = sender.send_async(frame).await;
                    }
                }
                Effect::DetachConnectionIo(conn_id) => {
                    self.io_senders.remove(&conn_id);
                    if let Some(task) = self.io_tasks.remove(&conn_id) {
                        task.abort();
                    }
                }
                Effect::Deliver(buffers) => {
                    let buffers = self.payload_codec.decode(buffers);
                    self.callbacks.received(buffers).await;
                }
                Effect::ConnectionBusy(conn_id) => {
                    if let Some(conn) = self.state.connection(conn_id) {
                        self.callbacks.busy(conn).await;
                    }
                }
                Effect::ConnectionIdle(conn_id) => {
                    if let Some(conn) = self.state.connection(conn_id) {
                        self.callbacks.idle(conn).await;
                    }
                }
                Effect::Available => self.callbacks.available().await,
                Effect::Unavailable => self.callbacks.unavailable().await,
                Effect::ShutDown => self.callbacks.shut_down().await,
                Effect::Interrupted => {
                    for task in self.io_tasks.values() {
                        task.abort();
                    }
                    self.io_tasks.clear();
                    self.io_senders.clear();
                    self.callbacks.interrupted().await;
                }
            }
        }
    }
}
