//! The cloneable, application-facing front end for a running session. Talks
//! to the `SessionActor` purely by message passing — nothing here touches
//! `SessionState` directly, so cloning a handle is cheap and safe to share
//! across tasks.

use flume::Sender;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::watch;

use crate::codec::{ConnectionHead, SessionId};
use crate::session::actor::SessionCommand;

#[derive(Clone)]
pub struct SessionHandle {
    session_id: SessionId,
    commands: Sender<SessionCommand>,
    closed: watch::Receiver<bool>,
}

impl SessionHandle {
    pub(crate) fn new(session_id: SessionId, commands: Sender<SessionCommand>, closed: watch::Receiver<bool>) -> Self {
        Self {
            session_id,
            commands,
            closed,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// enqueues `message` for delivery. Never blocks on network I/O; returns
    /// once the send has been handed to the session's internal queue.
    pub async fn send(&self, message: Vec<Vec<u8>>) {
        let _ = self.commands.send_async(SessionCommand::Send(message)).await;
    }

    pub(crate) async fn add_stream(&self, head: ConnectionHead, read: OwnedReadHalf, write: OwnedWriteHalf) {
        let _ = self
            .commands
            .send_async(SessionCommand::AddStream(head, read, write))
            .await;
    }

    pub(crate) async fn allocate_connection_id(&self) -> u32 {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let _ = self.commands.send_async(SessionCommand::AllocateConnectionId(tx)).await;
        rx.await.unwrap_or(0)
    }

    pub(crate) async fn retire_connection(&self, conn_id: u32) {
        let _ = self.commands.send_async(SessionCommand::RetireConnection(conn_id)).await;
    }

    /// requests a graceful shutdown: `Finish` is sent on every open
    /// connection and `shut_down()`/`interrupted()` on the callbacks fires
    /// once teardown completes. Use [`SessionHandle::closed`] to wait for it.
    pub async fn shut_down(&self) {
        let _ = self.commands.send_async(SessionCommand::ShutDown).await;
    }

    /// abrupt teardown: best-effort notice to the peer, then the session is
    /// torn down immediately without waiting for acknowledgement.
    pub async fn interrupt(&self) {
        let _ = self.commands.send_async(SessionCommand::Interrupt).await;
    }

    /// resolves once the session has fully torn down, gracefully or
    /// abruptly — i.e. once `shut_down()` or `interrupted()` has fired on
    /// the callbacks.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|&done| done).await;
    }
}
