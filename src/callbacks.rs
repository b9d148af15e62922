//! Application-facing callback surface. Follows
//! `roundtable::handler::HandlerInit`'s shape: an `#[async_trait]` with
//! default (empty) bodies for everything but the one method almost every
//! implementor actually needs, so a minimal application only overrides
//! `received`.

use async_trait::async_trait;

use crate::connection::Connection;
use crate::session::SessionHandle;

#[async_trait]
pub trait SessionCallbacks: Send + Sync + 'static {
    /// a fully-ordered, deduplicated application message arrived.
    async fn received(&self, message: Vec<Vec<u8>>);

    /// the session's handle, for callbacks that need to send replies or
    /// query connection state. Called exactly once, right after the session
    /// is created and before its first connection is attached.
    async fn attach_handle(&self, _handle: SessionHandle) {}

    /// fired on the client side when a new connection becomes available,
    /// i.e. there is at least one connection accepting sends.
    async fn available(&self) {}

    /// fired on the client side when every connection has died and sends
    /// are being buffered offline instead.
    async fn unavailable(&self) {}

    /// fired once per connection entering the Busy state (has at least one
    /// unconfirmed packet outstanding).
    async fn busy(&self, _connection: &Connection) {}

    /// fired once per connection returning to the Idle state (nothing
    /// outstanding).
    async fn idle(&self, _connection: &Connection) {}

    /// the session finished a graceful, mutually-acknowledged shutdown.
    async fn shut_down(&self) {}

    /// the session tore down abruptly (`internalInterrupt` or an
    /// unrecoverable `SessionError`).
    async fn interrupted(&self) {}

    /// server-only: a brand new session (not a renew of an existing one)
    /// was just created for an inbound connection.
    async fn accepted(&self) {}
}

/// A `SessionCallbacks` that does nothing beyond dropping messages, useful
/// for tests and for clients that only care about the liveness hooks.
pub struct NoopCallbacks;

#[async_trait]
impl SessionCallbacks for NoopCallbacks {
    async fn received(&self, _message: Vec<Vec<u8>>) {}
}
