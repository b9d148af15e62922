//! Optional payload transform hook (spec.md §1's "optional payload crypto
//! hooks" and §4.3's "deliver (after optional `dataDecrypt`)"). The core
//! session engine treats message buffers as opaque bytes and never depends
//! on any particular crypto crate; an application that wants payload
//! encryption implements [`PayloadCodec`] and hands it to
//! [`crate::client::connect`]/[`crate::server::serve`]. [`IdentityCodec`] is
//! the default passthrough, so most callers never need to think about this.

/// Transforms message buffers on the way out (`encode`) and on the way in
/// (`decode`), symmetrically. Runs outside the session's atomic transaction
/// (it touches no protocol state), so a slow or fallible codec never blocks
/// or corrupts bookkeeping — only the bytes the application ultimately sees.
pub trait PayloadCodec: Send + Sync + 'static {
    /// called once per outgoing message, before it is handed to the sending
    /// connection.
    fn encode(&self, buffers: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        buffers
    }

    /// called once per newly-delivered (non-duplicate) message, before
    /// `SessionCallbacks::received` sees it.
    fn decode(&self, buffers: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        buffers
    }
}

/// Passthrough codec: returns buffers unchanged. The default for every
/// session that doesn't configure its own.
pub struct IdentityCodec;

impl PayloadCodec for IdentityCodec {}
