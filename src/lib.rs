//! Bundled Connection Protocol: a session abstraction over a pool of TCP
//! connections that tolerates individual connections dying mid-session by
//! retransmitting their unconfirmed packets over whichever connection is
//! free next, while keeping delivery ordered and deduplicated from the
//! application's point of view.
#![allow(non_upper_case_globals)]

#[cfg(feature = "log")]
#[macro_use]
extern crate log;

#[cfg(not(feature = "log"))]
#[macro_use]
extern crate tracing;

mod callbacks;
pub mod client;
mod codec;
mod config;
mod connection;
mod error;
mod idset;
mod logging;
mod payload;
mod sendqueue;
pub mod server;
mod session;
mod stream;
mod varint;

pub use callbacks::{NoopCallbacks, SessionCallbacks};
pub use client::{connect, connect_with_codec, resume, resume_with_codec};
pub use codec::{ConnectionHead, Frame, SessionId};
pub use config::Config;
pub use connection::Connection;
pub use error::{ProtocolError, SessionError, TransportError};
pub use logging::init_logging;
pub use payload::{IdentityCodec, PayloadCodec};
pub use server::{serve, serve_with_codec, SessionFactory};
pub use session::{SessionActor, SessionHandle};
