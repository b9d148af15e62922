//! The session engine: a pure state machine (`state`) driven by an actor
//! (`actor`) that owns the I/O side effects, exposed to applications through
//! a cloneable `SessionHandle`.

mod actor;
mod handle;
mod state;

pub use actor::{SessionActor, SessionEventSender};
pub use handle::SessionHandle;
pub use state::Effect;
