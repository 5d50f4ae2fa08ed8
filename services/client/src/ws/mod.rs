//! Realtime Session
//!
//! Everything behind the duplex connection to `<backend>/v1/realtime`:
//!
//! - `protocol`: the JSON envelopes exchanged in each direction.
//! - `machine`: the connection lifecycle and inbound classification.
//! - `transport`: the WebSocket reader and writer tasks.
//! - `session`: the event loop tying connection, history and tools together.

pub mod machine;
pub mod protocol;
pub mod session;
pub mod transport;

pub use machine::ConnectionState;
pub use session::{Session, SessionEvent, SessionHandle};
