//! Conversation core for the parley realtime voice client.
//!
//! Everything here is transport-agnostic: the turn model, the append-only
//! history with its read-time views, voice-scoped persistence and snapshot
//! sync, and the tool dispatcher with its built-in capabilities.

pub mod dispatcher;
pub mod history;
pub mod memory;
pub mod sync;
pub mod tools;
pub mod turn;
