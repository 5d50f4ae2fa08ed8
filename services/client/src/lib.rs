//! Parley Client Library Crate
//!
//! The client side of a realtime voice conversation: configuration, the
//! session event loop over the realtime connection, and the backend's REST
//! endpoints. The `parley` binary is a thin CLI over this library.

pub mod audio_utils;
pub mod config;
pub mod error;
pub mod rest;
pub mod ws;
