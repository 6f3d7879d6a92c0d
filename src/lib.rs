//! Multi-client display compositor server for DRM-style kernel scanout.
//!
//! The binary in `main.rs` is a thin wrapper; everything lives here so the
//! end-to-end tests can drive a real server in-process.

pub mod buffer;
pub mod cli;
pub mod client_agent;
pub mod compositor;
pub mod config;
pub mod cursor;
pub mod error;
pub mod event_loop;
pub mod ipc;
pub mod listener;
pub mod protocol;
pub mod renderer;
pub mod scanout;
pub mod server;
pub mod shm;
pub mod surface;
