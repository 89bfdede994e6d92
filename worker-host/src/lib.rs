//! Worker host: spawns analysis worker processes on behalf of a UI,
//! supervises them, and multiplexes their output back per worker id.
//!
//! - [`admission`]: may another worker start?
//! - [`registry`]: owns processes and the per-id dispatch table
//! - [`classify`]: turns raw failures into the UI error taxonomy
//! - [`router`]: bridges a UI endpoint and one registry
//! - [`api`]: WebSocket and status routes over both routers

pub mod admission;
pub mod api;
pub mod classify;
pub mod config;
pub mod error;
pub mod ipc;
pub mod registry;
pub mod router;
pub mod state;

pub use error::WorkerError;
pub use state::AppState;
