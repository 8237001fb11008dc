//! Control plane for a Linux container host. This crate carries the wire
//! protocol shared by client and server, the backend seam and the daemon
//! side: request dispatch, per container grace timers and bidirectional
//! process streaming. The isolation itself lives behind the [`backend`]
//! traits and is somebody else's problem.

pub mod api;
pub mod backend;
pub mod config;
pub mod server;
