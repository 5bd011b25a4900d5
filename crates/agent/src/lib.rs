//! VM telemetry agent
//!
//! Node daemon wiring VM discovery, the periodic refresh of exchange
//! disks and per-VM guest channels behind a small HTTP API.

pub mod api;
pub mod config;
