//! Telemetry library for per-VM metrics delivery
//!
//! This crate provides the core functionality for:
//! - Bounded-concurrency collection of VM statistics
//! - The fixed-size metrics exchange disk read by guests
//! - The guest channel server answering metrics requests
//! - VM discovery, periodic refresh and per-VM lifecycle
//! - Health checks and observability

pub mod channel;
pub mod collector;
pub mod exchange;
pub mod health;
pub mod manager;
pub mod models;
pub mod observability;
pub mod report;
pub mod xml;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{AgentMetrics, StructuredLogger};
