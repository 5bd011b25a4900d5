//! Guest channel delivery
//!
//! Serves metrics to a guest over the virtual serial channel the hypervisor
//! exposes as a unix socket. The server only ever connects to that socket.

pub mod protocol;
mod rate_limit;
mod server;

pub use protocol::{ReadOutcome, RequestError, INVALID_RESPONSE, PLACEHOLDER};
pub use rate_limit::RateLimiter;
pub use server::{
    ChannelConfig, GuestChannelServer, DEFAULT_BURST, DEFAULT_INITIAL_BACKOFF,
    DEFAULT_MAX_CONNECT_ATTEMPTS, DEFAULT_REQUESTS_PER_SECOND,
};

use crate::models::MetricsDocument;
use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

/// Produces the document answering one guest request
#[async_trait]
pub trait MetricsReporter: Send + Sync {
    async fn report(&self) -> anyhow::Result<MetricsDocument>;
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid channel configuration: {0}")]
    InvalidConfig(String),

    #[error("gave up connecting to {} after {attempts} attempts", .path.display())]
    AttemptsExhausted { path: PathBuf, attempts: u32 },

    #[error("failed to connect to {}: {source}", .path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),
}
