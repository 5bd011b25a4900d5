//! Guest channel server
//!
//! Lifecycle: connect to the hypervisor's socket with bounded exponential
//! backoff, then answer requests one at a time until the guest hangs up or
//! the server is cancelled.

use super::protocol::{self, ReadOutcome, INVALID_RESPONSE, PLACEHOLDER};
use super::rate_limit::RateLimiter;
use super::{ChannelError, MetricsReporter};
use crate::observability::{outcomes, AgentMetrics};
use crate::xml;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_REQUESTS_PER_SECOND: f64 = 5.0;
pub const DEFAULT_BURST: u32 = 1;
pub const DEFAULT_MAX_CONNECT_ATTEMPTS: u32 = 6;
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Configuration of one guest channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Socket created by the hypervisor for the channel device
    pub socket_path: PathBuf,
    pub requests_per_second: f64,
    pub burst: u32,
    pub max_connect_attempts: u32,
    /// First retry delay, doubled after every failed attempt
    pub initial_backoff: Duration,
}

impl ChannelConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            requests_per_second: DEFAULT_REQUESTS_PER_SECOND,
            burst: DEFAULT_BURST,
            max_connect_attempts: DEFAULT_MAX_CONNECT_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
        }
    }
}

/// Serves metrics to one guest
pub struct GuestChannelServer {
    config: ChannelConfig,
    reporter: Arc<dyn MetricsReporter>,
    limiter: RateLimiter,
    metrics: AgentMetrics,
}

impl GuestChannelServer {
    pub fn new(
        config: ChannelConfig,
        reporter: Arc<dyn MetricsReporter>,
    ) -> Result<Self, ChannelError> {
        if config.max_connect_attempts == 0 {
            return Err(ChannelError::InvalidConfig(
                "max_connect_attempts must be at least 1".to_string(),
            ));
        }
        let limiter = RateLimiter::new(config.requests_per_second, config.burst)?;

        Ok(Self {
            config,
            reporter,
            limiter,
            metrics: AgentMetrics::new(),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Connect and serve until the guest closes or `cancel` fires
    ///
    /// Cancellation is not an error. Running out of connect attempts or a
    /// non-retryable connect failure is.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ChannelError> {
        let Some(stream) = self.connect(&cancel).await? else {
            debug!(socket = %self.config.socket_path.display(), "Cancelled while connecting");
            return Ok(());
        };

        let metrics = self.metrics.clone();
        metrics.guest_channel_connected();
        let result = self.serve(stream, cancel).await;
        metrics.guest_channel_disconnected();

        result
    }

    async fn connect(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<UnixStream>, ChannelError> {
        let path = &self.config.socket_path;
        let attempts = self.config.max_connect_attempts;
        let mut backoff = self.config.initial_backoff;

        for attempt in 1..=attempts {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                result = UnixStream::connect(path) => result,
            };

            match result {
                Ok(stream) => {
                    info!(socket = %path.display(), attempt = attempt, "Guest channel connected");
                    return Ok(Some(stream));
                }
                Err(e) if is_retryable(&e) => {
                    debug!(
                        socket = %path.display(),
                        attempt = attempt,
                        error = %e,
                        "Guest channel not ready"
                    );
                    if attempt == attempts {
                        break;
                    }

                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => {
                    return Err(ChannelError::Connect {
                        path: path.clone(),
                        source: e,
                    })
                }
            }
        }

        Err(ChannelError::AttemptsExhausted {
            path: path.clone(),
            attempts,
        })
    }

    async fn serve(
        self,
        stream: UnixStream,
        cancel: CancellationToken,
    ) -> Result<(), ChannelError> {
        let Self {
            config,
            reporter,
            limiter,
            metrics,
        } = self;
        let socket = config.socket_path.display().to_string();

        let (read_half, mut write_half) = stream.into_split();

        // one slot, so an abandoned read can always hand off its result
        let (tx, mut rx) = mpsc::channel(1);
        let reader = tokio::spawn(read_requests(read_half, limiter, tx, cancel.clone()));

        let result = loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                outcome = rx.recv() => outcome,
            };

            let response = match outcome {
                None | Some(Ok(ReadOutcome::Closed)) => {
                    debug!(socket = %socket, "Guest closed the channel");
                    break Ok(());
                }
                Some(Err(e)) if is_closed(&e) => break Ok(()),
                Some(Err(e)) => break Err(ChannelError::Io(e)),
                Some(Ok(ReadOutcome::Invalid(reason))) => {
                    debug!(socket = %socket, reason = %reason, "Invalid guest request");
                    metrics.inc_guest_request(outcomes::INVALID);
                    INVALID_RESPONSE.to_vec()
                }
                Some(Ok(ReadOutcome::Request)) => tokio::select! {
                    _ = cancel.cancelled() => break Ok(()),
                    response = render(reporter.as_ref(), &metrics, &socket) => response,
                },
            };

            let written = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                written = write_response(&mut write_half, &response) => written,
            };
            match written {
                Ok(()) => {}
                Err(e) if is_closed(&e) => break Ok(()),
                Err(e) => break Err(ChannelError::Io(e)),
            }
        };

        reader.abort();
        if let Err(e) = write_half.shutdown().await {
            debug!(socket = %socket, error = %e, "Channel already closed");
        }

        result
    }
}

/// Read side of a served channel
async fn read_requests(
    read_half: OwnedReadHalf,
    mut limiter: RateLimiter,
    tx: mpsc::Sender<io::Result<ReadOutcome>>,
    cancel: CancellationToken,
) {
    let mut reader = BufReader::new(read_half);

    loop {
        if !limiter.wait(&cancel).await {
            return;
        }

        let outcome = protocol::read_request(&mut reader).await;
        let last = matches!(outcome, Ok(ReadOutcome::Closed) | Err(_));
        if matches!(outcome, Ok(ReadOutcome::Invalid(_))) {
            // start the next request on a clean buffer
            reader = BufReader::new(reader.into_inner());
        }

        if tx.send(outcome).await.is_err() || last {
            return;
        }
    }
}

async fn render(reporter: &dyn MetricsReporter, metrics: &AgentMetrics, socket: &str) -> Vec<u8> {
    let body = match reporter.report().await {
        Ok(doc) => match xml::encode_document(&doc) {
            Ok(body) => {
                metrics.inc_guest_request(outcomes::SERVED);
                body
            }
            Err(e) => {
                warn!(socket = %socket, error = %e, "Failed to encode guest report");
                metrics.inc_guest_request(outcomes::PLACEHOLDER);
                PLACEHOLDER.as_bytes().to_vec()
            }
        },
        Err(e) => {
            warn!(socket = %socket, error = %e, "Failed to build guest report");
            metrics.inc_guest_request(outcomes::PLACEHOLDER);
            PLACEHOLDER.as_bytes().to_vec()
        }
    };

    protocol::frame_response(body)
}

async fn write_response(write_half: &mut OwnedWriteHalf, response: &[u8]) -> io::Result<()> {
    write_half.write_all(response).await?;
    write_half.flush().await
}

fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound
    )
}

fn is_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}
