use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use http::{Method, Version};
use n0_error::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::{sync::CancellationToken, task::TaskTracker, time::FutureExt};
use tracing::{Instrument, debug, error_span, trace, warn};

use crate::{
    config::{Config, HEADER_SECTION_MAX_LENGTH},
    info,
    metrics::RelayMetrics,
    parse::{BodyLength, HttpRequest},
    splice::{SpliceError, SpliceOpts, splice},
    util::Prebuffered,
};

/// How long in-flight connections may run on after shutdown was requested.
pub const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// What to do with a parsed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Hand the raw connection to the splicer.
    Splice,
    /// Answer from the info endpoints.
    Info,
    /// Close the connection without a response.
    Reject,
}

/// The HTTP/1.1 front door.
///
/// Serves the info endpoints and hijacks WebSocket upgrades on the configured
/// path, splicing them to the loopback backend. Each accepted connection runs
/// in its own task; connections share nothing but the immutable [`Config`]
/// and the aggregate [`RelayMetrics`].
#[derive(Debug, Clone)]
pub struct Relay {
    config: Arc<Config>,
    splice_opts: SpliceOpts,
    metrics: Arc<RelayMetrics>,
}

impl Relay {
    pub fn new(config: Config) -> Self {
        let splice_opts = SpliceOpts {
            idle_timeout: config.idle_timeout,
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
            splice_opts,
            metrics: Default::default(),
        }
    }

    /// Overrides the splice tuning derived from the config.
    pub fn with_splice_opts(mut self, opts: SpliceOpts) -> Self {
        self.splice_opts = opts;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    /// Decides how to handle `req`.
    ///
    /// Upgrades are checked before any routing so that a request on the
    /// WebSocket path never reaches the info endpoints. A request only counts
    /// as an upgrade when it names a protocol in `Upgrade` and carries the
    /// `upgrade` token in `Connection`.
    pub fn dispatch(&self, req: &HttpRequest) -> Dispatch {
        if req.upgrade().is_none() || !req.connection_upgrade() {
            Dispatch::Info
        } else if req.is_websocket_upgrade() && req.target == self.config.ws_path {
            Dispatch::Splice
        } else {
            Dispatch::Reject
        }
    }

    /// Accepts connections until `shutdown` is cancelled.
    ///
    /// After cancellation no new connections are accepted; in-flight ones get
    /// [`GRACEFUL_SHUTDOWN_TIMEOUT`] to finish and are aborted afterwards.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let tasks = TaskTracker::new();
        let abort = CancellationToken::new();
        let mut id = 0u64;
        loop {
            let (stream, peer_addr) = tokio::select! {
                res = listener.accept() => match res {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("failed to accept connection: {err:#}");
                        continue;
                    }
                },
                _ = shutdown.cancelled() => break,
            };
            self.metrics.connection_accepted();
            let this = self.clone();
            tasks.spawn(
                abort
                    .child_token()
                    .run_until_cancelled_owned(async move {
                        trace!(%peer_addr, "accepted connection");
                        match this.handle_connection(stream).await {
                            Ok(()) => trace!("connection closed"),
                            Err(err) => debug!("connection closed with error: {err:#}"),
                        }
                    })
                    .instrument(error_span!("conn", id)),
            );
            id += 1;
        }

        tasks.close();
        debug!(pending = tasks.len(), "listener closed, waiting for connections");
        if tasks.wait().timeout(GRACEFUL_SHUTDOWN_TIMEOUT).await.is_err() {
            debug!(remaining = tasks.len(), "not all connections closed in time, abort");
            abort.cancel();
            tasks.wait().await;
        }
        Ok(())
    }

    /// Serves requests on one connection until it closes or is hijacked.
    ///
    /// Malformed or oversized header sections end the connection without a
    /// response.
    pub async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let mut reader = Prebuffered::new(stream, HEADER_SECTION_MAX_LENGTH);
        loop {
            let Some((header_len, req)) = HttpRequest::peek(&mut reader).await? else {
                return Ok(());
            };
            trace!(method = %req.method, path = %req.target, "request");
            match self.dispatch(&req) {
                Dispatch::Reject => {
                    debug!(path = %req.target, "upgrade on unknown path, closing");
                    self.metrics.request_rejected();
                    return Ok(());
                }
                Dispatch::Splice => {
                    // The buffer still starts at this request's first byte, so the
                    // backend sees the request unmodified followed by the tail.
                    let (replay, stream) = reader.into_parts();
                    self.hand_off(stream, replay, header_len).await;
                    return Ok(());
                }
                Dispatch::Info => {
                    reader.consume(header_len);
                    let body = req.body_length();
                    if let BodyLength::Fixed(len) = body {
                        reader.skip(len).await?;
                    }
                    let keep_alive = req.keep_alive() && body != BodyLength::Unknown;
                    let mut response = info::respond(&req, &self.config);
                    if !keep_alive {
                        response = response.close();
                    } else if req.version == Version::HTTP_10 {
                        response = response.keep_alive();
                    }
                    response
                        .write(reader.get_mut(), req.method != Method::HEAD)
                        .await?;
                    self.metrics.info_request();
                    if !keep_alive {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn hand_off(&self, stream: TcpStream, replay: Bytes, header_len: usize) {
        self.metrics.splice_started();
        trace!(
            header_len,
            tail_len = replay.len() - header_len,
            "hijacking connection"
        );
        match splice(stream, replay, self.config.backend_addr(), &self.splice_opts).await {
            Ok(stats) => {
                self.metrics.add_bytes_to_backend(stats.to_backend);
                self.metrics.add_bytes_to_client(stats.to_client);
                debug!(
                    to_backend = stats.to_backend,
                    to_client = stats.to_client,
                    end = ?stats.end,
                    "splice finished"
                );
            }
            Err(err) => {
                self.record_splice_failure(&err);
                debug!("splice failed: {err:#}");
            }
        }
    }

    fn record_splice_failure(&self, err: &SpliceError) {
        if matches!(err, SpliceError::BackendConnect { .. }) {
            self.metrics.dial_failed();
        }
    }
}
