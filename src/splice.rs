//! Full-duplex byte splicing between a hijacked client socket and the backend.

use std::{
    io,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use bytes::Bytes;
use n0_error::{e, stack_error};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time::Instant,
};
use tracing::trace;

/// Size of the per-direction copy buffer.
pub const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// How long the backend may keep sending after the client finished sending.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Tuning for [`splice`].
#[derive(Debug, Clone)]
pub struct SpliceOpts {
    /// Bytes read per copy step, per direction.
    pub buffer_size: usize,
    /// Bound on the backend→client drain after a clean client EOF.
    pub drain_grace: Duration,
    /// Tear the pair down after this long without traffic in either direction.
    pub idle_timeout: Option<Duration>,
}

impl Default for SpliceOpts {
    fn default() -> Self {
        Self {
            buffer_size: COPY_BUFFER_SIZE,
            drain_grace: DEFAULT_DRAIN_GRACE,
            idle_timeout: None,
        }
    }
}

/// Why a spliced pair was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpliceEnd {
    /// The client finished sending and the backend drained (or the grace ran out).
    ClientEof,
    /// The backend closed its side.
    BackendEof,
    /// Reading or writing failed on either socket.
    Error(io::ErrorKind),
    /// No traffic for the configured idle timeout.
    IdleTimeout,
}

/// Outcome of a finished splice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpliceStats {
    /// Bytes copied client→backend, excluding the replayed request bytes.
    pub to_backend: u64,
    /// Bytes copied backend→client.
    pub to_client: u64,
    pub end: SpliceEnd,
}

/// Failures before any byte was copied.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum SpliceError {
    /// Could not connect to the backend.
    #[error("failed to connect to backend {addr}")]
    BackendConnect {
        addr: SocketAddr,
        #[error(source, std_err)]
        source: io::Error,
    },

    /// Could not deliver the buffered request bytes to the backend.
    #[error("failed to replay buffered request bytes to backend")]
    Replay {
        #[error(source, std_err)]
        source: io::Error,
    },
}

/// Connects `client` to the backend at `backend` and copies bytes both ways.
///
/// `replay` holds the bytes already read from `client` (the request header
/// section and anything received after it). They are written to the backend
/// before any further client bytes are forwarded.
///
/// Both sockets are closed when this returns. On error the client socket is
/// dropped without a response.
pub async fn splice(
    client: TcpStream,
    replay: Bytes,
    backend: SocketAddr,
    opts: &SpliceOpts,
) -> Result<SpliceStats, SpliceError> {
    let mut upstream = TcpStream::connect(backend)
        .await
        .map_err(|source| e!(SpliceError::BackendConnect { addr: backend, source }))?;
    if !replay.is_empty() {
        upstream
            .write_all(&replay)
            .await
            .map_err(|source| e!(SpliceError::Replay { source }))?;
    }
    client.set_nodelay(true).ok();
    upstream.set_nodelay(true).ok();
    trace!(replayed = replay.len(), "backend connected");

    let (mut client_recv, mut client_send) = client.into_split();
    let (mut backend_recv, mut backend_send) = upstream.into_split();
    let stats = pipe(
        &mut client_recv,
        &mut client_send,
        &mut backend_recv,
        &mut backend_send,
        opts,
    )
    .await;
    trace!(?stats, "splice finished");
    Ok(stats)
}

enum First {
    Client(io::Result<()>),
    Backend(io::Result<()>),
    Idle,
}

/// Copies client→backend and backend→client until one direction ends.
///
/// A clean client EOF is passed on to the backend and the backend gets
/// `drain_grace` to finish answering. Anything else ends both directions at
/// once. The caller drops the halves, which closes the sockets.
pub async fn pipe(
    client_recv: &mut (impl AsyncRead + Unpin),
    client_send: &mut (impl AsyncWrite + Unpin),
    backend_recv: &mut (impl AsyncRead + Unpin),
    backend_send: &mut (impl AsyncWrite + Unpin),
    opts: &SpliceOpts,
) -> SpliceStats {
    let activity = Activity::new();
    let to_backend = AtomicU64::new(0);
    let to_client = AtomicU64::new(0);

    let up = copy_half(
        client_recv,
        backend_send,
        opts.buffer_size,
        &to_backend,
        &activity,
    );
    let down = copy_half(
        backend_recv,
        client_send,
        opts.buffer_size,
        &to_client,
        &activity,
    );
    let idle = activity.expired(opts.idle_timeout);
    tokio::pin!(up, down, idle);

    let first = tokio::select! {
        res = &mut up => First::Client(res),
        res = &mut down => First::Backend(res),
        _ = &mut idle => First::Idle,
    };
    let end = match first {
        First::Client(Ok(())) => {
            match tokio::time::timeout(opts.drain_grace, &mut down).await {
                Ok(Err(err)) => SpliceEnd::Error(err.kind()),
                Ok(Ok(())) | Err(_) => SpliceEnd::ClientEof,
            }
        }
        First::Backend(Ok(())) => SpliceEnd::BackendEof,
        First::Client(Err(err)) | First::Backend(Err(err)) => SpliceEnd::Error(err.kind()),
        First::Idle => SpliceEnd::IdleTimeout,
    };

    SpliceStats {
        to_backend: to_backend.load(Ordering::Relaxed),
        to_client: to_client.load(Ordering::Relaxed),
        end,
    }
}

async fn copy_half(
    reader: &mut (impl AsyncRead + Unpin),
    writer: &mut (impl AsyncWrite + Unpin),
    buffer_size: usize,
    copied: &AtomicU64,
    activity: &Activity,
) -> io::Result<()> {
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            writer.shutdown().await?;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        copied.fetch_add(n as u64, Ordering::Relaxed);
        activity.touch();
    }
}

/// Last time any byte moved through the pair.
struct Activity {
    start: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let ms = self.start.elapsed().as_millis() as u64;
        self.last_ms.store(ms, Ordering::Relaxed);
    }

    fn last(&self) -> Instant {
        self.start + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }

    /// Resolves once the pair has been idle for `timeout`; never without one.
    async fn expired(&self, timeout: Option<Duration>) {
        let Some(timeout) = timeout else {
            return std::future::pending().await;
        };
        loop {
            let deadline = self.last() + timeout;
            tokio::time::sleep_until(deadline).await;
            if self.last() + timeout <= Instant::now() {
                return;
            }
        }
    }
}
