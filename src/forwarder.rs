//! This module is responsible for the I/O layer of the application.
//!
//! It drives one accepted client connection through its whole life: pick a
//! backend, dial it, splice bytes both ways, release the backend. The splice
//! propagates half-closes, tears everything down on a mid-stream error, and
//! unwinds promptly when the proxy lifecycle is cancelled.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, error};

use crate::backend::Backend;
use crate::config::TimeoutConfig;
use crate::metrics::{
    ACTIVE_CONNECTIONS, BYTES_FROM_BACKEND, BYTES_TO_BACKEND, DIAL_FAILURES, PICK_FAILURES,
};
use crate::strategy::Balancer;

/// Per-direction user-space copy buffer.
const COPY_BUF_SIZE: usize = 16 * 1024;

/// RAII release of a picked backend: every successful pick is paired with
/// exactly one connection-count decrement, on every exit path.
struct ConnGuard {
    backend: Arc<Backend>,
}

impl ConnGuard {
    fn new(backend: Arc<Backend>) -> Self {
        ACTIVE_CONNECTIONS.inc();
        Self { backend }
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.backend.dec_conn();
        ACTIVE_CONNECTIONS.dec();
    }
}

/// Handles one accepted client connection end to end.
///
/// Errors never escape: a failed pick or dial closes the client socket and a
/// mid-splice error tears the pair down, all scoped to this connection.
pub async fn handle(
    balancer: &dyn Balancer,
    mut client: TcpStream,
    timeouts: &TimeoutConfig,
    shutdown: watch::Receiver<()>,
) {
    let client_ip = match client.peer_addr() {
        Ok(addr) => addr.ip().to_string(),
        Err(e) => {
            error!(error = %e, "Failed to read peer address");
            return;
        }
    };

    let backend = match balancer.pick(&client_ip) {
        Ok(b) => b,
        Err(e) => {
            PICK_FAILURES.inc();
            error!(client_ip = %client_ip, error = %e, "Failed to pick backend");
            return;
        }
    };
    let _guard = ConnGuard::new(Arc::clone(&backend));

    // A dial failure is a normal connection error; liveness is the health
    // checker's call, not ours.
    let dial = tokio::time::timeout(timeouts.connect(), TcpStream::connect(backend.address()));
    let mut upstream = match dial.await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            DIAL_FAILURES.with_label_values(&[backend.address()]).inc();
            error!(backend = %backend.address(), error = %e, "Failed to connect to backend");
            return;
        }
        Err(_) => {
            DIAL_FAILURES.with_label_values(&[backend.address()]).inc();
            error!(backend = %backend.address(), "Backend connect timed out");
            return;
        }
    };

    match splice(&mut client, &mut upstream, timeouts, shutdown).await {
        Ok((to_backend, from_backend)) => {
            BYTES_TO_BACKEND.with_label_values(&[backend.address()]).inc_by(to_backend);
            BYTES_FROM_BACKEND.with_label_values(&[backend.address()]).inc_by(from_backend);
            debug!(
                backend = %backend.address(),
                to_backend = to_backend,
                from_backend = from_backend,
                "Connection closed"
            );
        }
        Err(e) => {
            // Abrupt client or backend closes land here; both sockets are
            // dropped without draining the other direction.
            debug!(backend = %backend.address(), error = %e, "Splice aborted");
        }
    }
}

/// Splices bytes between the client and backend sockets until both
/// directions finish.
///
/// Each direction runs concurrently. EOF on a source half-closes the write
/// side of its destination so the peer can finish its reply; a non-EOF error
/// in either direction cancels the other and surfaces the error, and the
/// caller's drop of both streams closes them immediately. A lifecycle signal
/// aborts both directions the same way.
///
/// Returns `(bytes_to_backend, bytes_from_backend)`.
async fn splice(
    client: &mut TcpStream,
    backend: &mut TcpStream,
    timeouts: &TimeoutConfig,
    shutdown: watch::Receiver<()>,
) -> io::Result<(u64, u64)> {
    let (mut client_read, mut client_write) = client.split();
    let (mut backend_read, mut backend_write) = backend.split();

    let client_to_backend = copy_half(
        &mut client_read,
        &mut backend_write,
        timeouts.client_idle(),
        shutdown.clone(),
    );
    let backend_to_client =
        copy_half(&mut backend_read, &mut client_write, timeouts.backend_idle(), shutdown);

    tokio::try_join!(client_to_backend, backend_to_client)
}

/// Copies one direction until EOF, then half-closes the destination.
async fn copy_half<R, W>(
    src: &mut R,
    dst: &mut W,
    idle_timeout: Duration,
    mut shutdown: watch::Receiver<()>,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total = 0u64;

    loop {
        let read = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "proxy shutting down"));
            }
            read = tokio::time::timeout(idle_timeout, src.read(&mut buf)) => read,
        };

        let n = match read {
            Ok(result) => result?,
            Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
        };
        if n == 0 {
            break;
        }

        dst.write_all(&buf[..n]).await?;
        total += n as u64;
    }

    dst.shutdown().await?;
    Ok(total)
}
