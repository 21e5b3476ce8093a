//! The public TCP listener and its lifecycle.
//!
//! A proxy moves one way through `Listening -> Stopping -> Stopped`. The
//! accept loop hands every connection to a handler task; stopping broadcasts
//! the per-proxy cancellation (which cascades into live splices), stops
//! accepting, and waits for handlers to drain up to a deadline.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};
use tracing::{error, info};

use crate::config::TimeoutConfig;
use crate::forwarder;
use crate::metrics::ACCEPTED_CONNECTIONS;
use crate::strategy::Balancer;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy drain deadline exceeded")]
    DrainDeadline,
    #[error("proxy already running")]
    AlreadyRunning,
}

pub struct Proxy {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    balancer: Arc<dyn Balancer>,
    timeouts: TimeoutConfig,
    shutdown_tx: watch::Sender<()>,
    stopped: AtomicBool,
    active_handlers: AtomicI64,
    drained: Notify,
}

impl Proxy {
    /// Binds the public listener. The accept loop starts with [`Proxy::run`].
    pub async fn bind(
        address: &str,
        balancer: Arc<dyn Balancer>,
        timeouts: TimeoutConfig,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, _) = watch::channel(());

        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            balancer,
            timeouts,
            shutdown_tx,
            stopped: AtomicBool::new(false),
            active_handlers: AtomicI64::new(0),
            drained: Notify::new(),
        })
    }

    /// The address the listener actually bound, useful when the configured
    /// port was 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections until stopped, spawning one handler task per
    /// connection. Transient accept errors are logged and the loop continues;
    /// the stop signal ends the loop cleanly.
    pub async fn run(self: Arc<Self>) -> Result<(), ProxyError> {
        let listener = self.listener.lock().take().ok_or(ProxyError::AlreadyRunning)?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        // A stop that raced ahead of this subscription left only the flag.
        if self.stopped.load(Ordering::Acquire) {
            return Ok(());
        }

        info!(addr = %self.local_addr, "Proxy listening");

        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, _peer)) => self.spawn_handler(stream),
                Err(_) if self.stopped.load(Ordering::Acquire) => break,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    continue;
                }
            }
        }

        // Dropping the listener closes the socket; in-flight handlers keep
        // running until stop() drains them.
        drop(listener);
        info!(addr = %self.local_addr, "Proxy stopped accepting");
        Ok(())
    }

    fn spawn_handler(self: &Arc<Self>, stream: TcpStream) {
        ACCEPTED_CONNECTIONS.inc();
        self.active_handlers.fetch_add(1, Ordering::AcqRel);

        let proxy = Arc::clone(self);
        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            forwarder::handle(proxy.balancer.as_ref(), stream, &proxy.timeouts, shutdown_rx).await;
            if proxy.active_handlers.fetch_sub(1, Ordering::AcqRel) == 1 {
                proxy.drained.notify_waiters();
            }
        });
    }

    /// Stops the proxy: flags the state, closes the listener, cancels live
    /// splices, then waits for handler tasks up to `deadline`. Idempotent;
    /// a second call just waits for the same drain.
    ///
    /// On deadline expiry the remaining handlers are abandoned and
    /// [`ProxyError::DrainDeadline`] is returned.
    pub async fn stop(&self, deadline: Duration) -> Result<(), ProxyError> {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            info!(addr = %self.local_addr, "Proxy stopping");
        }
        // Receivers may all be gone already; that simply means nothing is
        // left to cancel.
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(deadline, self.drained()).await {
            Ok(()) => {
                info!(addr = %self.local_addr, "Proxy drained");
                Ok(())
            }
            Err(_) => Err(ProxyError::DrainDeadline),
        }
    }

    async fn drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            // Register for the wakeup before the count check so a handler
            // finishing in between cannot be missed.
            notified.as_mut().enable();
            if self.active_handlers.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}
