//! HTTP server implementation.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{error, info};

use super::service::router;
use crate::config::TurnstileConfig;
use crate::error::Result;
use crate::ratelimit::RateLimiter;

/// HTTP server fronted by the rate limiter.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The rate limiter instance
    rate_limiter: Arc<RateLimiter>,
    request_timeout: Duration,
    sweep_interval: Duration,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(config: &TurnstileConfig, rate_limiter: Arc<RateLimiter>) -> Self {
        Self {
            addr: config.server.listen_addr,
            rate_limiter,
            request_timeout: Duration::from_secs(config.server.request_timeout_secs),
            sweep_interval: config.limiter.sweep_interval(),
        }
    }

    /// The configured listen address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The router serving requests.
    pub fn router(&self) -> Router {
        router(Arc::clone(&self.rate_limiter), self.request_timeout)
    }

    /// Bind the configured address and serve until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind listener");
            e
        })?;
        self.serve_on(listener, signal).await
    }

    /// Serve on an already bound listener until `signal` resolves.
    ///
    /// The idle bucket sweeper runs for as long as the server does.
    pub async fn serve_on<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        let app = self.router();

        let (stop_sweeper, sweeper_stopped) = oneshot::channel::<()>();
        let sweeper = self.rate_limiter.spawn_sweeper(self.sweep_interval, async move {
            let _ = sweeper_stopped.await;
        });

        info!(addr = %addr, "Starting HTTP server");

        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await;

        let _ = stop_sweeper.send(());
        if let Err(e) = sweeper.await {
            error!(error = %e, "Bucket sweeper task failed");
        }

        served.map_err(|e| {
            error!(error = %e, "HTTP server failed");
            e.into()
        })
    }
}
