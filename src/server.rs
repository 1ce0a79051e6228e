//! Application wiring and the serve loop.
//!
//! # Responsibilities
//! - Construct the balancer, limiters, client manager, and upstream client
//! - Stack the middleware chain over the admin router and proxy fallback
//! - Serve with connect-info, drain gracefully on SIGINT/SIGTERM, and stop
//!   every component's background tasks on the way out

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use hyper_util::client::legacy::connect::HttpConnector;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::api;
use crate::balancer::{self, Balancer, Stoppable};
use crate::config::Config;
use crate::middleware as mw;
use crate::proxy::{self, HttpClient};
use crate::ratelimit::{ClientManager, ManagerError, RateLimiter, TokenBucketLimiter};

/// How long in-flight requests may drain after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared handles injected into handlers and middleware.
#[derive(Clone)]
pub struct AppState {
    pub balancer: Arc<dyn Balancer>,
    pub client: HttpClient,
    pub global_limiter: Arc<dyn RateLimiter>,
    pub manager: Option<Arc<ClientManager>>,
}

/// The assembled proxy application.
pub struct App {
    router: Router,
    state: AppState,
}

impl App {
    /// Build every component from the configuration.
    ///
    /// Failing to open the client store is fatal; the caller should exit
    /// non-zero.
    pub fn build(cfg: &Config) -> Result<Self, ManagerError> {
        let rl = &cfg.rate_limiter;
        let global_limiter: Arc<dyn RateLimiter> = Arc::new(TokenBucketLimiter::new(
            rl.capacity,
            rl.refill_rate,
            rl.refill_interval,
        ));

        let manager = ClientManager::open(&cfg.db_path)?;
        let balancer = balancer::build(cfg);
        let client: HttpClient = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        let state = AppState {
            balancer,
            client,
            global_limiter,
            manager: Some(manager),
        };

        let router = Router::new()
            .merge(api::router())
            .fallback(proxy::forward)
            .layer(axum::middleware::from_fn_with_state(
                state.clone(),
                mw::client_rate_limit,
            ))
            .layer(axum::middleware::from_fn_with_state(
                state.clone(),
                mw::global_rate_limit,
            ))
            .layer(axum::middleware::from_fn(mw::access_log))
            .with_state(state.clone());

        Ok(Self { router, state })
    }

    /// The composed router, for serving on an externally-managed listener.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Serve until a shutdown signal arrives, then drain for up to 10 s and
    /// stop all background tasks.
    pub async fn run(self, listener: TcpListener) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let service = self
            .router
            .clone()
            .into_make_service_with_connect_info::<SocketAddr>();
        let serve = axum::serve(listener, service).with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });
        let mut serve_task = tokio::spawn(serve.into_future());

        tokio::select! {
            result = &mut serve_task => {
                self.stop_components();
                return result.unwrap_or_else(|err| Err(std::io::Error::other(err)));
            }
            _ = shutdown_signal() => {
                tracing::info!("shutdown signal received, draining connections");
                let _ = shutdown_tx.send(true);
            }
        }

        let result = match tokio::time::timeout(DRAIN_TIMEOUT, &mut serve_task).await {
            Ok(joined) => joined.unwrap_or_else(|err| Err(std::io::Error::other(err))),
            Err(_) => {
                tracing::warn!(
                    deadline_secs = DRAIN_TIMEOUT.as_secs(),
                    "drain deadline exceeded, forcing close"
                );
                serve_task.abort();
                Ok(())
            }
        };

        self.stop_components();
        tracing::info!("HTTP server stopped");
        result
    }

    fn stop_components(&self) {
        if let Some(stoppable) = self.state.balancer.stoppable() {
            stoppable.stop();
        }
        self.state.global_limiter.stop();
        if let Some(manager) = &self.state.manager {
            manager.stop();
        }
    }
}

/// Resolves on SIGINT or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
