//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Request arrives → balancer.next() picks a Backend (or none)
//!     → dispatcher increases the connection count (ConnAware strategies)
//!     → request forwarded upstream
//!     → ConnGuard drop decreases the count on every exit path
//! ```
//!
//! # Design Decisions
//! - Strategies share one minimal `Balancer` contract; connection accounting
//!   and background-task shutdown are opt-in capabilities
//! - Capability discovery via accessor methods, not downcasting
//! - Backend lists are fixed at construction; no runtime membership changes

use std::fmt;
use std::sync::Arc;

use crate::config::{Algorithm, Config};

pub mod adaptive;
pub mod least_conn;
pub mod p2c;
pub mod round_robin;

use adaptive::Adaptive;
use least_conn::LeastConn;
use p2c::PowerOfTwo;
use round_robin::RoundRobin;

/// An upstream address: an absolute URL including scheme and authority.
///
/// Cheap to clone; equality and hashing are by URL text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Backend(Arc<str>);

impl Backend {
    pub fn new(url: impl AsRef<str>) -> Self {
        Self(Arc::from(url.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Minimal strategy contract: hand out the next upstream.
pub trait Balancer: Send + Sync {
    /// The next backend to dispatch to, or `None` when no backend is
    /// currently admissible.
    fn next(&self) -> Option<Backend>;

    /// Connection-accounting capability, if this strategy tracks load.
    fn conn_aware(&self) -> Option<&dyn ConnAware> {
        None
    }

    /// Shutdown capability, if this strategy owns background tasks.
    fn stoppable(&self) -> Option<&dyn Stoppable> {
        None
    }
}

/// Capability for strategies that track per-backend active connections.
pub trait ConnAware: Send + Sync {
    fn increase(&self, backend: &Backend);
    fn decrease(&self, backend: &Backend);
}

/// Capability for strategies that own background tasks.
pub trait Stoppable: Send + Sync {
    /// Signal background tasks to terminate. Idempotent.
    fn stop(&self);
}

/// RAII pairing of `increase` with exactly one `decrease`.
///
/// The decrease runs in `Drop`, so it fires on normal return, early return,
/// panic unwind, and future cancellation alike.
pub struct ConnGuard<'a> {
    conn: &'a dyn ConnAware,
    backend: Backend,
}

impl<'a> ConnGuard<'a> {
    pub fn new(conn: &'a dyn ConnAware, backend: Backend) -> Self {
        conn.increase(&backend);
        Self { conn, backend }
    }
}

impl Drop for ConnGuard<'_> {
    fn drop(&mut self) {
        self.conn.decrease(&self.backend);
    }
}

/// Construct the strategy selected by the configuration.
///
/// The adaptive supervisor gets one instance of each child strategy over the
/// same server list. Thresholds are assumed normalized by the config layer.
pub fn build(cfg: &Config) -> Arc<dyn Balancer> {
    let servers: Vec<Backend> = cfg.servers.iter().map(Backend::new).collect();

    match cfg.algorithm {
        Algorithm::Rr => Arc::new(RoundRobin::new(servers)),
        Algorithm::Lc => Arc::new(LeastConn::new(servers)),
        Algorithm::P2c => Arc::new(PowerOfTwo::new(servers, cfg.health_check_interval)),
        Algorithm::Adaptive => {
            let rr = RoundRobin::new(servers.clone());
            let lc = LeastConn::new(servers.clone());
            let p2c = PowerOfTwo::new(servers, cfg.health_check_interval);
            Arc::new(Adaptive::new(
                rr,
                lc,
                p2c,
                cfg.adaptive.low_threshold,
                cfg.adaptive.high_threshold,
            ))
        }
    }
}
