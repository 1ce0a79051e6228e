//! Power-of-two-choices load balancing with active health checking.
//!
//! # Data Flow
//! ```text
//! next():
//!     snapshot admissible servers (shared lock, released before the pick)
//!     → two distinct uniform picks → smaller connection count wins
//!
//! health task (one per selector):
//!     every hc_interval → one HEAD {backend}/health probe per backend,
//!     in parallel, 1 s timeout → admissible iff status < 500
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;

use crate::balancer::{Backend, Balancer, ConnAware, Stoppable};

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

type HealthMap = Arc<RwLock<HashMap<Backend, bool>>>;

/// Power-of-two-choices selector.
///
/// Picks two distinct admissible backends uniformly at random and returns
/// the one with fewer active connections, ties going to the first pick.
/// A background task keeps the admissible set current.
pub struct PowerOfTwo {
    servers: Vec<Backend>,
    counts: HashMap<Backend, AtomicI64>,
    health: HealthMap,
    rng: Mutex<SmallRng>,
    stop_tx: watch::Sender<bool>,
}

impl PowerOfTwo {
    /// Build the selector and start its health checker.
    ///
    /// Every backend starts admissible; the first probe round corrects that
    /// if reality disagrees.
    pub fn new(servers: Vec<Backend>, hc_interval: Duration) -> Self {
        let counts = servers
            .iter()
            .map(|s| (s.clone(), AtomicI64::new(0)))
            .collect();
        let health: HealthMap = Arc::new(RwLock::new(
            servers.iter().map(|s| (s.clone(), true)).collect(),
        ));

        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(health_check_loop(
            servers.clone(),
            health.clone(),
            hc_interval,
            stop_rx,
        ));

        Self {
            servers,
            counts,
            health,
            rng: Mutex::new(SmallRng::from_entropy()),
            stop_tx,
        }
    }

    fn admissible(&self) -> Vec<Backend> {
        let health = self.health.read().expect("health map lock poisoned");
        self.servers
            .iter()
            .filter(|s| health.get(*s).copied().unwrap_or(false))
            .cloned()
            .collect()
    }

    fn load(&self, backend: &Backend) -> i64 {
        self.counts
            .get(backend)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn set_health(&self, backend: &Backend, up: bool) {
        self.health
            .write()
            .expect("health map lock poisoned")
            .insert(backend.clone(), up);
    }
}

impl Balancer for PowerOfTwo {
    fn next(&self) -> Option<Backend> {
        let admissible = self.admissible();
        match admissible.len() {
            0 => None,
            1 => admissible.into_iter().next(),
            n => {
                let (i, j) = {
                    let mut rng = self.rng.lock().expect("rng lock poisoned");
                    let i = rng.gen_range(0..n);
                    // Sample the second index from the remaining n-1 slots.
                    let mut j = rng.gen_range(0..n - 1);
                    if j >= i {
                        j += 1;
                    }
                    (i, j)
                };
                let (first, second) = (&admissible[i], &admissible[j]);
                if self.load(first) <= self.load(second) {
                    Some(first.clone())
                } else {
                    Some(second.clone())
                }
            }
        }
    }

    fn conn_aware(&self) -> Option<&dyn ConnAware> {
        Some(self)
    }

    fn stoppable(&self) -> Option<&dyn Stoppable> {
        Some(self)
    }
}

impl ConnAware for PowerOfTwo {
    fn increase(&self, backend: &Backend) {
        if let Some(count) = self.counts.get(backend) {
            count.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn decrease(&self, backend: &Backend) {
        if let Some(count) = self.counts.get(backend) {
            count.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl Stoppable for PowerOfTwo {
    fn stop(&self) {
        // watch keeps the latest value, so repeated stops are harmless and
        // the checker observes the signal at its next wait point.
        self.stop_tx.send_replace(true);
    }
}

/// Periodic probe driver. Runs until the stop signal flips.
async fn health_check_loop(
    servers: Vec<Backend>,
    health: HealthMap,
    hc_interval: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    let client = match reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() {
        Ok(client) => client,
        Err(err) => {
            tracing::error!(error = %err, "failed to build health probe client");
            return;
        }
    };

    let mut ticker = tokio::time::interval(hc_interval);
    // tokio intervals fire immediately; consume the first tick so probes run
    // on interval boundaries.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for server in &servers {
                    tokio::spawn(probe_one(
                        client.clone(),
                        server.clone(),
                        health.clone(),
                    ));
                }
            }
            _ = stop_rx.changed() => {
                tracing::debug!("health checker stopping");
                return;
            }
        }
    }
}

/// Probe a single backend and record the verdict.
async fn probe_one(client: reqwest::Client, backend: Backend, health: HealthMap) {
    let url = format!("{}/health", backend);
    let up = match client.head(&url).send().await {
        Ok(response) => response.status().as_u16() < 500,
        Err(err) => {
            tracing::debug!(backend = %backend, error = %err, "health probe failed");
            false
        }
    };

    let mut map = health.write().expect("health map lock poisoned");
    map.insert(backend, up);
}
