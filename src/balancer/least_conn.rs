//! Least-connections load balancing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::balancer::{Backend, Balancer, ConnAware};

/// Selects the backend with the fewest active connections.
///
/// Counter reads during the scan are independent atomic loads; a concurrent
/// mutation can at worst produce a suboptimal but valid pick.
pub struct LeastConn {
    servers: Vec<Backend>,
    counts: HashMap<Backend, AtomicI64>,
}

impl LeastConn {
    pub fn new(servers: Vec<Backend>) -> Self {
        let counts = servers
            .iter()
            .map(|s| (s.clone(), AtomicI64::new(0)))
            .collect();
        Self { servers, counts }
    }
}

impl Balancer for LeastConn {
    fn next(&self) -> Option<Backend> {
        let mut best: Option<(&Backend, i64)> = None;
        for server in &self.servers {
            let count = self.counts[server].load(Ordering::Relaxed);
            match best {
                // Strict comparison keeps the first minimum: ties resolve to
                // original list order.
                Some((_, min)) if count >= min => {}
                _ => best = Some((server, count)),
            }
        }
        best.map(|(server, _)| server.clone())
    }

    fn conn_aware(&self) -> Option<&dyn ConnAware> {
        Some(self)
    }
}

impl ConnAware for LeastConn {
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
