//! Persistent per-client rate limiting.
//!
//! Each registered client owns a token bucket with its own refill cadence.
//! Buckets live in memory for the fast path; a SQLite table is the durable
//! copy, rewritten by a periodic checkpoint so quotas survive restarts. The
//! manager is the single writer to the store.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::ratelimit::RateLimiter;

/// How often in-memory token counts are flushed to the store. Consumption
/// within the window can be lost on crash; refill catches up afterwards.
const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS clients (
    id           TEXT PRIMARY KEY,
    config       TEXT NOT NULL,
    tokens       REAL NOT NULL,
    last_updated DATETIME NOT NULL
);
";

/// A client's bucket parameters, also the wire form for the admin API and
/// the `config` column. `tokens` is only meaningful in snapshots returned
/// by [`ClientManager::get_client`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub capacity: f64,
    /// Tokens per second.
    pub refill_rate: f64,
    #[serde(with = "humantime_serde")]
    pub refill_interval: Duration,
    #[serde(default)]
    pub tokens: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("client not found")]
    NotFound,
    #[error("invalid client config: {0}")]
    InvalidConfig(&'static str),
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("config serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One client's in-memory state. The refill task holds a clone of the Arc
/// and exits when `stop_tx` flips.
struct ClientBucket {
    config: ClientConfig,
    tokens: Mutex<f64>,
    stop_tx: watch::Sender<bool>,
}

impl ClientBucket {
    fn start(config: ClientConfig, tokens: f64) -> Arc<Self> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let bucket = Arc::new(Self {
            config,
            tokens: Mutex::new(tokens),
            stop_tx,
        });
        tokio::spawn(refill_loop(bucket.clone(), stop_rx));
        bucket
    }

    fn stop(&self) {
        self.stop_tx.send_replace(true);
    }
}

/// Durable per-client bucket registry.
pub struct ClientManager {
    db: Mutex<Connection>,
    clients: RwLock<HashMap<String, Arc<ClientBucket>>>,
    stop_tx: watch::Sender<bool>,
}

impl ClientManager {
    /// Open (creating if absent) the store, load every saved client, and
    /// start the refill and checkpoint tasks.
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>, ManagerError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;

        let mut clients = HashMap::new();
        {
            let mut stmt = conn.prepare("SELECT id, config, tokens FROM clients")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                ))
            })?;
            for row in rows {
                let (id, config_json, tokens) = row?;
                let config: ClientConfig = serde_json::from_str(&config_json)?;
                clients.insert(id, ClientBucket::start(config, tokens));
            }
        }
        tracing::info!(clients = clients.len(), "client store loaded");

        let (stop_tx, stop_rx) = watch::channel(false);
        let manager = Arc::new(Self {
            db: Mutex::new(conn),
            clients: RwLock::new(clients),
            stop_tx,
        });
        tokio::spawn(checkpoint_loop(manager.clone(), stop_rx));
        Ok(manager)
    }

    /// Register or replace a client.
    ///
    /// The new bucket starts at full capacity and its refill task replaces
    /// the old one. A storage failure surfaces to the caller but leaves the
    /// in-memory bucket installed; the next checkpoint reconciles the store.
    pub fn add_client(&self, id: &str, config: ClientConfig) -> Result<(), ManagerError> {
        validate(&config)?;

        let bucket = ClientBucket::start(config.clone(), config.capacity);
        {
            let mut clients = self.clients.write().expect("client map lock poisoned");
            if let Some(old) = clients.insert(id.to_string(), bucket) {
                old.stop();
            }
        }

        let config_json = serde_json::to_string(&config)?;
        let db = self.db.lock().expect("db lock poisoned");
        db.execute(
            "INSERT INTO clients (id, config, tokens, last_updated)
             VALUES (?1, ?2, ?3, CURRENT_TIMESTAMP)
             ON CONFLICT(id) DO UPDATE SET
                 config = excluded.config,
                 tokens = excluded.tokens,
                 last_updated = CURRENT_TIMESTAMP",
            params![id, config_json, config.capacity],
        )?;
        Ok(())
    }

    /// Consume one token for `id`. Unknown clients are always denied.
    pub fn allow(&self, id: &str) -> bool {
        let bucket = {
            let clients = self.clients.read().expect("client map lock poisoned");
            clients.get(id).cloned()
        };
        let Some(bucket) = bucket else {
            return false;
        };

        let mut tokens = bucket.tokens.lock().expect("bucket lock poisoned");
        if *tokens >= 1.0 {
            *tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Snapshot of a client's config with its current token count.
    pub fn get_client(&self, id: &str) -> Result<ClientConfig, ManagerError> {
        let bucket = {
            let clients = self.clients.read().expect("client map lock poisoned");
            clients.get(id).cloned()
        }
        .ok_or(ManagerError::NotFound)?;

        let tokens = *bucket.tokens.lock().expect("bucket lock poisoned");
        let mut snapshot = bucket.config.clone();
        snapshot.tokens = tokens;
        Ok(snapshot)
    }

    /// Remove a client from memory and the store.
    pub fn remove_client(&self, id: &str) -> Result<(), ManagerError> {
        let bucket = {
            let clients = self.clients.read().expect("client map lock poisoned");
            clients.get(id).cloned()
        }
        .ok_or(ManagerError::NotFound)?;
        bucket.stop();

        {
            let db = self.db.lock().expect("db lock poisoned");
            db.execute("DELETE FROM clients WHERE id = ?1", params![id])?;
        }

        let mut clients = self.clients.write().expect("client map lock poisoned");
        clients.remove(id);
        Ok(())
    }

    /// Stop every refill task and the checkpoint task. Idempotent; the
    /// store closes when the manager is dropped.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
        let clients = self.clients.read().expect("client map lock poisoned");
        for bucket in clients.values() {
            bucket.stop();
        }
    }

    /// Write every client's current token count to the store. Failures are
    /// logged per row; the config column is left to `add_client`.
    fn checkpoint(&self) {
        let snapshot: Vec<(String, f64)> = {
            let clients = self.clients.read().expect("client map lock poisoned");
            clients
                .iter()
                .map(|(id, bucket)| {
                    let tokens = *bucket.tokens.lock().expect("bucket lock poisoned");
                    (id.clone(), tokens)
                })
                .collect()
        };

        let db = self.db.lock().expect("db lock poisoned");
        for (id, tokens) in snapshot {
            if let Err(err) = db.execute(
                "UPDATE clients SET tokens = ?1, last_updated = CURRENT_TIMESTAMP WHERE id = ?2",
                params![tokens, id],
            ) {
                tracing::warn!(client = %id, error = %err, "checkpoint write failed");
            }
        }
    }
}

impl RateLimiter for ClientManager {
    fn allow(&self, key: &str) -> bool {
        ClientManager::allow(self, key)
    }

    fn stop(&self) {
        ClientManager::stop(self)
    }
}

fn validate(config: &ClientConfig) -> Result<(), ManagerError> {
    if config.capacity <= 0.0 {
        return Err(ManagerError::InvalidConfig("capacity must be positive"));
    }
    if config.refill_rate <= 0.0 {
        return Err(ManagerError::InvalidConfig("refill_rate must be positive"));
    }
    if config.refill_interval.is_zero() {
        return Err(ManagerError::InvalidConfig(
            "refill_interval must be non-zero",
        ));
    }
    Ok(())
}

async fn refill_loop(bucket: Arc<ClientBucket>, mut stop_rx: watch::Receiver<bool>) {
    let add = bucket.config.refill_rate * bucket.config.refill_interval.as_secs_f64();
    let capacity = bucket.config.capacity;

    let mut ticker = tokio::time::interval(bucket.config.refill_interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let mut tokens = bucket.tokens.lock().expect("bucket lock poisoned");
                *tokens = (*tokens + add).min(capacity);
            }
            _ = stop_rx.changed() => return,
        }
    }
}

async fn checkpoint_loop(manager: Arc<ClientManager>, mut stop_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(CHECKPOINT_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => manager.checkpoint(),
            _ = stop_rx.changed() => return,
        }
    }
}
