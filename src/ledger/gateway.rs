//! Call gateway: retry-with-backoff plus a short-TTL result cache in front
//! of every remote ledger operation.

use crate::ledger::error::LedgerError;
use crate::ledger::rpc::LedgerRpc;
use crate::ledger::types::{AccessRecord, LedgerEvent, MutationReceipt};
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::Health;

/// Retry budget and backoff shape for rate-limited calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per operation.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Full exponential backoff, no jitter: `min(max, base * multiplier^i)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

struct CacheEntry {
    value: Value,
    stored_at: Instant,
}

/// Counters surfaced for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    pub calls: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub retries: u64,
    pub failures: u64,
    pub cache_size: usize,
    pub event_cursor: u64,
}

/// Gateway wrapping every ledger read/write with retry/backoff and a
/// time-boxed result cache.
///
/// Reads are cached under `operation:arg1:arg2...` for the configured TTL.
/// Any successful remote execution conservatively clears the whole cache
/// before storing its own fresh result, since it may have observed (or, for
/// mutations, produced) new global state.
pub struct CallGateway {
    rpc: Arc<dyn LedgerRpc>,
    policy: RetryPolicy,
    cache_ttl: Duration,
    cache: Mutex<HashMap<String, CacheEntry>>,
    events_tx: broadcast::Sender<LedgerEvent>,
    poll_interval: Duration,
    event_cursor: AtomicU64,
    consecutive_failures: AtomicU32,
    calls: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
}

impl CallGateway {
    pub fn new(
        rpc: Arc<dyn LedgerRpc>,
        cache_ttl: Duration,
        policy: RetryPolicy,
        poll_interval: Duration,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            rpc,
            policy,
            cache_ttl,
            cache: Mutex::new(HashMap::new()),
            events_tx,
            poll_interval,
            event_cursor: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            calls: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    // ---- read operations ------------------------------------------------

    pub async fn token_id_for_node(&self, node_id: &str) -> Result<u64, LedgerError> {
        let rpc = Arc::clone(&self.rpc);
        let node = node_id.to_string();
        let value = self
            .call_cached("tokenIdForNode", &[node_id], move || {
                let rpc = Arc::clone(&rpc);
                let node = node.clone();
                async move { rpc.token_id_for_node(&node).await.map(|id| json!(id)) }
            })
            .await?;
        decode(value)
    }

    pub async fn access_record(&self, token_id: u64) -> Result<Option<AccessRecord>, LedgerError> {
        let rpc = Arc::clone(&self.rpc);
        let value = self
            .call_cached("getRecord", &[&token_id.to_string()], move || {
                let rpc = Arc::clone(&rpc);
                async move { rpc.access_record(token_id).await.map(|r| json!(r)) }
            })
            .await?;
        decode(value)
    }

    pub async fn has_access(&self, owner: &str, node_id: &str) -> Result<bool, LedgerError> {
        let rpc = Arc::clone(&self.rpc);
        let owner_arg = owner.to_string();
        let node = node_id.to_string();
        let value = self
            .call_cached("hasAccess", &[owner, node_id], move || {
                let rpc = Arc::clone(&rpc);
                let owner = owner_arg.clone();
                let node = node.clone();
                async move { rpc.has_access(&owner, &node).await.map(|b| json!(b)) }
            })
            .await?;
        decode(value)
    }

    pub async fn owner_of(&self, token_id: u64) -> Result<Option<String>, LedgerError> {
        let rpc = Arc::clone(&self.rpc);
        let value = self
            .call_cached("ownerOf", &[&token_id.to_string()], move || {
                let rpc = Arc::clone(&rpc);
                async move { rpc.owner_of(token_id).await.map(|o| json!(o)) }
            })
            .await?;
        decode(value)
    }

    // ---- mutating operations --------------------------------------------

    /// Mint an access token. Never touches the read cache except to clear it
    /// once the signed operation succeeds.
    pub async fn mint_access(
        &self,
        owner: &str,
        node_id: &str,
        public_key: &str,
        token_uri: &str,
    ) -> Result<MutationReceipt, LedgerError> {
        if !self.rpc.has_signer() {
            return Err(LedgerError::SignerNotConfigured {
                operation: "mint_access".to_string(),
            });
        }
        let rpc = Arc::clone(&self.rpc);
        let (owner, node, key, uri) = (
            owner.to_string(),
            node_id.to_string(),
            public_key.to_string(),
            token_uri.to_string(),
        );
        let receipt = self
            .execute_with_retry("mintAccess", move || {
                let rpc = Arc::clone(&rpc);
                let (owner, node, key, uri) =
                    (owner.clone(), node.clone(), key.clone(), uri.clone());
                async move { rpc.mint_access(&owner, &node, &key, &uri).await }
            })
            .await?;
        self.clear_cache();
        Ok(receipt)
    }

    /// Revoke an access token. Clears the read cache on success.
    pub async fn revoke_access(&self, token_id: u64) -> Result<MutationReceipt, LedgerError> {
        if !self.rpc.has_signer() {
            return Err(LedgerError::SignerNotConfigured {
                operation: "revoke_access".to_string(),
            });
        }
        let rpc = Arc::clone(&self.rpc);
        let receipt = self
            .execute_with_retry("revokeAccess", move || {
                let rpc = Arc::clone(&rpc);
                async move { rpc.revoke_access(token_id).await }
            })
            .await?;
        self.clear_cache();
        Ok(receipt)
    }

    // ---- events ----------------------------------------------------------

    /// Subscribe to ledger mutation events republished by the event pump.
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events_tx.subscribe()
    }

    /// Spawn the background event pump. The handle is owned by the caller;
    /// aborting it stops the pump.
    pub fn start_event_pump(self: &Arc<Self>) -> JoinHandle<()> {
        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(gateway.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                gateway.pump_events_once().await;
            }
        })
    }

    /// One poll cycle. The cursor only advances after a successful poll, so
    /// a failed poll re-reads the same window next time.
    pub async fn pump_events_once(&self) {
        let cursor = self.event_cursor.load(Ordering::Relaxed);
        match self.rpc.poll_events(cursor).await {
            Ok(page) => {
                for event in page.events {
                    debug!("ledger event: {} token {}", event.kind(), event.token_id());
                    // Send fails only when nobody is subscribed yet.
                    let _ = self.events_tx.send(event);
                }
                self.event_cursor.store(page.cursor, Ordering::Relaxed);
                self.consecutive_failures.store(0, Ordering::Relaxed);
            }
            Err(e) => {
                warn!("event poll failed at cursor {}: {}", cursor, e);
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    // ---- cache -----------------------------------------------------------

    /// Drop every cached read result.
    pub fn clear_cache(&self) {
        self.cache.lock().unwrap().clear();
    }

    fn cache_get(&self, key: &str) -> Option<Value> {
        let mut cache = self.cache.lock().unwrap();
        match cache.get(key) {
            Some(entry) if entry.stored_at.elapsed() < self.cache_ttl => {
                Some(entry.value.clone())
            }
            Some(_) => {
                cache.remove(key);
                None
            }
            None => None,
        }
    }

    fn cache_put(&self, key: String, value: Value) {
        self.cache.lock().unwrap().insert(
            key,
            CacheEntry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    // ---- internals -------------------------------------------------------

    async fn call_cached<F, Fut>(
        &self,
        operation: &str,
        args: &[&str],
        f: F,
    ) -> Result<Value, LedgerError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Value, LedgerError>>,
    {
        let key = cache_key(operation, args);

        if let Some(value) = self.cache_get(&key) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        match self.execute_with_retry(operation, f).await {
            Ok(value) => {
                // A successful remote execution may have observed new global
                // state; invalidate everything before storing this result.
                self.clear_cache();
                self.cache_put(key, value.clone());
                Ok(value)
            }
            Err(e) if e.is_network() => {
                // Last-known-good fallback: a racing caller may have filled
                // the cache while we were failing.
                if let Some(value) = self.cache_get(&key) {
                    warn!(
                        "{}: ledger unreachable, serving cached value: {}",
                        operation, e
                    );
                    return Ok(value);
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn execute_with_retry<T, F, Fut>(
        &self,
        operation: &str,
        f: F,
    ) -> Result<T, LedgerError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        let attempts = self.policy.max_retries.max(1);
        let mut last_message = String::new();

        for attempt in 0..attempts {
            self.calls.fetch_add(1, Ordering::Relaxed);
            match f().await {
                Ok(value) => {
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    return Ok(value);
                }
                Err(LedgerError::RateLimited(message)) => {
                    last_message = message;
                    if attempt + 1 < attempts {
                        let delay = self.policy.backoff_delay(attempt);
                        warn!(
                            "rate limit hit for {}, retrying in {:?} (attempt {}/{})",
                            operation,
                            delay,
                            attempt + 1,
                            attempts
                        );
                        self.retries.fetch_add(1, Ordering::Relaxed);
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            }
        }

        self.failures.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        info!("{} exhausted its retry budget", operation);
        Err(LedgerError::RateLimitExceeded {
            attempts,
            message: last_message,
        })
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            calls: self.calls.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            cache_size: self.cache.lock().unwrap().len(),
            event_cursor: self.event_cursor.load(Ordering::Relaxed),
        }
    }

    pub fn health(&self) -> Health {
        match self.consecutive_failures.load(Ordering::Relaxed) {
            0 => Health::Healthy,
            1..=2 => Health::Degraded,
            _ => Health::Unhealthy,
        }
    }
}

fn cache_key(operation: &str, args: &[&str]) -> String {
    let mut key = String::from(operation);
    for arg in args {
        key.push(':');
        key.push_str(arg);
    }
    key
}

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, LedgerError> {
    serde_json::from_value(value).map_err(|e| LedgerError::Decode(e.to_string()))
}
