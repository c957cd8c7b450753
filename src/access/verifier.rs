use crate::access::cache::FifoCache;
use crate::ledger::{CallGateway, LedgerError};
use crate::validate;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Why a verification request resolved the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictReason {
    AccessGranted,
    AccessDenied,
    NodeNotFound,
    NodeInactive,
    PublicKeyMismatch,
    VerificationError,
}

/// The answer to a single verification request. Serialized as-is to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessVerdict {
    pub granted: bool,
    pub reason: VerdictReason,
    pub message: String,
    pub node_id: String,
    /// Identity key with the middle elided; full keys never leave this module.
    pub identity_key_masked: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_address: Option<String>,
    pub cached: bool,
    pub timestamp: DateTime<Utc>,
    pub response_time_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifierStats {
    pub verifications: u64,
    pub granted: u64,
    pub denied: u64,
    pub errors: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Hits over hits plus misses; 0.0 before any lookup.
    pub hit_rate: f64,
    pub cache_size: usize,
    pub cache_capacity: usize,
}

/// Ledger-backed access verifier with a bounded verdict cache.
pub struct AccessVerifier {
    gateway: Arc<CallGateway>,
    cache: Mutex<FifoCache<AccessVerdict>>,
    verifications: AtomicU64,
    granted: AtomicU64,
    denied: AtomicU64,
    errors: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl AccessVerifier {
    pub fn new(gateway: Arc<CallGateway>, max_cache_size: usize, cache_ttl: Duration) -> Self {
        Self {
            gateway,
            cache: Mutex::new(FifoCache::new(max_cache_size, cache_ttl)),
            verifications: AtomicU64::new(0),
            granted: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }

    /// Verify that `identity_key` may connect to `node_id`.
    ///
    /// Malformed inputs and ledger failures both produce an uncached,
    /// fail-closed `VerificationError` verdict rather than an `Err`; the
    /// caller always gets a verdict it can act on.
    pub async fn verify(&self, identity_key: &str, node_id: &str) -> AccessVerdict {
        let started = Instant::now();
        self.verifications.fetch_add(1, Ordering::Relaxed);
        let masked = validate::mask_key(identity_key);

        if let Err(e) = validate::node_id(node_id) {
            self.errors.fetch_add(1, Ordering::Relaxed);
            return self.error_verdict(node_id, &masked, e.to_string(), started);
        }
        if let Err(e) = validate::public_key(identity_key) {
            self.errors.fetch_add(1, Ordering::Relaxed);
            return self.error_verdict(node_id, &masked, e.to_string(), started);
        }

        let cache_key = format!("{identity_key}:{node_id}");
        if let Some(mut verdict) = self.cache.lock().unwrap().get(&cache_key) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            if verdict.granted {
                self.granted.fetch_add(1, Ordering::Relaxed);
            } else {
                self.denied.fetch_add(1, Ordering::Relaxed);
            }
            verdict.cached = true;
            verdict.response_time_ms = started.elapsed().as_millis() as u64;
            return verdict;
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        match self.resolve(identity_key, node_id, &masked, started).await {
            Ok(verdict) => {
                if verdict.granted {
                    self.granted.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.denied.fetch_add(1, Ordering::Relaxed);
                }
                self.cache
                    .lock()
                    .unwrap()
                    .insert(cache_key, verdict.clone());
                verdict
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!("verification failed for node {}: {}", node_id, e);
                self.error_verdict(node_id, &masked, e.to_string(), started)
            }
        }
    }

    /// Verify several requests sequentially, preserving input order.
    pub async fn verify_batch(&self, requests: &[(String, String)]) -> Vec<AccessVerdict> {
        let mut verdicts = Vec::with_capacity(requests.len());
        for (identity_key, node_id) in requests {
            verdicts.push(self.verify(identity_key, node_id).await);
        }
        verdicts
    }

    async fn resolve(
        &self,
        identity_key: &str,
        node_id: &str,
        masked: &str,
        started: Instant,
    ) -> Result<AccessVerdict, LedgerError> {
        let token_id = self.gateway.token_id_for_node(node_id).await?;
        if token_id == 0 {
            return Ok(self.verdict(
                VerdictReason::NodeNotFound,
                format!("no token registered for node {node_id}"),
                node_id,
                masked,
                None,
                None,
                started,
            ));
        }

        let record = match self.gateway.access_record(token_id).await? {
            Some(record) => record,
            None => {
                return Ok(self.verdict(
                    VerdictReason::NodeNotFound,
                    format!("token {token_id} has no access record"),
                    node_id,
                    masked,
                    Some(token_id),
                    None,
                    started,
                ));
            }
        };

        if !record.is_active {
            return Ok(self.verdict(
                VerdictReason::NodeInactive,
                format!("node {node_id} is deactivated"),
                node_id,
                masked,
                Some(token_id),
                None,
                started,
            ));
        }

        if record.public_key != identity_key {
            return Ok(self.verdict(
                VerdictReason::PublicKeyMismatch,
                "presented key does not match the registered key".to_string(),
                node_id,
                masked,
                Some(token_id),
                None,
                started,
            ));
        }

        let owner = match self.gateway.owner_of(token_id).await? {
            Some(owner) => owner,
            None => {
                return Ok(self.verdict(
                    VerdictReason::AccessDenied,
                    format!("token {token_id} has no owner"),
                    node_id,
                    masked,
                    Some(token_id),
                    None,
                    started,
                ));
            }
        };

        if !self.gateway.has_access(&owner, node_id).await? {
            return Ok(self.verdict(
                VerdictReason::AccessDenied,
                format!("owner holds no access grant for node {node_id}"),
                node_id,
                masked,
                Some(token_id),
                Some(owner),
                started,
            ));
        }

        debug!("access granted: node {} token {}", node_id, token_id);
        Ok(self.verdict(
            VerdictReason::AccessGranted,
            "access granted".to_string(),
            node_id,
            masked,
            Some(token_id),
            Some(owner),
            started,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn verdict(
        &self,
        reason: VerdictReason,
        message: String,
        node_id: &str,
        masked: &str,
        token_id: Option<u64>,
        owner_address: Option<String>,
        started: Instant,
    ) -> AccessVerdict {
        AccessVerdict {
            granted: reason == VerdictReason::AccessGranted,
            reason,
            message,
            node_id: node_id.to_string(),
            identity_key_masked: masked.to_string(),
            token_id,
            owner_address,
            cached: false,
            timestamp: Utc::now(),
            response_time_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn error_verdict(
        &self,
        node_id: &str,
        masked: &str,
        message: String,
        started: Instant,
    ) -> AccessVerdict {
        self.verdict(
            VerdictReason::VerificationError,
            message,
            node_id,
            masked,
            None,
            None,
            started,
        )
    }

    pub fn clear_cache(&self) {
        self.cache.lock().unwrap().clear();
    }

    pub fn stats(&self) -> VerifierStats {
        let cache = self.cache.lock().unwrap();
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        VerifierStats {
            verifications: self.verifications.load(Ordering::Relaxed),
            granted: self.granted.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            cache_hits: hits,
            cache_misses: misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            cache_size: cache.len(),
            cache_capacity: cache.max_size(),
        }
    }

    pub fn reset_stats(&self) {
        self.verifications.store(0, Ordering::Relaxed);
        self.granted.store(0, Ordering::Relaxed);
        self.denied.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
    }
}
