// Copyright Warden Project contributors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Node auth token issuance, validation, revocation, and lockout.
//!
//! Tokens are 32 random bytes, URL-safe base64 encoded; only their sha256
//! lands in the store. Validation is cache-first with a bounded TTL'd LRU,
//! but lockout is re-checked even on cache hits so a locked node cannot ride
//! a warm cache. Usage bookkeeping is batched: hits queue an update that a
//! background task flushes every 30 seconds, deduplicated per token.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use lru::LruCache;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use warden_service::auth::is_valid_token_format;
use warden_service::types::NodeId;

use crate::store::{FailedAuthAttempt, NodeTokenRecord, TokenStore};

/// Token manager tuning.
#[derive(Debug, Clone, Copy)]
pub struct TokenManagerConfig {
    pub token_ttl: Duration,
    pub max_failed_attempts: usize,
    pub lockout_window: Duration,
    pub cache_ttl: Duration,
    pub cache_size: usize,
    pub batch_interval: Duration,
}

impl Default for TokenManagerConfig {
    fn default() -> Self {
        TokenManagerConfig {
            token_ttl: Duration::from_secs(7 * 24 * 3600),
            max_failed_attempts: 5,
            lockout_window: Duration::from_secs(30 * 60),
            cache_ttl: Duration::from_secs(600),
            cache_size: 10_000,
            batch_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    token_id: i64,
    expires_at: DateTime<Utc>,
    is_active: bool,
    cached_at: Instant,
}

/// Issues and validates node-scoped auth tokens.
pub struct NodeTokenManager {
    store: Arc<dyn TokenStore>,
    config: TokenManagerConfig,
    cache: Mutex<LruCache<(NodeId, String), CachedToken>>,
    /// token id → (node id, queued at); deduplicates usage updates within
    /// one batch interval.
    pending_usage: Mutex<HashMap<i64, (NodeId, Instant)>>,
    shutdown_tx: watch::Sender<bool>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl NodeTokenManager {
    pub fn new(store: Arc<dyn TokenStore>, config: TokenManagerConfig) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(NodeTokenManager {
            store,
            config,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(config.cache_size.max(1)).expect("cache size is non-zero"),
            )),
            pending_usage: Mutex::new(HashMap::new()),
            shutdown_tx,
            flush_task: Mutex::new(None),
        })
    }

    /// Starts the background usage-update flusher.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.flush_task.lock().expect("flush task lock poisoned");
        if task.is_some() {
            return;
        }
        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.batch_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => manager.flush_usage_updates().await,
                    _ = shutdown.changed() => return,
                }
            }
        }));
    }

    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.flush_task.lock().expect("flush task lock poisoned").take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        self.flush_usage_updates().await;
    }

    /// Generates and stores a fresh token for `node_id`, returning the raw
    /// token. The raw value exists only in this return path.
    pub async fn generate(&self, node_id: NodeId) -> anyhow::Result<String> {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = base64::encode_config(bytes, base64::URL_SAFE_NO_PAD);
        let token_hash = hex::encode(Sha256::digest(token.as_bytes()));

        let now = Utc::now();
        let ttl = TimeDelta::from_std(self.config.token_ttl).unwrap_or(TimeDelta::days(7));
        self.store
            .insert_token(NodeTokenRecord {
                id: 0,
                node_id,
                token_hash,
                created_at: now,
                expires_at: now + ttl,
                is_active: true,
                last_used: None,
                usage_count: 0,
            })
            .await?;
        info!(node_id, "generated node auth token");
        Ok(token)
    }

    /// Validates a raw token for `node_id`.
    pub async fn validate(&self, token: &str, node_id: NodeId) -> bool {
        if !is_valid_token_format(token) {
            self.note_failure(node_id, "Malformed token").await;
            return false;
        }
        let token_hash = hex::encode(Sha256::digest(token.as_bytes()));
        let cache_key = (node_id, token_hash.clone());

        let cached = {
            let mut cache = self.cache.lock().expect("token cache lock poisoned");
            match cache.get(&cache_key) {
                Some(entry) if entry.cached_at.elapsed() < self.config.cache_ttl => {
                    Some(entry.clone())
                }
                Some(_) => {
                    cache.pop(&cache_key);
                    None
                }
                None => None,
            }
        };

        if let Some(entry) = cached {
            if entry.is_active && entry.expires_at > Utc::now() {
                // Lockout binds even for cached tokens.
                if self.is_locked_out(node_id).await {
                    warn!(node_id, "cached token rejected: node is locked out");
                    return false;
                }
                self.schedule_usage_update(entry.token_id, node_id);
                return true;
            }
            self.cache
                .lock()
                .expect("token cache lock poisoned")
                .pop(&cache_key);
        }

        if self.is_locked_out(node_id).await {
            warn!(node_id, "authentication rejected: node is locked out");
            return false;
        }

        let record = match self.store.get_token(node_id, &token_hash).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                self.note_failure(node_id, "Invalid token").await;
                return false;
            }
            Err(err) => {
                warn!(node_id, %err, "token lookup failed");
                self.note_failure(node_id, "Validation error").await;
                return false;
            }
        };

        let now = Utc::now();
        if record.expires_at <= now {
            self.note_failure(node_id, "Expired token").await;
            let _ = self.store.deactivate_token(node_id, &token_hash).await;
            return false;
        }
        if !record.is_active {
            self.note_failure(node_id, "Inactive token").await;
            return false;
        }

        self.cache.lock().expect("token cache lock poisoned").put(
            cache_key,
            CachedToken {
                token_id: record.id,
                expires_at: record.expires_at,
                is_active: record.is_active,
                cached_at: Instant::now(),
            },
        );
        // A database hit updates usage synchronously and clears the failure
        // history; later cache hits go through the batcher.
        if let Err(err) = self.store.record_token_usage(record.id, now).await {
            debug!(node_id, %err, "token usage update failed");
        }
        let _ = self.store.clear_failed_attempts(node_id).await;
        true
    }

    /// Revokes a specific token. Cached validations are invalidated.
    pub async fn revoke(&self, node_id: NodeId, token: &str) -> bool {
        let token_hash = hex::encode(Sha256::digest(token.as_bytes()));
        match self.store.deactivate_token(node_id, &token_hash).await {
            Ok(found) => {
                self.cache
                    .lock()
                    .expect("token cache lock poisoned")
                    .pop(&(node_id, token_hash));
                if found {
                    info!(node_id, "revoked node token");
                }
                found
            }
            Err(err) => {
                warn!(node_id, %err, "token revocation failed");
                false
            }
        }
    }

    /// Revokes every token for a node and drops its cache entries.
    pub async fn revoke_all(&self, node_id: NodeId) -> u64 {
        let revoked = match self.store.deactivate_all_tokens(node_id).await {
            Ok(count) => count,
            Err(err) => {
                warn!(node_id, %err, "bulk token revocation failed");
                0
            }
        };
        let mut cache = self.cache.lock().expect("token cache lock poisoned");
        let keys: Vec<_> = cache
            .iter()
            .filter(|((id, _), _)| *id == node_id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            cache.pop(&key);
        }
        info!(node_id, revoked, "revoked all node tokens");
        revoked
    }

    /// Purges expired tokens from the store.
    pub async fn cleanup_expired(&self) -> u64 {
        match self.store.purge_expired_tokens(Utc::now()).await {
            Ok(count) => {
                if count > 0 {
                    info!(count, "purged expired node tokens");
                }
                count
            }
            Err(err) => {
                warn!(%err, "expired token cleanup failed");
                0
            }
        }
    }

    async fn is_locked_out(&self, node_id: NodeId) -> bool {
        let window = TimeDelta::from_std(self.config.lockout_window)
            .unwrap_or_else(|_| TimeDelta::minutes(30));
        let cutoff = Utc::now() - window;
        match self.store.failed_attempts_since(node_id, cutoff).await {
            Ok(count) => count >= self.config.max_failed_attempts,
            Err(err) => {
                warn!(node_id, %err, "failed-attempt lookup failed");
                false
            }
        }
    }

    async fn note_failure(&self, node_id: NodeId, reason: &str) {
        let attempt = FailedAuthAttempt {
            node_id,
            attempted_at: Utc::now(),
            reason: reason.to_owned(),
        };
        if let Err(err) = self.store.record_failed_attempt(attempt).await {
            warn!(node_id, %err, "failed to record auth failure");
            return;
        }
        if self.is_locked_out(node_id).await {
            warn!(
                node_id,
                max_attempts = self.config.max_failed_attempts,
                "node locked out after repeated authentication failures"
            );
        }
    }

    fn schedule_usage_update(&self, token_id: i64, node_id: NodeId) {
        let mut pending = self.pending_usage.lock().expect("pending usage lock poisoned");
        match pending.get(&token_id) {
            Some((_, queued_at))
                if queued_at.elapsed() < self.config.batch_interval => {}
            _ => {
                pending.insert(token_id, (node_id, Instant::now()));
            }
        }
    }

    async fn flush_usage_updates(&self) {
        let batch: Vec<(i64, NodeId)> = {
            let mut pending = self.pending_usage.lock().expect("pending usage lock poisoned");
            pending.drain().map(|(id, (node, _))| (id, node)).collect()
        };
        if batch.is_empty() {
            return;
        }
        let now = Utc::now();
        let mut cleared = std::collections::BTreeSet::new();
        for (token_id, node_id) in batch {
            if let Err(err) = self.store.record_token_usage(token_id, now).await {
                debug!(token_id, %err, "batched usage update failed");
                continue;
            }
            if cleared.insert(node_id) {
                let _ = self.store.clear_failed_attempts(node_id).await;
            }
        }
        debug!(nodes = cleared.len(), "flushed batched token usage updates");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn manager() -> (Arc<NodeTokenManager>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let manager = NodeTokenManager::new(
            Arc::clone(&store) as Arc<dyn TokenStore>,
            TokenManagerConfig::default(),
        );
        (manager, store)
    }

    #[tokio::test]
    async fn generated_tokens_validate_and_only_hashes_are_stored() {
        let (manager, store) = manager();
        let token = manager.generate(1).await.unwrap();
        assert!(is_valid_token_format(&token));
        assert!(manager.validate(&token, 1).await);

        // Only the hash is persisted.
        let hash = hex::encode(Sha256::digest(token.as_bytes()));
        let record = store.get_token(1, &hash).await.unwrap().unwrap();
        assert_eq!(record.token_hash, hash);
        assert_ne!(record.token_hash, token);

        // A token for node 1 does not authenticate node 2.
        assert!(!manager.validate(&token, 2).await);
    }

    #[tokio::test]
    async fn revocation_invalidates_cache() {
        let (manager, _store) = manager();
        let token = manager.generate(1).await.unwrap();

        // Warm the cache, then revoke: the cached entry must not survive.
        assert!(manager.validate(&token, 1).await);
        assert!(manager.revoke(1, &token).await);
        assert!(!manager.validate(&token, 1).await);
    }

    #[tokio::test]
    async fn revoke_all_covers_every_token() {
        let (manager, _store) = manager();
        let t1 = manager.generate(1).await.unwrap();
        let t2 = manager.generate(1).await.unwrap();
        assert!(manager.validate(&t1, 1).await);
        assert!(manager.validate(&t2, 1).await);

        assert_eq!(manager.revoke_all(1).await, 2);
        assert!(!manager.validate(&t1, 1).await);
        assert!(!manager.validate(&t2, 1).await);
    }

    #[tokio::test]
    async fn lockout_after_repeated_failures() {
        let (manager, _store) = manager();
        let token = manager.generate(1).await.unwrap();

        for _ in 0..5 {
            assert!(!manager.validate("A-wrong-token-of-decent-length", 1).await);
        }
        // Even the valid (and previously cached) token is now rejected.
        assert!(!manager.validate(&token, 1).await);
    }

    #[tokio::test]
    async fn successful_validation_clears_failures() {
        let (manager, store) = manager();
        let token = manager.generate(1).await.unwrap();

        for _ in 0..3 {
            assert!(!manager.validate("A-wrong-token-of-decent-length", 1).await);
        }
        assert!(manager.validate(&token, 1).await);
        let cutoff = Utc::now() - TimeDelta::minutes(30);
        assert_eq!(store.failed_attempts_since(1, cutoff).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn deactivated_tokens_are_rejected() {
        let (manager, store) = manager();
        let token = manager.generate(1).await.unwrap();
        let hash = hex::encode(Sha256::digest(token.as_bytes()));

        store.deactivate_token(1, &hash).await.unwrap();
        assert!(!manager.validate(&token, 1).await);
    }

    #[tokio::test]
    async fn cleanup_purges_expired_tokens() {
        let (manager, store) = manager();
        store
            .insert_token(NodeTokenRecord {
                id: 0,
                node_id: 3,
                token_hash: "deadbeef".into(),
                created_at: Utc::now() - TimeDelta::days(10),
                expires_at: Utc::now() - TimeDelta::days(3),
                is_active: true,
                last_used: None,
                usage_count: 0,
            })
            .await
            .unwrap();
        assert_eq!(manager.cleanup_expired().await, 1);
        assert!(store.get_token(3, "deadbeef").await.unwrap().is_none());
    }
}
