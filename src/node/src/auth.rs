// Copyright Warden Project contributors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Bearer-token validation for inbound panel RPCs.
//!
//! The panel shares `sha256(token)` with the node at provisioning time; the
//! node compares hashes, never seeing stored raw tokens. Validation results
//! are cached for five minutes keyed by `(token hash, node id)` so the hot
//! path is one LRU lookup. Every data method goes through the interceptor;
//! there is no unauthenticated method on the service.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tonic::service::Interceptor;
use tonic::{Request, Status};
use tracing::{debug, warn};
use warden_service::auth::{bearer_token, is_valid_token_format, missing_token_status};
use warden_service::types::NodeId;

const CACHE_TTL: Duration = Duration::from_secs(300);
const CACHE_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    valid: bool,
    cached_at: Instant,
}

/// Validates panel tokens against the node's configured token hash.
#[derive(Debug)]
pub struct TokenValidator {
    node_id: NodeId,
    /// Hex sha256 of the accepted token. `None` accepts any well-formed
    /// token (standalone deployments without panel-issued tokens).
    expected_hash: Option<String>,
    cache: Mutex<LruCache<String, CacheEntry>>,
}

impl TokenValidator {
    pub fn new(node_id: NodeId, expected_hash: Option<String>) -> Arc<Self> {
        if expected_hash.is_none() {
            warn!("no token hash configured; accepting any well-formed token");
        }
        Arc::new(TokenValidator {
            node_id,
            expected_hash: expected_hash.map(|h| h.to_lowercase()),
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_SIZE).expect("cache size is non-zero"),
            )),
        })
    }

    /// Validates a raw bearer token.
    pub fn validate(&self, token: &str) -> bool {
        if !is_valid_token_format(token) {
            debug!(node_id = self.node_id, "rejecting malformed token");
            return false;
        }

        let token_hash = hex::encode(Sha256::digest(token.as_bytes()));
        let cache_key = format!("{token_hash}:{}", self.node_id);

        {
            let mut cache = self.cache.lock().expect("token cache lock poisoned");
            if let Some(entry) = cache.get(&cache_key) {
                if entry.cached_at.elapsed() < CACHE_TTL {
                    return entry.valid;
                }
                cache.pop(&cache_key);
            }
        }

        let valid = match &self.expected_hash {
            Some(expected) => constant_time_eq(expected.as_bytes(), token_hash.as_bytes()),
            None => true,
        };

        self.cache
            .lock()
            .expect("token cache lock poisoned")
            .put(
                cache_key,
                CacheEntry {
                    valid,
                    cached_at: Instant::now(),
                },
            );

        if valid {
            debug!(node_id = self.node_id, "token validated");
        } else {
            warn!(node_id = self.node_id, "token validation failed");
        }
        valid
    }

    /// Drops all cached validation results.
    pub fn clear_cache(&self) {
        self.cache
            .lock()
            .expect("token cache lock poisoned")
            .clear();
    }
}

/// The tonic interceptor guarding every service method. Requests without a
/// usable bearer token are rejected with `UNAUTHENTICATED` before any
/// handler runs.
#[derive(Clone)]
pub struct AuthInterceptor {
    validator: Arc<TokenValidator>,
}

impl AuthInterceptor {
    pub fn new(validator: Arc<TokenValidator>) -> Self {
        AuthInterceptor { validator }
    }
}

impl Interceptor for AuthInterceptor {
    fn call(&mut self, request: Request<()>) -> Result<Request<()>, Status> {
        let Some(token) = bearer_token(request.metadata()) else {
            return Err(missing_token_status());
        };
        if !self.validator.validate(token) {
            return Err(Status::unauthenticated(
                "authentication failed: invalid token",
            ));
        }
        Ok(request)
    }
}

// Comparison over fixed-length hex digests; both sides are the same length
// by construction.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "wX3rT9yUv-bQ7sK1mN5pL2aZ8cD4eF6g";

    fn hash_of(token: &str) -> String {
        hex::encode(Sha256::digest(token.as_bytes()))
    }

    #[tokio::test(start_paused = true)]
    async fn accepts_matching_token_and_caches() {
        let validator = TokenValidator::new(1, Some(hash_of(TOKEN)));
        assert!(validator.validate(TOKEN));
        // Cached path.
        assert!(validator.validate(TOKEN));
        assert!(!validator.validate("wrongwrongwrongwrongwrong-123456"));
    }

    #[tokio::test(start_paused = true)]
    async fn cache_entries_expire() {
        let validator = TokenValidator::new(1, Some(hash_of(TOKEN)));
        assert!(validator.validate(TOKEN));
        tokio::time::advance(Duration::from_secs(301)).await;
        // Expired entries are re-validated rather than trusted.
        assert!(validator.validate(TOKEN));
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_malformed_tokens_without_lookup() {
        let validator = TokenValidator::new(1, Some(hash_of(TOKEN)));
        assert!(!validator.validate(""));
        assert!(!validator.validate("short"));
        assert!(!validator.validate("has spaces in it which is wrong"));
    }

    #[tokio::test(start_paused = true)]
    async fn interceptor_rejects_missing_token() {
        let validator = TokenValidator::new(1, Some(hash_of(TOKEN)));
        let mut interceptor = AuthInterceptor::new(validator);
        let err = interceptor.call(Request::new(())).unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unauthenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn interceptor_accepts_bearer_token() {
        let validator = TokenValidator::new(1, Some(hash_of(TOKEN)));
        let mut interceptor = AuthInterceptor::new(validator);
        let mut request = Request::new(());
        request.metadata_mut().insert(
            "authorization",
            format!("Bearer {TOKEN}").parse().unwrap(),
        );
        assert!(interceptor.call(request).is_ok());
    }
}
