// Copyright Warden Project contributors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Core-owned persistent state, behind traits so the composition root picks
//! the engine and tests inject fakes.
//!
//! The relational shape (see the deployment schema):
//!
//! - `node_tokens(node_id, token_hash, created_at, expires_at, is_active,
//!   last_used, usage_count)` — raw tokens are never stored, only sha256.
//! - `failed_auth_attempts(node_id, attempted_at, reason)`.
//! - `peak_events(...)` — upsert on `(node_id, dedupe_key, seq)`.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use warden_node_client::NodeDirectory;
use warden_service::types::{
    Backend, Node, NodeId, NodeStatus, PeakEvent, User, UserUpdate,
};

/// A stored node auth token. Only the hash of the token is kept.
#[derive(Debug, Clone)]
pub struct NodeTokenRecord {
    pub id: i64,
    pub node_id: NodeId,
    pub token_hash: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
    pub last_used: Option<DateTime<Utc>>,
    pub usage_count: u64,
}

/// One failed authentication attempt, kept long enough to compute lockouts.
#[derive(Debug, Clone)]
pub struct FailedAuthAttempt {
    pub node_id: NodeId,
    pub attempted_at: DateTime<Utc>,
    pub reason: String,
}

/// Persistence for node auth tokens and failed attempts.
#[async_trait]
pub trait TokenStore: Send + Sync + 'static {
    async fn insert_token(&self, record: NodeTokenRecord) -> anyhow::Result<i64>;
    async fn get_token(
        &self,
        node_id: NodeId,
        token_hash: &str,
    ) -> anyhow::Result<Option<NodeTokenRecord>>;
    async fn deactivate_token(&self, node_id: NodeId, token_hash: &str) -> anyhow::Result<bool>;
    async fn deactivate_all_tokens(&self, node_id: NodeId) -> anyhow::Result<u64>;
    async fn record_token_usage(&self, token_id: i64, at: DateTime<Utc>) -> anyhow::Result<()>;
    async fn record_failed_attempt(&self, attempt: FailedAuthAttempt) -> anyhow::Result<()>;
    async fn failed_attempts_since(
        &self,
        node_id: NodeId,
        cutoff: DateTime<Utc>,
    ) -> anyhow::Result<usize>;
    async fn clear_failed_attempts(&self, node_id: NodeId) -> anyhow::Result<()>;
    async fn purge_expired_tokens(&self, now: DateTime<Utc>) -> anyhow::Result<u64>;
}

/// Persistence for peak events arriving from nodes.
#[async_trait]
pub trait PeakEventStore: Send + Sync + 'static {
    /// Insert-or-replace on `(node_id, dedupe_key, seq)`.
    async fn upsert_event(&self, event: &PeakEvent) -> anyhow::Result<()>;
    async fn events_since(
        &self,
        node_id: NodeId,
        since_ms: i64,
    ) -> anyhow::Result<Vec<PeakEvent>>;
}

/// The panel's record of which users belong on which node. The registry
/// keeps this current as operator mutations fan out; `RepopulateUsers`
/// reads it back as the authoritative list.
pub trait UserIndex: Send + Sync + 'static {
    fn assign(&self, node_id: NodeId, user: &User, tags: &BTreeSet<String>);
    fn unassign(&self, node_id: NodeId, user_id: i64);
    fn nodes_for_user(&self, user_id: i64) -> Vec<NodeId>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    nodes: HashMap<NodeId, Node>,
    backends: HashMap<NodeId, Vec<Backend>>,
    node_users: HashMap<NodeId, HashMap<i64, UserUpdate>>,
    tokens: Vec<NodeTokenRecord>,
    failed_attempts: Vec<FailedAuthAttempt>,
    peak_events: HashMap<(NodeId, String, u64), PeakEvent>,
    usage_snapshots: HashMap<NodeId, HashMap<i64, u64>>,
    next_token_id: i64,
}

/// In-memory implementation of every store trait, used by tests and small
/// single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().expect("store lock poisoned")
    }

    pub fn upsert_node(&self, node: Node) {
        self.lock().nodes.insert(node.id, node);
    }

    pub fn node(&self, node_id: NodeId) -> Option<Node> {
        self.lock().nodes.get(&node_id).cloned()
    }

    pub fn backends(&self, node_id: NodeId) -> Vec<Backend> {
        self.lock().backends.get(&node_id).cloned().unwrap_or_default()
    }

    /// Records the latest usage snapshot reported by a node, with the
    /// node's usage coefficient already applied.
    pub fn record_node_usage(&self, node_id: NodeId, usage: Vec<(i64, u64)>) {
        self.lock()
            .usage_snapshots
            .insert(node_id, usage.into_iter().collect());
    }

    pub fn node_usage(&self, node_id: NodeId) -> HashMap<i64, u64> {
        self.lock()
            .usage_snapshots
            .get(&node_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn peak_events(&self, node_id: NodeId) -> Vec<PeakEvent> {
        let inner = self.lock();
        let mut events: Vec<_> = inner
            .peak_events
            .values()
            .filter(|e| e.node_id == node_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.seq);
        events
    }
}

#[async_trait]
impl NodeDirectory for MemoryStore {
    async fn list_users(&self, node_id: NodeId) -> anyhow::Result<Vec<UserUpdate>> {
        Ok(self
            .lock()
            .node_users
            .get(&node_id)
            .map(|users| users.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn store_backends(&self, node_id: NodeId, backends: Vec<Backend>) -> anyhow::Result<()> {
        self.lock().backends.insert(node_id, backends);
        Ok(())
    }

    async fn set_status(&self, node_id: NodeId, status: NodeStatus, message: Option<String>) {
        let mut inner = self.lock();
        if let Some(node) = inner.nodes.get_mut(&node_id) {
            node.status = status;
            node.message = message;
        } else {
            debug!(node_id, %status, "status update for unknown node row");
        }
    }
}

impl UserIndex for MemoryStore {
    fn assign(&self, node_id: NodeId, user: &User, tags: &BTreeSet<String>) {
        let mut inner = self.lock();
        let users = inner.node_users.entry(node_id).or_default();
        if tags.is_empty() {
            users.remove(&user.id);
        } else {
            users.insert(
                user.id,
                UserUpdate {
                    user: user.clone(),
                    inbounds: tags.clone(),
                },
            );
        }
    }

    fn unassign(&self, node_id: NodeId, user_id: i64) {
        let mut inner = self.lock();
        if let Some(users) = inner.node_users.get_mut(&node_id) {
            users.remove(&user_id);
        }
    }

    fn nodes_for_user(&self, user_id: i64) -> Vec<NodeId> {
        self.lock()
            .node_users
            .iter()
            .filter(|(_, users)| users.contains_key(&user_id))
            .map(|(node_id, _)| *node_id)
            .collect()
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn insert_token(&self, mut record: NodeTokenRecord) -> anyhow::Result<i64> {
        let mut inner = self.lock();
        inner.next_token_id += 1;
        record.id = inner.next_token_id;
        let id = record.id;
        inner.tokens.push(record);
        Ok(id)
    }

    async fn get_token(
        &self,
        node_id: NodeId,
        token_hash: &str,
    ) -> anyhow::Result<Option<NodeTokenRecord>> {
        Ok(self
            .lock()
            .tokens
            .iter()
            .find(|t| t.node_id == node_id && t.token_hash == token_hash)
            .cloned())
    }

    async fn deactivate_token(&self, node_id: NodeId, token_hash: &str) -> anyhow::Result<bool> {
        let mut inner = self.lock();
        let mut found = false;
        for token in inner
            .tokens
            .iter_mut()
            .filter(|t| t.node_id == node_id && t.token_hash == token_hash)
        {
            token.is_active = false;
            found = true;
        }
        Ok(found)
    }

    async fn deactivate_all_tokens(&self, node_id: NodeId) -> anyhow::Result<u64> {
        let mut inner = self.lock();
        let mut count = 0;
        for token in inner.tokens.iter_mut().filter(|t| t.node_id == node_id) {
            if token.is_active {
                token.is_active = false;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn record_token_usage(&self, token_id: i64, at: DateTime<Utc>) -> anyhow::Result<()> {
        let mut inner = self.lock();
        if let Some(token) = inner.tokens.iter_mut().find(|t| t.id == token_id) {
            token.last_used = Some(at);
            token.usage_count += 1;
        }
        Ok(())
    }

    async fn record_failed_attempt(&self, attempt: FailedAuthAttempt) -> anyhow::Result<()> {
        self.lock().failed_attempts.push(attempt);
        Ok(())
    }

    async fn failed_attempts_since(
        &self,
        node_id: NodeId,
        cutoff: DateTime<Utc>,
    ) -> anyhow::Result<usize> {
        Ok(self
            .lock()
            .failed_attempts
            .iter()
            .filter(|a| a.node_id == node_id && a.attempted_at >= cutoff)
            .count())
    }

    async fn clear_failed_attempts(&self, node_id: NodeId) -> anyhow::Result<()> {
        self.lock().failed_attempts.retain(|a| a.node_id != node_id);
        Ok(())
    }

    async fn purge_expired_tokens(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut inner = self.lock();
        let before = inner.tokens.len();
        inner.tokens.retain(|t| t.expires_at > now);
        Ok((before - inner.tokens.len()) as u64)
    }
}

#[async_trait]
impl PeakEventStore for MemoryStore {
    async fn upsert_event(&self, event: &PeakEvent) -> anyhow::Result<()> {
        self.lock().peak_events.insert(
            (event.node_id, event.dedupe_key.clone(), event.seq),
            event.clone(),
        );
        Ok(())
    }

    async fn events_since(
        &self,
        node_id: NodeId,
        since_ms: i64,
    ) -> anyhow::Result<Vec<PeakEvent>> {
        let inner = self.lock();
        let mut events: Vec<_> = inner
            .peak_events
            .values()
            .filter(|e| e.node_id == node_id && e.started_at_ms >= since_ms)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.seq);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use warden_service::types::{PeakCategory, PeakLevel};

    use super::*;

    fn event(node_id: NodeId, seq: u64, resolved: bool) -> PeakEvent {
        PeakEvent {
            node_id,
            category: PeakCategory::Cpu,
            metric: "cpu_usage".into(),
            level: PeakLevel::Critical,
            value: 95.0,
            threshold: 90.0,
            dedupe_key: "abcd1234abcd1234".into(),
            context_json: "{}".into(),
            started_at_ms: 1000,
            resolved_at_ms: resolved.then_some(2000),
            seq,
        }
    }

    #[tokio::test]
    async fn peak_upsert_is_keyed_by_node_dedupe_seq() {
        let store = MemoryStore::new();
        store.upsert_event(&event(1, 5, false)).await.unwrap();
        // Re-delivery of the same event replaces rather than duplicates.
        store.upsert_event(&event(1, 5, false)).await.unwrap();
        store.upsert_event(&event(1, 6, true)).await.unwrap();

        let events = store.events_since(1, 0).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].seq, 5);
        assert_eq!(events[1].seq, 6);
    }

    #[tokio::test]
    async fn user_index_tracks_assignments() {
        let store = MemoryStore::new();
        let user = User {
            id: 9,
            username: "u9".into(),
            key: "k".into(),
        };
        let tags: BTreeSet<String> = ["a".to_string()].into();
        store.assign(1, &user, &tags);
        store.assign(2, &user, &tags);
        let mut nodes = store.nodes_for_user(9);
        nodes.sort();
        assert_eq!(nodes, vec![1, 2]);

        store.assign(1, &user, &BTreeSet::new());
        assert_eq!(store.nodes_for_user(9), vec![2]);

        let listed = store.list_users(2).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].user.id, 9);
    }
}
