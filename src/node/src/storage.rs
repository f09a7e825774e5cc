// Copyright Warden Project contributors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Node-local storage of users and inbounds.
//!
//! The node keeps its own view of which users exist and which inbound tags
//! each is entitled to. The panel drives this table through `SyncUsers`
//! deltas and `RepopulateUsers` reconciliations; the node never invents
//! state of its own.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use warden_service::types::{Inbound, User};

/// A user as stored on the node: identity plus its current inbound tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUser {
    pub user: User,
    pub inbounds: BTreeSet<String>,
}

/// Storage surface the gRPC service operates on. Tests substitute their own.
pub trait UserStorage: Send + Sync + 'static {
    fn get_user(&self, id: i64) -> Option<StoredUser>;
    fn list_users(&self) -> Vec<StoredUser>;
    fn update_user_inbounds(&self, user: User, inbounds: BTreeSet<String>);
    fn remove_user(&self, id: i64);

    /// The inbounds this node knows about, filtered to `tags`.
    fn list_inbounds(&self, tags: &BTreeSet<String>) -> Vec<Inbound>;
    fn register_inbounds(&self, inbounds: Vec<Inbound>);
}

#[derive(Debug, Default)]
struct MemoryInner {
    users: BTreeMap<i64, StoredUser>,
    inbounds: BTreeMap<String, Inbound>,
}

/// In-memory storage; the node's user table is rebuilt from the panel on
/// every (re)connect, so nothing needs to survive restarts.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: Mutex<MemoryInner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UserStorage for MemoryStorage {
    fn get_user(&self, id: i64) -> Option<StoredUser> {
        self.inner
            .lock()
            .expect("storage lock poisoned")
            .users
            .get(&id)
            .cloned()
    }

    fn list_users(&self) -> Vec<StoredUser> {
        self.inner
            .lock()
            .expect("storage lock poisoned")
            .users
            .values()
            .cloned()
            .collect()
    }

    fn update_user_inbounds(&self, user: User, inbounds: BTreeSet<String>) {
        let mut inner = self.inner.lock().expect("storage lock poisoned");
        inner
            .users
            .insert(user.id, StoredUser { user, inbounds });
    }

    fn remove_user(&self, id: i64) {
        self.inner
            .lock()
            .expect("storage lock poisoned")
            .users
            .remove(&id);
    }

    fn list_inbounds(&self, tags: &BTreeSet<String>) -> Vec<Inbound> {
        let inner = self.inner.lock().expect("storage lock poisoned");
        tags.iter()
            .filter_map(|tag| inner.inbounds.get(tag).cloned())
            .collect()
    }

    fn register_inbounds(&self, inbounds: Vec<Inbound>) {
        let mut inner = self.inner.lock().expect("storage lock poisoned");
        for inbound in inbounds {
            inner.inbounds.insert(inbound.tag.clone(), inbound);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: i64) -> User {
        User {
            id,
            username: format!("u{id}"),
            key: "00112233445566778899aabbccddeeff".into(),
        }
    }

    #[test]
    fn user_table_round_trip() {
        let storage = MemoryStorage::new();
        assert!(storage.get_user(1).is_none());

        let tags: BTreeSet<_> = ["a".to_string(), "b".to_string()].into();
        storage.update_user_inbounds(user(1), tags.clone());
        assert_eq!(storage.get_user(1).map(|u| u.inbounds), Some(tags));

        storage.remove_user(1);
        assert!(storage.get_user(1).is_none());
        // Removing again is a no-op.
        storage.remove_user(1);
    }

    #[test]
    fn inbound_lookup_filters_unknown_tags() {
        let storage = MemoryStorage::new();
        storage.register_inbounds(vec![Inbound {
            tag: "vless".into(),
            config: "{}".into(),
        }]);
        let requested: BTreeSet<_> = ["vless".to_string(), "ghost".to_string()].into();
        let found = storage.list_inbounds(&requested);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].tag, "vless");
    }
}
