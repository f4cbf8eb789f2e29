// Copyright 2024 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! An in-memory [`KvStore`] implementation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::{KvError, KvStore, Node};

////////////////////////////////////////////////////////////////////////
// THE MEMORY STORE                                                   //
////////////////////////////////////////////////////////////////////////

/// An in-memory implementation of the [`KvStore`] trait.
///
/// The `MemoryStore` implements the full contract, including node
/// TTLs, implicit parent directories, compare-and-delete, and watches
/// that observe writes, deletes, and expirations. It backs the test
/// suite and can serve embedders who want a self-contained server
/// without an external cluster.
///
/// Watches are served from an unbounded in-memory event log, so a
/// watcher starting from an index in the past cannot miss a change;
/// the flip side is that the log grows for the lifetime of the store.
/// This is the right trade-off for tests and short-lived processes,
/// which are what this type is for.
pub struct MemoryStore {
    state: Mutex<State>,
    events: broadcast::Sender<Event>,
}

struct State {
    nodes: BTreeMap<String, Entry>,
    index: u64,
    log: Vec<Event>,
}

struct Entry {
    /// The value of a leaf node, or [`None`] for a directory.
    value: Option<String>,
    modified_index: u64,
    expires_at: Option<Instant>,
}

#[derive(Clone, Debug)]
struct Event {
    key: String,
    index: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(State {
                nodes: BTreeMap::new(),
                index: 0,
                log: Vec::new(),
            }),
            events,
        }
    }

    /// Removes expired nodes, recording an event for each so that
    /// watchers observe the expiry.
    fn purge(&self, state: &mut State) {
        let now = Instant::now();
        let expired: Vec<String> = state
            .nodes
            .iter()
            .filter(|(_, entry)| entry.expires_at.map_or(false, |at| at <= now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            state.nodes.remove(&key);
            state.index += 1;
            let event = Event {
                key,
                index: state.index,
            };
            state.log.push(event.clone());
            let _ = self.events.send(event);
        }
    }

    fn record_change(&self, state: &mut State, key: &str) -> u64 {
        state.index += 1;
        let event = Event {
            key: key.to_owned(),
            index: state.index,
        };
        state.log.push(event.clone());
        let _ = self.events.send(event);
        state.index
    }

    /// Checks that no proper ancestor of `key` is a value leaf.
    fn check_ancestors(state: &State, key: &str) -> Result<(), KvError> {
        let mut ancestor = key;
        while let Some(split_at) = ancestor.rfind('/') {
            ancestor = &ancestor[..split_at];
            if let Some(entry) = state.nodes.get(ancestor) {
                if entry.value.is_some() {
                    return Err(KvError::NotADirectory {
                        key: ancestor.to_owned(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Returns whether any key strictly below `key` exists.
    fn has_children(state: &State, key: &str) -> bool {
        let prefix = child_prefix(key);
        state
            .nodes
            .range(prefix.clone()..)
            .next()
            .map_or(false, |(k, _)| k.starts_with(&prefix))
    }

    fn build_node(state: &State, key: &str, recursive: bool) -> Node {
        if let Some(entry) = state.nodes.get(key) {
            if let Some(ref value) = entry.value {
                return Node {
                    key: key.to_owned(),
                    value: value.clone(),
                    dir: false,
                    nodes: Vec::new(),
                    modified_index: entry.modified_index,
                };
            }
        }

        // Explicit or implicit directory. Collect the immediate
        // children, keeping them in key order.
        let prefix = child_prefix(key);
        let mut children: BTreeSet<String> = BTreeSet::new();
        for child_key in state.nodes.range(prefix.clone()..).map(|(k, _)| k) {
            if !child_key.starts_with(&prefix) {
                break;
            }
            let rest = &child_key[prefix.len()..];
            let child = match rest.find('/') {
                Some(at) => format!("{}{}", &prefix, &rest[..at]),
                None => child_key.clone(),
            };
            children.insert(child);
        }

        let nodes = children
            .into_iter()
            .map(|child_key| {
                if recursive {
                    Self::build_node(state, &child_key, true)
                } else if state
                    .nodes
                    .get(&child_key)
                    .map_or(true, |entry| entry.value.is_none())
                {
                    // A shallow listing shows child directories as
                    // empty directory nodes.
                    Node {
                        key: child_key,
                        dir: true,
                        ..Node::default()
                    }
                } else {
                    Self::build_node(state, &child_key, false)
                }
            })
            .collect();

        Node {
            key: key.to_owned(),
            value: String::new(),
            dir: true,
            nodes,
            modified_index: state
                .nodes
                .get(key)
                .map_or(0, |entry| entry.modified_index),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(key: &str) -> String {
    key.trim_matches('/').to_owned()
}

fn child_prefix(key: &str) -> String {
    if key.is_empty() {
        String::new()
    } else {
        format!("{key}/")
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str, recursive: bool, _sorted: bool) -> Result<Node, KvError> {
        let key = normalize(key);
        let mut state = self.state.lock().unwrap();
        self.purge(&mut state);
        let exists =
            state.nodes.contains_key(&key) || Self::has_children(&state, &key) || key.is_empty();
        if !exists {
            return Err(KvError::KeyNotFound { key });
        }
        Ok(Self::build_node(&state, &key, recursive))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<Node, KvError> {
        let key = normalize(key);
        let mut state = self.state.lock().unwrap();
        self.purge(&mut state);
        Self::check_ancestors(&state, &key)?;
        let is_dir = state
            .nodes
            .get(&key)
            .map_or(false, |entry| entry.value.is_none())
            || Self::has_children(&state, &key);
        if is_dir {
            return Err(KvError::NotAFile { key });
        }
        let index = self.record_change(&mut state, &key);
        state.nodes.insert(
            key.clone(),
            Entry {
                value: Some(value.to_owned()),
                modified_index: index,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(Node {
            key,
            value: value.to_owned(),
            modified_index: index,
            ..Node::default()
        })
    }

    async fn set_dir(&self, key: &str) -> Result<Node, KvError> {
        let key = normalize(key);
        let mut state = self.state.lock().unwrap();
        self.purge(&mut state);
        Self::check_ancestors(&state, &key)?;
        let index = self.record_change(&mut state, &key);
        state.nodes.insert(
            key.clone(),
            Entry {
                value: None,
                modified_index: index,
                expires_at: None,
            },
        );
        Ok(Node {
            key,
            dir: true,
            modified_index: index,
            ..Node::default()
        })
    }

    async fn create(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<Node, KvError> {
        let key = normalize(key);
        let mut state = self.state.lock().unwrap();
        self.purge(&mut state);
        Self::check_ancestors(&state, &key)?;
        if state.nodes.contains_key(&key) || Self::has_children(&state, &key) {
            return Err(KvError::NodeExist {
                key,
                index: state.index,
            });
        }
        let index = self.record_change(&mut state, &key);
        state.nodes.insert(
            key.clone(),
            Entry {
                value: Some(value.to_owned()),
                modified_index: index,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(Node {
            key,
            value: value.to_owned(),
            modified_index: index,
            ..Node::default()
        })
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<(), KvError> {
        let key = normalize(key);
        let mut state = self.state.lock().unwrap();
        self.purge(&mut state);
        let exists = state.nodes.contains_key(&key);
        let has_children = Self::has_children(&state, &key);
        if !exists && !has_children {
            return Err(KvError::KeyNotFound { key });
        }
        if has_children && !recursive {
            return Err(KvError::NotAFile { key });
        }
        let prefix = child_prefix(&key);
        let removed: Vec<String> = state
            .nodes
            .keys()
            .filter(|k| *k == &key || k.starts_with(&prefix))
            .cloned()
            .collect();
        for k in removed {
            state.nodes.remove(&k);
            self.record_change(&mut state, &k);
        }
        Ok(())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<(), KvError> {
        let key = normalize(key);
        let mut state = self.state.lock().unwrap();
        self.purge(&mut state);
        match state.nodes.get(&key) {
            None => Err(KvError::KeyNotFound { key }),
            Some(entry) => match entry.value {
                None => Err(KvError::NotAFile { key }),
                Some(ref value) if value != expected => Err(KvError::TestFailed { key }),
                Some(_) => {
                    state.nodes.remove(&key);
                    self.record_change(&mut state, &key);
                    Ok(())
                }
            },
        }
    }

    async fn watch(&self, key: &str, after_index: u64) -> Result<u64, KvError> {
        let key = normalize(key);
        loop {
            // Subscribe before scanning the log so that a change
            // slipping in between the two cannot be missed.
            let mut receiver = self.events.subscribe();
            let next_expiry = {
                let mut state = self.state.lock().unwrap();
                self.purge(&mut state);
                if let Some(event) = state
                    .log
                    .iter()
                    .find(|event| event.key == key && event.index >= after_index)
                {
                    return Ok(event.index);
                }
                state
                    .nodes
                    .values()
                    .filter_map(|entry| entry.expires_at)
                    .min()
            };

            tokio::select! {
                received = receiver.recv() => {
                    if let Ok(event) = received {
                        if event.key == key && event.index >= after_index {
                            return Ok(event.index);
                        }
                    }
                    // Lagged or mismatched events: rescan the log.
                }
                _ = expiry_tick(next_expiry) => {
                    // A node TTL may have elapsed; purge and rescan.
                }
            }
        }
    }
}

/// Sleeps until the given deadline, or forever if there is none.
async fn expiry_tick(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_of_a_missing_key_is_distinguishable() {
        let store = MemoryStore::new();
        let err = store.get("no/such/key", false, true).await.unwrap_err();
        assert!(err.is_key_not_found());
        assert_eq!(err.code(), Some(100));
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = MemoryStore::new();
        store.set("net/disco/foo/.A", "1.2.3.4", None).await.unwrap();
        let node = store.get("net/disco/foo/.A", false, true).await.unwrap();
        assert!(!node.dir);
        assert_eq!(node.value, "1.2.3.4");
    }

    #[tokio::test]
    async fn interior_keys_become_implicit_directories() {
        let store = MemoryStore::new();
        store.set("net/disco/.NS/one", "ns1.disco.net.", None).await.unwrap();
        store.set("net/disco/.NS/two", "ns2.disco.net.", None).await.unwrap();
        let node = store.get("net/disco/.NS", true, true).await.unwrap();
        assert!(node.dir);
        let values: Vec<&str> = node.nodes.iter().map(|n| n.value.as_str()).collect();
        assert_eq!(values, ["ns1.disco.net.", "ns2.disco.net."]);
    }

    #[tokio::test]
    async fn shallow_gets_do_not_descend() {
        let store = MemoryStore::new();
        store.set("zone/a/leaf", "v", None).await.unwrap();
        store.set("zone/b", "w", None).await.unwrap();
        let node = store.get("zone", false, true).await.unwrap();
        assert_eq!(node.nodes.len(), 2);
        assert!(node.nodes[0].dir);
        assert!(node.nodes[0].nodes.is_empty());
        assert_eq!(node.nodes[1].value, "w");
    }

    #[tokio::test]
    async fn create_fails_when_the_node_exists() {
        let store = MemoryStore::new();
        store.create("lock", "a", None).await.unwrap();
        let err = store.create("lock", "b", None).await.unwrap_err();
        assert!(matches!(err, KvError::NodeExist { .. }));
    }

    #[tokio::test]
    async fn setting_below_a_leaf_fails() {
        let store = MemoryStore::new();
        store.set("a", "leaf", None).await.unwrap();
        let err = store.set("a/b", "nope", None).await.unwrap_err();
        assert_eq!(err.code(), Some(104));
    }

    #[tokio::test]
    async fn set_dir_converts_a_leaf() {
        let store = MemoryStore::new();
        store.set("net/disco/foo/.A", "1.2.3.4", None).await.unwrap();
        store.set_dir("net/disco/foo/.A").await.unwrap();
        store
            .set("net/disco/foo/.A/abc", "1.2.3.4", None)
            .await
            .unwrap();
        let node = store.get("net/disco/foo/.A", true, true).await.unwrap();
        assert!(node.dir);
        assert_eq!(node.nodes.len(), 1);
    }

    #[tokio::test]
    async fn compare_and_delete_checks_the_value() {
        let store = MemoryStore::new();
        store.set("lock", "mine", None).await.unwrap();
        let err = store.compare_and_delete("lock", "theirs").await.unwrap_err();
        assert_eq!(err.code(), Some(101));
        store.compare_and_delete("lock", "mine").await.unwrap();
        assert!(store
            .get("lock", false, true)
            .await
            .unwrap_err()
            .is_key_not_found());
    }

    #[tokio::test]
    async fn watches_see_later_changes() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let node = store.set("lock", "a", None).await.unwrap();

        let watcher = {
            let store = store.clone();
            tokio::spawn(async move { store.watch("lock", node.modified_index + 1).await })
        };
        store.delete("lock", false).await.unwrap();
        let observed = watcher.await.unwrap().unwrap();
        assert!(observed > node.modified_index);
    }

    #[tokio::test]
    async fn watches_replay_from_the_log() {
        let store = MemoryStore::new();
        let node = store.set("lock", "a", None).await.unwrap();
        store.delete("lock", false).await.unwrap();
        // The change already happened; the watch must return at once.
        let observed = store.watch("lock", node.modified_index + 1).await.unwrap();
        assert!(observed > node.modified_index);
    }

    #[tokio::test(start_paused = true)]
    async fn nodes_expire_after_their_ttl() {
        let store = MemoryStore::new();
        store
            .set("lock", "mine", Some(Duration::from_secs(10)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store
            .get("lock", false, true)
            .await
            .unwrap_err()
            .is_key_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn watchers_observe_expiry() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let node = store
            .set("lock", "mine", Some(Duration::from_secs(10)))
            .await
            .unwrap();
        let watcher = {
            let store = store.clone();
            tokio::spawn(async move { store.watch("lock", node.modified_index + 1).await })
        };
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(11)).await;
        let observed = watcher.await.unwrap().unwrap();
        assert!(observed > node.modified_index);
    }
}
