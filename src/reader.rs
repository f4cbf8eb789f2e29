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

//! Reading record values (and their TTL overrides) out of the store.
//!
//! An RRset node supports two layouts: a single value leaf, or a
//! directory whose children are value leaves (one per record). In
//! either layout, a record may have a TTL override next to it: a
//! sibling leaf whose key is the record's key with `.ttl` appended.
//! The [`RecordReader`] walks a subtree and yields each value node
//! paired with its effective TTL, hiding the layout from the resolver
//! and the update engine.

use std::sync::Arc;

use log::debug;

use crate::keys;
use crate::metrics;
use crate::rr::Ttl;
use crate::store::{KvError, KvStore, Node};

////////////////////////////////////////////////////////////////////////
// STORED RECORDS                                                     //
////////////////////////////////////////////////////////////////////////

/// A raw record read from the store: the value node and the TTL that
/// applies to it (its `.ttl` sibling's value, or the server default).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoredRecord {
    pub node: Node,
    pub ttl: Ttl,
}

////////////////////////////////////////////////////////////////////////
// THE READER                                                         //
////////////////////////////////////////////////////////////////////////

/// Reads the records under a key, in either storage layout.
#[derive(Clone)]
pub struct RecordReader {
    store: Arc<dyn KvStore>,
    prefix: String,
    default_ttl: Ttl,
}

impl RecordReader {
    pub fn new(store: Arc<dyn KvStore>, prefix: String, default_ttl: Ttl) -> Self {
        Self {
            store,
            prefix,
            default_ttl,
        }
    }

    /// Returns the store's "key not found" errors unchanged: whether
    /// absence is an empty result or a failure is the caller's call.
    pub async fn get_records(&self, key: &str) -> Result<Vec<StoredRecord>, KvError> {
        let full = keys::full_key(&self.prefix, key);
        metrics::STORE_QUERIES_TOTAL.inc();
        debug!("querying the store for {full}");

        let root = self.store.get(&full, true, true).await.map_err(|e| {
            metrics::STORE_QUERY_ERRORS_TOTAL.inc();
            e
        })?;

        let mut records = Vec::new();
        if root.dir {
            collect_dir(&root, self.default_ttl, &mut records);
        } else {
            if root.key.ends_with(".ttl") {
                debug!("unexpected .ttl node {}", root.key);
                return Ok(records);
            }
            // A lone leaf has no siblings to pair with, so look for
            // its override with a second, best-effort fetch.
            let ttl = match self.store.get(&format!("{full}.ttl"), false, false).await {
                Ok(ttl_node) => parse_ttl(&ttl_node).unwrap_or(self.default_ttl),
                Err(_) => self.default_ttl,
            };
            records.push(StoredRecord { node: root, ttl });
        }
        Ok(records)
    }
}

/// Parses the value of a `.ttl` node, logging and returning [`None`]
/// when it is not a valid unsigned 32-bit integer.
fn parse_ttl(node: &Node) -> Option<Ttl> {
    match node.value.parse::<u32>() {
        Ok(value) => Some(Ttl::from(value)),
        Err(_) => {
            debug!("unable to convert ttl value to an integer: {}", node.value);
            None
        }
    }
}

/// Walks a directory node, pairing each value child with an
/// immediately following `.ttl` sibling. The pairing is stateful: the
/// last value child is held back until the next child shows whether an
/// override follows it.
fn collect_dir(dir: &Node, default_ttl: Ttl, out: &mut Vec<StoredRecord>) {
    let mut pending: Option<&Node> = None;
    for child in &dir.nodes {
        if child.key.ends_with(".ttl") {
            match parse_ttl(child) {
                None => {} // logged; the pending value keeps waiting
                Some(ttl) => {
                    if let Some(value_node) = pending.take() {
                        emit(value_node, ttl, default_ttl, out);
                    } else {
                        debug!(".ttl node with no matching value node: {}", child.key);
                    }
                }
            }
        } else if let Some(value_node) = pending.replace(child) {
            emit(value_node, default_ttl, default_ttl, out);
        }
    }
    if let Some(value_node) = pending {
        emit(value_node, default_ttl, default_ttl, out);
    }
}

fn emit(node: &Node, ttl: Ttl, default_ttl: Ttl, out: &mut Vec<StoredRecord>) {
    if node.dir {
        // Nested directories are walked with the default TTL; an
        // override sibling applies only to value leaves.
        collect_dir(node, default_ttl, out);
    } else {
        out.push(StoredRecord {
            node: node.clone(),
            ttl,
        });
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    async fn reader_with(entries: &[(&str, &str)]) -> RecordReader {
        let _ = env_logger::builder().is_test(true).try_init();
        let store = Arc::new(MemoryStore::new());
        for (key, value) in entries {
            store.set(key, value, None).await.unwrap();
        }
        RecordReader::new(store, String::new(), Ttl::from(300))
    }

    #[tokio::test]
    async fn a_single_value_leaf_gets_the_default_ttl() {
        let reader = reader_with(&[("net/disco/foo/.A", "1.2.3.4")]).await;
        let records = reader.get_records("net/disco/foo/.A").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].node.value, "1.2.3.4");
        assert_eq!(records[0].ttl, Ttl::from(300));
    }

    #[tokio::test]
    async fn a_leaf_ttl_override_is_fetched_separately() {
        let reader = reader_with(&[
            ("net/disco/bar/.A", "1.2.3.4"),
            ("net/disco/bar/.A.ttl", "42"),
        ])
        .await;
        let records = reader.get_records("net/disco/bar/.A").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].ttl, Ttl::from(42));
    }

    #[tokio::test]
    async fn directory_children_pair_with_ttl_siblings() {
        let reader = reader_with(&[
            ("net/disco/multi/.A/one", "1.1.1.1"),
            ("net/disco/multi/.A/one.ttl", "60"),
            ("net/disco/multi/.A/two", "2.2.2.2"),
        ])
        .await;
        let mut records = reader.get_records("net/disco/multi/.A").await.unwrap();
        records.sort_by(|a, b| a.node.key.cmp(&b.node.key));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].node.value, "1.1.1.1");
        assert_eq!(records[0].ttl, Ttl::from(60));
        assert_eq!(records[1].node.value, "2.2.2.2");
        assert_eq!(records[1].ttl, Ttl::from(300));
    }

    #[tokio::test]
    async fn dangling_ttl_children_are_skipped() {
        let reader = reader_with(&[("net/disco/x/.A/one.ttl", "60")]).await;
        let records = reader.get_records("net/disco/x/.A").await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn unparsable_ttl_values_fall_back_to_the_default() {
        let reader = reader_with(&[
            ("net/disco/y/.A/one", "1.1.1.1"),
            ("net/disco/y/.A/one.ttl", "soon"),
        ])
        .await;
        let records = reader.get_records("net/disco/y/.A").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].ttl, Ttl::from(300));
    }

    #[tokio::test]
    async fn nested_directories_are_walked() {
        // The wildcard layout: net/disco/bar/*/.AAAA stores its
        // records one level down.
        let reader = reader_with(&[("net/disco/deep/.TXT/nested/one", "hello")]).await;
        let records = reader.get_records("net/disco/deep/.TXT").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].node.value, "hello");
    }

    #[tokio::test]
    async fn missing_keys_surface_as_key_not_found() {
        let reader = reader_with(&[]).await;
        let err = reader.get_records("net/disco/none/.A").await.unwrap_err();
        assert!(err.is_key_not_found());
    }
}
