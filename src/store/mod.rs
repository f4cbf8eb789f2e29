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

//! The interface to the hierarchical key/value store.
//!
//! All DNS state lives in an external, strongly consistent KV store
//! with an etcd-v2-style data model: keys form a tree, inner nodes are
//! directories, leaves carry string values, every node has a
//! modification index, and nodes may be given a time to live. The
//! [`KvStore`] trait abstracts the client for that store, so the
//! engine can be driven against any backend that can supply these
//! semantics. The real cluster client lives in the embedding daemon,
//! while tests (and embedders that want a self-contained server) use
//! the provided [`MemoryStore`].
//!
//! The error taxonomy matters here: "key not found" is an ordinary
//! condition that the [`resolver`](crate::resolver) translates into an
//! empty answer set, while transport-level failures must surface as
//! SERVFAIL. [`KvError`] keeps the two distinguishable, preserving the
//! store's numeric API error codes.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

mod memory;
pub use memory::MemoryStore;

////////////////////////////////////////////////////////////////////////
// NODES                                                              //
////////////////////////////////////////////////////////////////////////

/// A node of the KV store's key tree, as returned by [`KvStore::get`].
///
/// A node is either a value leaf (`dir == false`, `value` meaningful)
/// or a directory (`dir == true`, `nodes` holding its children, in the
/// store's key order). Keys are full paths from the store root,
/// without a leading slash.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Node {
    pub key: String,
    pub value: String,
    pub dir: bool,
    pub nodes: Vec<Node>,
    pub modified_index: u64,
}

impl Node {
    /// Constructs a leaf node. This is primarily a convenience for
    /// tests.
    pub fn leaf(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ..Self::default()
        }
    }
}

////////////////////////////////////////////////////////////////////////
// THE STORE TRAIT                                                    //
////////////////////////////////////////////////////////////////////////

/// A client for the hierarchical KV store.
///
/// Implementations must be safe for concurrent use; the server shares
/// one client across all in-flight requests. All operations are
/// cancel-safe in the sense that dropping the returned future must not
/// corrupt the client (the engine drops `watch` futures routinely when
/// a lock acquisition is abandoned).
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Reads the node at `key`. With `recursive`, the entire subtree
    /// under a directory is returned; otherwise only its immediate
    /// children are. With `sorted`, children appear in key order.
    async fn get(&self, key: &str, recursive: bool, sorted: bool) -> Result<Node, KvError>;

    /// Writes the value leaf at `key`, creating it (and any missing
    /// parent directories) if necessary. A `ttl` of [`None`] makes the
    /// node persistent; otherwise it expires after the given duration
    /// unless refreshed by another `set`.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<Node, KvError>;

    /// Makes `key` a directory. An existing value leaf at `key` is
    /// replaced by an empty directory.
    async fn set_dir(&self, key: &str) -> Result<Node, KvError>;

    /// Writes the value leaf at `key` only if no node exists there
    /// yet. Fails with [`KvError::NodeExist`] otherwise.
    async fn create(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<Node, KvError>;

    /// Deletes the node at `key`. A non-empty directory is only
    /// deleted when `recursive` is set.
    async fn delete(&self, key: &str, recursive: bool) -> Result<(), KvError>;

    /// Deletes the value leaf at `key` only if its current value
    /// equals `expected`. Fails with [`KvError::TestFailed`] otherwise.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<(), KvError>;

    /// Waits for the next change (write, delete, or expiry) of the
    /// node at `key` whose modification index is at least
    /// `after_index`, and returns that index. Callers cancel a watch
    /// by dropping the future.
    async fn watch(&self, key: &str, after_index: u64) -> Result<u64, KvError>;
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// Errors returned by [`KvStore`] operations.
///
/// The API variants mirror the store's numeric error codes (see
/// [`KvError::code`]); `Transport` covers everything that never
/// reached the store (connection refused, timeouts, and the like).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum KvError {
    /// Code 100: no node exists at the key.
    KeyNotFound { key: String },
    /// Code 101: a compare-and-X operation found a different value.
    TestFailed { key: String },
    /// Code 102: the operation requires a value leaf, but the key
    /// holds a directory.
    NotAFile { key: String },
    /// Code 104: an interior key holds a value leaf, not a directory.
    NotADirectory { key: String },
    /// Code 105: a create found the key already in existence. The
    /// store's index at the time of the failure is included so that
    /// callers can watch for the next change without missing one.
    NodeExist { key: String, index: u64 },
    /// Any other API error, with its numeric code.
    Api { code: u16, message: String },
    /// The store could not be reached.
    Transport(String),
}

impl KvError {
    /// Returns the store's numeric code for API errors, or [`None`]
    /// for transport failures.
    pub fn code(&self) -> Option<u16> {
        match self {
            Self::KeyNotFound { .. } => Some(100),
            Self::TestFailed { .. } => Some(101),
            Self::NotAFile { .. } => Some(102),
            Self::NotADirectory { .. } => Some(104),
            Self::NodeExist { .. } => Some(105),
            Self::Api { code, .. } => Some(*code),
            Self::Transport(_) => None,
        }
    }

    /// Returns whether this is the "key not found" condition, which
    /// most readers treat as an empty result rather than a failure.
    pub fn is_key_not_found(&self) -> bool {
        matches!(self, Self::KeyNotFound { .. })
    }
}

impl fmt::Display for KvError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::KeyNotFound { key } => write!(f, "key not found: {key}"),
            Self::TestFailed { key } => write!(f, "compare failed: {key}"),
            Self::NotAFile { key } => write!(f, "not a file: {key}"),
            Self::NotADirectory { key } => write!(f, "not a directory: {key}"),
            Self::NodeExist { key, .. } => write!(f, "node already exists: {key}"),
            Self::Api { code, message } => write!(f, "store error {code}: {message}"),
            Self::Transport(message) => write!(f, "store unreachable: {message}"),
        }
    }
}

impl std::error::Error for KvError {}
