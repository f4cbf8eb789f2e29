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

//! An authoritative DNS server engine whose zone data lives in an
//! external, strongly consistent, hierarchical key/value store.
//!
//! Unlike a conventional authoritative server, this crate does not load
//! zone files at startup. Every query consults the KV store (optionally
//! through a short-lived response cache), so DNS state can be treated
//! as just another entry in the KV namespace: records written to the
//! store out of band become visible to the DNS immediately, and records
//! changed through [RFC 2136] dynamic updates become visible to every
//! other consumer of the store.
//!
//! The crate implements the *engine* only:
//!
//! * the [`resolver`], which maps a DNS question onto KV reads and
//!   assembles the answer and authority sections, handling wildcards,
//!   CNAME chasing, SOA lookup, and per-record TTL overrides;
//! * the [`update`] engine, which validates RFC 2136 prerequisites and
//!   applies updates serially under a cooperative KV [`lock`];
//! * the supporting [`keys`], [`codec`], [`reader`], [`cache`], and
//!   [`filter`] modules; and
//! * the [`server`] dispatcher that routes parsed QUERY and UPDATE
//!   messages to the pieces above.
//!
//! Two collaborators are abstracted away. Network I/O (UDP/TCP framing
//! and TSIG signature verification) is the embedder's job: the
//! dispatcher consumes already-parsed [`message::Message`] values
//! together with a [`server::ReceivedInfo`] describing the transport
//! and the TSIG outcome. The KV client is likewise behind the
//! [`store::KvStore`] trait; [`store::MemoryStore`] is a complete
//! in-memory implementation suitable for tests and embedding.
//!
//! [RFC 2136]: https://datatracker.ietf.org/doc/html/rfc2136

pub mod cache;
pub mod class;
pub mod codec;
pub mod config;
pub mod filter;
pub mod keys;
pub mod lock;
pub mod message;
pub mod metrics;
pub mod name;
pub mod reader;
pub mod resolver;
pub mod rr;
pub mod server;
pub mod store;
pub mod update;

mod util;
