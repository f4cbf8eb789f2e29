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

//! The short-lived response cache.
//!
//! Every query normally consults the KV store. With a cache
//! configured, the answers for a question are remembered for a few
//! seconds, absorbing query bursts for hot names at the cost of
//! equally brief staleness. (Dynamic updates deliberately bypass the
//! cache; see [`resolver`](crate::resolver).)
//!
//! Entries expire via id indirection: the fingerprint maps to an
//! opaque id, and the id maps to the records. A `set` installs a fresh
//! id and schedules an expiry that removes the id's records
//! unconditionally but clears the fingerprint only if it still points
//! at that id. An expiry racing with a replacement therefore cannot
//! evict the newer entry.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::debug;
use uuid::Uuid;

use crate::message::question::Question;
use crate::message::{Qclass, Qtype};
use crate::metrics;
use crate::name::Name;
use crate::rr::Record;

////////////////////////////////////////////////////////////////////////
// FINGERPRINTS                                                       //
////////////////////////////////////////////////////////////////////////

/// The cache key: a question with its name canonicalised.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Fingerprint {
    pub qname: Name,
    pub qtype: Qtype,
    pub qclass: Qclass,
}

impl Fingerprint {
    pub fn new(qname: &Name, qtype: Qtype, qclass: Qclass) -> Self {
        Self {
            qname: qname.canonical(),
            qtype,
            qclass,
        }
    }
}

impl From<&Question> for Fingerprint {
    fn from(question: &Question) -> Self {
        Self::new(&question.qname, question.qtype, question.qclass)
    }
}

////////////////////////////////////////////////////////////////////////
// THE CACHE                                                          //
////////////////////////////////////////////////////////////////////////

/// A short-TTL in-memory cache of answer records.
///
/// The two internal tables are each behind their own reader/writer
/// lock; no lock is ever held across I/O or an await point.
pub struct RecordCache {
    ttl: Duration,
    ids: RwLock<HashMap<Fingerprint, Uuid>>,
    records: RwLock<HashMap<Uuid, Arc<[Record]>>>,
}

impl RecordCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            ids: RwLock::new(HashMap::new()),
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Looks up the cached answers for a question fingerprint.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<[Record]>> {
        let id = self.ids.read().unwrap().get(fingerprint).copied();
        match id {
            Some(id) => {
                let found = self.records.read().unwrap().get(&id).cloned();
                if found.is_some() {
                    metrics::CACHE_HITS_TOTAL.inc();
                } else {
                    metrics::CACHE_MISSES_TOTAL.inc();
                }
                found
            }
            None => {
                metrics::CACHE_MISSES_TOTAL.inc();
                None
            }
        }
    }

    /// Inserts the answers for a question fingerprint, superseding any
    /// previous entry, and schedules their expiry. Must be called from
    /// within a Tokio runtime (the expiry is a spawned task).
    pub fn set(self: &Arc<Self>, fingerprint: Fingerprint, answers: Vec<Record>) {
        let id = Uuid::new_v4();
        self.records
            .write()
            .unwrap()
            .insert(id, Arc::from(answers));
        self.ids.write().unwrap().insert(fingerprint.clone(), id);

        let cache = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(cache.ttl).await;
            debug!("cache expiry: {} {}", fingerprint.qname, fingerprint.qtype);

            // Clear the fingerprint only if it has not been replaced
            // since; the records for our id go away regardless.
            {
                let mut ids = cache.ids.write().unwrap();
                if ids.get(&fingerprint) == Some(&id) {
                    ids.remove(&fingerprint);
                }
            }
            cache.records.write().unwrap().remove(&id);
        });
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rr::{Rdata, Ttl, Type};

    fn fingerprint(qname: &str) -> Fingerprint {
        Fingerprint::new(
            &qname.parse().unwrap(),
            Qtype::from(Type::A),
            Qclass::from(crate::class::Class::IN),
        )
    }

    fn answer(addr: [u8; 4]) -> Vec<Record> {
        vec![Record::new(
            "foo.disco.net.".parse().unwrap(),
            Type::A,
            Ttl::from(300),
            Rdata::A(addr.into()),
        )]
    }

    #[tokio::test]
    async fn get_returns_what_set_stored() {
        let cache = Arc::new(RecordCache::new(Duration::from_secs(5)));
        assert!(cache.get(&fingerprint("foo.disco.net.")).is_none());
        cache.set(fingerprint("foo.disco.net."), answer([1, 2, 3, 4]));
        let hit = cache.get(&fingerprint("foo.disco.net.")).unwrap();
        assert_eq!(&*hit, answer([1, 2, 3, 4]).as_slice());
    }

    #[tokio::test]
    async fn fingerprints_are_case_insensitive() {
        let cache = Arc::new(RecordCache::new(Duration::from_secs(5)));
        cache.set(fingerprint("FOO.Disco.Net."), answer([1, 2, 3, 4]));
        assert!(cache.get(&fingerprint("foo.disco.net.")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_the_ttl() {
        let cache = Arc::new(RecordCache::new(Duration::from_secs(5)));
        cache.set(fingerprint("foo.disco.net."), answer([1, 2, 3, 4]));
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;
        assert!(cache.get(&fingerprint("foo.disco.net.")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn a_superseded_expiry_does_not_evict_the_replacement() {
        let cache = Arc::new(RecordCache::new(Duration::from_secs(10)));
        cache.set(fingerprint("foo.disco.net."), answer([1, 1, 1, 1]));
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(5)).await;
        cache.set(fingerprint("foo.disco.net."), answer([2, 2, 2, 2]));
        tokio::task::yield_now().await;

        // The first entry's timer fires now; the replacement must
        // survive it.
        tokio::time::advance(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;
        let hit = cache.get(&fingerprint("foo.disco.net.")).unwrap();
        assert_eq!(&*hit, answer([2, 2, 2, 2]).as_slice());

        // And the replacement still expires on its own schedule.
        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        assert!(cache.get(&fingerprint("foo.disco.net.")).is_none());
    }
}
