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

//! The resolver: answering DNS questions out of the KV store.
//!
//! [`Resolver::lookup`] implements the query algorithm:
//!
//! 1. Answer the question. A question for a concrete type reads that
//!    RRset and, when it is empty, falls back to the name's CNAME. An
//!    ANY question fans out one sub-lookup per supported type.
//! 2. If nothing was found, retry at wildcard names, walking from the
//!    closest-enclosing wildcard outward (`*.parent`,
//!    `*.grandparent`, …). The first non-empty match wins, and its
//!    answers are rewritten to the query name.
//! 3. Errors anywhere make the response SERVFAIL; an empty result
//!    becomes NXDOMAIN with the zone's SOA in the authority section;
//!    otherwise the answers are returned with NOERROR.
//!
//! Sub-lookups run as their own tasks and funnel their results through
//! an answer channel and an error channel; a collector drains both
//! until they close. A panicking sub-lookup merely drops its channel
//! ends, so it can never take the server down with it.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;
use tokio::sync::mpsc;

use crate::cache::{Fingerprint, RecordCache};
use crate::class::Class;
use crate::codec::{self, NodeConversionError};
use crate::keys;
use crate::message::question::Question;
use crate::message::{Message, Qtype, Rcode};
use crate::metrics;
use crate::name::Name;
use crate::rr::{Rdata, Record, Ttl, Type};
use crate::reader::RecordReader;
use crate::store::{KvError, KvStore};

////////////////////////////////////////////////////////////////////////
// THE RESOLVER                                                       //
////////////////////////////////////////////////////////////////////////

/// Answers DNS questions by reading the KV store.
///
/// A `Resolver` is cheap to clone (it is a handful of shared handles);
/// sub-lookups clone it into their tasks.
#[derive(Clone)]
pub struct Resolver {
    reader: RecordReader,
    cache: Option<Arc<RecordCache>>,
}

impl Resolver {
    pub fn new(store: Arc<dyn KvStore>, prefix: String, default_ttl: Ttl) -> Self {
        Self {
            reader: RecordReader::new(store, prefix, default_ttl),
            cache: None,
        }
    }

    /// Configures a response cache. Lookups made on behalf of queries
    /// go through it; the update engine's prerequisite checks do not.
    pub fn with_cache(mut self, cache: Arc<RecordCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Produces the response to a QUERY message.
    pub async fn lookup(&self, request: &Message) -> Message {
        let mut reply = Message::reply_to(request);
        reply.authoritative = true;
        reply.recursion_available = false; // we're a nameserver, no recursion for you

        let question = match request.sole_question() {
            Some(question) => question.clone(),
            None => {
                reply.rcode = Rcode::FormErr;
                return reply;
            }
        };
        metrics::QUESTIONS_TOTAL
            .with_label_values(&[&question.qtype.to_string()])
            .inc();
        debug!("answering question {question}");

        if Class::from(question.qclass) != Class::IN {
            // Only IN is served; everything else gets an empty
            // authoritative reply.
            return reply;
        }

        let (mut answers, mut errored) = self.gather(&question).await;

        // If we failed to find any answers, keep looking up the tree
        // for wildcard entries.
        if answers.is_empty() && !errored {
            let mut ancestor = question.qname.parent();
            while let Some(parent) = ancestor {
                if parent.is_root() {
                    break;
                }
                let wildcard = Question {
                    qname: parent.wildcard(),
                    qtype: question.qtype,
                    qclass: question.qclass,
                };
                let (wildcard_answers, wildcard_errored) = self.gather(&wildcard).await;
                if wildcard_errored {
                    errored = true;
                    break;
                }
                if !wildcard_answers.is_empty() {
                    answers = wildcard_answers;
                    break;
                }
                ancestor = parent.parent();
            }
        }

        // Answers synthesized from a wildcard (or stored under a
        // differently cased owner) are presented under the name that
        // was asked for.
        for record in &mut answers {
            record.owner = question.qname.clone();
        }

        if errored {
            metrics::ANSWERS_ERROR_TOTAL.inc();
            reply.rcode = Rcode::ServFail;
        } else if answers.is_empty() {
            metrics::ANSWERS_MISS_TOTAL.inc();
            reply.rcode = Rcode::NxDomain;
            match self.authority(&question.qname).await {
                Some(soa) => reply.authorities.push(soa),
                None => reply.authoritative = false, // no SOA? we're not authoritative
            }
        } else {
            metrics::ANSWERS_HIT_TOTAL.inc();
            reply.answers = answers;
        }
        reply
    }

    /// Spawns the sub-lookups for a question and collects their
    /// results. Returns the gathered answers and whether any
    /// sub-lookup reported an error.
    async fn gather(&self, question: &Question) -> (Vec<Record>, bool) {
        let (answers_tx, mut answers_rx) = mpsc::unbounded_channel();
        let (errors_tx, mut errors_rx) = mpsc::unbounded_channel();
        self.answer_question(question.clone(), answers_tx, errors_tx);

        let mut answers = Vec::new();
        let mut errored = false;
        let mut answers_open = true;
        let mut errors_open = true;
        while answers_open || errors_open {
            tokio::select! {
                received = answers_rx.recv(), if answers_open => match received {
                    Some(record) => answers.push(record),
                    None => answers_open = false,
                },
                received = errors_rx.recv(), if errors_open => match received {
                    Some(error) => {
                        debug!("caught error {error}");
                        errored = true;
                    }
                    None => errors_open = false,
                },
            }
        }
        (answers, errored)
    }

    /// Spawns one task per sub-lookup for the question and returns
    /// immediately; results flow through the given channels, which
    /// close once every sub-lookup is done.
    fn answer_question(
        &self,
        question: Question,
        answers: mpsc::UnboundedSender<Record>,
        errors: mpsc::UnboundedSender<LookupError>,
    ) {
        if question.qtype == Qtype::ANY {
            for rr_type in Type::SUPPORTED {
                let resolver = self.clone();
                let qname = question.qname.clone();
                let answers = answers.clone();
                let errors = errors.clone();
                tokio::spawn(async move {
                    match resolver.lookup_answers(&qname, rr_type).await {
                        Ok(records) => {
                            for record in records {
                                let _ = answers.send(record);
                            }
                        }
                        Err(error) => {
                            let _ = errors.send(error);
                        }
                    }
                });
            }
        } else if Type::from(question.qtype).is_supported() {
            let resolver = self.clone();
            let rr_type = Type::from(question.qtype);
            let qname = question.qname;
            tokio::spawn(async move {
                match resolver.lookup_answers(&qname, rr_type).await {
                    Err(error) => {
                        let _ = errors.send(error);
                    }
                    Ok(records) if !records.is_empty() => {
                        for record in records {
                            let _ = answers.send(record);
                        }
                    }
                    Ok(_) => {
                        // Nothing of the requested type; fall back to
                        // the name's CNAME, of which there may only be
                        // one.
                        match resolver.lookup_answers(&qname, Type::CNAME).await {
                            Err(error) => {
                                let _ = errors.send(error);
                            }
                            Ok(cnames) if cnames.len() > 1 => {
                                let _ = errors.send(LookupError::MultipleCnames);
                            }
                            Ok(cnames) => {
                                if let Some(cname) = cnames.into_iter().next() {
                                    let _ = answers.send(cname);
                                }
                            }
                        }
                    }
                }
            });
        }
        // An unsupported QTYPE spawns nothing; dropping the senders
        // closes the channels and the gather comes back empty.
    }

    /// Looks up the records of one type at a name, going through the
    /// response cache when one is configured.
    pub async fn lookup_answers(
        &self,
        name: &Name,
        rr_type: Type,
    ) -> Result<Vec<Record>, LookupError> {
        let cache = match self.cache {
            Some(ref cache) => cache,
            None => return self.lookup_answers_uncached(name, rr_type).await,
        };

        let fingerprint = Fingerprint::new(name, rr_type.into(), Class::IN.into());
        if let Some(hit) = cache.get(&fingerprint) {
            return Ok(hit.to_vec());
        }
        let answers = self.lookup_answers_uncached(name, rr_type).await?;
        if !answers.is_empty() {
            cache.set(fingerprint, answers.clone());
        }
        Ok(answers)
    }

    /// Looks up the records of one type at a name, straight from the
    /// store. The store's "key not found" is an empty result here, not
    /// an error.
    pub async fn lookup_answers_uncached(
        &self,
        name: &Name,
        rr_type: Type,
    ) -> Result<Vec<Record>, LookupError> {
        let name = name.canonical();
        let stored = match self.reader.get_records(&keys::rrset_key(&name, rr_type)).await {
            Ok(stored) => stored,
            Err(error) if error.is_key_not_found() => return Ok(Vec::new()),
            Err(error) => return Err(LookupError::Store(error)),
        };

        let mut answers = Vec::with_capacity(stored.len());
        for record in stored {
            answers.push(codec::decode(&record.node, &name, rr_type, record.ttl)?);
        }
        Ok(answers)
    }

    /// Walks from `name` towards the root and returns the first SOA
    /// found, to be used as the authority for a negative answer.
    ///
    /// The returned SOA's serial is synthesised as the current hour in
    /// seconds since the Unix epoch: stored SOAs carry no serial, and
    /// an hourly value gives secondaries a stable notion of freshness.
    /// Note that the serial does not stay monotonic if the wall clock
    /// steps backwards across an hour boundary.
    pub async fn authority(&self, name: &Name) -> Option<Record> {
        for ancestor in name.ancestors() {
            let answers = match self.lookup_answers(&ancestor, Type::SOA).await {
                Ok(answers) => answers,
                Err(_) => return None,
            };
            if answers.len() == 1 {
                let mut soa = answers.into_iter().next().unwrap();
                if let Some(Rdata::Soa { ref mut serial, .. }) = soa.rdata {
                    *serial = hourly_serial();
                }
                return Some(soa);
            }
        }

        // Keep score of the domains we're not authoritative for.
        metrics::MISSING_SOA_TOTAL.inc();
        None
    }

    ////////////////////////////////////////////////////////////////////
    // EXISTENCE PREDICATES (RFC 2136 PREREQUISITES)                  //
    ////////////////////////////////////////////////////////////////////

    // The predicates below bypass the response cache: prerequisite
    // evaluation happens under the update lock and must observe the
    // store itself, not a snapshot.

    /// Returns whether any record of any supported type exists at
    /// `name`. The per-type lookups run concurrently and the first hit
    /// wins.
    pub async fn name_exists(&self, name: &Name) -> Result<bool, LookupError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        for rr_type in Type::SUPPORTED {
            let resolver = self.clone();
            let name = name.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = resolver
                    .lookup_answers_uncached(&name, rr_type)
                    .await
                    .map(|answers| !answers.is_empty());
                let _ = tx.send(result);
            });
        }
        drop(tx);

        while let Some(result) = rx.recv().await {
            if result? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Returns whether at least one record of `rr_type` exists at
    /// `name`.
    pub async fn rrset_exists(&self, name: &Name, rr_type: Type) -> Result<bool, LookupError> {
        Ok(!self.lookup_answers_uncached(name, rr_type).await?.is_empty())
    }

    /// Returns whether the RRset at `(name, rr_type)` equals the
    /// expected records: same cardinality, and every expected record's
    /// canonical encoded form present in the stored set. TTLs do not
    /// participate in the comparison.
    pub async fn rrset_matches(
        &self,
        name: &Name,
        rr_type: Type,
        expected: &[Record],
    ) -> Result<bool, LookupError> {
        let actual = self.lookup_answers_uncached(name, rr_type).await?;
        if actual.len() != expected.len() {
            return Ok(false);
        }

        let mut actual_values = HashSet::with_capacity(actual.len());
        for record in &actual {
            actual_values.insert(codec::encode(record)?);
        }
        for record in expected {
            if !actual_values.contains(&codec::encode(record)?) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// The synthesised SOA serial: the current time truncated to the hour,
/// in seconds since the Unix epoch.
fn hourly_serial() -> u32 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    (now - now % 3600) as u32
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// Errors that arise while looking up answers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LookupError {
    Store(KvError),
    Conversion(NodeConversionError),
    MultipleCnames,
}

impl fmt::Display for LookupError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Store(e) => write!(f, "store lookup failed: {e}"),
            Self::Conversion(e) => e.fmt(f),
            Self::MultipleCnames => f.write_str("multiple CNAME records is invalid"),
        }
    }
}

impl std::error::Error for LookupError {}

impl From<KvError> for LookupError {
    fn from(error: KvError) -> Self {
        Self::Store(error)
    }
}

impl From<NodeConversionError> for LookupError {
    fn from(error: NodeConversionError) -> Self {
        Self::Conversion(error)
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    async fn resolver_with(entries: &[(&str, &str)]) -> Resolver {
        let _ = env_logger::builder().is_test(true).try_init();
        let store = Arc::new(MemoryStore::new());
        for (key, value) in entries {
            store.set(key, value, None).await.unwrap();
        }
        Resolver::new(store, String::new(), Ttl::from(300))
    }

    fn name(from: &str) -> Name {
        from.parse().unwrap()
    }

    fn query(qname: &str, qtype: Qtype) -> Message {
        Message::query(7, Question::new(name(qname), qtype))
    }

    #[tokio::test]
    async fn a_stored_record_is_answered_with_the_default_ttl() {
        let resolver = resolver_with(&[("net/disco/foo/.A", "1.2.3.4")]).await;
        let reply = resolver.lookup(&query("foo.disco.net.", Type::A.into())).await;

        assert_eq!(reply.rcode, Rcode::NoError);
        assert!(reply.authoritative);
        assert!(!reply.recursion_available);
        assert!(reply.authorities.is_empty());
        assert_eq!(reply.answers.len(), 1);
        assert_eq!(
            reply.answers[0],
            Record::new(
                name("foo.disco.net."),
                Type::A,
                Ttl::from(300),
                Rdata::A([1, 2, 3, 4].into()),
            )
        );
    }

    #[tokio::test]
    async fn missing_names_get_nxdomain_with_the_zone_soa() {
        let resolver = resolver_with(&[(
            "net/disco/.SOA",
            "ns1.disco.net.\tadmin.disco.net.\t3600\t600\t86400\t10",
        )])
        .await;
        let reply = resolver.lookup(&query("bar.disco.net.", Type::A.into())).await;

        assert_eq!(reply.rcode, Rcode::NxDomain);
        assert!(reply.authoritative);
        assert!(reply.answers.is_empty());
        assert_eq!(reply.authorities.len(), 1);
        match reply.authorities[0].rdata {
            Some(Rdata::Soa { minimum, serial, .. }) => {
                assert_eq!(minimum, 10);
                assert_eq!(serial % 3600, 0);
                assert!(serial > 0);
            }
            _ => panic!("expected an SOA in the authority section"),
        }
    }

    #[tokio::test]
    async fn missing_names_without_an_soa_clear_the_aa_bit() {
        let resolver = resolver_with(&[]).await;
        let reply = resolver.lookup(&query("bar.disco.net.", Type::A.into())).await;
        assert_eq!(reply.rcode, Rcode::NxDomain);
        assert!(!reply.authoritative);
        assert!(reply.authorities.is_empty());
    }

    #[tokio::test]
    async fn wildcards_answer_for_missing_children() {
        let resolver = resolver_with(&[("net/disco/bar/*/.AAAA", "::1")]).await;
        let reply = resolver
            .lookup(&query("baz.bar.disco.net.", Type::AAAA.into()))
            .await;

        assert_eq!(reply.rcode, Rcode::NoError);
        assert_eq!(reply.answers.len(), 1);
        assert_eq!(reply.answers[0].owner, name("baz.bar.disco.net."));
        assert_eq!(reply.answers[0].rdata, Some(Rdata::Aaaa("::1".parse().unwrap())));
    }

    #[tokio::test]
    async fn the_closest_enclosing_wildcard_wins() {
        let resolver = resolver_with(&[
            ("net/disco/bar/*/.A", "1.1.1.1"),
            ("net/disco/*/.A", "2.2.2.2"),
        ])
        .await;
        let reply = resolver
            .lookup(&query("baz.bar.disco.net.", Type::A.into()))
            .await;
        assert_eq!(reply.answers.len(), 1);
        assert_eq!(reply.answers[0].rdata, Some(Rdata::A([1, 1, 1, 1].into())));
    }

    #[tokio::test]
    async fn explicit_records_beat_wildcards() {
        let resolver = resolver_with(&[
            ("net/disco/*/.A", "2.2.2.2"),
            ("net/disco/bar/.A", "1.1.1.1"),
        ])
        .await;
        let reply = resolver.lookup(&query("bar.disco.net.", Type::A.into())).await;
        assert_eq!(reply.answers.len(), 1);
        assert_eq!(reply.answers[0].rdata, Some(Rdata::A([1, 1, 1, 1].into())));
    }

    #[tokio::test]
    async fn ttl_overrides_apply_per_record() {
        let resolver = resolver_with(&[
            ("net/disco/bar/.A", "1.2.3.4"),
            ("net/disco/bar/.A.ttl", "300"),
        ])
        .await;
        let reply = resolver.lookup(&query("bar.disco.net.", Type::A.into())).await;
        assert_eq!(reply.answers[0].ttl, Ttl::from(300));

        let resolver = resolver_with(&[
            ("net/disco/multi/.A/one", "1.1.1.1"),
            ("net/disco/multi/.A/one.ttl", "60"),
            ("net/disco/multi/.A/two", "2.2.2.2"),
        ])
        .await;
        let reply = resolver.lookup(&query("multi.disco.net.", Type::A.into())).await;
        let mut ttls: Vec<u32> = reply.answers.iter().map(|r| r.ttl.into()).collect();
        ttls.sort_unstable();
        assert_eq!(ttls, [60, 300]);
    }

    #[tokio::test]
    async fn lookups_fall_back_to_the_cname() {
        let resolver = resolver_with(&[("net/disco/www/.CNAME", "web.disco.net.")]).await;
        let reply = resolver.lookup(&query("www.disco.net.", Type::A.into())).await;

        assert_eq!(reply.rcode, Rcode::NoError);
        assert_eq!(reply.answers.len(), 1);
        assert_eq!(reply.answers[0].rr_type, Type::CNAME);
        assert_eq!(
            reply.answers[0].rdata,
            Some(Rdata::Cname(name("web.disco.net.")))
        );
    }

    #[tokio::test]
    async fn multiple_cnames_are_a_server_failure() {
        let resolver = resolver_with(&[
            ("net/disco/www/.CNAME/one", "a.disco.net."),
            ("net/disco/www/.CNAME/two", "b.disco.net."),
        ])
        .await;
        let reply = resolver.lookup(&query("www.disco.net.", Type::A.into())).await;
        assert_eq!(reply.rcode, Rcode::ServFail);
    }

    #[tokio::test]
    async fn any_queries_fan_out_over_all_types() {
        let resolver = resolver_with(&[
            ("net/disco/host/.A", "1.2.3.4"),
            ("net/disco/host/.TXT", "hello"),
        ])
        .await;
        let reply = resolver.lookup(&query("host.disco.net.", Qtype::ANY)).await;

        assert_eq!(reply.rcode, Rcode::NoError);
        let mut types: Vec<Type> = reply.answers.iter().map(|r| r.rr_type).collect();
        types.sort_unstable();
        assert_eq!(types, [Type::A, Type::TXT]);
    }

    #[tokio::test]
    async fn non_in_classes_get_an_empty_authoritative_reply() {
        let resolver = resolver_with(&[("net/disco/foo/.A", "1.2.3.4")]).await;
        let mut request = query("foo.disco.net.", Type::A.into());
        request.questions[0].qclass = Class::CH.into();
        let reply = resolver.lookup(&request).await;

        assert_eq!(reply.rcode, Rcode::NoError);
        assert!(reply.authoritative);
        assert!(reply.answers.is_empty());
        assert!(reply.authorities.is_empty());
    }

    #[tokio::test]
    async fn undecodable_records_are_a_server_failure() {
        let resolver = resolver_with(&[
            ("net/disco/bad/.A", "not-an-ip"),
            ("net/disco/good/.A", "1.2.3.4"),
        ])
        .await;
        let reply = resolver.lookup(&query("bad.disco.net.", Type::A.into())).await;
        assert_eq!(reply.rcode, Rcode::ServFail);

        // The rest of the zone stays usable.
        let reply = resolver.lookup(&query("good.disco.net.", Type::A.into())).await;
        assert_eq!(reply.rcode, Rcode::NoError);
    }

    #[tokio::test]
    async fn answers_echo_the_question_case() {
        let resolver = resolver_with(&[("net/disco/foo/.A", "1.2.3.4")]).await;
        let reply = resolver.lookup(&query("FOO.DISCO.NET.", Type::A.into())).await;
        assert_eq!(reply.answers[0].owner.to_string(), "FOO.DISCO.NET.");
    }

    #[tokio::test]
    async fn existence_predicates_see_the_store() {
        let resolver = resolver_with(&[("net/disco/host/.TXT", "hello")]).await;
        assert!(resolver.name_exists(&name("host.disco.net.")).await.unwrap());
        assert!(!resolver.name_exists(&name("ghost.disco.net.")).await.unwrap());
        assert!(resolver
            .rrset_exists(&name("host.disco.net."), Type::TXT)
            .await
            .unwrap());
        assert!(!resolver
            .rrset_exists(&name("host.disco.net."), Type::A)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn rrset_matching_is_value_dependent_and_ttl_blind() {
        let resolver = resolver_with(&[
            ("net/disco/multi/.A/one", "1.1.1.1"),
            ("net/disco/multi/.A/two", "2.2.2.2"),
        ])
        .await;
        let owner = name("multi.disco.net.");
        let record = |addr: [u8; 4], ttl: u32| {
            Record::new(owner.clone(), Type::A, Ttl::from(ttl), Rdata::A(addr.into()))
        };

        assert!(resolver
            .rrset_matches(&owner, Type::A, &[record([1, 1, 1, 1], 999), record([2, 2, 2, 2], 0)])
            .await
            .unwrap());
        // Wrong cardinality.
        assert!(!resolver
            .rrset_matches(&owner, Type::A, &[record([1, 1, 1, 1], 0)])
            .await
            .unwrap());
        // Wrong value.
        assert!(!resolver
            .rrset_matches(&owner, Type::A, &[record([1, 1, 1, 1], 0), record([3, 3, 3, 3], 0)])
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn cached_answers_are_reused() {
        let store = Arc::new(MemoryStore::new());
        store.set("net/disco/foo/.A", "1.2.3.4", None).await.unwrap();
        let cache = Arc::new(RecordCache::new(std::time::Duration::from_secs(30)));
        let resolver =
            Resolver::new(store.clone(), String::new(), Ttl::from(300)).with_cache(cache);

        let first = resolver.lookup(&query("foo.disco.net.", Type::A.into())).await;
        assert_eq!(first.answers.len(), 1);

        // Remove the record behind the cache's back; the cached answer
        // keeps being served.
        store.delete("net/disco/foo/.A", true).await.unwrap();
        let second = resolver.lookup(&query("foo.disco.net.", Type::A.into())).await;
        assert_eq!(second.answers.len(), 1);
    }
}
