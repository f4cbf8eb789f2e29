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

//! The [RFC 2136] dynamic update engine.
//!
//! [`UpdateEngine::update`] takes an UPDATE message whose right to
//! modify the zone has already been established (see
//! [`server`](crate::server)) and applies it: zone containment checks,
//! prerequisite evaluation, update validation, and finally the
//! mutations themselves, in message order.
//!
//! All updates, across every server instance sharing the store, are
//! applied serially under a single advisory [`KeyLock`] at
//! `<prefix>/_UPDATE_LOCK`. The RFC only requires serialisation of
//! *conflicting* updates; one global lock is a deliberate
//! simplification that holds up fine at the update rates a DNS zone
//! sees.
//!
//! Mutations are not transactional. A store failure mid-sequence
//! aborts the update with SERVFAIL and performs no rollback, so
//! observers (and a retrying client) can see a partially applied
//! update. Prerequisites make retries safe where it matters.
//!
//! [RFC 2136]: https://datatracker.ietf.org/doc/html/rfc2136

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};

use crate::class::Class;
use crate::codec::{self, NodeConversionError};
use crate::keys;
use crate::lock::KeyLock;
use crate::message::{Message, Rcode};
use crate::metrics;
use crate::name::Name;
use crate::reader::RecordReader;
use crate::resolver::Resolver;
use crate::rr::{Record, Ttl, Type};
use crate::store::{KvError, KvStore};

/// The key (under the configured prefix) of the global update lock.
const UPDATE_LOCK_KEY: &str = "_UPDATE_LOCK";

/// How long an update waits for the update lock before giving up.
const UPDATE_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Types that may never appear in an update section, in any class.
const FORBIDDEN_TYPES: [Type; 5] = [
    Type::IXFR,
    Type::AXFR,
    Type::MAILB,
    Type::MAILA,
    Type::ANY,
];

/// Types that may not appear with class ANY (type ANY is how "delete
/// all RRsets at a name" is spelled, so it is allowed there).
const FORBIDDEN_ANY_CLASS_TYPES: [Type; 4] =
    [Type::IXFR, Type::AXFR, Type::MAILB, Type::MAILA];

////////////////////////////////////////////////////////////////////////
// THE UPDATE ENGINE                                                  //
////////////////////////////////////////////////////////////////////////

/// Applies dynamic updates to the store.
#[derive(Clone)]
pub struct UpdateEngine {
    store: Arc<dyn KvStore>,
    prefix: String,
    reader: RecordReader,
    resolver: Resolver,
}

impl UpdateEngine {
    pub fn new(
        store: Arc<dyn KvStore>,
        prefix: String,
        default_ttl: Ttl,
        resolver: Resolver,
    ) -> Self {
        let reader = RecordReader::new(Arc::clone(&store), prefix.clone(), default_ttl);
        Self {
            store,
            prefix,
            reader,
            resolver,
        }
    }

    /// Performs the update described in the RFC 2136 message `request`
    /// against `zone`, and returns the response to send. The caller
    /// has already authenticated the client's right to update the
    /// zone.
    pub async fn update(&self, zone: &Name, request: &Message) -> Message {
        let mut reply = Message::reply_to(request);
        reply.rcode = self.update_rcode(zone, request).await;
        metrics::UPDATES_TOTAL
            .with_label_values(&[&reply.rcode.to_string()])
            .inc();
        reply
    }

    async fn update_rcode(&self, zone: &Name, request: &Message) -> Rcode {
        // In an UPDATE message the answer section holds the
        // prerequisites and the authority section the updates.
        let prerequisites = &request.answers;
        let updates = &request.authorities;

        let zone_class = match request.sole_question() {
            Some(question) => Class::from(question.qclass),
            None => return Rcode::FormErr,
        };

        // Cross-zone updates are invalid.
        for record in prerequisites.iter().chain(updates.iter()) {
            if !record.owner.eq_or_subdomain_of(zone) {
                debug!("domain {} is not in the {} zone", record.owner, zone);
                return Rcode::NotZone;
            }
        }

        // All updates from all running instances are applied fully
        // serially; the RFC asks for serialisation only between
        // conflicting updates, but one lock is far simpler than
        // transaction isolation and update rates are low.
        let lock = KeyLock::new(
            Arc::clone(&self.store),
            keys::full_key(&self.prefix, UPDATE_LOCK_KEY),
        );
        if let Err(error) = lock.wait_for_acquire(UPDATE_LOCK_TIMEOUT).await {
            debug!("failed to acquire the update lock: {error}");
            metrics::UPDATE_LOCK_TIMEOUTS_TOTAL.inc();
            return Rcode::ServFail;
        }

        let rcode = self.locked_update(zone, zone_class, prerequisites, updates).await;
        lock.abandon();
        rcode
    }

    /// The part of the update that runs under the update lock.
    async fn locked_update(
        &self,
        zone: &Name,
        zone_class: Class,
        prerequisites: &[Record],
        updates: &[Record],
    ) -> Rcode {
        let prerequisite_validation = self.validate_prerequisites(prerequisites).await;
        if prerequisite_validation != Rcode::NoError {
            debug!("validation of prerequisites failed");
            return prerequisite_validation;
        }

        let update_validation = validate_updates(updates, zone_class);
        if update_validation != Rcode::NoError {
            debug!("validation of update instructions failed");
            return update_validation;
        }

        // Nothing here is transactional: a failure part-way through
        // leaves the zone partially updated.
        match self.perform_update(zone, updates).await {
            Ok(()) => Rcode::NoError,
            Err(error) => {
                warn!("update aborted: {error}");
                Rcode::ServFail
            }
        }
    }

    ////////////////////////////////////////////////////////////////////
    // PREREQUISITES (RFC 2136 § 3.2)                                 //
    ////////////////////////////////////////////////////////////////////

    /// Checks every prerequisite and returns the RCODE mapped to the
    /// first unsatisfied one, or NOERROR when they all hold.
    async fn validate_prerequisites(&self, prerequisites: &[Record]) -> Rcode {
        // Value-dependent prerequisites are grouped by (name, type)
        // and each group is matched against the store as one set.
        let mut sets_to_match: HashMap<(Name, Type), Vec<Record>> = HashMap::new();

        for record in prerequisites {
            if !record.ttl.is_zero() {
                return Rcode::FormErr;
            }

            if record.class == Class::ANY {
                if !record.rdata_is_empty() {
                    return Rcode::FormErr;
                }
                if record.rr_type == Type::ANY {
                    // "Name is in use"
                    match self.resolver.name_exists(&record.owner).await {
                        Err(_) => return Rcode::ServFail,
                        Ok(false) => {
                            debug!("domain that should exist does not: {}", record.owner);
                            return Rcode::NxDomain;
                        }
                        Ok(true) => {}
                    }
                } else {
                    // "RRset exists (value independent)"
                    match self.resolver.rrset_exists(&record.owner, record.rr_type).await {
                        Err(_) => return Rcode::ServFail,
                        Ok(false) => {
                            debug!(
                                "RRset that should exist does not: {} {}",
                                record.owner, record.rr_type
                            );
                            return Rcode::NxRrset;
                        }
                        Ok(true) => {}
                    }
                }
            } else if record.class == Class::NONE {
                if !record.rdata_is_empty() {
                    return Rcode::FormErr;
                }
                if record.rr_type == Type::ANY {
                    // "Name is not in use"
                    match self.resolver.name_exists(&record.owner).await {
                        Err(_) => return Rcode::ServFail,
                        Ok(true) => {
                            debug!("domain that should not exist does: {}", record.owner);
                            return Rcode::YxDomain;
                        }
                        Ok(false) => {}
                    }
                } else {
                    // "RRset does not exist"
                    match self.resolver.rrset_exists(&record.owner, record.rr_type).await {
                        Err(_) => return Rcode::ServFail,
                        Ok(true) => {
                            debug!("RRset that should not exist does: {}", record.owner);
                            return Rcode::YxRrset;
                        }
                        Ok(false) => {}
                    }
                }
            } else if record.class == Class::IN {
                if record.rr_type == Type::ANY {
                    return Rcode::FormErr;
                }
                // "RRset exists (value dependent)"
                sets_to_match
                    .entry((record.owner.clone(), record.rr_type))
                    .or_default()
                    .push(record.clone());
            } else {
                return Rcode::FormErr;
            }
        }

        for ((name, rr_type), records) in &sets_to_match {
            match self.resolver.rrset_matches(name, *rr_type, records).await {
                Err(_) => return Rcode::ServFail,
                Ok(false) => return Rcode::NxRrset,
                Ok(true) => {}
            }
        }

        Rcode::NoError
    }

    ////////////////////////////////////////////////////////////////////
    // MUTATION (RFC 2136 § 3.4.2)                                    //
    ////////////////////////////////////////////////////////////////////

    /// Commits the updates to the store, in message order. By this
    /// point all prerequisites have been validated and the update lock
    /// is held.
    async fn perform_update(&self, zone: &Name, updates: &[Record]) -> Result<(), UpdateError> {
        for record in updates {
            if record.class == Class::ANY {
                self.apply_rrset_deletion(zone, record).await?;
            } else if record.class == Class::NONE {
                self.apply_record_deletion(record).await?;
            } else {
                self.apply_addition(record).await?;
            }
        }
        Ok(())
    }

    /// Class ANY: delete an RRset (type T), or every RRset at the name
    /// (type ANY). NS and SOA at the zone apex are explicitly
    /// preserved, as the RFC requires.
    async fn apply_rrset_deletion(&self, zone: &Name, record: &Record) -> Result<(), UpdateError> {
        let types_to_delete: Vec<Type> = if record.rr_type == Type::ANY {
            Type::SUPPORTED
                .into_iter()
                .filter(|&rr_type| {
                    !(record.owner == *zone && (rr_type == Type::NS || rr_type == Type::SOA))
                })
                .collect()
        } else {
            vec![record.rr_type]
        };

        for rr_type in types_to_delete {
            let existing = self.existing_records(&record.owner, rr_type).await?;
            for stored in existing {
                self.delete_key_and_ttl(&stored.node.key).await?;
            }
        }
        Ok(())
    }

    /// Class NONE: delete the records whose stored value equals the
    /// update record's encoded value.
    async fn apply_record_deletion(&self, record: &Record) -> Result<(), UpdateError> {
        let value = codec::encode(record)?;
        let existing = self.existing_records(&record.owner, record.rr_type).await?;
        for stored in existing {
            if stored.node.value == value {
                self.delete_key_and_ttl(&stored.node.key).await?;
            }
        }
        Ok(())
    }

    /// Zone class: add a record to its RRset.
    async fn apply_addition(&self, record: &Record) -> Result<(), UpdateError> {
        let value = codec::encode(record)?;
        let rrset_key = keys::full_key(&self.prefix, &keys::rrset_key(&record.owner, record.rr_type));

        // A name must not exist as any other record type if it exists
        // as a CNAME (RFC 1034 § 3.6.2), so conflicting inserts are
        // skipped. The scan over the name's sibling type nodes treats
        // both layouts, leaf and directory, as "present".
        let (has_cname, has_other) = self.sibling_types(&record.owner).await;
        if record.rr_type == Type::CNAME && has_other {
            debug!(
                "ignoring CNAME insert at {} due to existing non-CNAME records",
                record.owner
            );
            return Ok(());
        }
        if record.rr_type != Type::CNAME && has_cname {
            debug!(
                "ignoring {} insert at {} due to an existing CNAME record",
                record.rr_type, record.owner
            );
            return Ok(());
        }

        let existing = self.existing_records(&record.owner, record.rr_type).await?;

        // An identical value already in place only gets its TTL
        // refreshed; inserting it again would do nothing (the sub-key
        // is a hash of the value).
        let mut ttl_keys: Vec<String> = existing
            .iter()
            .filter(|stored| stored.node.value == value)
            .map(|stored| format!("{}.ttl", stored.node.key))
            .collect();
        let found_existing = !ttl_keys.is_empty();

        if !found_existing {
            if existing.len() == 1 && existing[0].node.key == rrset_key {
                self.convert_leaf_to_directory(&rrset_key, &existing[0].node.value)
                    .await?;
            }

            let new_key = format!("{rrset_key}/{}", keys::record_subkey(&value));
            ttl_keys.push(format!("{new_key}.ttl"));
            debug!("inserting new record at {new_key}");
            self.store.set(&new_key, &value, None).await?;
        }

        if !record.ttl.is_zero() {
            let ttl_value = u32::from(record.ttl).to_string();
            for ttl_key in &ttl_keys {
                debug!("setting TTL override {ttl_key} = {ttl_value}");
                self.store.set(ttl_key, &ttl_value, None).await?;
            }
        }
        Ok(())
    }

    /// Converts an old-style single-value RRset leaf into the
    /// directory layout, re-inserting the old value under its hashed
    /// sub-key and carrying over its TTL override if one exists.
    async fn convert_leaf_to_directory(
        &self,
        rrset_key: &str,
        old_value: &str,
    ) -> Result<(), UpdateError> {
        warn!("converting single-value RRset at {rrset_key} to the directory layout");

        // Look for the override before the leaf goes away.
        let old_ttl = match self.store.get(&format!("{rrset_key}.ttl"), false, false).await {
            Ok(node) => Some(node.value),
            Err(ref error) if error.is_key_not_found() => None,
            Err(error) => return Err(error.into()),
        };

        let converted_key = format!("{rrset_key}/{}", keys::record_subkey(old_value));
        self.store.set_dir(rrset_key).await?;
        self.store.set(&converted_key, old_value, None).await?;
        if let Some(old_ttl) = old_ttl {
            self.store
                .set(&format!("{converted_key}.ttl"), &old_ttl, None)
                .await?;
        }
        Ok(())
    }

    /// Scans the type nodes that exist at a name, for the CNAME
    /// exclusivity check. Returns (has a CNAME node, has any other
    /// type node).
    async fn sibling_types(&self, owner: &Name) -> (bool, bool) {
        let name_key = keys::full_key(&self.prefix, &keys::name_to_key(owner, ""));
        let mut has_cname = false;
        let mut has_other = false;
        if let Ok(listing) = self.store.get(&name_key, false, true).await {
            for node in &listing.nodes {
                let segment = match node.key.rsplit('/').next() {
                    Some(segment) => segment,
                    None => continue,
                };
                if !segment.starts_with('.') || segment.ends_with(".ttl") {
                    continue;
                }
                if &segment[1..] == "CNAME" {
                    has_cname = true;
                } else {
                    has_other = true;
                }
            }
        }
        (has_cname, has_other)
    }

    /// Reads the records currently stored for `(owner, rr_type)`,
    /// treating a missing key as the empty set.
    async fn existing_records(
        &self,
        owner: &Name,
        rr_type: Type,
    ) -> Result<Vec<crate::reader::StoredRecord>, UpdateError> {
        match self.reader.get_records(&keys::rrset_key(owner, rr_type)).await {
            Ok(records) => Ok(records),
            Err(ref error) if error.is_key_not_found() => Ok(Vec::new()),
            Err(error) => Err(error.into()),
        }
    }

    /// Deletes a record's key and its TTL sibling, tolerating either
    /// being gone already.
    async fn delete_key_and_ttl(&self, key: &str) -> Result<(), UpdateError> {
        debug!("deleting record at {key}");
        for target in [key.to_owned(), format!("{key}.ttl")] {
            match self.store.delete(&target, true).await {
                Ok(()) => {}
                Err(ref error) if error.is_key_not_found() => {}
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////
// UPDATE VALIDATION (RFC 2136 § 3.4.1)                               //
////////////////////////////////////////////////////////////////////////

/// Checks that the update section conforms to the RFC and is
/// processable, before any state is mutated.
fn validate_updates(updates: &[Record], zone_class: Class) -> Rcode {
    for record in updates {
        if record.class == zone_class {
            if FORBIDDEN_TYPES.contains(&record.rr_type) {
                debug!(
                    "bad type for class {}: {} {}",
                    record.class, record.owner, record.rr_type
                );
                return Rcode::FormErr;
            }
        } else if record.class == Class::ANY {
            if !record.ttl.is_zero()
                || !record.rdata_is_empty()
                || FORBIDDEN_ANY_CLASS_TYPES.contains(&record.rr_type)
            {
                debug!(
                    "bad ttl/rdata/type for class {}: {} {}",
                    record.class, record.owner, record.rr_type
                );
                return Rcode::FormErr;
            }
        } else if record.class == Class::NONE {
            if !record.ttl.is_zero() || FORBIDDEN_TYPES.contains(&record.rr_type) {
                debug!(
                    "bad ttl/type for class {}: {} {}",
                    record.class, record.owner, record.rr_type
                );
                return Rcode::FormErr;
            }
        } else {
            return Rcode::FormErr;
        }

        // Separately from the RFC rules, refuse types we cannot
        // encode. (Type ANY only ever reaches here as a whole-name
        // deletion, which encodes nothing.)
        if record.rr_type != Type::ANY && !codec::can_encode(record.rr_type) {
            debug!("no record encoder exists for {}", record.rr_type);
            return Rcode::ServFail;
        }
    }
    Rcode::NoError
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// Errors that abort an update mid-mutation. These all become
/// SERVFAIL; nothing is rolled back.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UpdateError {
    Store(KvError),
    Conversion(NodeConversionError),
}

impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Store(e) => write!(f, "store mutation failed: {e}"),
            Self::Conversion(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for UpdateError {}

impl From<KvError> for UpdateError {
    fn from(error: KvError) -> Self {
        Self::Store(error)
    }
}

impl From<NodeConversionError> for UpdateError {
    fn from(error: NodeConversionError) -> Self {
        Self::Conversion(error)
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
