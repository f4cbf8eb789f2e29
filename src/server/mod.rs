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

//! The request dispatcher, abstracted from any underlying network I/O
//! provider.
//!
//! The transport layer owns the sockets: it receives datagrams and
//! streams, parses them into [`Message`]s, verifies any TSIG
//! signature, and serialises the replies this module hands back. Each
//! parsed message is submitted to [`Handler::handle`] together with a
//! [`ReceivedInfo`] describing how it arrived; the handler routes
//! QUERY messages through the accept/reject filters into the
//! [`Resolver`] and UPDATE messages through the TSIG authorization
//! gate into the [`UpdateEngine`], and answers anything else with
//! NOTIMP.

use std::collections::HashSet;

use log::{debug, error};

use crate::class::Class;
use crate::filter::QueryFilterer;
use crate::message::{Message, Opcode, Rcode, TsigRcode};
use crate::metrics;
use crate::name::Name;
use crate::resolver::Resolver;
use crate::rr::{Rdata, Record, Ttl, Type};
use crate::update::UpdateEngine;

/// The authority-section TXT message attached to filtered queries.
const REJECTION_NOTICE: &str = "Rejected query based on matched filters";

////////////////////////////////////////////////////////////////////////
// RECEIVED-MESSAGE METADATA                                          //
////////////////////////////////////////////////////////////////////////

/// The transport a message arrived over. Metrics are kept per
/// transport.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Transport {
    Udp,
    Tcp,
}

impl Transport {
    fn label(self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
        }
    }
}

/// The transport layer's verdict on a message's TSIG signature.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TsigVerification {
    /// The key name the message was signed with.
    pub key_name: Name,
    /// Whether the signature verified against that key's secret.
    pub valid: bool,
}

/// Metadata accompanying a received message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReceivedInfo {
    pub transport: Transport,
    pub tsig: Option<TsigVerification>,
}

impl ReceivedInfo {
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            tsig: None,
        }
    }

    pub fn with_tsig(mut self, tsig: TsigVerification) -> Self {
        self.tsig = Some(tsig);
        self
    }
}

////////////////////////////////////////////////////////////////////////
// THE HANDLER                                                        //
////////////////////////////////////////////////////////////////////////

/// Routes parsed DNS messages to the resolver or the update engine
/// and produces the replies.
pub struct Handler {
    resolver: Resolver,
    update_engine: UpdateEngine,
    filterer: QueryFilterer,
    unauthenticated_zones: HashSet<Name>,
}

impl Handler {
    pub fn new(
        resolver: Resolver,
        update_engine: UpdateEngine,
        filterer: QueryFilterer,
        unauthenticated_zones: HashSet<Name>,
    ) -> Self {
        Self {
            resolver,
            update_engine,
            filterer,
            unauthenticated_zones,
        }
    }

    /// Handles one received message and returns the reply to send.
    pub async fn handle(&self, request: &Message, info: ReceivedInfo) -> Message {
        let protocol = info.transport.label();
        metrics::REQUESTS_TOTAL.with_label_values(&[protocol]).inc();
        let timer = metrics::RESPONSE_TIME_SECONDS
            .with_label_values(&[protocol])
            .start_timer();

        let reply = if request.opcode == Opcode::QUERY {
            self.handle_query(request, &info).await
        } else if request.opcode == Opcode::UPDATE {
            self.handle_update(request, &info).await
        } else {
            debug!("opcode {} is not implemented", request.opcode);
            let mut reply = Message::reply_to(request);
            reply.rcode = Rcode::NotImp;
            reply
        };

        timer.observe_duration();
        reply
    }

    async fn handle_query(&self, request: &Message, info: &ReceivedInfo) -> Message {
        let protocol = info.transport.label();
        let question = match request.sole_question() {
            Some(question) => question,
            None => {
                let mut reply = Message::reply_to(request);
                reply.rcode = Rcode::FormErr;
                return reply;
            }
        };
        debug!("handling incoming query for domain {}", question.qname);

        if !self.filterer.should_accept(question) {
            debug!("query not accepted");
            metrics::FILTER_REJECTS_TOTAL
                .with_label_values(&[protocol])
                .inc();

            let mut reply = Message::reply_to(request);
            reply.rcode = Rcode::NxDomain;
            reply.authoritative = true;
            reply.recursion_available = false;
            // Add a useful TXT record.
            reply.authorities.push(Record {
                owner: question.qname.clone(),
                rr_type: Type::TXT,
                class: Class::IN,
                ttl: Ttl::ZERO,
                rdata: Some(Rdata::Txt(REJECTION_NOTICE.to_owned())),
            });
            return reply;
        }

        metrics::FILTER_ACCEPTS_TOTAL
            .with_label_values(&[protocol])
            .inc();
        self.resolver.lookup(request).await
    }

    async fn handle_update(&self, request: &Message, info: &ReceivedInfo) -> Message {
        let question = match request.sole_question() {
            Some(question) => question,
            None => {
                let mut reply = Message::reply_to(request);
                reply.rcode = Rcode::FormErr;
                return reply;
            }
        };
        let zone = question.qname.clone();

        // Updates must be signed with the zone's own key, unless the
        // zone is explicitly open to unauthenticated updates.
        match info.tsig {
            Some(ref tsig) => {
                if !tsig.valid {
                    debug!("rejecting update for {zone}: bad TSIG signature");
                    return notauth(request, Some(TsigRcode::BadSig));
                }
                if tsig.key_name != zone {
                    debug!(
                        "rejecting update for {zone}: TSIG key {} does not match the zone",
                        tsig.key_name
                    );
                    return notauth(request, Some(TsigRcode::BadKey));
                }
            }
            None => {
                if !self.unauthenticated_zones.contains(&zone) {
                    debug!("rejecting unsigned update for {zone}");
                    return notauth(request, None);
                }
            }
        }

        // The engine raises a non-recoverable fault on internal
        // invariant breaches; running it on its own task contains the
        // unwind so that we can answer SERVFAIL and carry on.
        let engine = self.update_engine.clone();
        let task_zone = zone.clone();
        let task_request = request.clone();
        match tokio::spawn(async move { engine.update(&task_zone, &task_request).await }).await {
            Ok(reply) => reply,
            Err(join_error) => {
                error!("update of {zone} aborted: {join_error}");
                let mut reply = Message::reply_to(request);
                reply.rcode = Rcode::ServFail;
                reply
            }
        }
    }
}

fn notauth(request: &Message, tsig_rcode: Option<TsigRcode>) -> Message {
    let mut reply = Message::reply_to(request);
    reply.rcode = Rcode::NotAuth;
    reply.tsig_rcode = tsig_rcode;
    reply
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
