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

//! The parsed DNS message model.
//!
//! This crate never serializes or deserializes the DNS wire format;
//! that is the transport layer's job. What it works with is the
//! [`Message`] structure defined here: a header's worth of fields plus
//! the four record sections, all in semantic form.

use crate::rr::Record;

mod opcode;
pub mod question;
mod rcode;
pub use opcode::Opcode;
pub use question::{Qclass, Qtype, Question};
pub use rcode::{Rcode, TsigRcode};

////////////////////////////////////////////////////////////////////////
// MESSAGES                                                           //
////////////////////////////////////////////////////////////////////////

/// A parsed DNS message.
///
/// The section names follow [RFC 1035 § 4.1]. Note that [RFC 2136]
/// reappropriates the sections for UPDATE messages: the question
/// section carries the zone, the answer section the prerequisites, and
/// the authority section the update records. The
/// [`update`](crate::update) engine reads them accordingly.
///
/// The `tsig_rcode` field stands in for the error field of a TSIG
/// record ([RFC 8945 § 5.3]): when the dispatcher rejects an update
/// over its transaction signature, it records the BADSIG/BADKEY code
/// here for the transport layer to serialize.
///
/// [RFC 1035 § 4.1]: https://datatracker.ietf.org/doc/html/rfc1035#section-4.1
/// [RFC 2136]: https://datatracker.ietf.org/doc/html/rfc2136
/// [RFC 8945 § 5.3]: https://datatracker.ietf.org/doc/html/rfc8945#section-5.3
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Message {
    pub id: u16,
    pub opcode: Opcode,
    pub response: bool,
    pub authoritative: bool,
    pub truncated: bool,
    pub recursion_desired: bool,
    pub recursion_available: bool,
    pub rcode: Rcode,
    pub tsig_rcode: Option<TsigRcode>,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
    pub authorities: Vec<Record>,
    pub additionals: Vec<Record>,
}

impl Message {
    /// Constructs a QUERY request with a single question. This is
    /// primarily a convenience for tests and embedders.
    pub fn query(id: u16, question: Question) -> Self {
        Self {
            id,
            opcode: Opcode::QUERY,
            questions: vec![question],
            ..Self::default()
        }
    }

    /// Starts a response to `request`: the ID, opcode, recursion
    /// desired flag, and question section are copied, the QR bit is
    /// set, and everything else is left at its default.
    pub fn reply_to(request: &Message) -> Self {
        Self {
            id: request.id,
            opcode: request.opcode,
            response: true,
            recursion_desired: request.recursion_desired,
            questions: request.questions.clone(),
            ..Self::default()
        }
    }

    /// Returns the sole question of the message, if it has exactly
    /// one.
    pub fn sole_question(&self) -> Option<&Question> {
        match self.questions.as_slice() {
            [question] => Some(question),
            _ => None,
        }
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::question::Question;

    fn question() -> Question {
        Question {
            qname: "foo.disco.net.".parse().unwrap(),
            qtype: Qtype::from(crate::rr::Type::A),
            qclass: Qclass::from(crate::class::Class::IN),
        }
    }

    #[test]
    fn reply_copies_the_request_envelope() {
        let mut request = Message::query(0x1234, question());
        request.recursion_desired = true;
        let reply = Message::reply_to(&request);
        assert_eq!(reply.id, 0x1234);
        assert_eq!(reply.opcode, Opcode::QUERY);
        assert!(reply.response);
        assert!(reply.recursion_desired);
        assert_eq!(reply.questions, request.questions);
        assert_eq!(reply.rcode, Rcode::NoError);
    }

    #[test]
    fn sole_question_requires_exactly_one() {
        let mut message = Message::query(1, question());
        assert!(message.sole_question().is_some());
        message.questions.push(question());
        assert!(message.sole_question().is_none());
        message.questions.clear();
        assert!(message.sole_question().is_none());
    }
}
