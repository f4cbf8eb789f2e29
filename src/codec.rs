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

//! The codec between stored KV values and resource records.
//!
//! Values in the store are short, human-editable strings, so an operator
//! with nothing but the KV store's own CLI can read and write them.
//! The grammar per type:
//!
//! | Type | Value |
//! |---|---|
//! | `A` | dotted IPv4 address |
//! | `AAAA` | [RFC 5952] IPv6 address |
//! | `TXT` | the raw text |
//! | `CNAME`, `NS` | a domain name (fully qualified on read) |
//! | `PTR` | a domain name; must be syntactically valid |
//! | `SRV` | `priority\tweight\tport\ttarget` |
//! | `SOA` | `mname\trname\trefresh\tretry\texpire\tminttl` |
//!
//! The stored SOA has no serial; the resolver synthesises one (see
//! [`Resolver::authority`](crate::resolver::Resolver::authority)).
//!
//! [`decode`] and [`encode`] are pure and round-trip modulo TTL.
//!
//! [RFC 5952]: https://datatracker.ietf.org/doc/html/rfc5952

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::name::Name;
use crate::rr::{Rdata, Record, Ttl, Type};
use crate::store::Node;

////////////////////////////////////////////////////////////////////////
// DECODING                                                           //
////////////////////////////////////////////////////////////////////////

/// Decodes a stored value node into a [`Record`] of the given type,
/// owned by `owner` and carrying `ttl`.
pub fn decode(
    node: &Node,
    owner: &Name,
    rr_type: Type,
    ttl: Ttl,
) -> Result<Record, NodeConversionError> {
    let value = node.value.as_str();
    let err = |message: String| NodeConversionError {
        message,
        key: node.key.clone(),
        value: value.to_owned(),
        attempted_type: rr_type,
    };

    let rdata = match rr_type {
        Type::A => Rdata::A(
            value
                .parse::<Ipv4Addr>()
                .map_err(|_| err(format!("failed to parse {value} as an IPv4 address")))?,
        ),
        Type::AAAA => Rdata::Aaaa(
            value
                .parse::<Ipv6Addr>()
                .map_err(|_| err(format!("failed to parse {value} as an IPv6 address")))?,
        ),
        Type::TXT => Rdata::Txt(value.to_owned()),
        Type::CNAME => Rdata::Cname(parse_name(value).map_err(err)?),
        Type::NS => Rdata::Ns(parse_name(value).map_err(err)?),
        Type::PTR => Rdata::Ptr(
            parse_name(value).map_err(|_| err(format!("value '{value}' is not a domain name")))?,
        ),
        Type::SRV => {
            let fields: Vec<&str> = value.splitn(4, '\t').collect();
            if fields.len() != 4 {
                return Err(err(format!("value {value} is not valid for SRV")));
            }
            Rdata::Srv {
                priority: parse_number::<u16>(fields[0]).map_err(err)?,
                weight: parse_number::<u16>(fields[1]).map_err(err)?,
                port: parse_number::<u16>(fields[2]).map_err(err)?,
                target: parse_name(fields[3]).map_err(err)?,
            }
        }
        Type::SOA => {
            let fields: Vec<&str> = value.splitn(6, '\t').collect();
            if fields.len() < 6 {
                return Err(err(format!("value {value} is not valid for SOA")));
            }
            Rdata::Soa {
                mname: parse_name(fields[0]).map_err(err)?,
                rname: parse_name(fields[1]).map_err(err)?,
                // The stored value has no serial; it is synthesised at
                // response time.
                serial: 0,
                refresh: parse_number::<u32>(fields[2]).map_err(err)?,
                retry: parse_number::<u32>(fields[3]).map_err(err)?,
                expire: parse_number::<u32>(fields[4]).map_err(err)?,
                minimum: parse_number::<u32>(fields[5]).map_err(err)?,
            }
        }
        _ => return Err(err(format!("no decoder is registered for {rr_type}"))),
    };

    Ok(Record::new(owner.clone(), rr_type, ttl, rdata))
}

fn parse_name(text: &str) -> Result<Name, String> {
    text.parse::<Name>()
        .map_err(|e| format!("'{text}' is not a domain name: {e}"))
}

fn parse_number<N: std::str::FromStr>(text: &str) -> Result<N, String> {
    text.parse::<N>()
        .map_err(|_| format!("field '{text}' is not a valid number"))
}

////////////////////////////////////////////////////////////////////////
// ENCODING                                                           //
////////////////////////////////////////////////////////////////////////

/// Encodes a record's RDATA into the stored value string.
///
/// Domain names in the value are written in canonical (lowercased,
/// fully qualified) form, so that two spellings of the same record
/// encode identically; the update engine relies on this when it
/// deduplicates by value.
pub fn encode(record: &Record) -> Result<String, NodeConversionError> {
    let err = |message: String| NodeConversionError {
        message,
        key: String::new(),
        value: String::new(),
        attempted_type: record.rr_type,
    };

    let rdata = match record.rdata {
        Some(ref rdata) => rdata,
        None => return Err(err("the record has no RDATA to encode".to_owned())),
    };

    Ok(match *rdata {
        Rdata::A(addr) => addr.to_string(),
        Rdata::Aaaa(addr) => addr.to_string(),
        Rdata::Txt(ref text) => text.clone(),
        Rdata::Cname(ref target) => target.canonical().to_string(),
        Rdata::Ns(ref target) => target.canonical().to_string(),
        Rdata::Ptr(ref target) => target.canonical().to_string(),
        Rdata::Srv {
            priority,
            weight,
            port,
            ref target,
        } => format!("{priority}\t{weight}\t{port}\t{}", target.canonical()),
        Rdata::Soa {
            ref mname,
            ref rname,
            refresh,
            retry,
            expire,
            minimum,
            ..
        } => format!(
            "{}\t{}\t{refresh}\t{retry}\t{expire}\t{minimum}",
            mname.canonical(),
            rname.canonical()
        ),
    })
}

/// Returns whether records of `rr_type` can be encoded for storage.
/// Updates naming any other type fail before any state is mutated.
pub fn can_encode(rr_type: Type) -> bool {
    rr_type.is_supported()
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error converting between a stored node and a resource record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeConversionError {
    pub message: String,
    pub key: String,
    pub value: String,
    pub attempted_type: Type,
}

impl fmt::Display for NodeConversionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "unable to convert node '{}' into an RR of type {}: {}",
            self.key, self.attempted_type, self.message
        )
    }
}

impl std::error::Error for NodeConversionError {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn name(from: &str) -> Name {
        from.parse().unwrap()
    }

    fn decode_value(value: &str, rr_type: Type) -> Result<Record, NodeConversionError> {
        let node = Node::leaf("net/disco/foo/.X", value);
        decode(&node, &name("foo.disco.net."), rr_type, Ttl::from(300))
    }

    #[test]
    fn a_records_decode_from_dotted_quads() {
        let record = decode_value("1.2.3.4", Type::A).unwrap();
        assert_eq!(
            record.rdata,
            Some(Rdata::A(std::net::Ipv4Addr::new(1, 2, 3, 4)))
        );
        assert_eq!(u32::from(record.ttl), 300);
    }

    #[test]
    fn a_records_reject_garbage_and_ipv6() {
        assert!(decode_value("not-an-ip", Type::A).is_err());
        assert!(decode_value("::1", Type::A).is_err());
    }

    #[test]
    fn aaaa_records_reject_ipv4() {
        assert!(decode_value("1.2.3.4", Type::AAAA).is_err());
        assert!(decode_value("::1", Type::AAAA).is_ok());
    }

    #[test]
    fn cname_values_are_fully_qualified_on_read() {
        let record = decode_value("bar.disco.net", Type::CNAME).unwrap();
        assert_eq!(record.rdata, Some(Rdata::Cname(name("bar.disco.net."))));
    }

    #[test]
    fn ptr_values_must_be_domain_names() {
        assert!(decode_value("host.disco.net.", Type::PTR).is_ok());
        assert!(decode_value("not a domain", Type::PTR).is_err());
    }

    #[test]
    fn srv_values_need_four_fields() {
        let record = decode_value("10\t20\t8080\tbackend.disco.net.", Type::SRV).unwrap();
        assert_eq!(
            record.rdata,
            Some(Rdata::Srv {
                priority: 10,
                weight: 20,
                port: 8080,
                target: name("backend.disco.net."),
            })
        );
        assert!(decode_value("10\t20\t8080", Type::SRV).is_err());
        assert!(decode_value("10\ttwenty\t8080\tb.disco.net.", Type::SRV).is_err());
    }

    #[test]
    fn soa_values_need_six_fields_and_numbers() {
        let record = decode_value(
            "ns1.disco.net.\tadmin.disco.net.\t3600\t600\t86400\t10",
            Type::SOA,
        )
        .unwrap();
        match record.rdata {
            Some(Rdata::Soa {
                ref mname, minimum, serial, ..
            }) => {
                assert_eq!(*mname, name("ns1.disco.net."));
                assert_eq!(minimum, 10);
                assert_eq!(serial, 0);
            }
            _ => panic!("expected SOA rdata"),
        }
        assert!(decode_value("ns1.disco.net.\tadmin.disco.net.\t3600", Type::SOA).is_err());
        assert!(decode_value(
            "ns1.disco.net.\tadmin.disco.net.\tx\t600\t86400\t10",
            Type::SOA
        )
        .is_err());
    }

    #[test]
    fn unsupported_types_have_no_decoder() {
        assert!(decode_value("whatever", Type::from(99)).is_err());
    }

    #[test]
    fn encode_and_decode_round_trip_modulo_ttl() {
        let cases = [
            ("1.2.3.4", Type::A),
            ("::1", Type::AAAA),
            ("some text", Type::TXT),
            ("target.disco.net.", Type::CNAME),
            ("ns1.disco.net.", Type::NS),
            ("host.disco.net.", Type::PTR),
            ("10\t20\t8080\tbackend.disco.net.", Type::SRV),
            (
                "ns1.disco.net.\tadmin.disco.net.\t3600\t600\t86400\t10",
                Type::SOA,
            ),
        ];
        for (value, rr_type) in cases {
            let record = decode_value(value, rr_type).unwrap();
            assert_eq!(encode(&record).unwrap(), value, "{rr_type}");
        }
    }

    #[test]
    fn encode_canonicalises_names() {
        let record = decode_value("Target.DISCO.Net", Type::CNAME).unwrap();
        assert_eq!(encode(&record).unwrap(), "target.disco.net.");
    }

    #[test]
    fn records_without_rdata_do_not_encode() {
        let record = Record {
            owner: name("foo.disco.net."),
            rr_type: Type::A,
            class: crate::class::Class::ANY,
            ttl: Ttl::ZERO,
            rdata: None,
        };
        assert!(encode(&record).is_err());
    }
}
