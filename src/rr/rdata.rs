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

//! The [`Record`] and [`Rdata`] structures.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::class::Class;
use crate::name::Name;

use super::{Ttl, Type};

////////////////////////////////////////////////////////////////////////
// RECORDS                                                            //
////////////////////////////////////////////////////////////////////////

/// A single DNS resource record.
///
/// This is the semantic form of a record: type-specific data is parsed
/// into an [`Rdata`], never kept as wire octets. Records in the
/// prerequisite and update sections of an [RFC 2136] message may have
/// RDLENGTH 0; such records carry `rdata: None`.
///
/// [RFC 2136]: https://datatracker.ietf.org/doc/html/rfc2136
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Record {
    pub owner: Name,
    pub rr_type: Type,
    pub class: Class,
    pub ttl: Ttl,
    pub rdata: Option<Rdata>,
}

impl Record {
    /// Constructs a data record of class IN.
    pub fn new(owner: Name, rr_type: Type, ttl: Ttl, rdata: Rdata) -> Self {
        Self {
            owner,
            rr_type,
            class: Class::IN,
            ttl,
            rdata: Some(rdata),
        }
    }

    /// Returns whether the record carries no RDATA (RDLENGTH 0).
    pub fn rdata_is_empty(&self) -> bool {
        self.rdata.is_none()
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.owner, self.ttl, self.class, self.rr_type
        )?;
        if let Some(ref rdata) = self.rdata {
            write!(f, " {rdata}")?;
        }
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////
// RDATA                                                              //
////////////////////////////////////////////////////////////////////////

/// The type-specific data of a [`Record`], for the types this server
/// stores.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Rdata {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Txt(String),
    Cname(Name),
    Ns(Name),
    Ptr(Name),
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: Name,
    },
    Soa {
        mname: Name,
        rname: Name,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
    },
}

impl Rdata {
    /// Returns the RR type this `Rdata` belongs to.
    pub fn rr_type(&self) -> Type {
        match self {
            Self::A(_) => Type::A,
            Self::Aaaa(_) => Type::AAAA,
            Self::Txt(_) => Type::TXT,
            Self::Cname(_) => Type::CNAME,
            Self::Ns(_) => Type::NS,
            Self::Ptr(_) => Type::PTR,
            Self::Srv { .. } => Type::SRV,
            Self::Soa { .. } => Type::SOA,
        }
    }
}

impl fmt::Display for Rdata {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::A(addr) => write!(f, "{addr}"),
            Self::Aaaa(addr) => write!(f, "{addr}"),
            Self::Txt(text) => write!(f, "\"{text}\""),
            Self::Cname(target) => write!(f, "{target}"),
            Self::Ns(target) => write!(f, "{target}"),
            Self::Ptr(target) => write!(f, "{target}"),
            Self::Srv {
                priority,
                weight,
                port,
                target,
            } => write!(f, "{priority} {weight} {port} {target}"),
            Self::Soa {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => write!(
                f,
                "{mname} {rname} {serial} {refresh} {retry} {expire} {minimum}"
            ),
        }
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_display_in_presentation_order() {
        let record = Record::new(
            "foo.disco.net.".parse().unwrap(),
            Type::A,
            Ttl::from(300),
            Rdata::A(Ipv4Addr::new(1, 2, 3, 4)),
        );
        assert_eq!(record.to_string(), "foo.disco.net. 300 IN A 1.2.3.4");
    }

    #[test]
    fn empty_rdata_displays_without_a_trailing_field() {
        let record = Record {
            owner: "foo.disco.net.".parse().unwrap(),
            rr_type: Type::ANY,
            class: Class::ANY,
            ttl: Ttl::ZERO,
            rdata: None,
        };
        assert_eq!(record.to_string(), "foo.disco.net. 0 * ANY");
    }
}
