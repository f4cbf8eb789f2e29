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

//! Query accept/reject filters.
//!
//! A filter pairs a domain with a set of query types and matches a
//! question whose name falls under the domain and whose QTYPE is in
//! the set. The textual form is `domain:type[,type…]`: an empty domain
//! matches any name, and an empty type list matches any type, so
//! `:TXT` matches TXT queries everywhere and `disco.net.:` matches
//! everything under `disco.net.`.
//!
//! The policy, evaluated by [`QueryFilterer::should_accept`]: a
//! question matching any reject filter is rejected; otherwise, if
//! accept filters are configured, it must match at least one of them;
//! otherwise it is accepted.

use std::fmt;
use std::str::FromStr;

use log::debug;

use crate::message::question::Question;
use crate::message::Qtype;
use crate::name::Name;

////////////////////////////////////////////////////////////////////////
// FILTERS                                                            //
////////////////////////////////////////////////////////////////////////

/// A single query filter: a domain suffix and a set of query types.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QueryFilter {
    domain: Name,
    qtypes: Vec<Qtype>,
}

impl QueryFilter {
    /// Returns whether the filter matches the given question. The
    /// domain comparison is label-wise (`sub.disco.net.` matches a
    /// `disco.net.` filter; `notdisco.net.` does not).
    pub fn matches(&self, question: &Question) -> bool {
        if !question.qname.eq_or_subdomain_of(&self.domain) {
            return false;
        }
        self.qtypes.is_empty() || self.qtypes.contains(&question.qtype)
    }
}

impl FromStr for QueryFilter {
    type Err = ParseError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let (domain, types) = match text.split_once(':') {
            Some(parts) => parts,
            None => return Err(ParseError::Syntax),
        };
        if types.contains(':') {
            return Err(ParseError::Syntax);
        }

        let domain = domain.parse::<Name>().map_err(ParseError::InvalidDomain)?;
        let mut qtypes = Vec::new();
        for qtype in types.split(',').filter(|t| !t.is_empty()) {
            qtypes.push(
                qtype
                    .parse::<Qtype>()
                    .map_err(|_| ParseError::UnknownType(qtype.to_owned()))?,
            );
        }
        Ok(Self { domain, qtypes })
    }
}

impl fmt::Display for QueryFilter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:", self.domain)?;
        for (i, qtype) in self.qtypes.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{qtype}")?;
        }
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////
// THE FILTERER                                                       //
////////////////////////////////////////////////////////////////////////

/// The accept/reject policy over a pair of filter lists.
#[derive(Clone, Debug, Default)]
pub struct QueryFilterer {
    accept: Vec<QueryFilter>,
    reject: Vec<QueryFilter>,
}

impl QueryFilterer {
    pub fn new(accept: Vec<QueryFilter>, reject: Vec<QueryFilter>) -> Self {
        Self { accept, reject }
    }

    /// Returns whether the given question should be accepted.
    pub fn should_accept(&self, question: &Question) -> bool {
        for filter in &self.reject {
            if filter.matches(question) {
                debug!("filter {filter} rejected {question}");
                return false;
            }
        }

        if self.accept.is_empty() {
            return true;
        }
        for filter in &self.accept {
            if filter.matches(question) {
                debug!("filter {filter} accepted {question}");
                return true;
            }
        }
        false
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// Errors that arise when parsing a [`QueryFilter`] from text.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ParseError {
    Syntax,
    InvalidDomain(crate::name::Error),
    UnknownType(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Syntax => f.write_str("filters take the form domain:type[,type...]"),
            Self::InvalidDomain(e) => write!(f, "invalid filter domain: {e}"),
            Self::UnknownType(t) => write!(f, "unknown query type '{t}'"),
        }
    }
}

impl std::error::Error for ParseError {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rr::Type;

    fn question(qname: &str, qtype: Qtype) -> Question {
        Question::new(qname.parse().unwrap(), qtype)
    }

    fn filter(text: &str) -> QueryFilter {
        text.parse().unwrap()
    }

    #[test]
    fn filters_parse_from_the_colon_syntax() {
        assert!(filter("disco.net:").matches(&question("foo.disco.net.", Type::A.into())));
        assert!(filter(":TXT").matches(&question("anything.", Type::TXT.into())));
        assert!(!filter(":TXT").matches(&question("anything.", Type::A.into())));
        assert!(
            filter("disco.net:A,AAAA").matches(&question("foo.disco.net.", Type::AAAA.into()))
        );
    }

    #[test]
    fn malformed_filters_are_errors() {
        assert_eq!("disco.net".parse::<QueryFilter>(), Err(ParseError::Syntax));
        assert_eq!("a:b:c".parse::<QueryFilter>(), Err(ParseError::Syntax));
        assert!(matches!(
            "disco.net:BOGUS".parse::<QueryFilter>(),
            Err(ParseError::UnknownType(_))
        ));
    }

    #[test]
    fn domain_matching_is_label_wise() {
        let f = filter("disco.net:");
        assert!(f.matches(&question("disco.net.", Type::A.into())));
        assert!(f.matches(&question("deep.foo.disco.net.", Type::A.into())));
        assert!(!f.matches(&question("notdisco.net.", Type::A.into())));
    }

    #[test]
    fn no_filters_accept_everything() {
        let filterer = QueryFilterer::default();
        assert!(filterer.should_accept(&question("foo.disco.net.", Type::A.into())));
    }

    #[test]
    fn reject_filters_win() {
        let filterer = QueryFilterer::new(vec![filter("disco.net:")], vec![filter(":TXT")]);
        assert!(filterer.should_accept(&question("foo.disco.net.", Type::A.into())));
        assert!(!filterer.should_accept(&question("foo.disco.net.", Type::TXT.into())));
    }

    #[test]
    fn accept_filters_limit_when_present() {
        let filterer = QueryFilterer::new(vec![filter("disco.net:A")], Vec::new());
        assert!(filterer.should_accept(&question("foo.disco.net.", Type::A.into())));
        assert!(!filterer.should_accept(&question("foo.disco.net.", Type::AAAA.into())));
        assert!(!filterer.should_accept(&question("foo.other.org.", Type::A.into())));
    }

    #[test]
    fn any_accept_filter_suffices() {
        let filterer = QueryFilterer::new(
            vec![filter("disco.net:A"), filter("other.org:")],
            Vec::new(),
        );
        assert!(filterer.should_accept(&question("foo.other.org.", Type::SRV.into())));
    }
}
