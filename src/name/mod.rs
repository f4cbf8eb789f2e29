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

//! Implementation of data structures related to domain names.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

mod error;
pub use error::Error;

/// The maximum number of octets in the textual representation of a
/// domain name that we will accept. (The wire limit is 255 octets; the
/// presentation form of a maximal name is slightly shorter, but being a
/// little lax here does no harm, since we never serialize names to the
/// wire.)
const MAX_NAME_LEN: usize = 255;

/// The maximum length of a label in a domain name.
const MAX_LABEL_LEN: usize = 63;

////////////////////////////////////////////////////////////////////////
// NAME STRUCTURE                                                     //
////////////////////////////////////////////////////////////////////////

/// A structure to represent a domain name.
///
/// A `Name` is a sequence of labels and is always fully qualified; the
/// root label is implied and not stored. Comparison and hashing are
/// ASCII-case-insensitive, per [RFC 1035 § 2.3.3]. The case of the
/// labels as originally written is preserved, which lets response
/// records echo the case of the question; [`Name::canonical`] returns
/// the lowercased form used at every storage boundary.
///
/// `Name`s are constructed through the [`FromStr`] implementation.
/// Both `"foo.disco.net."` and `"foo.disco.net"` are accepted (the
/// trailing root dot is implied), and `""` and `"."` both denote the
/// root.
///
/// [RFC 1035 § 2.3.3]: https://datatracker.ietf.org/doc/html/rfc1035#section-2.3.3
#[derive(Clone, Eq)]
pub struct Name {
    labels: Vec<Box<str>>,
}

impl Name {
    /// Returns the root name `.`.
    pub fn root() -> Self {
        Self { labels: Vec::new() }
    }

    /// Returns the number of labels in this `Name`, not counting the
    /// implied root label.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Returns whether the `Name` is the DNS root `.`.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Returns whether the `Name` is the DNS root `.`.
    pub fn is_root(&self) -> bool {
        self.labels.is_empty()
    }

    /// Returns an iterator over the labels of this `Name`, leftmost
    /// (deepest) label first.
    pub fn labels(&self) -> impl DoubleEndedIterator<Item = &str> + ExactSizeIterator + '_ {
        self.labels.iter().map(Box::as_ref)
    }

    /// Returns whether this `Name` is equal to or a subdomain of
    /// `other`. The comparison is ASCII-case-insensitive.
    pub fn eq_or_subdomain_of(&self, other: &Name) -> bool {
        self.len() >= other.len()
            && self
                .labels()
                .rev()
                .zip(other.labels().rev())
                .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }

    /// Returns the parent of this `Name`, or [`None`] if it is the
    /// root.
    pub fn parent(&self) -> Option<Name> {
        if self.is_root() {
            None
        } else {
            Some(Name {
                labels: self.labels[1..].to_vec(),
            })
        }
    }

    /// Returns an iterator walking from this `Name` up to the root,
    /// inclusive of both.
    pub fn ancestors(&self) -> Ancestors {
        Ancestors {
            next: Some(self.clone()),
        }
    }

    /// Returns the wildcard domain name `*.<self>`.
    pub fn wildcard(&self) -> Name {
        let mut labels = Vec::with_capacity(self.labels.len() + 1);
        labels.push("*".into());
        labels.extend_from_slice(&self.labels);
        Name { labels }
    }

    /// Returns the lowercased form of this `Name`.
    pub fn canonical(&self) -> Name {
        Name {
            labels: self
                .labels
                .iter()
                .map(|l| l.to_ascii_lowercase().into_boxed_str())
                .collect(),
        }
    }
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        self.labels.len() == other.labels.len()
            && self
                .labels()
                .zip(other.labels())
                .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }
}

impl Hash for Name {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for label in self.labels() {
            for octet in label.bytes() {
                state.write_u8(octet.to_ascii_lowercase());
            }
            state.write_u8(0);
        }
    }
}

impl FromStr for Name {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        if text.is_empty() || text == "." {
            return Ok(Self::root());
        }
        if text.len() > MAX_NAME_LEN {
            return Err(Error::NameTooLong);
        }

        let unqualified = text.strip_suffix('.').unwrap_or(text);
        let mut labels = Vec::new();
        for label in unqualified.split('.') {
            if label.is_empty() {
                return Err(Error::EmptyLabel);
            }
            if label.len() > MAX_LABEL_LEN {
                return Err(Error::LabelTooLong);
            }
            if !label.bytes().all(|b| b.is_ascii_graphic()) {
                return Err(Error::InvalidOctet);
            }
            labels.push(label.into());
        }
        Ok(Self { labels })
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_root() {
            f.write_str(".")
        } else {
            for label in self.labels() {
                write!(f, "{label}.")?;
            }
            Ok(())
        }
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self}")
    }
}

////////////////////////////////////////////////////////////////////////
// ANCESTOR ITERATION                                                 //
////////////////////////////////////////////////////////////////////////

/// An iterator over a [`Name`] and its ancestors up to and including
/// the root. Returned by [`Name::ancestors`].
pub struct Ancestors {
    next: Option<Name>,
}

impl Iterator for Ancestors {
    type Item = Name;

    fn next(&mut self) -> Option<Name> {
        let current = self.next.take()?;
        self.next = current.parent();
        Some(current)
    }
}

impl std::iter::FusedIterator for Ancestors {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
