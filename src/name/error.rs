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

//! Implementation of the [`Error`] type for domain name parsing.

use std::fmt;

/// Errors that arise when parsing a [`Name`](super::Name) from text.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Error {
    EmptyLabel,
    LabelTooLong,
    NameTooLong,
    InvalidOctet,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::EmptyLabel => f.write_str("domain names cannot have empty labels"),
            Self::LabelTooLong => f.write_str("labels cannot exceed 63 octets"),
            Self::NameTooLong => f.write_str("the domain name is too long"),
            Self::InvalidOctet => f.write_str("labels must consist of graphic ASCII characters"),
        }
    }
}

impl std::error::Error for Error {}
