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

//! The codec between DNS owner names and KV keys.
//!
//! An owner name maps to a key by splitting on `.`, dropping empty
//! labels, lowercasing, reversing, and joining with `/`, so that the
//! KV tree mirrors the DNS tree: `foo.disco.net.` lives under
//! `net/disco/foo`, next to its siblings. An RRset's node is the
//! name's key plus a `/.<TYPE>` suffix, e.g. `net/disco/foo/.A`.

use crate::name::Name;
use crate::rr::Type;

/// Returns the KV key for a domain name, with `suffix` appended. The
/// name is canonicalised (lowercased) first, and the result never has
/// a leading slash.
pub fn name_to_key(name: &Name, suffix: &str) -> String {
    let mut key = String::new();
    for label in name.labels().rev() {
        if !key.is_empty() {
            key.push('/');
        }
        for c in label.chars() {
            key.push(c.to_ascii_lowercase());
        }
    }
    key.push_str(suffix);
    key
}

/// Returns the KV key for an RRset: the name's key plus `/.<TYPE>`.
pub fn rrset_key(name: &Name, rr_type: Type) -> String {
    name_to_key(name, &format!("/.{rr_type}"))
}

/// The inverse of [`name_to_key`], reconstructing the textual domain
/// name from a key. This is total (any key yields some string) and is
/// used only to make error messages and logs readable.
pub fn key_to_name(key: &str) -> String {
    let mut name = String::new();
    for segment in key.split('/').rev() {
        if !segment.is_empty() {
            name.push_str(segment);
            name.push('.');
        }
    }
    if name.is_empty() {
        name.push('.');
    }
    name
}

/// Joins the configured store prefix onto a key. An empty prefix
/// leaves the key untouched.
pub fn full_key(prefix: &str, key: &str) -> String {
    let key = key.trim_start_matches('/');
    if prefix.is_empty() {
        key.to_owned()
    } else {
        format!("{}/{}", prefix.trim_end_matches('/'), key)
    }
}

/// Returns the sub-key under which a record value is stored in the
/// directory layout. The MD5 of the value is used, making duplicate
/// records within an RRset impossible.
pub fn record_subkey(value: &str) -> String {
    format!("{:x}", md5::compute(value.as_bytes()))
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn name(from: &str) -> Name {
        from.parse().unwrap()
    }

    #[test]
    fn names_map_to_reversed_keys() {
        assert_eq!(name_to_key(&name("foo.disco.net."), ""), "net/disco/foo");
        assert_eq!(
            name_to_key(&name("foo.disco.net."), "/.A"),
            "net/disco/foo/.A"
        );
    }

    #[test]
    fn names_are_lowercased_in_keys() {
        assert_eq!(name_to_key(&name("FOO.Disco.NET."), ""), "net/disco/foo");
    }

    #[test]
    fn the_root_maps_to_the_bare_suffix() {
        assert_eq!(name_to_key(&Name::root(), "/.SOA"), "/.SOA");
        assert_eq!(full_key("dns", "/.SOA"), "dns/.SOA");
    }

    #[test]
    fn key_to_name_inverts_name_to_key() {
        for text in ["foo.disco.net.", "disco.net.", "a.b.c.d.e.", "."] {
            let key = name_to_key(&name(text), "");
            assert_eq!(key_to_name(&key), text.to_ascii_lowercase());
        }
    }

    #[test]
    fn rrset_keys_use_the_type_mnemonic() {
        assert_eq!(
            rrset_key(&name("bar.disco.net."), Type::AAAA),
            "net/disco/bar/.AAAA"
        );
    }

    #[test]
    fn prefixes_join_without_doubled_slashes() {
        assert_eq!(full_key("", "net/disco/.A"), "net/disco/.A");
        assert_eq!(full_key("dns/", "net/disco/.A"), "dns/net/disco/.A");
        assert_eq!(full_key("dns", "net/disco/.A"), "dns/net/disco/.A");
    }

    #[test]
    fn record_subkeys_are_md5_hex() {
        // Stable across versions: the subkey is part of the storage
        // contract.
        assert_eq!(record_subkey("1.2.3.4"), "6465ec74397c9126916786bbcd6d7601");
    }
}
