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

//! The engine's configuration surface.
//!
//! [`Config`] is the typed form of the knobs the engine recognises.
//! It derives [`serde::Deserialize`] with defaults for every field, so
//! an embedding daemon can load it straight from its TOML
//! configuration file (or fill it from command-line flags). Transport
//! concerns (listen addresses, ports, socket timeouts, the KV
//! endpoints themselves) belong to the embedder and are not
//! represented here.
//!
//! The string-valued fields (`accept`/`reject` filters, `tsig`
//! secrets, `unauthenticated_zones`) keep the operator-facing syntax
//! and are parsed into their runtime forms by the accessor methods;
//! all parse failures surface as [`ConfigError`] so a daemon can
//! refuse to start on a bad configuration rather than silently
//! dropping an entry.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::Deserialize;

use crate::filter::{self, QueryFilter, QueryFilterer};
use crate::name::{self, Name};
use crate::rr::Ttl;

////////////////////////////////////////////////////////////////////////
// CONFIGURATION                                                      //
////////////////////////////////////////////////////////////////////////

/// The engine configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The KV key prefix under which all DNS data lives.
    pub prefix: String,

    /// The TTL returned for records without an explicit TTL override.
    pub default_ttl: u32,

    /// The response cache TTL, in seconds. Zero disables the cache.
    pub cache_ttl: u64,

    /// Accept filters, as `domain:type[,type…]` strings.
    pub accept: Vec<String>,

    /// Reject filters, as `domain:type[,type…]` strings.
    pub reject: Vec<String>,

    /// TSIG secrets, as `zone:secret` strings. The transport layer
    /// uses these to verify signatures; the key name must equal the
    /// zone being updated.
    pub tsig: Vec<String>,

    /// Zones that accept dynamic updates without a TSIG signature.
    pub unauthenticated_zones: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            default_ttl: 300,
            cache_ttl: 0,
            accept: Vec::new(),
            reject: Vec::new(),
            tsig: Vec::new(),
            unauthenticated_zones: Vec::new(),
        }
    }
}

impl Config {
    pub fn default_ttl(&self) -> Ttl {
        Ttl::from(self.default_ttl)
    }

    /// Parses the accept/reject filter strings into a
    /// [`QueryFilterer`].
    pub fn query_filterer(&self) -> Result<QueryFilterer, ConfigError> {
        Ok(QueryFilterer::new(
            parse_filters(&self.accept)?,
            parse_filters(&self.reject)?,
        ))
    }

    /// Parses the `zone:secret` strings into a map from zone name to
    /// base64 TSIG secret.
    pub fn tsig_secrets(&self) -> Result<HashMap<Name, String>, ConfigError> {
        let mut secrets = HashMap::with_capacity(self.tsig.len());
        for entry in &self.tsig {
            let (zone, secret) = entry
                .split_once(':')
                .ok_or_else(|| ConfigError::TsigSyntax(entry.clone()))?;
            if secret.is_empty() {
                return Err(ConfigError::TsigSyntax(entry.clone()));
            }
            let zone = parse_zone(zone)?;
            secrets.insert(zone, secret.to_owned());
        }
        Ok(secrets)
    }

    /// Parses the unauthenticated zone names.
    pub fn unauthenticated_zone_set(&self) -> Result<HashSet<Name>, ConfigError> {
        self.unauthenticated_zones
            .iter()
            .map(|zone| parse_zone(zone))
            .collect()
    }
}

fn parse_filters(texts: &[String]) -> Result<Vec<QueryFilter>, ConfigError> {
    texts
        .iter()
        .map(|text| {
            text.parse::<QueryFilter>()
                .map_err(|error| ConfigError::Filter {
                    filter: text.clone(),
                    error,
                })
        })
        .collect()
}

fn parse_zone(zone: &str) -> Result<Name, ConfigError> {
    zone.parse::<Name>().map_err(|error| ConfigError::Zone {
        zone: zone.to_owned(),
        error,
    })
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// Errors found while parsing the string-valued configuration fields.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConfigError {
    Filter {
        filter: String,
        error: filter::ParseError,
    },
    TsigSyntax(String),
    Zone { zone: String, error: name::Error },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Filter { filter, error } => write!(f, "bad filter '{filter}': {error}"),
            Self::TsigSyntax(entry) => {
                write!(f, "bad TSIG secret '{entry}': expected zone:secret")
            }
            Self::Zone { zone, error } => write!(f, "bad zone name '{zone}': {error}"),
        }
    }
}

impl std::error::Error for ConfigError {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::question::Question;
    use crate::rr::Type;

    #[test]
    fn the_default_config_accepts_everything() {
        let config = Config::default();
        assert_eq!(config.default_ttl, 300);
        let filterer = config.query_filterer().unwrap();
        let question = Question::new("anything.".parse().unwrap(), Type::A.into());
        assert!(filterer.should_accept(&question));
    }

    #[test]
    fn configs_load_from_toml() {
        let config: Config = toml::from_str(
            r#"
            prefix = "dns"
            default_ttl = 60
            cache_ttl = 5
            accept = ["disco.net:A,AAAA"]
            reject = [":TXT"]
            tsig = ["disco.net.:c2VjcmV0"]
            unauthenticated_zones = ["internal.disco.net."]
            "#,
        )
        .unwrap();

        assert_eq!(config.prefix, "dns");
        assert_eq!(config.default_ttl(), Ttl::from(60));
        config.query_filterer().unwrap();

        let secrets = config.tsig_secrets().unwrap();
        let zone: Name = "disco.net.".parse().unwrap();
        assert_eq!(secrets.get(&zone).map(String::as_str), Some("c2VjcmV0"));

        let zones = config.unauthenticated_zone_set().unwrap();
        let open: Name = "internal.disco.net.".parse().unwrap();
        assert!(zones.contains(&open));
    }

    #[test]
    fn bad_filters_are_reported_with_their_text() {
        let config = Config {
            accept: vec!["no-colon".to_owned()],
            ..Config::default()
        };
        assert!(matches!(
            config.query_filterer(),
            Err(ConfigError::Filter { filter, .. }) if filter == "no-colon"
        ));
    }

    #[test]
    fn tsig_entries_need_a_zone_and_a_secret() {
        let config = Config {
            tsig: vec!["disco.net.".to_owned()],
            ..Config::default()
        };
        assert!(matches!(config.tsig_secrets(), Err(ConfigError::TsigSyntax(_))));

        let config = Config {
            tsig: vec!["disco.net.:".to_owned()],
            ..Config::default()
        };
        assert!(matches!(config.tsig_secrets(), Err(ConfigError::TsigSyntax(_))));
    }
}
