//! Connection parameters and their three surface forms.
//!
//! A connection target can be described as
//!
//! - parallel keyword/value arrays ([`ConnectionParameters::from_arrays`]),
//! - a `keyword = value` string (`host=a,b port=7070 user=admin`),
//! - a URI (`clusterwire://admin@a:7070,b:7071/ops?connect_timeout=10`).
//!
//! [`ConnectionParameters::parse`] accepts either string form. All of them
//! normalize into the same [`ConnectionParameters`] mapping, which
//! [`ConnectionParameters::add_defaults`] completes from the environment and
//! compiled defaults, and [`ConnectionParameters::resolve_target`] turns into
//! an ordered host plan.

use std::env;
use std::fmt::Write as _;

use chainerror::*;

use crate::buffer::ExpandableBuffer;
use crate::error::*;

mod hosts;
mod keyword;
mod passfile;
mod uri;

pub use self::hosts::{ConnectionTarget, HostEntry, HostKind, SslMode, DEFAULT_HOST, DEFAULT_PORT};
pub use self::uri::{percent_decode, URI_DESIGNATORS};

/// One entry of the option table.
#[derive(Debug)]
pub struct OptionSpec {
    pub keyword: &'static str,
    pub env_var: Option<&'static str>,
    pub default: Option<&'static str>,
    /// Value is secret and must not be echoed.
    pub secret: bool,
}

const fn opt(
    keyword: &'static str,
    env_var: Option<&'static str>,
    default: Option<&'static str>,
) -> OptionSpec {
    OptionSpec {
        keyword,
        env_var,
        default,
        secret: false,
    }
}

/// Every option known to the resolver, in serialization order.
pub static OPTIONS: &[OptionSpec] = &[
    opt("user", Some("CLUSTER_USER"), None),
    OptionSpec {
        keyword: "password",
        env_var: Some("CLUSTER_PASSWORD"),
        default: None,
        secret: true,
    },
    opt("passfile", Some("CLUSTER_PASSFILE"), None),
    opt("host", Some("CLUSTER_HOST"), Some(hosts::DEFAULT_HOST)),
    opt("hostaddr", Some("CLUSTER_HOSTADDR"), None),
    opt("port", Some("CLUSTER_PORT"), Some(hosts::DEFAULT_PORT_STR)),
    opt("dbname", Some("CLUSTER_DATABASE"), None),
    opt("connect_timeout", Some("CLUSTER_CONNECT_TIMEOUT"), None),
    opt("options", Some("CLUSTER_OPTIONS"), None),
    opt("application_name", Some("CLUSTER_APPNAME"), None),
    opt("client_encoding", Some("CLUSTER_CLIENTENCODING"), None),
    opt("keepalives", None, Some("1")),
    opt("keepalives_idle", None, None),
    opt("tcp_user_timeout", Some("CLUSTER_TCP_USER_TIMEOUT"), None),
    opt("sslmode", Some("CLUSTER_SSLMODE"), Some("disable")),
    opt("sslrootcert", Some("CLUSTER_SSLROOTCERT"), None),
    opt("requirepeer", Some("CLUSTER_REQUIREPEER"), None),
];

fn option_index(keyword: &str) -> Option<usize> {
    OPTIONS.iter().position(|o| o.keyword == keyword)
}

/// Option keyword → current value mapping, one slot per [`OPTIONS`] entry.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionParameters {
    values: Vec<Option<String>>,
}

impl ConnectionParameters {
    /// A mapping with every option unset.
    pub fn new() -> Self {
        ConnectionParameters {
            values: vec![None; OPTIONS.len()],
        }
    }

    /// Build from parallel keyword/value arrays.
    ///
    /// Unknown keywords are ignored, empty values count as absent, and the
    /// shorter of the two arrays bounds the iteration.
    pub fn from_arrays<K: AsRef<str>, V: AsRef<str>>(keywords: &[K], values: &[V]) -> Self {
        let mut params = ConnectionParameters::new();
        for (k, v) in keywords.iter().zip(values.iter()) {
            let v = v.as_ref();
            if v.is_empty() {
                continue;
            }
            if let Some(idx) = option_index(k.as_ref()) {
                params.values[idx] = Some(v.to_string());
            }
        }
        params
    }

    /// Parse a `keyword = value` string or, if it starts with one of the
    /// [`URI_DESIGNATORS`], a URI.
    pub fn parse(conninfo: &str) -> Result<Self> {
        if uri::uri_prefix_length(conninfo).is_some() {
            uri::parse_uri(conninfo)
        } else {
            keyword::parse_keywords(conninfo)
        }
    }

    pub fn get(&self, keyword: &str) -> Option<&str> {
        option_index(keyword).and_then(|idx| self.values[idx].as_deref())
    }

    /// Store `value` under `keyword`. Unknown keywords are rejected.
    pub fn set(&mut self, keyword: &str, value: &str) -> Result<()> {
        match option_index(keyword) {
            Some(idx) => {
                self.values[idx] = Some(value.to_string());
                Ok(())
            }
            None => Err(cherr!(ErrorKind::InvalidOption(format!(
                "invalid connection option \"{}\"",
                keyword
            )))),
        }
    }

    pub fn unset(&mut self, keyword: &str) {
        if let Some(idx) = option_index(keyword) {
            self.values[idx] = None;
        }
    }

    /// Set options as (keyword, value) pairs, in table order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> + '_ {
        OPTIONS
            .iter()
            .zip(self.values.iter())
            .filter_map(|(o, v)| v.as_deref().map(|v| (o.keyword, v)))
    }

    /// Fill every unset option from its environment variable, then from its
    /// compiled default. Options with neither stay absent.
    pub fn add_defaults(&mut self) {
        self.add_defaults_with(|name| env::var(name).ok());
    }

    /// [`ConnectionParameters::add_defaults`] with an explicit environment
    /// lookup.
    pub fn add_defaults_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for (option, value) in OPTIONS.iter().zip(self.values.iter_mut()) {
            if value.is_some() {
                continue;
            }
            if let Some(from_env) = option.env_var.and_then(&lookup).filter(|v| !v.is_empty()) {
                *value = Some(from_env);
                continue;
            }
            if let Some(default) = option.default {
                *value = Some(default.to_string());
            }
        }
    }

    /// Serialize the set options as a `keyword='value'` string that parses
    /// back to an equal mapping.
    pub fn to_conninfo_string(&self) -> String {
        let mut buf = ExpandableBuffer::new();
        for (keyword, value) in self.iter() {
            if !buf.is_empty() {
                buf.append_char(' ');
            }
            let _ = write!(buf, "{}='", keyword);
            for c in value.chars() {
                if c == '\'' || c == '\\' {
                    buf.append_char('\\');
                }
                buf.append_char(c);
            }
            buf.append_char('\'');
        }
        buf.as_str().into_owned()
    }

    /// Validate the options and expand the host, hostaddr and port lists
    /// into the per-host connection plan.
    pub fn resolve_target(&self) -> Result<ConnectionTarget> {
        hosts::resolve_target(self)
    }
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        ConnectionParameters::new()
    }
}

impl std::fmt::Debug for ConnectionParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (option, value) in OPTIONS.iter().zip(self.values.iter()) {
            if let Some(v) = value {
                if option.secret {
                    map.entry(&option.keyword, &"********");
                } else {
                    map.entry(&option.keyword, v);
                }
            }
        }
        map.finish()
    }
}

impl std::str::FromStr for ConnectionParameters {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ConnectionParameters::parse(s)
    }
}
