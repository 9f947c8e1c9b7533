//! Broker addresses.
//!
//! Supported forms:
//! * `tcp://host:port?options` and `ssl://host:port?options` for a single broker
//! * `failover:(uri1,uri2,...)?options`, also written `failover://(...)`
//! * `failover:uri1,uri2` and a bare `uri1,uri2` list, both with default failover options

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use anyhow::{anyhow, bail};

use crate::error::TransportError;

pub const DEFAULT_PORT: u16 = 61613;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Scheme {
    Tcp,
    Ssl,
}
impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::Ssl => "ssl",
        }
    }
}

/// The address of a single broker, together with the options for the connection to it
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EndpointUri {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub params: BTreeMap<String, String>,
}

impl EndpointUri {
    pub fn tcp(host: &str, port: u16) -> EndpointUri {
        EndpointUri {
            scheme: Scheme::Tcp,
            host: host.to_string(),
            port,
            params: Default::default(),
        }
    }

    /// `host:port` in a form suitable for connecting
    pub fn socket_address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        }
        else {
            format!("{}:{}", self.host, self.port)
        }
    }

    fn parse(s: &str) -> anyhow::Result<EndpointUri> {
        let s = s.trim();
        let (scheme, rest) = s.split_once("://")
            .ok_or_else(|| anyhow!("{:?} is not a broker URI", s))?;
        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "tcp" => Scheme::Tcp,
            "ssl" => Scheme::Ssl,
            other => bail!("unsupported URI scheme {:?}", other),
        };

        let (authority, query) = match rest.split_once('?') {
            Some((authority, query)) => (authority, Some(query)),
            None => (rest, None),
        };
        let authority = authority.trim_end_matches('/');

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, after) = bracketed.split_once(']')
                .ok_or_else(|| anyhow!("unterminated IPv6 address in {:?}", s))?;
            match after.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if after.is_empty() => (host, None),
                None => bail!("unexpected {:?} after IPv6 address in {:?}", after, s),
            }
        }
        else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            bail!("no host in {:?}", s);
        }
        let port = match port {
            Some(port) => port.parse()
                .map_err(|e| anyhow!("invalid port {:?} in {:?}: {}", port, s, e))?,
            None => DEFAULT_PORT,
        };

        Ok(EndpointUri {
            scheme,
            host: host.to_string(),
            port,
            params: parse_query(query)?,
        })
    }
}

impl Display for EndpointUri {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.socket_address())?;
        write_query(f, &self.params)
    }
}


#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BrokerUri {
    Single(EndpointUri),
    Failover {
        uris: Vec<EndpointUri>,
        params: BTreeMap<String, String>,
    },
}

impl FromStr for BrokerUri {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_broker_uri(s)
            .map_err(|e| TransportError::Config(format!("{:#}", e)))
    }
}

impl Display for BrokerUri {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerUri::Single(uri) => write!(f, "{}", uri),
            BrokerUri::Failover { uris, params } => {
                write!(f, "failover:(")?;
                for (i, uri) in uris.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", uri)?;
                }
                write!(f, ")")?;
                write_query(f, params)
            }
        }
    }
}

fn parse_broker_uri(s: &str) -> anyhow::Result<BrokerUri> {
    let s = s.trim();

    let failover_part = match s.get(..9) {
        Some(prefix) if prefix.eq_ignore_ascii_case("failover:") => Some(&s[9..]),
        _ => None,
    };

    match failover_part {
        Some(rest) => {
            let rest = rest.strip_prefix("//").unwrap_or(rest);
            let (list, query) = match rest.strip_prefix('(') {
                Some(inner) => {
                    let close = inner.rfind(')')
                        .ok_or_else(|| anyhow!("unbalanced parentheses in {:?}", s))?;
                    let after = &inner[close + 1..];
                    let query = match after.strip_prefix('?') {
                        Some(query) => Some(query),
                        None if after.is_empty() => None,
                        None => bail!("unexpected {:?} after failover address list", after),
                    };
                    (&inner[..close], query)
                }
                None => (rest, None),
            };

            Ok(BrokerUri::Failover {
                uris: parse_list(list)?,
                params: parse_query(query)?,
            })
        }
        None if s.contains(',') => Ok(BrokerUri::Failover {
            uris: parse_list(s)?,
            params: Default::default(),
        }),
        None => Ok(BrokerUri::Single(EndpointUri::parse(s)?)),
    }
}

fn parse_list(list: &str) -> anyhow::Result<Vec<EndpointUri>> {
    let uris = list.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(EndpointUri::parse)
        .collect::<anyhow::Result<Vec<_>>>()?;
    if uris.is_empty() {
        bail!("no broker addresses in {:?}", list);
    }
    Ok(uris)
}

fn parse_query(query: Option<&str>) -> anyhow::Result<BTreeMap<String, String>> {
    let mut result = BTreeMap::new();
    let Some(query) = query else {
        return Ok(result);
    };

    for part in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = part.split_once('=').unwrap_or((part, ""));
        if key.is_empty() {
            bail!("empty option name in {:?}", query);
        }
        result.insert(key.to_string(), value.to_string());
    }
    Ok(result)
}

fn write_query(f: &mut Formatter<'_>, params: &BTreeMap<String, String>) -> std::fmt::Result {
    for (i, (key, value)) in params.iter().enumerate() {
        write!(f, "{}{}={}", if i == 0 { '?' } else { '&' }, key, value)?;
    }
    Ok(())
}
