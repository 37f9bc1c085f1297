// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! URL parsing: `scheme://host:port[/path][?k=v&k=v…]`, with resolution
//! to a [`Pid`](crate::core::pid::Pid).

use crate::core::pid::Pid;
use crate::error::{Error, Result};
use std::net::{Ipv4Addr, ToSocketAddrs};

/// A parsed transport URL.
///
/// Query parameters are kept as an insertion-ordered list (not a map)
/// because the same key may legitimately repeat, and callers may care
/// about order (e.g. provider fallback lists).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    pub path: Option<String>,
    pub query: Vec<(String, String)>,
}

impl Url {
    /// Parses `scheme://host[:port][/path][?k=v&k=v…]`.
    pub fn parse(s: &str) -> Result<Url> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| Error::MalformedUrl(s.to_string()))?;
        if scheme.is_empty() {
            return Err(Error::MalformedUrl(s.to_string()));
        }

        let (authority_and_path, query_str) = match rest.split_once('?') {
            Some((a, q)) => (a, Some(q)),
            None => (rest, None),
        };

        let (authority, path) = match authority_and_path.split_once('/') {
            Some((a, p)) => (a, Some(format!("/{p}"))),
            None => (authority_and_path, None),
        };

        if authority.is_empty() {
            return Err(Error::MalformedUrl(s.to_string()));
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) => {
                let port: u32 = p
                    .parse()
                    .map_err(|_| Error::MalformedUrl(format!("bad port in {s}")))?;
                if port >= 65536 {
                    return Err(Error::MalformedUrl(format!("port out of range in {s}")));
                }
                (h.to_string(), Some(port as u16))
            }
            None => (authority.to_string(), None),
        };

        if host.is_empty() {
            return Err(Error::MalformedUrl(s.to_string()));
        }

        let query = query_str
            .map(parse_query)
            .transpose()?
            .unwrap_or_default();

        Ok(Url {
            scheme: scheme.to_string(),
            host,
            port,
            path,
            query,
        })
    }

    /// Resolves the host to an IPv4 address (blocking DNS permitted) and
    /// packs it with the port into a [`Pid`].
    pub fn to_pid(&self) -> Result<Pid> {
        let port = self.port.unwrap_or(0);
        let addr = self.resolve_ipv4()?;
        Ok(Pid::pack(addr, port))
    }

    fn resolve_ipv4(&self) -> Result<Ipv4Addr> {
        if let Ok(addr) = self.host.parse::<Ipv4Addr>() {
            return Ok(addr);
        }
        let lookup = format!("{}:0", self.host);
        let resolved = lookup
            .to_socket_addrs()
            .map_err(|_| Error::MalformedUrl(format!("unresolvable host: {}", self.host)))?
            .find_map(|sa| match sa {
                std::net::SocketAddr::V4(v4) => Some(*v4.ip()),
                std::net::SocketAddr::V6(_) => None,
            });
        resolved.ok_or_else(|| Error::MalformedUrl(format!("unresolvable host: {}", self.host)))
    }

    /// Returns the first value for a query key, if present.
    #[must_use]
    pub fn query_get(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

fn parse_query(s: &str) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for pair in s.split('&').filter(|p| !p.is_empty()) {
        let (k, v) = pair
            .split_once('=')
            .ok_or_else(|| Error::MalformedUrl(format!("malformed query pair: {pair}")))?;
        out.push((k.to_string(), v.to_string()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scheme_host_port() {
        let url = Url::parse("verbs://10.0.0.5:9000").unwrap();
        assert_eq!(url.scheme, "verbs");
        assert_eq!(url.host, "10.0.0.5");
        assert_eq!(url.port, Some(9000));
        assert!(url.path.is_none());
    }

    #[test]
    fn parses_path_and_query_preserving_order() {
        let url = Url::parse("mpi://node03:7400/connect?host=node03&port=7400").unwrap();
        assert_eq!(url.path.as_deref(), Some("/connect"));
        assert_eq!(
            url.query,
            vec![
                ("host".to_string(), "node03".to_string()),
                ("port".to_string(), "7400".to_string()),
            ]
        );
    }

    #[test]
    fn rejects_out_of_range_port() {
        assert!(Url::parse("verbs://10.0.0.5:70000").is_err());
    }

    #[test]
    fn rejects_missing_scheme_separator() {
        assert!(Url::parse("10.0.0.5:9000").is_err());
    }

    #[test]
    fn rejects_empty_host() {
        assert!(Url::parse("verbs://:9000").is_err());
    }

    #[test]
    fn to_pid_is_deterministic_for_ip_literal_host() {
        let a = Url::parse("verbs://10.0.0.5:9000").unwrap().to_pid().unwrap();
        let b = Url::parse("verbs://10.0.0.5:9000").unwrap().to_pid().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_urls_yield_distinct_pids() {
        let a = Url::parse("verbs://10.0.0.5:9000").unwrap().to_pid().unwrap();
        let b = Url::parse("verbs://10.0.0.6:9000").unwrap().to_pid().unwrap();
        assert_ne!(a, b);
    }
}
