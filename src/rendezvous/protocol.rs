// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The rendezvous control-plane's wire protocol: a single HTTP-style
//! request line in, a newline-delimited `key=value` list or a bare
//! status line out.

use crate::error::{Error, Result};

/// A parsed rendezvous request line, e.g.
/// `/verbs/connect?host=node03&port=7400&lid=4`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub prefix: String,
    pub action: String,
    pub params: Vec<(String, String)>,
}

impl Request {
    /// Parses a single request line (without the trailing newline).
    pub fn parse(line: &str) -> Result<Request> {
        let line = line.trim();
        let (path, query) = match line.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (line, None),
        };
        let path = path.strip_prefix('/').unwrap_or(path);
        let (prefix, action) = path
            .rsplit_once('/')
            .ok_or_else(|| Error::InvalidArgument(format!("malformed rendezvous request: {line}")))?;
        if prefix.is_empty() || action.is_empty() {
            return Err(Error::InvalidArgument(format!("malformed rendezvous request: {line}")));
        }
        let params = query.map(parse_params).transpose()?.unwrap_or_default();
        Ok(Request {
            prefix: prefix.to_string(),
            action: action.to_string(),
            params,
        })
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

fn parse_params(s: &str) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for pair in s.split('&').filter(|p| !p.is_empty()) {
        let (k, v) = pair
            .split_once('=')
            .ok_or_else(|| Error::InvalidArgument(format!("malformed query pair: {pair}")))?;
        out.push((k.to_string(), v.to_string()));
    }
    Ok(out)
}

/// Builds the request line for `connect`, the only request the client
/// side ever issues on its own initiative.
#[must_use]
pub fn connect_request_line(prefix: &str, params: &[(&str, String)]) -> String {
    let query = params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    format!("/{prefix}/connect?{query}")
}

/// Encodes a response body as a newline-delimited `key=value` list.
#[must_use]
pub fn encode_response(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Decodes a newline-delimited `key=value` response body.
pub fn decode_response(body: &str) -> Vec<(String, String)> {
    body.lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_connect_request_with_params() {
        let req = Request::parse("/verbs/connect?host=node03&port=7400").unwrap();
        assert_eq!(req.prefix, "verbs");
        assert_eq!(req.action, "connect");
        assert_eq!(req.get("host"), Some("node03"));
        assert_eq!(req.get("port"), Some("7400"));
    }

    #[test]
    fn parses_request_with_no_params() {
        let req = Request::parse("/mpi/stats").unwrap();
        assert_eq!(req.action, "stats");
        assert!(req.params.is_empty());
    }

    #[test]
    fn rejects_request_missing_prefix() {
        assert!(Request::parse("connect").is_err());
    }

    #[test]
    fn response_round_trips_through_wire_encoding() {
        let pairs = vec![
            ("qpn".to_string(), "1234".to_string()),
            ("lid".to_string(), "4".to_string()),
        ];
        let encoded = encode_response(&pairs);
        let decoded = decode_response(&encoded);
        assert_eq!(decoded, pairs);
    }

    #[test]
    fn connect_request_line_matches_the_documented_grammar() {
        let line = connect_request_line("verbs", &[("host", "node03".into()), ("port", "7400".into())]);
        assert_eq!(line, "/verbs/connect?host=node03&port=7400");
        let parsed = Request::parse(&line).unwrap();
        assert_eq!(parsed.get("host"), Some("node03"));
    }
}
