// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Rendezvous client: issues a `connect` request against a peer's
//! control-plane listener, retrying with a fixed budget and back-off
//! (default 5 attempts, 1-second back-off, §4.12).

use super::protocol::decode_response;
use crate::error::{Error, Result};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

/// Drives the retry/back-off policy around a single rendezvous exchange.
pub struct RendezvousClient {
    retry_budget: u32,
    backoff: Duration,
    connect_timeout: Duration,
}

impl RendezvousClient {
    #[must_use]
    pub fn new(retry_budget: u32, backoff: Duration) -> RendezvousClient {
        RendezvousClient {
            retry_budget,
            backoff,
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Sends `request_line` to `addr` and returns the decoded `key=value`
    /// response, retrying on transient failure up to the configured budget.
    pub fn request(&self, addr: SocketAddr, request_line: &str) -> Result<Vec<(String, String)>> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.try_once(addr, request_line) {
                Ok(pairs) => return Ok(pairs),
                Err(e) if attempts >= self.retry_budget.max(1) => {
                    log::warn!("rendezvous with {addr} exhausted after {attempts} attempts: {e}");
                    return Err(Error::RendezvousExhausted {
                        target: addr.to_string(),
                        attempts,
                    });
                }
                Err(e) => {
                    log::debug!("rendezvous attempt {attempts} to {addr} failed: {e}, retrying");
                    std::thread::sleep(self.backoff);
                }
            }
        }
    }

    fn try_once(&self, addr: SocketAddr, request_line: &str) -> Result<Vec<(String, String)>> {
        let mut stream = TcpStream::connect_timeout(&addr, self.connect_timeout)?;
        stream.set_nodelay(true).ok();
        let mut line = request_line.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        stream.write_all(line.as_bytes())?;
        stream.shutdown(std::net::Shutdown::Write).ok();

        let mut body = String::new();
        stream.read_to_string(&mut body)?;

        if let Some(rest) = body.strip_prefix("ok\n") {
            Ok(decode_response(rest))
        } else if let Some(reason) = body.strip_prefix("error ") {
            Err(Error::ConnectionFailed {
                peer: addr.to_string(),
                reason: reason.trim().to_string(),
            })
        } else {
            Err(Error::ConnectionFailed {
                peer: addr.to_string(),
                reason: "malformed rendezvous response".into(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendezvous::server::{RendezvousHandler, RendezvousServer};
    use crate::rendezvous::protocol::Request;
    use std::sync::Arc;

    struct FlakyHandler;

    impl RendezvousHandler for FlakyHandler {
        fn handle(&self, req: &Request) -> Result<Vec<(String, String)>> {
            Ok(req.params.clone())
        }
    }

    #[test]
    fn successful_request_returns_decoded_pairs() {
        let server = RendezvousServer::bind("127.0.0.1", 0, Arc::new(FlakyHandler)).unwrap();
        let client = RendezvousClient::new(3, Duration::from_millis(1));
        let pairs = client
            .request(server.local_addr(), "/verbs/connect?host=node03&port=7400")
            .unwrap();
        assert!(pairs.contains(&("host".to_string(), "node03".to_string())));
    }

    #[test]
    fn exhausts_retry_budget_against_a_dead_port() {
        let dead_addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let client = RendezvousClient::new(2, Duration::from_millis(1));
        let result = client.request(dead_addr, "/verbs/connect?host=x&port=1");
        assert!(matches!(result, Err(Error::RendezvousExhausted { attempts: 2, .. })));
    }
}
