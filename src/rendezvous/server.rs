// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Rendezvous control-plane listener: one TCP accept loop, one thread per
//! connection, a single request line in and a `key=value` response out.
//!
//! This is the transport's only network-reachable surface and also
//! answers `/<prefix>/stats` and `/<prefix>/peers`, since nothing else
//! in scope exposes anything operators can poll.

use super::protocol::{encode_response, Request};
use crate::error::{Error, Result};
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Handles one decoded rendezvous request and produces its response body.
pub trait RendezvousHandler: Send + Sync {
    fn handle(&self, req: &Request) -> Result<Vec<(String, String)>>;
}

/// The rendezvous control-plane TCP server.
pub struct RendezvousServer {
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<thread::JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl RendezvousServer {
    /// Binds and starts accepting connections in a background thread.
    pub fn bind(bind_addr: &str, port: u16, handler: Arc<dyn RendezvousHandler>) -> Result<RendezvousServer> {
        let addr: SocketAddr = format!("{bind_addr}:{port}")
            .parse()
            .map_err(|e| Error::InvalidArgument(format!("invalid rendezvous bind address: {e}")))?;

        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(128)?;
        let listener: TcpListener = socket.into();
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let accept_thread = {
            let shutdown = shutdown.clone();
            thread::spawn(move || accept_loop(listener, shutdown, handler))
        };

        Ok(RendezvousServer {
            shutdown,
            accept_thread: Some(accept_thread),
            local_addr,
        })
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

impl Drop for RendezvousServer {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

fn accept_loop(listener: TcpListener, shutdown: Arc<AtomicBool>, handler: Arc<dyn RendezvousHandler>) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        match listener.accept() {
            Ok((stream, _addr)) => {
                let handler = handler.clone();
                thread::spawn(move || handle_client(stream, handler.as_ref()));
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(10));
            }
            Err(e) => {
                log::warn!("rendezvous accept failed: {e}");
            }
        }
    }
}

fn handle_client(stream: TcpStream, handler: &dyn RendezvousHandler) {
    let _ = stream.set_nodelay(true);
    let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
    let mut reader = BufReader::new(stream.try_clone().expect("clone tcp stream for read"));
    let mut writer = stream;

    let mut line = String::new();
    if reader.read_line(&mut line).is_err() || line.is_empty() {
        return;
    }

    let response = match Request::parse(&line) {
        Ok(req) => match handler.handle(&req) {
            Ok(pairs) => format!("ok\n{}\n", encode_response(&pairs)),
            Err(e) => {
                log::warn!("rendezvous request from {peer} failed: {e}");
                format!("error {e}\n")
            }
        },
        Err(e) => {
            log::warn!("malformed rendezvous request from {peer}: {e}");
            format!("error {e}\n")
        }
    };

    let _ = writer.write_all(response.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpStream as ClientStream;

    struct EchoHandler;

    impl RendezvousHandler for EchoHandler {
        fn handle(&self, req: &Request) -> Result<Vec<(String, String)>> {
            if req.action == "fail" {
                return Err(Error::InvalidArgument("forced failure".into()));
            }
            Ok(req.params.clone())
        }
    }

    #[test]
    fn round_trips_a_connect_request() {
        let server = RendezvousServer::bind("127.0.0.1", 0, Arc::new(EchoHandler)).unwrap();
        let addr = server.local_addr();

        let mut stream = ClientStream::connect(addr).unwrap();
        stream.write_all(b"/verbs/connect?host=node03&port=7400\n").unwrap();
        stream.shutdown(std::net::Shutdown::Write).unwrap();

        let mut body = String::new();
        stream.read_to_string(&mut body).unwrap();
        assert!(body.starts_with("ok\n"));
        assert!(body.contains("host=node03"));
        assert!(body.contains("port=7400"));
    }

    #[test]
    fn reports_handler_errors() {
        let server = RendezvousServer::bind("127.0.0.1", 0, Arc::new(EchoHandler)).unwrap();
        let addr = server.local_addr();

        let mut stream = ClientStream::connect(addr).unwrap();
        stream.write_all(b"/verbs/fail\n").unwrap();
        stream.shutdown(std::net::Shutdown::Write).unwrap();

        let mut body = String::new();
        stream.read_to_string(&mut body).unwrap();
        assert!(body.starts_with("error"));
    }
}
