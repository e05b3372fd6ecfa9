//! One TCP socket to one graphd node
//!
//! A [`WireConnection`] owns at most one live socket. It frames nothing
//! itself (requests are already complete lines when they get here); its job
//! is blocking-with-timeout connect/send, and an incremental receive loop
//! that feeds the [`ReplyParser`] until a full frame is buffered.
//!
//! Lifecycle: Disconnected -> Connecting -> Connected -> Disconnected on any
//! I/O error or explicit close. A torn-down connection is never reused; the
//! connector constructs the next attempt from scratch. Every teardown also
//! resets the parser so a stale partial frame can never leak into the next
//! logical connection.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use crate::error::{GraphError, Result};
use crate::pool::Address;
use crate::reply::{Reply, ReplyParser};

const RECV_CHUNK: usize = 4096;

/// A computed timeout of exactly zero means the caller's deadline has
/// already elapsed. Reject it before any syscall.
fn preflight(timeout: Option<Duration>, what: &str) -> Result<()> {
    if timeout == Some(Duration::ZERO) {
        return Err(GraphError::Timeout(format!(
            "deadline elapsed before {}",
            what
        )));
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct WireConnection {
    stream: Option<TcpStream>,
    parser: ReplyParser,
    peer: Option<Address>,
}

impl WireConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn peer(&self) -> Option<&Address> {
        self.peer.as_ref()
    }

    /// Connect to one address. `None` timeout means no timeout (the
    /// `no_timeouts` debug flag); `Some(ZERO)` is rejected pre-flight.
    pub fn connect(&mut self, addr: &Address, timeout: Option<Duration>) -> Result<()> {
        preflight(timeout, "connect")?;
        self.teardown();

        let sockaddrs: Vec<_> = (addr.host.as_str(), addr.port)
            .to_socket_addrs()
            .map_err(|e| GraphError::Connection {
                addr: addr.to_string(),
                reason: format!("resolve failed: {}", e),
            })?
            .collect();
        let sockaddr = sockaddrs.first().ok_or_else(|| GraphError::Connection {
            addr: addr.to_string(),
            reason: "no usable socket address".to_string(),
        })?;

        let stream = match timeout {
            Some(t) => TcpStream::connect_timeout(sockaddr, t).map_err(|e| {
                if e.kind() == std::io::ErrorKind::TimedOut {
                    GraphError::Timeout(format!("connect to {}", addr))
                } else {
                    GraphError::Connection {
                        addr: addr.to_string(),
                        reason: e.to_string(),
                    }
                }
            })?,
            None => TcpStream::connect(sockaddr).map_err(|e| GraphError::Connection {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?,
        };

        // Always: the protocol is latency-sensitive request/response, never
        // bulk transfer.
        stream.set_nodelay(true).map_err(|e| GraphError::Connection {
            addr: addr.to_string(),
            reason: format!("set_nodelay: {}", e),
        })?;

        debug!(peer = %addr, "connected");
        self.stream = Some(stream);
        self.peer = Some(addr.clone());
        Ok(())
    }

    /// Send one complete request line.
    pub fn send(&mut self, bytes: &[u8], timeout: Option<Duration>) -> Result<()> {
        preflight(timeout, "send")?;
        let result = match self.stream.as_mut() {
            None => Err(GraphError::ReadWrite("not connected".to_string())),
            Some(stream) => stream
                .set_write_timeout(timeout)
                .and_then(|_| stream.write_all(bytes))
                .map_err(io_to_error),
        };
        if result.is_err() {
            self.teardown();
        }
        result
    }

    /// Receive one complete reply: read chunks, feed the parser, repeat
    /// until a frame is ready. A zero-byte read means the peer closed
    /// mid-frame and is a read/write error, not a timeout.
    pub fn receive(&mut self, timeout: Option<Duration>) -> Result<Reply> {
        preflight(timeout, "receive")?;
        let result = self.receive_inner(timeout);
        if result.is_err() {
            self.teardown();
        }
        result
    }

    fn receive_inner(&mut self, timeout: Option<Duration>) -> Result<Reply> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| GraphError::ReadWrite("not connected".to_string()))?;
        stream.set_read_timeout(timeout).map_err(io_to_error)?;

        let mut chunk = [0u8; RECV_CHUNK];
        while !self.parser.is_ready() {
            let n = stream.read(&mut chunk).map_err(io_to_error)?;
            if n == 0 {
                return Err(GraphError::ReadWrite(format!(
                    "peer closed with {} bytes of partial reply",
                    self.parser.buffered()
                )));
            }
            self.parser.feed(&chunk[..n]);
        }
        self.parser.take_reply()
    }

    /// Drop the socket and clear all parser buffering.
    pub fn teardown(&mut self) {
        if let Some(peer) = self.peer.take() {
            debug!(peer = %peer, "connection torn down");
        }
        self.stream = None;
        self.parser.reset();
    }
}

fn io_to_error(e: std::io::Error) -> GraphError {
    match e.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            GraphError::Timeout(e.to_string())
        }
        _ => GraphError::ReadWrite(e.to_string()),
    }
}
