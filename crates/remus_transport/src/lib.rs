//! Message-oriented socket layer for the Remus broker.
//!
//! Thin wrappers over ZeroMQ that pin down the three behaviors the broker
//! relies on: a shared messaging context that scopes `inproc` endpoints,
//! TCP binds that probe upward from the configured port when it is taken,
//! and a poll primitive that distinguishes readiness, timeout, and signal
//! interruption. Everything else (ROUTER/DEALER semantics, multipart
//! framing) is used as the library provides it.

pub mod endpoint;
pub mod error;

pub use endpoint::{Endpoint, Scheme};
pub use error::{Result, TransportError};

use tracing::debug;

/// Shared process-wide messaging context.
///
/// All sockets of one broker (and any in-process workers talking to it over
/// `inproc`) must come from the same context. Cloning shares the underlying
/// context; the I/O thread count is fixed at construction.
#[derive(Clone)]
pub struct MessagingContext {
    inner: zmq::Context,
}

impl Default for MessagingContext {
    fn default() -> Self {
        Self::new()
    }
}

impl MessagingContext {
    /// Context with the default single I/O thread.
    pub fn new() -> Self {
        Self {
            inner: zmq::Context::new(),
        }
    }

    /// Context with an explicit I/O thread count.
    pub fn with_io_threads(count: i32) -> Result<Self> {
        let inner = zmq::Context::new();
        inner.set_io_threads(count.max(1))?;
        Ok(Self { inner })
    }

    pub fn socket(&self, kind: zmq::SocketType) -> Result<zmq::Socket> {
        Ok(self.inner.socket(kind)?)
    }
}

/// Outcome of a [`poll_readable`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// At least one socket is readable; carries the ready count.
    Ready(usize),
    TimedOut,
    /// The wait was cut short by a signal; callers should re-check their
    /// shutdown flag and poll again.
    Interrupted,
}

/// Wait until any of the sockets behind `items` becomes readable.
///
/// `timeout_ms` < 0 blocks indefinitely.
pub fn poll_readable(items: &mut [zmq::PollItem<'_>], timeout_ms: i64) -> Result<PollOutcome> {
    match zmq::poll(items, timeout_ms) {
        Ok(0) => Ok(PollOutcome::TimedOut),
        Ok(n) => Ok(PollOutcome::Ready(n as usize)),
        Err(zmq::Error::EINTR) => Ok(PollOutcome::Interrupted),
        Err(e) => Err(TransportError::Socket(e)),
    }
}

/// Bind a socket to an endpoint, returning the endpoint actually bound.
///
/// On TCP an in-use port is probed upward until a free one is found; `ipc`
/// and `inproc` endpoints bind literally or fail.
pub fn bind_endpoint(socket: &zmq::Socket, endpoint: &Endpoint) -> Result<Endpoint> {
    if endpoint.scheme != Scheme::Tcp {
        let address = endpoint.to_string();
        socket.bind(&address).map_err(|source| TransportError::Bind {
            endpoint: address,
            source,
        })?;
        return Ok(endpoint.clone());
    }

    let mut port = endpoint.port;
    loop {
        let candidate = endpoint.with_port(port);
        let address = candidate.to_string();
        match socket.bind(&address) {
            Ok(()) => {
                if port != endpoint.port {
                    debug!("Port {} taken, bound {} instead", endpoint.port, address);
                }
                return Ok(candidate);
            }
            Err(zmq::Error::EADDRINUSE) => {
                port = port
                    .checked_add(1)
                    .ok_or(TransportError::NoFreePort {
                        start: endpoint.port,
                    })?;
            }
            Err(source) => {
                return Err(TransportError::Bind {
                    endpoint: address,
                    source,
                })
            }
        }
    }
}

/// Send a multipart message, all frames or nothing.
pub fn send_frames(socket: &zmq::Socket, frames: Vec<Vec<u8>>) -> Result<()> {
    socket.send_multipart(frames, 0)?;
    Ok(())
}

/// Receive one multipart message without blocking.
///
/// Returns `None` when nothing is queued.
pub fn recv_frames(socket: &zmq::Socket) -> Result<Option<Vec<Vec<u8>>>> {
    match socket.recv_multipart(zmq::DONTWAIT) {
        Ok(frames) => Ok(Some(frames)),
        Err(zmq::Error::EAGAIN) => Ok(None),
        Err(e) => Err(TransportError::Socket(e)),
    }
}

/// Receive one multipart message, waiting up to the socket's configured
/// receive timeout. Returns `None` on timeout.
pub fn recv_frames_blocking(socket: &zmq::Socket) -> Result<Option<Vec<Vec<u8>>>> {
    match socket.recv_multipart(0) {
        Ok(frames) => Ok(Some(frames)),
        Err(zmq::Error::EAGAIN) => Ok(None),
        Err(e) => Err(TransportError::Socket(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_bind_probes_next_port() {
        let ctx = MessagingContext::new();
        let first = ctx.socket(zmq::ROUTER).unwrap();
        let second = ctx.socket(zmq::ROUTER).unwrap();

        let configured = Endpoint::tcp("127.0.0.1", 46801);
        let bound_first = bind_endpoint(&first, &configured).unwrap();
        let bound_second = bind_endpoint(&second, &configured).unwrap();

        assert_eq!(bound_first.port, 46801);
        assert!(bound_second.port > bound_first.port);
    }

    #[test]
    fn test_inproc_requires_shared_context() {
        let ctx = MessagingContext::new();
        let server = ctx.socket(zmq::ROUTER).unwrap();
        let endpoint = Endpoint::inproc("transport-test");
        bind_endpoint(&server, &endpoint).unwrap();

        // Same context connects fine.
        let client = ctx.socket(zmq::DEALER).unwrap();
        client.connect(&endpoint.to_string()).unwrap();

        // A different context cannot reach the name.
        let other = MessagingContext::new();
        let stranger = other.socket(zmq::DEALER).unwrap();
        assert!(stranger.connect(&endpoint.to_string()).is_err());
    }

    #[test]
    fn test_multipart_roundtrip_over_inproc() {
        let ctx = MessagingContext::new();
        let server = ctx.socket(zmq::ROUTER).unwrap();
        bind_endpoint(&server, &Endpoint::inproc("transport-frames")).unwrap();

        let client = ctx.socket(zmq::DEALER).unwrap();
        client.connect("inproc://transport-frames").unwrap();

        send_frames(&client, vec![b"one".to_vec(), b"two".to_vec()]).unwrap();

        server.set_rcvtimeo(1000).unwrap();
        let frames = recv_frames_blocking(&server).unwrap().unwrap();
        // ROUTER prepends the routing identity.
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1], b"one");
        assert_eq!(frames[2], b"two");
    }

    #[test]
    fn test_recv_frames_empty_returns_none() {
        let ctx = MessagingContext::new();
        let server = ctx.socket(zmq::ROUTER).unwrap();
        bind_endpoint(&server, &Endpoint::inproc("transport-empty")).unwrap();
        assert!(recv_frames(&server).unwrap().is_none());
    }

    #[test]
    fn test_poll_times_out() {
        let ctx = MessagingContext::new();
        let server = ctx.socket(zmq::ROUTER).unwrap();
        bind_endpoint(&server, &Endpoint::inproc("transport-poll")).unwrap();

        let mut items = [server.as_poll_item(zmq::POLLIN)];
        let outcome = poll_readable(&mut items, 10).unwrap();
        assert_eq!(outcome, PollOutcome::TimedOut);
    }
}
