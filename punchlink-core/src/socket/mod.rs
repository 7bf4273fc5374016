//! Raw datagram transports.
//!
//! The hole-punching and connection layers never touch sockets directly; they
//! go through [`Transport`], a non-blocking send/receive contract where every
//! address is a [`PathCandidate`] so a datagram can be sent to, or arrive from,
//! an address reached through the relay.
//!
//! - [`udp::UdpTransport`]: a real UDP socket that also talks to the
//!   rendezvous/relay service.
//! - [`memory::SimNetwork`]: a seeded in-memory network with loss, delay,
//!   relay forwarding and blocked links, for deterministic tests.

use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;

use crate::route::PathCandidate;

pub mod memory;
pub mod udp;

/// Default bound of a transport's inbound queue.
pub const DEFAULT_QUEUE_LIMIT: usize = 1024;

/// One received datagram.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Datagram {
    pub payload: Bytes,
    /// Where it came from. `source.relay` is set when the relay forwarded it,
    /// in which case `source.addr` is the sender's address as the relay saw it.
    pub source: PathCandidate,
}

impl Datagram {
    pub fn new(payload: Bytes, source: PathCandidate) -> Self {
        Self { payload, source }
    }
}

pub trait Transport {
    /// Sends one datagram. With `dest.relay` set the payload is handed to the
    /// relay service for forwarding to `dest.addr`.
    fn send_to(&mut self, buf: &[u8], dest: PathCandidate) -> io::Result<()>;
    /// Pops the next pending datagram, never blocks.
    fn recv_from(&mut self) -> Option<Datagram>;
    /// Addresses of the local interfaces this transport listens on.
    fn local_candidates(&self) -> Vec<SocketAddr>;
    /// The externally observed address, once the relay mirrored it.
    fn external_addr(&self) -> Option<SocketAddr>;
    /// Drives internal timers and fills the inbound queue.
    fn poll(&mut self, _now: Instant) {}
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send_to(&mut self, buf: &[u8], dest: PathCandidate) -> io::Result<()> {
        (**self).send_to(buf, dest)
    }
    fn recv_from(&mut self) -> Option<Datagram> {
        (**self).recv_from()
    }
    fn local_candidates(&self) -> Vec<SocketAddr> {
        (**self).local_candidates()
    }
    fn external_addr(&self) -> Option<SocketAddr> {
        (**self).external_addr()
    }
    fn poll(&mut self, now: Instant) {
        (**self).poll(now)
    }
}
