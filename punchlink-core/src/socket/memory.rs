//! In-memory datagram network for deterministic tests.
//!
//! Every host binds a [`SimSocket`] at one local address and optionally
//! sits behind a translation with a distinct external address. Datagrams
//! travel through a shared queue with seeded loss and delay; delivery time is
//! measured against the receiving socket's last [`Transport::poll`] clock, so
//! tests drive the whole network with synthetic instants.
//!
//! Sending with `relay` set models the rendezvous service: the payload is
//! delivered to whoever owns the destination address, tagged with the
//! sender's external address, even across blocked links.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::route::PathCandidate;
use crate::socket::{Datagram, Transport, DEFAULT_QUEUE_LIMIT};

/// Fault model of a [`SimNetwork`].
#[derive(Clone, Debug)]
pub struct SimConfig {
    /// Probability in `[0, 1]` that a datagram is silently dropped.
    pub loss_rate: f64,
    /// One-way delay, drawn uniformly per datagram.
    pub delay: Range<Duration>,
    /// Whether the relay service forwards at all.
    pub relay: bool,
    pub queue_limit: usize,
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            loss_rate: 0.0,
            delay: Duration::ZERO..Duration::ZERO,
            relay: true,
            queue_limit: DEFAULT_QUEUE_LIMIT,
            seed: 0x5eed,
        }
    }
}

impl SimConfig {
    pub fn set_loss_rate(mut self, loss_rate: f64) -> Self {
        self.loss_rate = loss_rate;
        self
    }
    pub fn set_delay(mut self, delay: Range<Duration>) -> Self {
        self.delay = delay;
        self
    }
    pub fn set_relay(mut self, relay: bool) -> Self {
        self.relay = relay;
        self
    }
    pub fn set_queue_limit(mut self, queue_limit: usize) -> Self {
        self.queue_limit = queue_limit;
        self
    }
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

struct InFlight {
    deliver_at: Instant,
    order: u64,
    datagram: Datagram,
}

impl PartialEq for InFlight {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for InFlight {}
impl PartialOrd for InFlight {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for InFlight {
    // min-heap on (deliver_at, order)
    fn cmp(&self, other: &Self) -> Ordering {
        (other.deliver_at, other.order).cmp(&(self.deliver_at, self.order))
    }
}

struct Host {
    local: SocketAddr,
    external: Option<SocketAddr>,
    clock: Option<Instant>,
    inbox: BinaryHeap<InFlight>,
}

impl Host {
    fn public_addr(&self) -> SocketAddr {
        self.external.unwrap_or(self.local)
    }
}

struct State {
    config: SimConfig,
    rng: StdRng,
    hosts: Vec<Host>,
    by_addr: HashMap<SocketAddr, usize>,
    blocked: HashSet<(usize, usize)>,
    order: u64,
    sent: u64,
    dropped: u64,
}

impl State {
    fn send(&mut self, from: usize, buf: &[u8], dest: PathCandidate) -> io::Result<()> {
        self.sent += 1;
        let Some(&to) = self.by_addr.get(&dest.addr) else {
            // nobody there, the datagram vanishes like on a real network
            self.dropped += 1;
            return Ok(());
        };
        let sender = &self.hosts[from];
        let source = if dest.relay {
            if !self.config.relay {
                self.dropped += 1;
                return Ok(());
            }
            PathCandidate::relayed(sender.public_addr())
        } else {
            if self.blocked.contains(&(from, to)) {
                self.dropped += 1;
                return Ok(());
            }
            // a translated host is seen at its external address by other hosts
            let seen = match sender.external {
                Some(external) if self.hosts[to].external != Some(external) => external,
                _ => sender.local,
            };
            PathCandidate::direct(seen)
        };
        let sent_at = sender.clock;
        if self.config.loss_rate > 0.0 && self.rng.gen_bool(self.config.loss_rate.min(1.0)) {
            self.dropped += 1;
            return Ok(());
        }
        let delay = if self.config.delay.is_empty() {
            self.config.delay.start
        } else {
            self.rng.gen_range(self.config.delay.clone())
        };
        let limit = self.config.queue_limit;
        let host = &mut self.hosts[to];
        if host.inbox.len() >= limit {
            self.dropped += 1;
            return Ok(());
        }
        let base = sent_at.or(host.clock).unwrap_or_else(Instant::now);
        self.order += 1;
        host.inbox.push(InFlight {
            deliver_at: base + delay,
            order: self.order,
            datagram: Datagram::new(Bytes::copy_from_slice(buf), source),
        });
        Ok(())
    }

    fn recv(&mut self, at: usize) -> Option<Datagram> {
        let host = &mut self.hosts[at];
        let now = host.clock?;
        if host.inbox.peek()?.deliver_at > now {
            return None;
        }
        host.inbox.pop().map(|v| v.datagram)
    }
}

/// A shared simulated network. Cloning yields another handle to the same one.
#[derive(Clone)]
pub struct SimNetwork {
    state: Arc<Mutex<State>>,
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl SimNetwork {
    pub fn new(config: SimConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            state: Arc::new(Mutex::new(State {
                config,
                rng,
                hosts: Vec::new(),
                by_addr: HashMap::new(),
                blocked: HashSet::new(),
                order: 0,
                sent: 0,
                dropped: 0,
            })),
        }
    }

    /// Attaches a host reachable at `local`.
    pub fn bind(&self, local: SocketAddr) -> SimSocket {
        self.attach(local, None)
    }

    /// Attaches a host at `local` whose traffic leaves through `external`.
    pub fn bind_translated(&self, local: SocketAddr, external: SocketAddr) -> SimSocket {
        self.attach(local, Some(external))
    }

    fn attach(&self, local: SocketAddr, external: Option<SocketAddr>) -> SimSocket {
        let mut state = self.state.lock();
        let index = state.hosts.len();
        state.by_addr.insert(local, index);
        if let Some(external) = external {
            state.by_addr.insert(external, index);
        }
        state.hosts.push(Host {
            local,
            external,
            clock: None,
            inbox: BinaryHeap::new(),
        });
        SimSocket {
            index,
            local,
            external,
            network: self.clone(),
        }
    }

    /// Drops every direct datagram between the two hosts, both ways.
    /// Relay forwarding still works.
    pub fn block(&self, a: &SimSocket, b: &SimSocket) {
        let mut state = self.state.lock();
        state.blocked.insert((a.index, b.index));
        state.blocked.insert((b.index, a.index));
    }

    pub fn unblock(&self, a: &SimSocket, b: &SimSocket) {
        let mut state = self.state.lock();
        state.blocked.remove(&(a.index, b.index));
        state.blocked.remove(&(b.index, a.index));
    }

    /// (sent, dropped) datagram counters.
    pub fn stats(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.sent, state.dropped)
    }
}

/// One host's handle on a [`SimNetwork`].
pub struct SimSocket {
    index: usize,
    local: SocketAddr,
    external: Option<SocketAddr>,
    network: SimNetwork,
}

impl SimSocket {
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

impl Transport for SimSocket {
    fn send_to(&mut self, buf: &[u8], dest: PathCandidate) -> io::Result<()> {
        self.network.state.lock().send(self.index, buf, dest)
    }

    fn recv_from(&mut self) -> Option<Datagram> {
        self.network.state.lock().recv(self.index)
    }

    fn local_candidates(&self) -> Vec<SocketAddr> {
        vec![self.local]
    }

    fn external_addr(&self) -> Option<SocketAddr> {
        self.external
    }

    fn poll(&mut self, now: Instant) {
        self.network.state.lock().hosts[self.index].clock = Some(now);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn direct_delivery() {
        let net = SimNetwork::default();
        let mut a = net.bind(addr("10.0.0.1:1000"));
        let mut b = net.bind(addr("10.0.0.2:2000"));
        let now = Instant::now();
        a.poll(now);
        b.poll(now);
        a.send_to(b"hi", PathCandidate::direct(b.local_addr())).unwrap();
        let datagram = b.recv_from().unwrap();
        assert_eq!(&datagram.payload[..], b"hi");
        assert_eq!(datagram.source, PathCandidate::direct(a.local_addr()));
        assert!(b.recv_from().is_none());
    }

    #[test]
    fn delay_holds_until_clock_advances() {
        let config = SimConfig::default()
            .set_delay(Duration::from_millis(50)..Duration::from_millis(51));
        let net = SimNetwork::new(config);
        let mut a = net.bind(addr("10.0.0.1:1000"));
        let mut b = net.bind(addr("10.0.0.2:2000"));
        let now = Instant::now();
        a.poll(now);
        b.poll(now);
        a.send_to(b"x", PathCandidate::direct(b.local_addr())).unwrap();
        assert!(b.recv_from().is_none());
        b.poll(now + Duration::from_millis(51));
        assert!(b.recv_from().is_some());
    }

    #[test]
    fn translated_source_and_relay() {
        let net = SimNetwork::default();
        let mut a = net.bind_translated(addr("192.168.1.2:1000"), addr("1.1.1.1:5000"));
        let mut b = net.bind_translated(addr("192.168.9.2:2000"), addr("2.2.2.2:6000"));
        let now = Instant::now();
        a.poll(now);
        b.poll(now);
        a.send_to(b"1", PathCandidate::direct(addr("2.2.2.2:6000")))
            .unwrap();
        assert_eq!(
            b.recv_from().unwrap().source,
            PathCandidate::direct(addr("1.1.1.1:5000"))
        );
        net.block(&a, &b);
        a.send_to(b"2", PathCandidate::direct(addr("2.2.2.2:6000")))
            .unwrap();
        assert!(b.recv_from().is_none());
        a.send_to(b"3", PathCandidate::relayed(addr("2.2.2.2:6000")))
            .unwrap();
        let datagram = b.recv_from().unwrap();
        assert_eq!(&datagram.payload[..], b"3");
        assert_eq!(datagram.source, PathCandidate::relayed(addr("1.1.1.1:5000")));
    }

    #[test]
    fn seeded_loss_is_reproducible() {
        let run = || {
            let net = SimNetwork::new(SimConfig::default().set_loss_rate(0.5).set_seed(7));
            let mut a = net.bind(addr("10.0.0.1:1"));
            let mut b = net.bind(addr("10.0.0.2:2"));
            let now = Instant::now();
            a.poll(now);
            b.poll(now);
            let mut got = Vec::new();
            for i in 0u8..64 {
                a.send_to(&[i], PathCandidate::direct(b.local_addr())).unwrap();
                if let Some(d) = b.recv_from() {
                    got.push(d.payload[0]);
                }
            }
            got
        };
        let first = run();
        assert!(!first.is_empty() && first.len() < 64);
        assert_eq!(first, run());
    }
}
