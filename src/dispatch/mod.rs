//! The host: demultiplexes inbound datagrams to the hole-punching
//! coordinator or to connections, and drives every timer once per tick.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use punchlink_core::nat::Endpoint;
use punchlink_core::route::{Path, PathCandidate};
use punchlink_core::socket::{Datagram, Transport};

use crate::config::HostConfig;
use crate::connection::{CloseReason, Connection, ConnectionState};
use crate::error::{Error, Result};
use crate::protocol::handshake::PathBody;
use crate::protocol::node_id::PeerIdentity;
use crate::protocol::protocol_type::Command;
use crate::protocol::{build_packet, split_packet, Header};
pub use puncher::Puncher;

pub mod puncher;

/// Sends one packet, logging instead of failing: a lost datagram is normal.
pub(crate) fn send_packet(
    tx: &mut dyn Transport,
    header: &Header,
    body: &[u8],
    dest: PathCandidate,
) {
    let packet = build_packet(header, body);
    if let Err(e) = tx.send_to(&packet, dest) {
        log::warn!(
            "[{}] send {:?} to {dest} failed: {e}",
            header.suid,
            header.command()
        );
    }
}

/// What a connection may touch while the dispatcher drives it.
pub struct Context<'a> {
    pub now: Instant,
    pub(crate) descriptor: &'a Endpoint,
    pub(crate) transport: &'a mut dyn Transport,
    pub(crate) puncher: &'a mut Puncher,
}

impl Context<'_> {
    pub(crate) fn send(&mut self, header: &Header, body: &[u8], dest: PathCandidate) {
        send_packet(self.transport, header, body, dest);
    }
    pub(crate) fn best_path(&mut self, peer: PeerIdentity, endpoint: &Endpoint) -> Option<Path> {
        self.puncher
            .best_path(self.transport, self.descriptor, peer, endpoint, self.now)
    }
}

/// Decides whether an inbound connection from `peer` is admitted.
pub trait ConnectPolicy: Send {
    fn allow(&mut self, peer: PeerIdentity, peer_port: i32) -> bool;
}

/// Admits everyone.
#[derive(Default, Debug, Clone, Copy)]
pub struct AllowAll;

impl ConnectPolicy for AllowAll {
    fn allow(&mut self, _peer: PeerIdentity, _peer_port: i32) -> bool {
        true
    }
}

impl<F: FnMut(PeerIdentity, i32) -> bool + Send> ConnectPolicy for F {
    fn allow(&mut self, peer: PeerIdentity, peer_port: i32) -> bool {
        self(peer, peer_port)
    }
}

/// A connection created by a peer's SYN1, waiting for [`Dispatcher::accept`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Accepted {
    pub port: i32,
    pub peer: PeerIdentity,
    pub peer_port: i32,
}

const PORT_LIMIT: i32 = 0x7fff;
const CONV_LIMIT: i32 = 0x7fffffff;

fn identity_seed(id: i32) -> i32 {
    let id = id as u32;
    ((id >> 16) + (id & 0xffff)) as i32
}

/// Logical port counter, seeded from the local id to keep restarts apart.
struct PortAllocator {
    next: i32,
}

impl PortAllocator {
    fn new(id: i32) -> Self {
        Self {
            next: (identity_seed(id) % 9 + 1) * 1000,
        }
    }
    fn allocate(&mut self, in_use: impl Fn(i32) -> bool) -> i32 {
        loop {
            self.next += 1;
            if self.next >= PORT_LIMIT {
                self.next = 1;
            }
            if !in_use(self.next) {
                return self.next;
            }
        }
    }
}

/// Conversation id counter, seeded from the local id plus the wall clock.
struct ConvAllocator {
    next: i32,
}

impl ConvAllocator {
    fn new(id: i32) -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_micros())
            .unwrap_or(0) as i32;
        Self {
            next: (identity_seed(id) & 0xffff) + micros,
        }
    }
    fn allocate(&mut self, elapsed: Duration) -> i32 {
        let step = 1 + (elapsed.as_secs() % 10) as i32;
        self.next = match self.next.checked_add(step) {
            Some(next) if next < CONV_LIMIT => next,
            _ => step,
        };
        self.next
    }
}

/// One host instance. Not thread-safe on its own; [`Node`](crate::Node)
/// wraps it in a mutex for use from async code.
pub struct Dispatcher<T> {
    config: Arc<HostConfig>,
    identity: PeerIdentity,
    transport: T,
    epoch: Instant,
    now: Instant,
    descriptor: Endpoint,
    puncher: Puncher,
    connections: HashMap<i32, Connection>,
    /// (peer, peer port) of every inbound connection, for duplicate SYN1s.
    listener: HashMap<(PeerIdentity, i32), i32>,
    accepted: VecDeque<Accepted>,
    policy: Box<dyn ConnectPolicy>,
    ports: PortAllocator,
    convs: ConvAllocator,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(config: HostConfig, transport: T, now: Instant) -> Self {
        let identity = config.identity;
        let descriptor = Endpoint::new(transport.local_candidates(), transport.external_addr());
        log::info!("[{}] host up, descriptor {}", identity.id, descriptor.encode());
        Self {
            puncher: Puncher::new(identity, config.punch.clone(), now),
            config: Arc::new(config),
            identity,
            transport,
            epoch: now,
            now,
            descriptor,
            connections: HashMap::new(),
            listener: HashMap::new(),
            accepted: VecDeque::new(),
            policy: Box::new(AllowAll),
            ports: PortAllocator::new(identity.id),
            convs: ConvAllocator::new(identity.id),
        }
    }

    pub fn set_policy<P: ConnectPolicy + 'static>(&mut self, policy: P) {
        self.policy = Box::new(policy);
    }

    pub fn identity(&self) -> PeerIdentity {
        self.identity
    }
    pub fn config(&self) -> &HostConfig {
        &self.config
    }
    pub fn transport(&self) -> &T {
        &self.transport
    }
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
    pub fn puncher(&self) -> &Puncher {
        &self.puncher
    }

    /// This host's endpoint, to hand to peers out of band.
    pub fn descriptor(&self) -> &Endpoint {
        &self.descriptor
    }

    fn refresh_descriptor(&mut self) {
        let descriptor = Endpoint::new(
            self.transport.local_candidates(),
            self.transport.external_addr(),
        );
        if descriptor != self.descriptor {
            log::info!(
                "[{}] descriptor now {}",
                self.identity.id,
                descriptor.encode()
            );
            self.descriptor = descriptor;
        }
    }

    /// One tick: drain inbound datagrams, run the route liveness pass, drive
    /// every connection, reap closed ones.
    pub fn update(&mut self, now: Instant) {
        self.now = now;
        self.transport.poll(now);
        self.refresh_descriptor();
        while let Some(datagram) = self.transport.recv_from() {
            self.process(datagram);
        }
        self.puncher
            .sweep(&mut self.transport, &self.descriptor, now);
        let mut ctx = Context {
            now,
            descriptor: &self.descriptor,
            transport: &mut self.transport,
            puncher: &mut self.puncher,
        };
        for connection in self.connections.values_mut() {
            connection.update(&mut ctx);
        }
        self.reap(now);
    }

    fn reap(&mut self, now: Instant) {
        let linger = self.config.linger;
        let before = self.connections.len();
        self.connections
            .retain(|_, c| c.closed_at().map_or(true, |at| now < at + linger));
        if self.connections.len() != before {
            let connections = &self.connections;
            self.listener
                .retain(|_, port| connections.contains_key(port));
            self.accepted
                .retain(|accepted| connections.contains_key(&accepted.port));
        }
    }

    fn process(&mut self, datagram: Datagram) {
        let (header, body) = match split_packet(&datagram.payload) {
            Ok(v) => v,
            Err(e) => {
                log::debug!(
                    "[{}] drop datagram from {}: {e}",
                    self.identity.id,
                    datagram.source
                );
                return;
            }
        };
        if header.dest() != self.identity {
            log::debug!(
                "[{}] drop datagram for {} from {}",
                self.identity.id,
                header.dest(),
                datagram.source
            );
            return;
        }
        let source = datagram.source;
        let now = self.now;
        let tx: &mut dyn Transport = &mut self.transport;
        let result = match header.command() {
            Command::Propose => self.puncher.on_propose(tx, &header, body, source),
            Command::ProposeAck => self
                .puncher
                .on_propose_ack(tx, &header, body, source, now),
            Command::Confirm => self.puncher.on_confirm(tx, &header, body),
            Command::ConfirmAck => self.puncher.on_confirm_ack(&header, body, now),
            Command::Ping => self.puncher.on_ping(tx, &header, body, source),
            Command::Pong => self.puncher.on_pong(&header, body, now),
            Command::Syn1 => self.on_syn1(&header, body, source),
            Command::Sack1
            | Command::Syn2
            | Command::Sack2
            | Command::Deny
            | Command::NoPort
            | Command::NoConv
            | Command::Data
            | Command::DataAck
            | Command::Alive
            | Command::AliveAck
            | Command::Close(_) => self.on_port_bound(&header, body, source),
            Command::Unknown(code) => Err(Error::Format(format!("unknown command {code:#x}"))),
        };
        if let Err(e) = result {
            log::debug!(
                "[{}] {:?} from {} dropped: {e}",
                self.identity.id,
                header.command(),
                source
            );
        }
    }

    /// Answers `header` with a rejection, unless it is itself a rejection.
    fn reject(&mut self, header: &Header, reason: Command, source: PathCandidate) {
        if header.command().is_rejection() {
            return;
        }
        let reply = Header::new(self.identity, header.source(), reason)
            .set_ports(header.dport, header.sport)
            .set_conv(header.conv);
        send_packet(&mut self.transport, &reply, &[], source);
    }

    fn on_syn1(&mut self, header: &Header, body: &[u8], source: PathCandidate) -> Result<()> {
        let peer = header.source();
        let key = (peer, header.sport);
        let duplicate = self
            .listener
            .get(&key)
            .and_then(|port| self.connections.get(port))
            .filter(|c| c.conv() == header.conv && !c.state().is_closed());
        if let Some(connection) = duplicate {
            let mut ctx = Context {
                now: self.now,
                descriptor: &self.descriptor,
                transport: &mut self.transport,
                puncher: &mut self.puncher,
            };
            connection.send_sack1(&mut ctx);
            return Ok(());
        }
        if !self.policy.allow(peer, header.sport) {
            log::info!("[{}] denied connection from {peer}", self.identity.id);
            self.reject(header, Command::Deny, source);
            return Ok(());
        }
        let path = match PathBody::decode(body) {
            Ok(path) => path.reversed(),
            Err(e) => {
                log::debug!("[{}] syn1 without path ({e}), replying to source", self.identity.id);
                Path::new(PathCandidate::default(), source, Default::default())
            }
        };
        let connections = &self.connections;
        let port = self.ports.allocate(|p| connections.contains_key(&p));
        let connection = Connection::accept(
            self.config.clone(),
            port,
            header.conv,
            peer,
            header.sport,
            path,
            self.now,
        );
        log::info!(
            "[{}:{port}] accepted {peer}:{} conv {}",
            self.identity.id,
            header.sport,
            header.conv
        );
        let mut ctx = Context {
            now: self.now,
            descriptor: &self.descriptor,
            transport: &mut self.transport,
            puncher: &mut self.puncher,
        };
        connection.send_sack1(&mut ctx);
        self.connections.insert(port, connection);
        self.listener.insert(key, port);
        self.accepted.push_back(Accepted {
            port,
            peer,
            peer_port: header.sport,
        });
        Ok(())
    }

    fn on_port_bound(&mut self, header: &Header, body: &[u8], source: PathCandidate) -> Result<()> {
        // a closed connection lingers only for status queries
        let Some(connection) = self
            .connections
            .get(&header.dport)
            .filter(|c| !c.state().is_closed())
        else {
            self.reject(header, Command::NoPort, source);
            return Err(Error::NoSuchPort(header.dport));
        };
        let sport_matches =
            header.command() == Command::Sack1 || header.sport == connection.peer_port();
        if connection.conv() != header.conv || connection.peer() != header.source() || !sport_matches
        {
            self.reject(header, Command::NoConv, source);
            return Err(Error::ProtocolMismatch);
        }
        let mut ctx = Context {
            now: self.now,
            descriptor: &self.descriptor,
            transport: &mut self.transport,
            puncher: &mut self.puncher,
        };
        if let Some(connection) = self.connections.get_mut(&header.dport) {
            connection.input(header, body, &mut ctx);
        }
        Ok(())
    }

    /// Opens a connection to `peer` advertising `descriptor`. The returned
    /// port starts in `Routing`; poll [`status`](Self::status).
    pub fn connect(&mut self, peer: PeerIdentity, descriptor: &str) -> Result<i32> {
        let endpoint = Endpoint::decode(descriptor);
        if endpoint.is_empty() {
            return Err(Error::InvalidDescriptor(descriptor.to_string()));
        }
        if self.puncher.is_suppressed(&peer, self.now) {
            return Err(Error::Unreachable);
        }
        let connections = &self.connections;
        let port = self.ports.allocate(|p| connections.contains_key(&p));
        let conv = self.convs.allocate(self.now.saturating_duration_since(self.epoch));
        log::info!("[{}:{port}] connecting to {peer} conv {conv}", self.identity.id);
        let connection =
            Connection::connect(self.config.clone(), port, conv, peer, endpoint, self.now);
        self.connections.insert(port, connection);
        Ok(port)
    }

    pub fn accept(&mut self) -> Option<Accepted> {
        self.accepted.pop_front()
    }

    pub fn status(&self, port: i32) -> Option<ConnectionState> {
        self.connections.get(&port).map(|c| c.state())
    }

    pub fn close_reason(&self, port: i32) -> Option<CloseReason> {
        self.connections.get(&port).and_then(|c| c.close_reason())
    }

    pub fn path(&self, port: i32) -> Option<Path> {
        self.connections.get(&port).and_then(|c| c.path())
    }

    pub fn rtt(&self, port: i32) -> Option<Duration> {
        self.connections.get(&port).and_then(|c| c.rtt())
    }

    pub fn connection(&self, port: i32) -> Option<&Connection> {
        self.connections.get(&port)
    }

    pub fn ports(&self) -> impl Iterator<Item = i32> + '_ {
        self.connections.keys().copied()
    }

    pub fn send(&mut self, port: i32, channel: u16, payload: &[u8]) -> Result<()> {
        let connection = self
            .connections
            .get_mut(&port)
            .ok_or(Error::NoSuchPort(port))?;
        let mut ctx = Context {
            now: self.now,
            descriptor: &self.descriptor,
            transport: &mut self.transport,
            puncher: &mut self.puncher,
        };
        connection.send(channel, payload, &mut ctx)
    }

    pub fn recv(&mut self, port: i32) -> Option<(u16, Bytes)> {
        self.connections.get_mut(&port).and_then(|c| c.recv())
    }

    /// Closes and forgets `port` at once.
    pub fn close(&mut self, port: i32) -> Result<()> {
        let mut connection = self
            .connections
            .remove(&port)
            .ok_or(Error::NoSuchPort(port))?;
        connection.close(CloseReason::Local, self.now);
        self.listener.retain(|_, p| *p != port);
        self.accepted.retain(|a| a.port != port);
        Ok(())
    }

    /// Refreshes the lifetime of the route record of `peer`.
    pub fn touch(&mut self, peer: PeerIdentity) -> bool {
        self.puncher.touch(&peer, self.now)
    }

    /// Drops the route record of `peer`; the next path request probes anew.
    pub fn forget(&mut self, peer: PeerIdentity) -> bool {
        self.puncher.forget(&peer)
    }
}
