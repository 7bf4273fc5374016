//! One logical connection: the handshake state machine, keepalive and
//! channel multiplexing over an embedded ARQ session.
//!
//! ```text
//! connector: Routing -> Syn1 -> Syn2 -> Ready -> Established
//! listener:             AwaitingSyn2 -> Ready -> Established
//! ```
//!
//! Any state may move to `Closed`; a connection that is not established
//! within the handshake timeout closes itself.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use punchlink_core::nat::Endpoint;
use punchlink_core::route::Path;
use punchlink_reliable::ArqSession;

use crate::config::HostConfig;
use crate::dispatch::Context;
use crate::error::{Error, Result};
use crate::protocol::handshake::PathBody;
use crate::protocol::node_id::PeerIdentity;
use crate::protocol::protocol_type::Command;
use crate::protocol::punch::PingBody;
use crate::protocol::Header;
use channel::ChannelSequences;
use timer::RetryTimer;

pub mod channel;
pub mod timer;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ConnectionState {
    Routing,
    Syn1,
    Syn2,
    AwaitingSyn2,
    Ready,
    Established,
    Closed,
}

impl ConnectionState {
    pub fn is_established(&self) -> bool {
        *self == ConnectionState::Established
    }
    pub fn is_closed(&self) -> bool {
        *self == ConnectionState::Closed
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum CloseReason {
    Local,
    HandshakeTimeout,
    KeepaliveTimeout,
    /// The peer answered with NOPORT, NOCONV or DENY.
    Rejected(Command),
    TransportFailure,
    QueueOverflow,
}

impl CloseReason {
    pub fn into_error(self, port: i32) -> Error {
        match self {
            CloseReason::HandshakeTimeout => Error::HandshakeTimeout,
            CloseReason::KeepaliveTimeout => Error::KeepaliveTimeout,
            CloseReason::Rejected(_) => Error::ProtocolMismatch,
            CloseReason::TransportFailure => Error::TransportFailure,
            CloseReason::Local | CloseReason::QueueOverflow => Error::NotEstablished(port),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Role {
    Connector,
    Listener,
}

pub struct Connection {
    config: Arc<HostConfig>,
    identity: PeerIdentity,
    port: i32,
    conv: i32,
    peer: PeerIdentity,
    peer_port: i32,
    role: Role,
    state: ConnectionState,
    reason: Option<CloseReason>,
    descriptor: Endpoint,
    path: Option<Path>,
    arq: ArqSession,
    inbox: VecDeque<(u16, Bytes)>,
    sequences: ChannelSequences,
    created: Instant,
    closed_at: Option<Instant>,
    syn_timer: RetryTimer,
    ready_at: Instant,
    time_alive: Instant,
    next_alive_check: Instant,
    rtt: Option<Duration>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("port", &self.port)
            .field("conv", &self.conv)
            .field("peer", &self.peer)
            .field("peer_port", &self.peer_port)
            .field("state", &self.state)
            .field("path", &self.path)
            .finish()
    }
}

impl Connection {
    fn new(
        config: Arc<HostConfig>,
        port: i32,
        conv: i32,
        peer: PeerIdentity,
        role: Role,
        state: ConnectionState,
        now: Instant,
    ) -> Self {
        let arq = ArqSession::new(conv as u32, config.arq.clone());
        let syn_timer = RetryTimer::new(config.syn_retry_interval, config.syn_retry_backoff);
        Self {
            identity: config.identity,
            config,
            port,
            conv,
            peer,
            peer_port: 0,
            role,
            state,
            reason: None,
            descriptor: Endpoint::default(),
            path: None,
            arq,
            inbox: VecDeque::new(),
            sequences: ChannelSequences::default(),
            created: now,
            closed_at: None,
            syn_timer,
            ready_at: now,
            time_alive: now,
            next_alive_check: now,
            rtt: None,
        }
    }

    /// Outbound connection to `peer`, which advertises `descriptor`.
    pub fn connect(
        config: Arc<HostConfig>,
        port: i32,
        conv: i32,
        peer: PeerIdentity,
        descriptor: Endpoint,
        now: Instant,
    ) -> Self {
        let mut connection = Self::new(
            config,
            port,
            conv,
            peer,
            Role::Connector,
            ConnectionState::Routing,
            now,
        );
        connection.descriptor = descriptor;
        connection
    }

    /// Inbound connection created by a SYN1 from `peer:peer_port`.
    pub fn accept(
        config: Arc<HostConfig>,
        port: i32,
        conv: i32,
        peer: PeerIdentity,
        peer_port: i32,
        path: Path,
        now: Instant,
    ) -> Self {
        let mut connection = Self::new(
            config,
            port,
            conv,
            peer,
            Role::Listener,
            ConnectionState::AwaitingSyn2,
            now,
        );
        connection.peer_port = peer_port;
        connection.path = Some(path);
        connection
    }

    pub fn port(&self) -> i32 {
        self.port
    }
    pub fn conv(&self) -> i32 {
        self.conv
    }
    pub fn peer(&self) -> PeerIdentity {
        self.peer
    }
    pub fn peer_port(&self) -> i32 {
        self.peer_port
    }
    pub fn role(&self) -> Role {
        self.role
    }
    pub fn state(&self) -> ConnectionState {
        self.state
    }
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.reason
    }
    pub fn closed_at(&self) -> Option<Instant> {
        self.closed_at
    }
    /// Snapshot of the path adopted at handshake time.
    pub fn path(&self) -> Option<Path> {
        self.path
    }
    /// Round trip of the last keepalive exchange.
    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }

    pub fn close(&mut self, reason: CloseReason, now: Instant) {
        if self.state.is_closed() {
            return;
        }
        log::info!(
            "[{}:{}] closed ({:?}) in state {:?}",
            self.identity.id,
            self.port,
            reason,
            self.state
        );
        self.state = ConnectionState::Closed;
        self.reason = Some(reason);
        self.closed_at = Some(now);
    }

    fn header(&self, cmd: Command) -> Header {
        Header::new(self.identity, self.peer, cmd)
            .set_ports(self.port, self.peer_port)
            .set_conv(self.conv)
    }

    fn send_to_peer(&self, ctx: &mut Context<'_>, cmd: Command, body: &[u8]) {
        if let Some(path) = &self.path {
            ctx.send(&self.header(cmd), body, path.remote);
        }
    }

    /// Answers a SYN1, first or duplicate, with this connection's port.
    pub fn send_sack1(&self, ctx: &mut Context<'_>) {
        self.send_to_peer(ctx, Command::Sack1, &[]);
    }

    fn timestamp(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.created).as_millis() as u64
    }

    fn enter_ready(&mut self, now: Instant) {
        log::debug!("[{}:{}] ready", self.identity.id, self.port);
        self.state = ConnectionState::Ready;
        self.ready_at = now;
    }

    /// One tick.
    pub fn update(&mut self, ctx: &mut Context<'_>) {
        let now = ctx.now;
        if self.state.is_closed() {
            return;
        }
        if self.arq.is_failed() {
            self.close(CloseReason::TransportFailure, now);
            return;
        }
        if !self.state.is_established() && now >= self.created + self.config.handshake_timeout {
            self.close(CloseReason::HandshakeTimeout, now);
            return;
        }
        if self.state == ConnectionState::Routing {
            if let Some(path) = ctx.best_path(self.peer, &self.descriptor) {
                log::debug!("[{}:{}] adopted {path}", self.identity.id, self.port);
                self.path = Some(path);
                self.state = ConnectionState::Syn1;
                self.syn_timer.reset();
            }
        }
        match self.state {
            ConnectionState::Syn1 => {
                if self.syn_timer.check(now) {
                    if let Some(path) = &self.path {
                        let body = PathBody::from(path).encode();
                        let header = self.header(Command::Syn1).set_ports(self.port, 0);
                        ctx.send(&header, body.as_bytes(), path.remote);
                    }
                }
            }
            ConnectionState::Syn2 => {
                if self.syn_timer.check(now) {
                    self.send_to_peer(ctx, Command::Syn2, &[]);
                }
            }
            ConnectionState::Ready => {
                if now >= self.ready_at + self.config.settle_delay {
                    log::info!(
                        "[{}:{}] established with {}:{}",
                        self.identity.id,
                        self.port,
                        self.peer,
                        self.peer_port
                    );
                    self.state = ConnectionState::Established;
                    self.time_alive = now;
                    self.next_alive_check = now;
                }
                self.flush(ctx);
            }
            ConnectionState::Established => {
                if now >= self.next_alive_check {
                    self.next_alive_check = now + self.config.keepalive_check;
                    let idle = self.time_alive + self.config.keepalive_idle;
                    if now >= idle + self.config.keepalive_timeout {
                        self.close(CloseReason::KeepaliveTimeout, now);
                        return;
                    }
                    if now >= idle {
                        let body = PingBody {
                            ts: self.timestamp(now),
                        };
                        self.send_to_peer(ctx, Command::Alive, body.encode().as_bytes());
                    }
                }
                self.flush(ctx);
            }
            ConnectionState::Routing
            | ConnectionState::AwaitingSyn2
            | ConnectionState::Closed => {}
        }
    }

    fn flush(&mut self, ctx: &mut Context<'_>) {
        let Some(path) = self.path else {
            return;
        };
        let header = self.header(Command::Data);
        let now = ctx.now;
        self.arq
            .update(now, &mut |datagram: Bytes| ctx.send(&header, &datagram, path.remote));
    }

    /// Handles a datagram the dispatcher routed to this port.
    pub fn input(&mut self, header: &Header, body: &[u8], ctx: &mut Context<'_>) {
        let now = ctx.now;
        match header.command() {
            Command::Sack1 => {
                if self.state == ConnectionState::Syn1 {
                    self.peer_port = header.sport;
                    self.state = ConnectionState::Syn2;
                    self.syn_timer.reset();
                    self.update(ctx);
                }
            }
            Command::Syn2 => {
                if self.state == ConnectionState::AwaitingSyn2 {
                    self.enter_ready(now);
                }
                if !self.state.is_closed() {
                    self.send_to_peer(ctx, Command::Sack2, &[]);
                }
            }
            Command::Sack2 => {
                if self.state == ConnectionState::Syn2 {
                    self.enter_ready(now);
                }
            }
            Command::Deny | Command::NoPort | Command::NoConv => {
                self.close(CloseReason::Rejected(header.command()), now);
            }
            Command::Data => {
                if matches!(
                    self.state,
                    ConnectionState::Ready | ConnectionState::Established
                ) {
                    self.input_data(body, now);
                }
            }
            Command::Alive => {
                if !self.state.is_closed() {
                    self.send_to_peer(ctx, Command::AliveAck, body);
                }
            }
            Command::AliveAck => {
                if let Ok(echo) = PingBody::decode(body) {
                    let rtt = self.timestamp(now).saturating_sub(echo.ts);
                    self.rtt = Some(Duration::from_millis(rtt));
                    self.time_alive = now;
                    ctx.puncher.touch(&self.peer, now);
                }
            }
            command => {
                log::debug!(
                    "[{}:{}] ignored {command:?} in {:?}",
                    self.identity.id,
                    self.port,
                    self.state
                );
            }
        }
    }

    fn input_data(&mut self, body: &[u8], now: Instant) {
        if channel::is_unreliable_frame(body) {
            match channel::decode_unreliable(body) {
                Ok((channel, seq, payload)) => {
                    if self.sequences.accept(channel, seq) {
                        self.deliver(channel, payload, now);
                    }
                }
                Err(e) => log::debug!("[{}:{}] {e}", self.identity.id, self.port),
            }
            return;
        }
        if let Err(e) = self.arq.input(body) {
            log::debug!("[{}:{}] arq input: {e}", self.identity.id, self.port);
        }
        while let Some(message) = self.arq.recv() {
            match channel::decode_reliable(message) {
                Ok((channel, payload)) => self.deliver(channel, payload, now),
                Err(e) => log::debug!("[{}:{}] {e}", self.identity.id, self.port),
            }
        }
    }

    fn deliver(&mut self, channel: u16, payload: Bytes, now: Instant) {
        if self.state.is_closed() {
            return;
        }
        self.inbox.push_back((channel, payload));
        if self.inbox.len() >= self.config.queue_limit {
            self.close(CloseReason::QueueOverflow, now);
        }
    }

    /// Sends `payload` on `channel`: even channels reliably through the ARQ
    /// session (on the next tick), odd channels immediately and unordered.
    pub fn send(&mut self, channel: u16, payload: &[u8], ctx: &mut Context<'_>) -> Result<()> {
        channel::check_channel(channel)?;
        if !self.state.is_established() {
            return Err(Error::NotEstablished(self.port));
        }
        if channel::is_reliable(channel) {
            return self
                .arq
                .send(channel::encode_reliable(channel, payload))
                .map_err(|_| Error::MessageTooLarge(payload.len()));
        }
        let seq = self.sequences.next_send(channel);
        let frame = channel::encode_unreliable(channel, seq, payload);
        self.send_to_peer(ctx, Command::Data, &frame);
        Ok(())
    }

    pub fn recv(&mut self) -> Option<(u16, Bytes)> {
        self.inbox.pop_front()
    }
}
