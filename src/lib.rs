//! # punchlink
//!
//! UDP hole punching between hosts behind NATs, plus a lightweight reliable
//! transport carried inside the resulting connections.
//!
//! The heart of the crate is the poll-driven [`Dispatcher`]: feed it the
//! current time once per tick with [`Dispatcher::update`] and it drains the
//! transport, runs the hole-punching coordinator, drives every connection
//! and its ARQ session, and retransmits whatever is due. Nothing blocks and
//! every timer compares against the supplied `Instant`, so a pair of hosts
//! over [`SimNetwork`](punchlink_core::socket::memory::SimNetwork) runs
//! deterministically in tests.
//!
//! [`Node`] wraps a dispatcher for async code: a tokio task ticks it every
//! 10 ms behind a mutex.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use punchlink::{Builder, PeerIdentity};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> punchlink::Result<()> {
//! let node = Builder::new()
//!     .identity(PeerIdentity::new(100, 1))
//!     .udp_port(23333)
//!     .relay("1.2.3.4:3478".parse().unwrap())
//!     .build()
//!     .await?;
//! println!("descriptor: {}", node.descriptor());
//!
//! let port = node.connect(PeerIdentity::new(200, 2), "192.168.1.3:23333")?;
//! node.wait_established(port, Duration::from_secs(20)).await?;
//! node.send(port, 0, b"hello")?;
//! let (channel, reply) = node.recv(port).await?;
//! println!("{channel}: {reply:?}");
//! # Ok(())
//! # }
//! ```

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use punchlink_core::socket::udp::{UdpConfig, UdpTransport};
use punchlink_core::socket::Transport;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub use config::HostConfig;
pub use connection::{CloseReason, ConnectionState};
pub use dispatch::{Accepted, AllowAll, ConnectPolicy, Dispatcher};
pub use error::{Error, Result};
pub use protocol::node_id::PeerIdentity;
pub use protocol::protocol_type::Command;
pub use protocol::Header;
pub use punchlink_core;
pub use punchlink_reliable;

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod protocol;

const DEFAULT_TICK: Duration = Duration::from_millis(10);

struct OwnedJoinHandle {
    handle: JoinHandle<()>,
}

impl Drop for OwnedJoinHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A [`Dispatcher`] ticked by a background tokio task. Dropping the node
/// stops the task.
pub struct Node<T> {
    dispatcher: Arc<Mutex<Dispatcher<T>>>,
    tick: Duration,
    _handle: OwnedJoinHandle,
}

impl<T: Transport + Send + 'static> Node<T> {
    /// Starts ticking `dispatcher`. Must be called within a tokio runtime.
    pub fn spawn(dispatcher: Dispatcher<T>, tick: Duration) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e)))?;
        let dispatcher = Arc::new(Mutex::new(dispatcher));
        let driven = dispatcher.clone();
        let handle = runtime.spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                driven.lock().update(Instant::now());
            }
        });
        Ok(Self {
            dispatcher,
            tick,
            _handle: OwnedJoinHandle { handle },
        })
    }
}

impl<T: Transport> Node<T> {
    /// Direct access to the dispatcher. Do not hold the guard across an
    /// `.await`.
    pub fn lock(&self) -> MutexGuard<'_, Dispatcher<T>> {
        self.dispatcher.lock()
    }

    pub fn descriptor(&self) -> String {
        self.lock().descriptor().encode()
    }

    pub fn connect(&self, peer: PeerIdentity, descriptor: &str) -> Result<i32> {
        self.lock().connect(peer, descriptor)
    }

    pub fn send(&self, port: i32, channel: u16, payload: &[u8]) -> Result<()> {
        self.lock().send(port, channel, payload)
    }

    pub fn close(&self, port: i32) -> Result<()> {
        self.lock().close(port)
    }

    fn closed_error(&self, port: i32) -> Option<Error> {
        let dispatcher = self.lock();
        match dispatcher.status(port) {
            None => Some(Error::NoSuchPort(port)),
            Some(ConnectionState::Closed) => Some(
                dispatcher
                    .close_reason(port)
                    .unwrap_or(CloseReason::Local)
                    .into_error(port),
            ),
            Some(_) => None,
        }
    }

    /// Waits until `port` is established, closed, or `timeout` passes.
    pub async fn wait_established(&self, port: i32, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.lock().status(port) == Some(ConnectionState::Established) {
                return Ok(());
            }
            if let Some(e) = self.closed_error(port) {
                return Err(e);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::HandshakeTimeout);
            }
            tokio::time::sleep(self.tick).await;
        }
    }

    /// Waits for the next inbound connection.
    pub async fn accept(&self) -> Accepted {
        loop {
            if let Some(accepted) = self.lock().accept() {
                return accepted;
            }
            tokio::time::sleep(self.tick).await;
        }
    }

    /// Waits for the next message on `port`.
    pub async fn recv(&self, port: i32) -> Result<(u16, Bytes)> {
        loop {
            if let Some(message) = self.lock().recv(port) {
                return Ok(message);
            }
            if let Some(e) = self.closed_error(port) {
                return Err(e);
            }
            tokio::time::sleep(self.tick).await;
        }
    }
}

/// Composes a [`HostConfig`] and a transport into a running [`Node`].
pub struct Builder {
    identity: Option<PeerIdentity>,
    udp_port: Option<u16>,
    relay: Option<SocketAddr>,
    config: Option<HostConfig>,
    policy: Option<Box<dyn ConnectPolicy>>,
    tick: Duration,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            identity: None,
            udp_port: None,
            relay: None,
            config: None,
            policy: None,
            tick: DEFAULT_TICK,
        }
    }
    pub fn identity(mut self, identity: PeerIdentity) -> Self {
        self.identity = Some(identity);
        self
    }
    pub fn udp_port(mut self, port: u16) -> Self {
        self.udp_port = Some(port);
        self
    }
    /// Rendezvous/relay service used to learn the external address and to
    /// forward when no direct path works.
    pub fn relay(mut self, relay: SocketAddr) -> Self {
        self.relay = Some(relay);
        self
    }
    /// Full host configuration. Its identity is overridden by
    /// [`identity`](Self::identity) if both are given.
    pub fn config(mut self, config: HostConfig) -> Self {
        self.config = Some(config);
        self
    }
    pub fn policy<P: ConnectPolicy + 'static>(mut self, policy: P) -> Self {
        self.policy = Some(Box::new(policy));
        self
    }
    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    fn host_config(&mut self) -> Result<HostConfig> {
        let mut config = match (self.config.take(), self.identity) {
            (Some(config), _) => config,
            (None, Some(identity)) => HostConfig::new(identity),
            (None, None) => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "identity is required",
                )))
            }
        };
        if let Some(identity) = self.identity {
            config.identity = identity;
        }
        Ok(config)
    }

    /// Binds a UDP transport and starts the node.
    pub async fn build(self) -> Result<Node<UdpTransport>> {
        let bind = SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            self.udp_port.unwrap_or_default(),
        );
        let mut udp = UdpConfig::default().set_bind(bind);
        if let Some(relay) = self.relay {
            udp = udp.set_relay(relay);
        }
        let transport = UdpTransport::bind(udp)?;
        self.build_with(transport)
    }

    /// Starts the node over any transport. Must be called within a tokio
    /// runtime.
    pub fn build_with<T: Transport + Send + 'static>(mut self, transport: T) -> Result<Node<T>> {
        let config = self.host_config()?;
        let mut dispatcher = Dispatcher::new(config, transport, Instant::now());
        if let Some(policy) = self.policy.take() {
            dispatcher.set_policy(BoxedPolicy(policy));
        }
        Node::spawn(dispatcher, self.tick)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

struct BoxedPolicy(Box<dyn ConnectPolicy>);

impl ConnectPolicy for BoxedPolicy {
    fn allow(&mut self, peer: PeerIdentity, peer_port: i32) -> bool {
        self.0.allow(peer, peer_port)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use punchlink_core::socket::memory::SimNetwork;

    #[tokio::test]
    async fn node_round_trip() {
        let net = SimNetwork::default();
        let a = Builder::new()
            .identity(PeerIdentity::new(100, 1))
            .build_with(net.bind("10.0.0.1:1000".parse().unwrap()))
            .unwrap();
        let b = Builder::new()
            .identity(PeerIdentity::new(200, 2))
            .build_with(net.bind("10.0.0.2:2000".parse().unwrap()))
            .unwrap();

        let port = a.connect(PeerIdentity::new(200, 2), &b.descriptor()).unwrap();
        a.wait_established(port, Duration::from_secs(10))
            .await
            .unwrap();
        let accepted = b.accept().await;
        assert_eq!(accepted.peer, PeerIdentity::new(100, 1));
        b.wait_established(accepted.port, Duration::from_secs(10))
            .await
            .unwrap();

        a.send(port, 0, b"ping").unwrap();
        let (channel, payload) = b.recv(accepted.port).await.unwrap();
        assert_eq!(channel, 0);
        assert_eq!(&payload[..], b"ping");

        a.close(port).unwrap();
        assert!(matches!(a.recv(port).await, Err(Error::NoSuchPort(_))));
    }

    #[test]
    fn build_requires_identity_and_runtime() {
        let net = SimNetwork::default();
        assert!(Builder::new()
            .build_with(net.bind("10.0.0.1:1000".parse().unwrap()))
            .is_err());
        // no runtime here
        assert!(Builder::new()
            .identity(PeerIdentity::new(1, 1))
            .build_with(net.bind("10.0.0.2:1000".parse().unwrap()))
            .is_err());
    }
}
