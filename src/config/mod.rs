use std::time::Duration;

use punchlink_core::punch::PunchConfig;
use punchlink_reliable::ArqConfig;

use crate::protocol::node_id::PeerIdentity;

pub const DEFAULT_QUEUE_LIMIT: usize = 1024;

/// Configuration of one host (a [`Dispatcher`](crate::dispatch::Dispatcher)).
///
/// # Examples
///
/// ```rust
/// use punchlink::config::HostConfig;
/// use punchlink::PeerIdentity;
/// use std::time::Duration;
///
/// let config = HostConfig::new(PeerIdentity::new(100, 1))
///     .set_handshake_timeout(Duration::from_secs(10))
///     .set_queue_limit(256);
/// assert_eq!(config.queue_limit, 256);
/// ```
#[derive(Clone, Debug)]
pub struct HostConfig {
    pub identity: PeerIdentity,
    /// From connection creation to `established`.
    pub handshake_timeout: Duration,
    /// Time spent in `ready` before `established`.
    pub settle_delay: Duration,
    /// How often an established connection checks its keepalive state.
    pub keepalive_check: Duration,
    /// Idle time after which an established connection sends ALIVE.
    pub keepalive_idle: Duration,
    /// Additional silence after `keepalive_idle` that closes the connection.
    pub keepalive_timeout: Duration,
    /// Inbound messages a connection may hold before it is closed.
    pub queue_limit: usize,
    pub syn_retry_interval: Duration,
    pub syn_retry_backoff: f64,
    /// How long a closed connection stays queryable before its port is reaped.
    pub linger: Duration,
    pub punch: PunchConfig,
    pub arq: ArqConfig,
}

impl HostConfig {
    pub fn new(identity: PeerIdentity) -> Self {
        Self {
            identity,
            handshake_timeout: Duration::from_secs(20),
            settle_delay: Duration::from_secs(1),
            keepalive_check: Duration::from_secs(1),
            keepalive_idle: Duration::from_secs(3),
            keepalive_timeout: Duration::from_secs(15),
            queue_limit: DEFAULT_QUEUE_LIMIT,
            syn_retry_interval: Duration::from_millis(300),
            syn_retry_backoff: 1.2,
            linger: Duration::from_secs(10),
            punch: PunchConfig::default(),
            arq: ArqConfig::default(),
        }
    }
    pub fn set_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }
    pub fn set_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }
    pub fn set_keepalive(mut self, idle: Duration, timeout: Duration) -> Self {
        self.keepalive_idle = idle;
        self.keepalive_timeout = timeout;
        self
    }
    pub fn set_queue_limit(mut self, queue_limit: usize) -> Self {
        self.queue_limit = queue_limit;
        self
    }
    pub fn set_syn_retry(mut self, interval: Duration, backoff: f64) -> Self {
        self.syn_retry_interval = interval;
        self.syn_retry_backoff = backoff;
        self
    }
    pub fn set_linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }
    pub fn set_punch_config(mut self, punch: PunchConfig) -> Self {
        self.punch = punch;
        self
    }
    pub fn set_arq_config(mut self, arq: ArqConfig) -> Self {
        self.arq = arq;
        self
    }
}
