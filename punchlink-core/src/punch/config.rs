use std::time::Duration;

/// Timers of the hole-punching coordinator.
#[derive(Clone, Debug)]
pub struct PunchConfig {
    /// Hard lifetime of a route record, refreshed by `touch`.
    pub lifetime: Duration,
    /// First PROPOSE retry interval while probing.
    pub propose_interval: Duration,
    pub propose_backoff: f64,
    pub propose_max_interval: Duration,
    /// PROPOSE rounds after which an unvalidated record is force-expired.
    pub propose_max_retries: u32,
    /// Liveness ping interval once validated.
    pub ping_interval: Duration,
    /// Delay after which a relay-only best path is accepted.
    pub relay_fallback: Duration,
    /// Cooldown of the negative cache after an unvalidated eviction.
    pub negative_cooldown: Duration,
}

impl Default for PunchConfig {
    fn default() -> Self {
        Self {
            lifetime: Duration::from_secs(30),
            propose_interval: Duration::from_secs(2),
            propose_backoff: 1.5,
            propose_max_interval: Duration::from_secs(5),
            propose_max_retries: 10,
            ping_interval: Duration::from_secs(20),
            relay_fallback: Duration::from_millis(8600),
            negative_cooldown: Duration::from_secs(25),
        }
    }
}

impl PunchConfig {
    pub fn set_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }
    pub fn set_propose_interval(mut self, interval: Duration, backoff: f64, max: Duration) -> Self {
        self.propose_interval = interval;
        self.propose_backoff = backoff;
        self.propose_max_interval = max;
        self
    }
    pub fn set_propose_max_retries(mut self, retries: u32) -> Self {
        self.propose_max_retries = retries;
        self
    }
    pub fn set_ping_interval(mut self, ping_interval: Duration) -> Self {
        self.ping_interval = ping_interval;
        self
    }
    pub fn set_relay_fallback(mut self, relay_fallback: Duration) -> Self {
        self.relay_fallback = relay_fallback;
        self
    }
    pub fn set_negative_cooldown(mut self, cooldown: Duration) -> Self {
        self.negative_cooldown = cooldown;
        self
    }
}
