use std::time::Duration;

/// Overhead subtracted from the MTU to get the packing budget.
const MTU_OVERHEAD: usize = 20;

#[derive(Clone, Debug)]
pub struct ArqConfig {
    /// Segments in flight, and the receive window, in each direction.
    pub window: u32,
    pub mtu: usize,
    pub rto_initial: Duration,
    pub rto_min: Duration,
    pub rto_max: Duration,
    /// Growth of a segment's retransmit deadline after each transmission.
    pub backoff: f64,
    /// Retransmissions after which the session fails.
    pub max_retries: u32,
}

impl Default for ArqConfig {
    fn default() -> Self {
        Self {
            window: 64,
            mtu: 1400,
            rto_initial: Duration::from_millis(300),
            rto_min: Duration::from_millis(10),
            rto_max: Duration::from_millis(10_000),
            backoff: 1.2,
            max_retries: 10,
        }
    }
}

impl ArqConfig {
    /// Payload budget of one outbound datagram.
    pub fn mss(&self) -> usize {
        self.mtu.saturating_sub(MTU_OVERHEAD)
    }
    pub fn set_window(mut self, window: u32) -> Self {
        self.window = window;
        self
    }
    pub fn set_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }
    pub fn set_rto(mut self, initial: Duration, min: Duration, max: Duration) -> Self {
        self.rto_initial = initial;
        self.rto_min = min;
        self.rto_max = max;
        self
    }
    pub fn set_backoff(mut self, backoff: f64) -> Self {
        self.backoff = backoff;
        self
    }
    pub fn set_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}
