use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use crate::nat::Endpoint;
use crate::punch::PunchConfig;
use crate::route::{Path, PathKey};

/// Lower and upper clamp of a measured punch round trip.
pub const MIN_PUNCH_RTT: Duration = Duration::from_millis(1);
pub const MAX_PUNCH_RTT: Duration = Duration::from_secs(30);

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RecordState {
    Probing,
    Validated,
    Expired,
}

/// What the owner of a record has to do after a liveness tick.
#[derive(Clone, Debug, PartialEq)]
pub enum RecordAction {
    Idle,
    /// Send another PROPOSE round to the remote endpoint.
    Propose,
    /// Send a liveness ping over the validated path.
    Ping(Path),
    /// Lifetime ran out after validation; drop the record.
    Expired,
    /// Never validated; drop the record and cool down.
    Unreachable,
}

/// Probing state for one remote identity.
#[derive(Clone, Debug)]
pub struct RouteRecord {
    endpoint: Endpoint,
    paths: HashMap<PathKey, Duration>,
    best: Option<Path>,
    state: RecordState,
    created: Instant,
    expire_at: Instant,
    next_propose: Instant,
    propose_interval: Duration,
    proposes: u32,
    next_ping: Instant,
    replies: usize,
}

impl RouteRecord {
    pub fn new(endpoint: Endpoint, now: Instant, config: &PunchConfig) -> Self {
        Self {
            endpoint,
            paths: HashMap::with_capacity(8),
            best: None,
            state: RecordState::Probing,
            created: now,
            expire_at: now + config.lifetime,
            next_propose: now + config.propose_interval,
            propose_interval: config.propose_interval,
            proposes: 0,
            next_ping: now,
            replies: 0,
        }
    }
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
    pub fn state(&self) -> RecordState {
        self.state
    }
    pub fn replies(&self) -> usize {
        self.replies
    }
    /// Every distinct path seen so far with its minimum round trip.
    pub fn paths(&self) -> impl Iterator<Item = Path> + '_ {
        self.paths
            .iter()
            .map(|(key, rtt)| Path::new(key.local, key.remote, *rtt))
    }
    /// The current best path, only once the record is validated.
    pub fn best_path(&self) -> Option<Path> {
        if self.state != RecordState::Validated {
            return None;
        }
        self.best
    }
    /// The best path recorded so far regardless of state.
    pub fn best_candidate(&self) -> Option<Path> {
        self.best
    }
    pub fn touch(&mut self, now: Instant, config: &PunchConfig) {
        if self.state != RecordState::Expired {
            self.expire_at = now + config.lifetime;
        }
    }

    /// Records a confirmed path, keeping the minimum round trip per exact
    /// path and promoting the best one.
    pub fn record(&mut self, path: Path, now: Instant, config: &PunchConfig) {
        if self.state == RecordState::Expired {
            return;
        }
        let rtt = path.rtt.clamp(MIN_PUNCH_RTT, MAX_PUNCH_RTT);
        let min_rtt = self
            .paths
            .entry(path.key())
            .and_modify(|v| *v = (*v).min(rtt))
            .or_insert(rtt);
        let path = Path::new(path.local, path.remote, *min_rtt);
        self.replies += 1;
        match &self.best {
            Some(best) if !path.is_better_than(best) => {}
            _ => self.best = Some(path),
        }
        if self.state == RecordState::Probing && path.is_direct() {
            self.validate(now, config);
        }
        self.touch(now, config);
    }

    fn validate(&mut self, now: Instant, config: &PunchConfig) {
        self.state = RecordState::Validated;
        self.next_ping = now + config.ping_interval;
    }

    /// Advances timers. Expiry is terminal.
    pub fn tick(&mut self, now: Instant, config: &PunchConfig) -> RecordAction {
        match self.state {
            RecordState::Expired => return RecordAction::Expired,
            _ if now >= self.expire_at => {
                let validated = self.state == RecordState::Validated;
                self.state = RecordState::Expired;
                return if validated {
                    RecordAction::Expired
                } else {
                    RecordAction::Unreachable
                };
            }
            RecordState::Validated => {
                if now >= self.next_ping {
                    self.next_ping = now + config.ping_interval;
                    if let Some(best) = self.best {
                        return RecordAction::Ping(best);
                    }
                }
                return RecordAction::Idle;
            }
            RecordState::Probing => {}
        }
        if self.best.is_some() && now >= self.created + config.relay_fallback {
            self.validate(now, config);
            return RecordAction::Idle;
        }
        if now < self.next_propose {
            return RecordAction::Idle;
        }
        self.proposes += 1;
        if self.proposes > config.propose_max_retries {
            self.state = RecordState::Expired;
            return RecordAction::Unreachable;
        }
        self.propose_interval = self
            .propose_interval
            .mul_f64(config.propose_backoff)
            .min(config.propose_max_interval);
        self.next_propose = now + self.propose_interval;
        RecordAction::Propose
    }
}

/// Route records keyed by remote identity, plus a negative cache of
/// identities that recently failed to validate.
pub struct RouteTable<PeerID> {
    records: HashMap<PeerID, RouteRecord>,
    negative: HashMap<PeerID, Instant>,
    config: PunchConfig,
}

impl<PeerID: Hash + Eq + Clone> RouteTable<PeerID> {
    pub fn new(config: PunchConfig) -> RouteTable<PeerID> {
        Self {
            records: HashMap::with_capacity(64),
            negative: HashMap::new(),
            config,
        }
    }
    pub fn config(&self) -> &PunchConfig {
        &self.config
    }
    pub fn len(&self) -> usize {
        self.records.len()
    }
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
    pub fn get(&self, id: &PeerID) -> Option<&RouteRecord> {
        self.records.get(id)
    }

    /// Whether `id` is still cooling down after an unvalidated eviction.
    /// A stale entry is dropped as a side effect.
    pub fn is_suppressed(&mut self, id: &PeerID, now: Instant) -> bool {
        match self.negative.get(id) {
            Some(until) if now < *until => true,
            Some(_) => {
                self.negative.remove(id);
                false
            }
            None => false,
        }
    }

    /// Drops the record for `id` if it was created for a different endpoint.
    /// Returns true if a record was discarded.
    pub fn discard_stale(&mut self, id: &PeerID, endpoint: &Endpoint) -> bool {
        let stale = self
            .records
            .get(id)
            .is_some_and(|record| !record.endpoint().route_equivalent(endpoint));
        if stale {
            self.records.remove(id);
        }
        stale
    }

    pub fn insert(&mut self, id: PeerID, endpoint: Endpoint, now: Instant) -> &RouteRecord {
        let record = RouteRecord::new(endpoint, now, &self.config);
        self.records.insert(id.clone(), record);
        &self.records[&id]
    }

    pub fn best_path(&self, id: &PeerID) -> Option<Path> {
        self.records.get(id).and_then(|record| record.best_path())
    }

    /// Adds a confirmed path to an existing record; unknown identities are ignored.
    pub fn record(&mut self, id: &PeerID, path: Path, now: Instant) -> bool {
        match self.records.get_mut(id) {
            Some(record) => {
                record.record(path, now, &self.config);
                true
            }
            None => false,
        }
    }

    pub fn touch(&mut self, id: &PeerID, now: Instant) -> bool {
        match self.records.get_mut(id) {
            Some(record) => {
                record.touch(now, &self.config);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &PeerID) -> Option<RouteRecord> {
        self.records.remove(id)
    }

    /// Runs one liveness pass. Expired records are removed; unvalidated ones
    /// additionally enter the negative cache. Returns the work the caller has
    /// to carry out, with a snapshot of the remote endpoint.
    pub fn sweep(&mut self, now: Instant) -> Vec<(PeerID, Endpoint, RecordAction)> {
        let mut actions = Vec::new();
        let config = &self.config;
        let negative = &mut self.negative;
        self.records.retain(|id, record| {
            let action = record.tick(now, config);
            let keep = match action {
                RecordAction::Idle => return true,
                RecordAction::Propose | RecordAction::Ping(_) => true,
                RecordAction::Expired => false,
                RecordAction::Unreachable => {
                    negative.insert(id.clone(), now + config.negative_cooldown);
                    false
                }
            };
            actions.push((id.clone(), record.endpoint().clone(), action));
            keep
        });
        self.negative.retain(|_, until| now < *until);
        actions
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::route::PathCandidate;

    fn path(local: &str, remote: &str, relay: bool, rtt_ms: u64) -> Path {
        Path::new(
            PathCandidate::direct(local.parse().unwrap()),
            PathCandidate::new(remote.parse().unwrap(), relay),
            Duration::from_millis(rtt_ms),
        )
    }

    fn endpoint() -> Endpoint {
        Endpoint::decode("192.168.1.3:4000/9.9.9.9:4000")
    }

    #[test]
    fn probing_hides_best() {
        let config = PunchConfig::default();
        let now = Instant::now();
        let mut record = RouteRecord::new(endpoint(), now, &config);
        assert_eq!(record.best_path(), None);
        record.record(path("8.8.8.8:1", "9.9.9.9:4000", true, 20), now, &config);
        assert_eq!(record.state(), RecordState::Probing);
        assert_eq!(record.best_path(), None);
        assert!(record.best_candidate().is_some());
    }

    #[test]
    fn direct_path_validates() {
        let config = PunchConfig::default();
        let now = Instant::now();
        let mut record = RouteRecord::new(endpoint(), now, &config);
        let direct = path("192.168.1.2:3000", "192.168.1.3:4000", false, 30);
        record.record(direct, now, &config);
        assert_eq!(record.state(), RecordState::Validated);
        assert_eq!(record.best_path(), Some(direct));
        // same state, same answer
        assert_eq!(record.best_path(), record.best_path());
        // a worse path leaves the best untouched
        record.record(path("8.8.8.8:1", "9.9.9.9:4000", false, 1), now, &config);
        assert_eq!(record.best_path(), Some(direct));
        // a faster measurement of the same key improves it
        record.record(
            path("192.168.1.2:3000", "192.168.1.3:4000", false, 10),
            now,
            &config,
        );
        assert_eq!(record.best_path().unwrap().rtt, Duration::from_millis(10));
        // a slower measurement of the same key keeps the minimum
        record.record(
            path("192.168.1.2:3000", "192.168.1.3:4000", false, 90),
            now,
            &config,
        );
        assert_eq!(record.best_path().unwrap().rtt, Duration::from_millis(10));
        assert_eq!(record.paths().count(), 2);
    }

    #[test]
    fn rtt_is_clamped() {
        let config = PunchConfig::default();
        let now = Instant::now();
        let mut record = RouteRecord::new(endpoint(), now, &config);
        record.record(path("10.0.0.1:1", "10.0.0.2:2", false, 0), now, &config);
        assert_eq!(record.best_path().unwrap().rtt, MIN_PUNCH_RTT);
    }

    #[test]
    fn relay_fallback() {
        let config = PunchConfig::default();
        let now = Instant::now();
        let mut record = RouteRecord::new(endpoint(), now, &config);
        record.record(path("8.8.8.8:1", "9.9.9.9:4000", true, 20), now, &config);
        assert_eq!(
            record.tick(now + Duration::from_secs(1), &config),
            RecordAction::Idle
        );
        record.tick(now + config.relay_fallback, &config);
        assert_eq!(record.state(), RecordState::Validated);
        assert!(record.best_path().unwrap().remote.is_relay());
    }

    #[test]
    fn propose_backoff_and_ceiling() {
        let config = PunchConfig::default()
            .set_propose_interval(Duration::from_secs(2), 2.0, Duration::from_secs(5))
            .set_propose_max_retries(3)
            .set_lifetime(Duration::from_secs(600));
        let start = Instant::now();
        let mut record = RouteRecord::new(endpoint(), start, &config);
        let at = |ms: u64| start + Duration::from_millis(ms);
        assert_eq!(record.tick(at(1999), &config), RecordAction::Idle);
        assert_eq!(record.tick(at(2000), &config), RecordAction::Propose);
        // next interval doubled to 4s
        assert_eq!(record.tick(at(5999), &config), RecordAction::Idle);
        assert_eq!(record.tick(at(6000), &config), RecordAction::Propose);
        // capped at 5s
        assert_eq!(record.tick(at(11000), &config), RecordAction::Propose);
        assert_eq!(record.tick(at(16000), &config), RecordAction::Unreachable);
        assert_eq!(record.state(), RecordState::Expired);
    }

    #[test]
    fn lifetime_and_touch() {
        let config = PunchConfig::default();
        let start = Instant::now();
        let mut record = RouteRecord::new(endpoint(), start, &config);
        record.record(path("10.0.0.1:1", "10.0.0.2:2", false, 5), start, &config);
        record.touch(start + Duration::from_secs(20), &config);
        assert_ne!(
            record.tick(start + Duration::from_secs(35), &config),
            RecordAction::Expired
        );
        assert_eq!(
            record.tick(start + Duration::from_secs(50), &config),
            RecordAction::Expired
        );
    }

    #[test]
    fn validated_pings() {
        let config = PunchConfig::default();
        let start = Instant::now();
        let mut record = RouteRecord::new(endpoint(), start, &config);
        let direct = path("10.0.0.1:1", "10.0.0.2:2", false, 5);
        record.record(direct, start, &config);
        assert_eq!(
            record.tick(start + Duration::from_secs(1), &config),
            RecordAction::Idle
        );
        record.touch(start + Duration::from_secs(19), &config);
        assert!(matches!(
            record.tick(start + Duration::from_secs(20), &config),
            RecordAction::Ping(p) if p.key() == direct.key()
        ));
    }

    #[test]
    fn table_negative_cache() {
        let config = PunchConfig::default();
        let start = Instant::now();
        let mut table = RouteTable::<u32>::new(config.clone());
        table.insert(7, endpoint(), start);
        table.insert(8, endpoint(), start);
        table.record(
            &8,
            path("10.0.0.1:1", "10.0.0.2:2", false, 5),
            start + Duration::from_secs(1),
        );
        let expiry = start + Duration::from_secs(31);
        let actions = table.sweep(expiry);
        assert!(actions
            .iter()
            .any(|(id, _, a)| *id == 7 && *a == RecordAction::Unreachable));
        assert!(actions
            .iter()
            .any(|(id, _, a)| *id == 8 && *a == RecordAction::Expired));
        assert!(table.is_empty());
        assert!(table.is_suppressed(&7, expiry + Duration::from_secs(24)));
        assert!(!table.is_suppressed(&8, expiry));
        assert!(!table.is_suppressed(&7, expiry + Duration::from_secs(25)));
    }

    #[test]
    fn table_discards_stale_descriptor() {
        let start = Instant::now();
        let mut table = RouteTable::<u32>::new(PunchConfig::default());
        table.insert(1, endpoint(), start);
        assert!(!table.discard_stale(&1, &endpoint()));
        assert!(table.discard_stale(&1, &Endpoint::decode("192.168.1.3:4001")));
        assert!(table.get(&1).is_none());
    }
}
