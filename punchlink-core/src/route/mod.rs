//! Path candidates and path ranking.
//!
//! A [`PathCandidate`] is one way to reach one address: directly, or by
//! asking the rendezvous service to forward. A [`Path`] pairs the prober's
//! candidate (`local`) with the responder's candidate (`remote`); the
//! combination is what hole punching validates and scores.
//!
//! # Examples
//!
//! ```rust
//! use punchlink_core::route::{Path, PathCandidate};
//! use std::time::Duration;
//!
//! let direct = Path::new(
//!     PathCandidate::direct("192.168.1.2:3000".parse().unwrap()),
//!     PathCandidate::direct("192.168.1.3:4000".parse().unwrap()),
//!     Duration::from_millis(40),
//! );
//! let relayed = Path::new(
//!     PathCandidate::direct("127.0.0.1:3000".parse().unwrap()),
//!     PathCandidate::relayed("127.0.0.1:4000".parse().unwrap()),
//!     Duration::from_millis(1),
//! );
//! assert!(direct.sort_key() < relayed.sort_key());
//! ```

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use crate::extend::addr::socket_rank;

pub mod route_table;

/// Round trip assumed for a path nobody has measured yet.
pub const DEFAULT_RTT: Duration = Duration::from_millis(200);

/// An address plus whether datagrams to it go through the relay.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct PathCandidate {
    pub addr: SocketAddr,
    pub relay: bool,
}

impl Default for PathCandidate {
    fn default() -> Self {
        Self::direct(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)))
    }
}

impl PathCandidate {
    pub const fn new(addr: SocketAddr, relay: bool) -> Self {
        Self { addr, relay }
    }
    pub const fn direct(addr: SocketAddr) -> Self {
        Self::new(addr, false)
    }
    pub const fn relayed(addr: SocketAddr) -> Self {
        Self::new(addr, true)
    }
    #[inline]
    pub fn is_relay(&self) -> bool {
        self.relay
    }
    #[inline]
    pub fn hops(&self) -> u8 {
        self.relay as u8
    }
    #[inline]
    pub fn rank(&self) -> u32 {
        socket_rank(&self.addr)
    }
}

impl fmt::Display for PathCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.relay {
            write!(f, "relay://{}", self.addr)
        } else {
            write!(f, "udp://{}", self.addr)
        }
    }
}

/// Exact identity of a path, independent of its measured round trip.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct PathKey {
    pub local: PathCandidate,
    pub remote: PathCandidate,
}

/// A validated path between two hosts.
///
/// `local` is where the peer reaches the prober, `remote` is where the
/// prober reaches the peer.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Path {
    pub local: PathCandidate,
    pub remote: PathCandidate,
    pub rtt: Duration,
}

impl Path {
    pub const fn new(local: PathCandidate, remote: PathCandidate, rtt: Duration) -> Self {
        Self { local, remote, rtt }
    }
    pub fn key(&self) -> PathKey {
        PathKey {
            local: self.local,
            remote: self.remote,
        }
    }
    /// Number of relay legs, 0 for a fully direct path.
    pub fn relay_hops(&self) -> u8 {
        self.local.hops() + self.remote.hops()
    }
    pub fn is_direct(&self) -> bool {
        self.relay_hops() == 0
    }
    /// Combined locality rank of both ends.
    pub fn rank(&self) -> u32 {
        self.local.rank() + self.remote.rank()
    }
    pub fn sort_key(&self) -> RouteSortKey {
        RouteSortKey {
            hops: self.relay_hops(),
            rank: self.rank(),
            rtt: self.rtt,
        }
    }
    /// Whether `self` should replace `other` as the best path.
    pub fn is_better_than(&self, other: &Path) -> bool {
        self.sort_key() < other.sort_key()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {} ({:?})", self.local, self.remote, self.rtt)
    }
}

/// Ordering used to pick the best path: relay hops, then address rank of
/// both ends, then round trip.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct RouteSortKey {
    hops: u8,
    rank: u32,
    rtt: Duration,
}

#[cfg(test)]
mod test {
    use super::*;

    fn path(local: &str, remote: &str, relay: bool, rtt_ms: u64) -> Path {
        Path::new(
            PathCandidate::direct(local.parse().unwrap()),
            PathCandidate::new(remote.parse().unwrap(), relay),
            Duration::from_millis(rtt_ms),
        )
    }

    #[test]
    fn fewer_relay_hops_win() {
        let direct = path("8.8.8.8:1", "9.9.9.9:2", false, 500);
        let relayed = path("127.0.0.1:1", "127.0.0.1:2", true, 1);
        assert!(direct.is_better_than(&relayed));
        assert!(!relayed.is_better_than(&direct));
    }

    #[test]
    fn lower_rank_beats_lower_rtt() {
        let lan = path("192.168.1.2:1", "192.168.1.3:2", false, 300);
        let wan = path("8.8.8.8:1", "9.9.9.9:2", false, 5);
        assert!(lan.is_better_than(&wan));
    }

    #[test]
    fn rank_uses_both_paths() {
        // Both candidates share the same local end; only the remote end's rank
        // differs, so the comparison must look at each path's own remote.
        let a = path("10.0.0.1:1", "192.168.0.9:2", false, 100);
        let b = path("10.0.0.1:1", "172.16.0.9:2", false, 1);
        assert!(a.is_better_than(&b));
        assert!(!b.is_better_than(&a));
    }

    #[test]
    fn equal_rank_lower_rtt_wins() {
        let fast = path("10.0.0.1:1", "10.0.0.2:2", false, 10);
        let slow = path("10.0.0.3:1", "10.0.0.4:2", false, 20);
        assert!(fast.is_better_than(&slow));
        assert!(!slow.is_better_than(&fast));
        assert!(!fast.is_better_than(&fast));
    }
}
