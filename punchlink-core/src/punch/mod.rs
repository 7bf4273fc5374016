use std::net::SocketAddr;

use crate::nat::Endpoint;
use crate::route::PathCandidate;

pub use config::*;
pub mod config;

/// Lists the candidates worth probing to reach `endpoint`.
///
/// Order: every local candidate directly, then the external address via the
/// relay and directly, then the observed source of the peer's own traffic
/// (which captures NAT egress the peer did not advertise). Duplicate
/// `(addr, relay)` pairs are dropped, keeping the first.
pub fn enumerate(endpoint: &Endpoint, observed: Option<PathCandidate>) -> Vec<PathCandidate> {
    let mut list = Vec::with_capacity(endpoint.local().len() + 3);
    let mut push = |candidate: PathCandidate| {
        if !list.contains(&candidate) {
            list.push(candidate);
        }
    };
    for addr in endpoint.local() {
        push(PathCandidate::direct(*addr));
    }
    if let Some(external) = endpoint.external() {
        push(PathCandidate::relayed(external));
        push(PathCandidate::direct(external));
    }
    if let Some(observed) = observed {
        push(observed);
    }
    list
}

/// Same as [`enumerate`] seeded with an observed datagram source.
pub fn enumerate_with_source(
    endpoint: &Endpoint,
    source: SocketAddr,
    via_relay: bool,
) -> Vec<PathCandidate> {
    enumerate(endpoint, Some(PathCandidate::new(source, via_relay)))
}

#[cfg(test)]
mod test {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn enumerate_order() {
        let ep = Endpoint::new(
            vec![addr("192.168.1.2:3000"), addr("10.0.0.2:3000")],
            Some(addr("1.2.3.4:5000")),
        );
        let list = enumerate(&ep, None);
        assert_eq!(
            list,
            vec![
                PathCandidate::direct(addr("192.168.1.2:3000")),
                PathCandidate::direct(addr("10.0.0.2:3000")),
                PathCandidate::relayed(addr("1.2.3.4:5000")),
                PathCandidate::direct(addr("1.2.3.4:5000")),
            ]
        );
    }

    #[test]
    fn enumerate_dedup() {
        // publicly reachable: external duplicates a local candidate
        let ep = Endpoint::new(vec![addr("1.2.3.4:5000")], Some(addr("1.2.3.4:5000")));
        let list = enumerate_with_source(&ep, addr("1.2.3.4:5000"), false);
        assert_eq!(
            list,
            vec![
                PathCandidate::direct(addr("1.2.3.4:5000")),
                PathCandidate::relayed(addr("1.2.3.4:5000")),
            ]
        );
    }

    #[test]
    fn enumerate_observed_egress() {
        let ep = Endpoint::new(vec![addr("192.168.1.2:3000")], None);
        let list = enumerate_with_source(&ep, addr("5.6.7.8:61000"), true);
        assert_eq!(list.len(), 2);
        assert_eq!(list[1], PathCandidate::relayed(addr("5.6.7.8:61000")));
        assert!(enumerate(&Endpoint::default(), None).is_empty());
    }
}
