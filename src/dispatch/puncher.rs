use std::time::{Duration, Instant};

use punchlink_core::nat::Endpoint;
use punchlink_core::punch::{enumerate, PunchConfig};
use punchlink_core::route::route_table::{RecordAction, RecordState, RouteTable};
use punchlink_core::route::{Path, PathCandidate};
use punchlink_core::socket::Transport;

use crate::dispatch::send_packet;
use crate::error::Result;
use crate::protocol::node_id::PeerIdentity;
use crate::protocol::protocol_type::Command;
use crate::protocol::punch::{PingBody, ProbeBody, ProposeBody};
use crate::protocol::Header;

/// The hole-punching coordinator of one host: a route record per remote
/// identity plus the handlers of the four probe messages and ping/pong.
///
/// Timestamps on the wire are milliseconds since `epoch` and are only ever
/// echoed back to us.
pub struct Puncher {
    identity: PeerIdentity,
    table: RouteTable<PeerIdentity>,
    epoch: Instant,
}

impl Puncher {
    pub fn new(identity: PeerIdentity, config: PunchConfig, epoch: Instant) -> Self {
        Self {
            identity,
            table: RouteTable::new(config),
            epoch,
        }
    }

    pub fn table(&self) -> &RouteTable<PeerIdentity> {
        &self.table
    }

    fn timestamp(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64
    }

    fn elapsed_since(&self, ts: u64, now: Instant) -> Duration {
        Duration::from_millis(self.timestamp(now).saturating_sub(ts))
    }

    /// Current best path to `peer`, creating a record and starting to probe
    /// `endpoint` on first use. Returns `None` until the record validates.
    pub fn best_path(
        &mut self,
        tx: &mut dyn Transport,
        local: &Endpoint,
        peer: PeerIdentity,
        endpoint: &Endpoint,
        now: Instant,
    ) -> Option<Path> {
        if self.table.is_suppressed(&peer, now) {
            return None;
        }
        if self.table.discard_stale(&peer, endpoint) {
            log::info!(
                "[{}] descriptor of {peer} changed, probing again",
                self.identity.id
            );
        }
        if self.table.get(&peer).is_none() {
            self.table.insert(peer, endpoint.clone(), now);
            self.propose(tx, local, peer, endpoint, now);
            return None;
        }
        self.table.best_path(&peer)
    }

    fn propose(
        &self,
        tx: &mut dyn Transport,
        local: &Endpoint,
        peer: PeerIdentity,
        endpoint: &Endpoint,
        now: Instant,
    ) {
        let header = Header::new(self.identity, peer, Command::Propose);
        let ts = self.timestamp(now);
        for target in enumerate(endpoint, None) {
            let body = ProposeBody {
                ts,
                target,
                descriptor: local.clone(),
            };
            send_packet(tx, &header, body.encode().as_bytes(), target);
        }
    }

    /// Responder: answer on every candidate of the prober, including the
    /// source this PROPOSE actually came from.
    pub fn on_propose(
        &mut self,
        tx: &mut dyn Transport,
        header: &Header,
        body: &[u8],
        source: PathCandidate,
    ) -> Result<()> {
        let propose = ProposeBody::decode(body)?;
        let reply = Header::new(self.identity, header.source(), Command::ProposeAck);
        for candidate in enumerate(&propose.descriptor, Some(source)) {
            let ack = ProbeBody::new(propose.ts, candidate, propose.target);
            send_packet(tx, &reply, ack.encode().as_bytes(), candidate);
        }
        Ok(())
    }

    /// Prober: confirm the acknowledged path, and the path through the
    /// observed source if it differs from the declared one.
    pub fn on_propose_ack(
        &mut self,
        tx: &mut dyn Transport,
        header: &Header,
        body: &[u8],
        source: PathCandidate,
        now: Instant,
    ) -> Result<()> {
        let ack = ProbeBody::decode(body)?;
        let peer = header.source();
        if self.table.get(&peer).is_none() {
            log::debug!("[{}] ack from {peer} without a record", self.identity.id);
            return Ok(());
        }
        let reply = Header::new(self.identity, peer, Command::Confirm);
        let ts = self.timestamp(now);
        let confirm = ProbeBody::new(ts, ack.local, ack.remote);
        send_packet(tx, &reply, confirm.encode().as_bytes(), ack.remote);
        if source != ack.remote {
            let observed = ProbeBody {
                observed: true,
                ..ProbeBody::new(ts, ack.local, source)
            };
            send_packet(tx, &reply, observed.encode().as_bytes(), source);
        }
        Ok(())
    }

    /// Responder: echo the confirmation back over the prober's candidate.
    pub fn on_confirm(
        &mut self,
        tx: &mut dyn Transport,
        header: &Header,
        body: &[u8],
    ) -> Result<()> {
        let confirm = ProbeBody::decode(body)?;
        let reply = Header::new(self.identity, header.source(), Command::ConfirmAck);
        send_packet(tx, &reply, body, confirm.local);
        Ok(())
    }

    /// Prober: the path works both ways; record it.
    pub fn on_confirm_ack(&mut self, header: &Header, body: &[u8], now: Instant) -> Result<()> {
        let confirm = ProbeBody::decode(body)?;
        let peer = header.source();
        let rtt = self.elapsed_since(confirm.ts, now);
        let path = Path::new(confirm.local, confirm.remote, rtt);
        let before = self.table.get(&peer).map(|r| r.state());
        if !self.table.record(&peer, path, now) {
            return Ok(());
        }
        log::debug!("[{}] path to {peer}: {path}", self.identity.id);
        let after = self.table.get(&peer).map(|r| r.state());
        if before != after && after == Some(RecordState::Validated) {
            log::info!("[{}] route to {peer} validated via {path}", self.identity.id);
        }
        Ok(())
    }

    pub fn on_ping(
        &mut self,
        tx: &mut dyn Transport,
        header: &Header,
        body: &[u8],
        source: PathCandidate,
    ) -> Result<()> {
        PingBody::decode(body)?;
        let reply = Header::new(self.identity, header.source(), Command::Pong);
        send_packet(tx, &reply, body, source);
        Ok(())
    }

    pub fn on_pong(&mut self, header: &Header, body: &[u8], now: Instant) -> Result<()> {
        let pong = PingBody::decode(body)?;
        let peer = header.source();
        if self.table.touch(&peer, now) {
            log::trace!(
                "[{}] pong from {peer} after {:?}",
                self.identity.id,
                self.elapsed_since(pong.ts, now)
            );
        }
        Ok(())
    }

    /// Liveness pass over every record: PROPOSE retries while probing, pings
    /// once validated, eviction on expiry.
    pub fn sweep(&mut self, tx: &mut dyn Transport, local: &Endpoint, now: Instant) {
        for (peer, endpoint, action) in self.table.sweep(now) {
            match action {
                RecordAction::Idle => {}
                RecordAction::Propose => self.propose(tx, local, peer, &endpoint, now),
                RecordAction::Ping(path) => {
                    let header = Header::new(self.identity, peer, Command::Ping);
                    let body = PingBody {
                        ts: self.timestamp(now),
                    };
                    send_packet(tx, &header, body.encode().as_bytes(), path.remote);
                }
                RecordAction::Expired => {
                    log::info!("[{}] route to {peer} expired", self.identity.id);
                }
                RecordAction::Unreachable => {
                    log::info!(
                        "[{}] {peer} unreachable, cooling down for {:?}",
                        self.identity.id,
                        self.table.config().negative_cooldown
                    );
                }
            }
        }
    }

    /// Whether `peer` is in the negative cache.
    pub fn is_suppressed(&mut self, peer: &PeerIdentity, now: Instant) -> bool {
        self.table.is_suppressed(peer, now)
    }

    pub fn touch(&mut self, peer: &PeerIdentity, now: Instant) -> bool {
        self.table.touch(peer, now)
    }

    pub fn forget(&mut self, peer: &PeerIdentity) -> bool {
        self.table.remove(peer).is_some()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use punchlink_core::socket::memory::SimNetwork;

    use crate::protocol::split_packet;

    const A: PeerIdentity = PeerIdentity::new(100, 1);
    const B: PeerIdentity = PeerIdentity::new(200, 2);

    fn recv_all(socket: &mut dyn Transport) -> Vec<(Header, Vec<u8>, PathCandidate)> {
        let mut out = Vec::new();
        while let Some(datagram) = socket.recv_from() {
            let (header, body) = split_packet(&datagram.payload).unwrap();
            out.push((header, body.to_vec(), datagram.source));
        }
        out
    }

    #[test]
    fn four_way_probe_validates() {
        let net = SimNetwork::default();
        let mut a_sock = net.bind("10.0.0.1:1000".parse().unwrap());
        let mut b_sock = net.bind("10.0.0.2:2000".parse().unwrap());
        let start = Instant::now();
        a_sock.poll(start);
        b_sock.poll(start);
        let a_ep = Endpoint::new(a_sock.local_candidates(), None);
        let b_ep = Endpoint::new(b_sock.local_candidates(), None);
        let mut a = Puncher::new(A, PunchConfig::default(), start);
        let mut b = Puncher::new(B, PunchConfig::default(), start);

        assert_eq!(a.best_path(&mut a_sock, &a_ep, B, &b_ep, start), None);
        let now = start + Duration::from_millis(20);
        a_sock.poll(now);
        b_sock.poll(now);

        let proposes = recv_all(&mut b_sock);
        assert_eq!(proposes.len(), 1);
        let (header, body, source) = &proposes[0];
        assert_eq!(header.command(), Command::Propose);
        b.on_propose(&mut b_sock, header, body, *source).unwrap();

        let acks = recv_all(&mut a_sock);
        assert_eq!(acks.len(), 1);
        let (header, body, source) = &acks[0];
        a.on_propose_ack(&mut a_sock, header, body, *source, now)
            .unwrap();

        let confirms = recv_all(&mut b_sock);
        assert_eq!(confirms.len(), 1);
        let (header, body, _) = &confirms[0];
        b.on_confirm(&mut b_sock, header, body).unwrap();

        let done = recv_all(&mut a_sock);
        let (header, body, _) = &done[0];
        assert_eq!(header.command(), Command::ConfirmAck);
        a.on_confirm_ack(header, body, now).unwrap();

        let path = a.best_path(&mut a_sock, &a_ep, B, &b_ep, now).unwrap();
        assert!(path.is_direct());
        assert_eq!(path.remote, PathCandidate::direct(b_sock.local_addr()));
        assert_eq!(path.local, PathCandidate::direct(a_sock.local_addr()));
    }

    #[test]
    fn observed_source_is_confirmed_too() {
        let net = SimNetwork::default();
        let mut a_sock = net.bind("10.0.0.1:1000".parse().unwrap());
        let start = Instant::now();
        a_sock.poll(start);
        let a_ep = Endpoint::new(a_sock.local_candidates(), None);
        let b_ep = Endpoint::decode("10.0.0.2:2000");
        let mut a = Puncher::new(A, PunchConfig::default(), start);
        a.best_path(&mut a_sock, &a_ep, B, &b_ep, start);

        let mut b_sock = net.bind_translated(
            "192.168.0.2:2000".parse().unwrap(),
            "5.5.5.5:7000".parse().unwrap(),
        );
        b_sock.poll(start);
        let header = Header::new(B, A, Command::ProposeAck);
        let ack = ProbeBody::new(
            0,
            PathCandidate::direct(a_sock.local_addr()),
            PathCandidate::direct("10.0.0.2:2000".parse().unwrap()),
        );
        let observed = PathCandidate::direct("5.5.5.5:7000".parse().unwrap());
        a.on_propose_ack(&mut a_sock, &header, ack.encode().as_bytes(), observed, start)
            .unwrap();
        let confirms = recv_all(&mut b_sock);
        assert_eq!(confirms.len(), 1);
        let body = ProbeBody::decode(&confirms[0].1).unwrap();
        assert!(body.observed);
        assert_eq!(body.remote, observed);
    }

    #[test]
    fn unvalidated_peer_is_negative_cached() {
        let net = SimNetwork::default();
        let mut a_sock = net.bind("10.0.0.1:1000".parse().unwrap());
        let start = Instant::now();
        let a_ep = Endpoint::new(a_sock.local_candidates(), None);
        let b_ep = Endpoint::decode("10.9.9.9:1");
        let mut a = Puncher::new(A, PunchConfig::default(), start);
        assert!(a.best_path(&mut a_sock, &a_ep, B, &b_ep, start).is_none());
        let mut now = start;
        while now < start + Duration::from_secs(31) {
            now += Duration::from_millis(100);
            a.sweep(&mut a_sock, &a_ep, now);
        }
        assert!(a.table().get(&B).is_none());
        // cooling down: no record is created
        assert!(a.best_path(&mut a_sock, &a_ep, B, &b_ep, now).is_none());
        assert!(a.table().get(&B).is_none());
        let later = now + Duration::from_secs(26);
        assert!(a.best_path(&mut a_sock, &a_ep, B, &b_ep, later).is_none());
        assert!(a.table().get(&B).is_some());
    }

    #[test]
    fn ping_is_answered_and_touches() {
        let net = SimNetwork::default();
        let mut a_sock = net.bind("10.0.0.1:1000".parse().unwrap());
        let mut b_sock = net.bind("10.0.0.2:2000".parse().unwrap());
        let start = Instant::now();
        a_sock.poll(start);
        b_sock.poll(start);
        let mut b = Puncher::new(B, PunchConfig::default(), start);
        let ping = Header::new(A, B, Command::Ping);
        b.on_ping(
            &mut b_sock,
            &ping,
            b"42",
            PathCandidate::direct(a_sock.local_addr()),
        )
        .unwrap();
        let pongs = recv_all(&mut a_sock);
        assert_eq!(pongs[0].0.command(), Command::Pong);
        assert_eq!(pongs[0].1, b"42");
        assert!(b.on_ping(&mut b_sock, &ping, b"x", PathCandidate::default()).is_err());
    }
}
