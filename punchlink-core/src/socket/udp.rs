use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use bytes::Bytes;
use network_interface::{NetworkInterface, NetworkInterfaceConfig};
use socket2::Protocol;

use crate::error::Result;
use crate::extend::addr::address_rank;
use crate::relay::{RelayCommand, RelayFrame};
use crate::route::PathCandidate;
use crate::socket::{Datagram, Transport, DEFAULT_QUEUE_LIMIT};

/// Binds a non-blocking UDP socket with address reuse enabled.
pub fn bind_udp(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = if addr.is_ipv4() {
        socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(Protocol::UDP),
        )?
    } else {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV6,
            socket2::Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        socket.set_only_v6(true)?;
        socket
    };
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Local IPv4 interface addresses with `port`, most local first.
/// Falls back to loopback when nothing usable is found.
pub fn local_ipv4_candidates(port: u16) -> Vec<SocketAddr> {
    let mut ips: Vec<Ipv4Addr> = match NetworkInterface::show() {
        Ok(interfaces) => interfaces
            .into_iter()
            .flat_map(|iface| iface.addr)
            .filter_map(|addr| match addr.ip() {
                IpAddr::V4(ip) if !ip.is_unspecified() && !ip.is_link_local() => Some(ip),
                _ => None,
            })
            .collect(),
        Err(e) => {
            log::warn!("interface enumeration failed: {e:?}");
            Vec::new()
        }
    };
    ips.sort_by_key(|ip| (address_rank(ip), *ip));
    ips.dedup();
    if ips.is_empty() {
        ips.push(Ipv4Addr::LOCALHOST);
    }
    ips.into_iter()
        .map(|ip| SocketAddr::new(IpAddr::V4(ip), port))
        .collect()
}

#[derive(Clone, Debug)]
pub struct UdpConfig {
    pub bind: SocketAddr,
    /// Rendezvous/relay service; without it no external address is learned
    /// and relayed sends fail.
    pub relay: Option<SocketAddr>,
    pub queue_limit: usize,
    /// First MIRROR retry interval while the external address is unknown.
    pub mirror_interval: Duration,
    pub mirror_backoff: f64,
    pub mirror_max_interval: Duration,
    /// MIRROR refresh interval once mirrored.
    pub mirror_refresh: Duration,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            relay: None,
            queue_limit: DEFAULT_QUEUE_LIMIT,
            mirror_interval: Duration::from_millis(300),
            mirror_backoff: 1.3,
            mirror_max_interval: Duration::from_secs(10),
            mirror_refresh: Duration::from_secs(25),
        }
    }
}

impl UdpConfig {
    pub fn set_bind(mut self, bind: SocketAddr) -> Self {
        self.bind = bind;
        self
    }
    pub fn set_relay(mut self, relay: SocketAddr) -> Self {
        self.relay = Some(relay);
        self
    }
    pub fn set_queue_limit(mut self, queue_limit: usize) -> Self {
        self.queue_limit = queue_limit;
        self
    }
}

/// [`Transport`] over a real UDP socket.
pub struct UdpTransport {
    socket: UdpSocket,
    config: UdpConfig,
    local: Vec<SocketAddr>,
    external: Option<SocketAddr>,
    queue: VecDeque<Datagram>,
    buf: Vec<u8>,
    next_mirror: Option<Instant>,
    mirror_interval: Duration,
    overflow: u64,
}

impl UdpTransport {
    pub fn bind(config: UdpConfig) -> Result<Self> {
        let socket = bind_udp(config.bind)?;
        let bound = socket.local_addr()?;
        let local = if bound.ip().is_unspecified() {
            local_ipv4_candidates(bound.port())
        } else {
            vec![bound]
        };
        log::info!("udp transport bound {bound}, candidates {local:?}");
        Ok(Self {
            socket,
            mirror_interval: config.mirror_interval,
            config,
            local,
            external: None,
            queue: VecDeque::new(),
            buf: vec![0; 65536],
            next_mirror: None,
            overflow: 0,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Datagrams dropped because the inbound queue was full.
    pub fn overflow(&self) -> u64 {
        self.overflow
    }

    fn mirror(&mut self, now: Instant) {
        let Some(relay) = self.config.relay else {
            return;
        };
        if self.next_mirror.is_some_and(|at| now < at) {
            return;
        }
        let interval = if self.external.is_some() {
            self.config.mirror_refresh
        } else {
            let interval = self.mirror_interval;
            self.mirror_interval = interval
                .mul_f64(self.config.mirror_backoff)
                .min(self.config.mirror_max_interval);
            interval
        };
        self.next_mirror = Some(now + interval);
        let unspecified = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        match RelayFrame::new(RelayCommand::Mirror, unspecified, &[]) {
            Ok(frame) => {
                if let Err(e) = self.socket.send_to(&frame.encode(), relay) {
                    log::warn!("mirror request to {relay} failed: {e:?}");
                }
            }
            Err(e) => log::warn!("mirror request: {e}"),
        }
    }

    fn push(&mut self, datagram: Datagram) {
        if self.queue.len() >= self.config.queue_limit {
            self.overflow += 1;
            return;
        }
        self.queue.push_back(datagram);
    }

    fn on_relay_frame(&mut self, len: usize) -> bool {
        let Ok(frame) = RelayFrame::parse(&self.buf[..len]) else {
            return false;
        };
        match frame.cmd {
            RelayCommand::Mirror => {
                let observed = SocketAddr::V4(frame.addr);
                if self.external != Some(observed) {
                    log::info!("external address mirrored as {observed}");
                    self.external = Some(observed);
                }
            }
            RelayCommand::Echo => {}
            RelayCommand::Forward => {
                let datagram = Datagram::new(
                    Bytes::copy_from_slice(frame.payload),
                    PathCandidate::relayed(SocketAddr::V4(frame.addr)),
                );
                self.push(datagram);
            }
        }
        true
    }

    fn drain(&mut self) {
        loop {
            let (len, source) = match self.socket.recv_from(&mut self.buf) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                // ICMP port unreachable surfaces here on some platforms
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    log::warn!("udp receive failed: {e:?}");
                    return;
                }
            };
            if Some(source) == self.config.relay && self.on_relay_frame(len) {
                continue;
            }
            let datagram = Datagram::new(
                Bytes::copy_from_slice(&self.buf[..len]),
                PathCandidate::direct(source),
            );
            self.push(datagram);
        }
    }
}

impl Transport for UdpTransport {
    fn send_to(&mut self, buf: &[u8], dest: PathCandidate) -> io::Result<()> {
        if !dest.relay {
            return self.socket.send_to(buf, dest.addr).map(|_| ());
        }
        let Some(relay) = self.config.relay else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no relay configured",
            ));
        };
        let frame = RelayFrame::new(RelayCommand::Forward, dest.addr, buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        self.socket.send_to(&frame.encode(), relay).map(|_| ())
    }

    fn recv_from(&mut self) -> Option<Datagram> {
        self.queue.pop_front()
    }

    fn local_candidates(&self) -> Vec<SocketAddr> {
        self.local.clone()
    }

    fn external_addr(&self) -> Option<SocketAddr> {
        self.external
    }

    fn poll(&mut self, now: Instant) {
        self.mirror(now);
        self.drain();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::relay::RelayServer;

    fn wait_for<F: FnMut() -> bool>(mut f: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn candidates_never_empty() {
        let candidates = local_ipv4_candidates(4000);
        assert!(!candidates.is_empty());
        assert!(candidates.iter().all(|c| c.port() == 4000));
    }

    #[test]
    fn direct_loopback() {
        let loopback = "127.0.0.1:0".parse().unwrap();
        let mut a = UdpTransport::bind(UdpConfig::default().set_bind(loopback)).unwrap();
        let mut b = UdpTransport::bind(UdpConfig::default().set_bind(loopback)).unwrap();
        let b_addr = b.local_addr().unwrap();
        a.send_to(b"ping", PathCandidate::direct(b_addr)).unwrap();
        let mut got = None;
        assert!(wait_for(|| {
            b.poll(Instant::now());
            got = b.recv_from();
            got.is_some()
        }));
        let got = got.unwrap();
        assert_eq!(&got.payload[..], b"ping");
        assert_eq!(got.source, PathCandidate::direct(a.local_addr().unwrap()));
    }

    #[test]
    fn mirror_and_forward_through_relay() {
        let loopback: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut relay = RelayServer::bind(loopback).unwrap();
        let relay_addr = relay.local_addr().unwrap();
        let config = UdpConfig::default().set_bind(loopback).set_relay(relay_addr);
        let mut a = UdpTransport::bind(config.clone()).unwrap();
        let mut b = UdpTransport::bind(config).unwrap();
        assert!(wait_for(|| {
            let now = Instant::now();
            a.poll(now);
            b.poll(now);
            relay.poll().unwrap();
            a.external_addr().is_some() && b.external_addr().is_some()
        }));
        assert_eq!(a.external_addr(), a.local_addr().ok());

        let b_addr = b.local_addr().unwrap();
        a.send_to(b"via relay", PathCandidate::relayed(b_addr))
            .unwrap();
        let mut got = None;
        assert!(wait_for(|| {
            relay.poll().unwrap();
            b.poll(Instant::now());
            got = b.recv_from();
            got.is_some()
        }));
        let got = got.unwrap();
        assert_eq!(&got.payload[..], b"via relay");
        assert_eq!(
            got.source,
            PathCandidate::relayed(a.local_addr().unwrap())
        );
    }
}
