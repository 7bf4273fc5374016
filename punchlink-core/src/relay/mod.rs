//! Rendezvous/relay service.
//!
//! The relay answers three requests, each a 16-byte frame header optionally
//! followed by a payload:
//!
//! ```text
//! | cmd: u32 | ipv4: [u8; 4] | port: u16 | reserved: [u8; 6] | payload... |
//! ```
//!
//! - `ECHO`: sent back unchanged, used by clients to measure their distance.
//! - `MIRROR`: answered with the address the request was observed from.
//! - `FORWARD`: the payload is re-sent to the address in the header, which
//!   the relay rewrites to the original sender's observed address.
//!
//! All multi-byte fields are big-endian.

use std::io;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::socket::udp::bind_udp;

pub const RELAY_HEAD_LEN: usize = 16;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum RelayCommand {
    Echo = 0x6001,
    Mirror = 0x6002,
    Forward = 0x6004,
}

impl TryFrom<u32> for RelayCommand {
    type Error = Error;

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        match value {
            0x6001 => Ok(RelayCommand::Echo),
            0x6002 => Ok(RelayCommand::Mirror),
            0x6004 => Ok(RelayCommand::Forward),
            _ => Err(Error::InvalidRelayFrame),
        }
    }
}

/// A parsed relay frame borrowing its payload.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RelayFrame<'a> {
    pub cmd: RelayCommand,
    pub addr: SocketAddrV4,
    pub payload: &'a [u8],
}

impl<'a> RelayFrame<'a> {
    pub fn new(cmd: RelayCommand, addr: SocketAddr, payload: &'a [u8]) -> Result<Self> {
        match addr {
            SocketAddr::V4(addr) => Ok(Self { cmd, addr, payload }),
            SocketAddr::V6(_) => Err(Error::NotSupportIPV6),
        }
    }

    pub fn parse(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < RELAY_HEAD_LEN {
            return Err(Error::InvalidRelayFrame);
        }
        let cmd = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]).try_into()?;
        let ip = [buf[4], buf[5], buf[6], buf[7]];
        let port = u16::from_be_bytes([buf[8], buf[9]]);
        Ok(Self {
            cmd,
            addr: SocketAddrV4::new(ip.into(), port),
            payload: &buf[RELAY_HEAD_LEN..],
        })
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(RELAY_HEAD_LEN + self.payload.len());
        buf.put_u32(self.cmd as u32);
        buf.put_slice(&self.addr.ip().octets());
        buf.put_u16(self.addr.port());
        buf.put_bytes(0, 6);
        buf.put_slice(self.payload);
        buf
    }
}

/// Computes the relay's reply to one request: the bytes and where they go.
pub fn respond(request: &[u8], source: SocketAddr) -> Result<(BytesMut, SocketAddr)> {
    let frame = RelayFrame::parse(request)?;
    match frame.cmd {
        RelayCommand::Echo => Ok((BytesMut::from(request), source)),
        RelayCommand::Mirror => {
            let reply = RelayFrame::new(RelayCommand::Mirror, source, &[])?;
            Ok((reply.encode(), source))
        }
        RelayCommand::Forward => {
            let reply = RelayFrame::new(RelayCommand::Forward, source, frame.payload)?;
            Ok((reply.encode(), SocketAddr::V4(frame.addr)))
        }
    }
}

/// A minimal poll-driven relay on a non-blocking UDP socket.
pub struct RelayServer {
    socket: UdpSocket,
    buf: Vec<u8>,
    forwarded: u64,
    rejected: u64,
}

impl RelayServer {
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = bind_udp(addr)?;
        log::info!("relay listening on {}", socket.local_addr()?);
        Ok(Self {
            socket,
            buf: vec![0; 65536],
            forwarded: 0,
            rejected: 0,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// (answered, rejected) request counters.
    pub fn stats(&self) -> (u64, u64) {
        (self.forwarded, self.rejected)
    }

    /// Answers every request currently queued on the socket, returning how
    /// many were processed.
    pub fn poll(&mut self) -> Result<usize> {
        let mut count = 0;
        loop {
            let (len, source) = match self.socket.recv_from(&mut self.buf) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(count),
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e.into()),
            };
            count += 1;
            match respond(&self.buf[..len], source) {
                Ok((reply, dest)) => {
                    if let Err(e) = self.socket.send_to(&reply, dest) {
                        log::warn!("relay send to {dest} failed: {e:?}");
                    }
                    self.forwarded += 1;
                }
                Err(e) => {
                    log::debug!("relay dropped {len} bytes from {source}: {e}");
                    self.rejected += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::{Duration, Instant};

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn frame_layout() {
        let frame = RelayFrame::new(RelayCommand::Forward, addr("1.2.3.4:258"), b"abc").unwrap();
        let buf = frame.encode();
        assert_eq!(buf.len(), RELAY_HEAD_LEN + 3);
        assert_eq!(&buf[..4], &[0, 0, 0x60, 0x04]);
        assert_eq!(&buf[4..10], &[1, 2, 3, 4, 1, 2]);
        assert_eq!(RelayFrame::parse(&buf).unwrap(), frame);
    }

    #[test]
    fn rejects_bad_frames() {
        assert!(RelayFrame::parse(&[0; 8]).is_err());
        assert!(RelayFrame::parse(&[0xff; 16]).is_err());
        assert!(matches!(
            RelayFrame::new(RelayCommand::Echo, addr("[::1]:1"), &[]),
            Err(Error::NotSupportIPV6)
        ));
    }

    #[test]
    fn respond_mirror_and_forward() {
        let client = addr("9.9.9.9:4000");
        let mirror = RelayFrame::new(RelayCommand::Mirror, addr("0.0.0.0:0"), &[])
            .unwrap()
            .encode();
        let (reply, dest) = respond(&mirror, client).unwrap();
        assert_eq!(dest, client);
        assert_eq!(
            SocketAddr::V4(RelayFrame::parse(&reply).unwrap().addr),
            client
        );

        let target = addr("8.8.8.8:5000");
        let forward = RelayFrame::new(RelayCommand::Forward, target, b"payload")
            .unwrap()
            .encode();
        let (reply, dest) = respond(&forward, client).unwrap();
        assert_eq!(dest, target);
        let frame = RelayFrame::parse(&reply).unwrap();
        assert_eq!(SocketAddr::V4(frame.addr), client);
        assert_eq!(frame.payload, b"payload");
    }

    #[test]
    fn loopback_echo() {
        let mut server = RelayServer::bind(addr("127.0.0.1:0")).unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let echo = RelayFrame::new(RelayCommand::Echo, addr("0.0.0.0:0"), b"t")
            .unwrap()
            .encode();
        client.send_to(&echo, server_addr).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while server.poll().unwrap() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        let mut buf = [0u8; 64];
        let (len, _) = client.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], &echo[..]);
        assert_eq!(server.stats(), (1, 0));
    }
}
