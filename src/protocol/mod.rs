/*
   0                                               31
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |                  source id                      |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |                  source key                     |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |                  dest id                        |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |                  dest key                       |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |                  source port                    |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |                  dest port                      |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |                  command                        |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |                  conversation                   |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |                  body(n)                        |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
   All fields are big-endian i32.
*/

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};
use node_id::PeerIdentity;
use protocol_type::Command;

pub mod handshake;
pub mod node_id;
pub mod protocol_type;
pub mod punch;

pub const HEAD_LEN: usize = 32;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct Header {
    pub suid: i32,
    pub skey: i32,
    pub duid: i32,
    pub dkey: i32,
    pub sport: i32,
    pub dport: i32,
    pub cmd: i32,
    pub conv: i32,
}

impl Header {
    pub fn new(src: PeerIdentity, dest: PeerIdentity, cmd: Command) -> Self {
        Self {
            suid: src.id,
            skey: src.key,
            duid: dest.id,
            dkey: dest.key,
            cmd: cmd.into(),
            ..Default::default()
        }
    }
    pub fn set_ports(mut self, sport: i32, dport: i32) -> Self {
        self.sport = sport;
        self.dport = dport;
        self
    }
    pub fn set_conv(mut self, conv: i32) -> Self {
        self.conv = conv;
        self
    }
    pub fn source(&self) -> PeerIdentity {
        PeerIdentity::new(self.suid, self.skey)
    }
    pub fn dest(&self) -> PeerIdentity {
        PeerIdentity::new(self.duid, self.dkey)
    }
    pub fn command(&self) -> Command {
        Command::from(self.cmd)
    }

    /// Decodes exactly [`HEAD_LEN`] bytes.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != HEAD_LEN {
            return Err(Error::Format(format!("header of {} bytes", buf.len())));
        }
        let field = |i: usize| {
            let at = i * 4;
            i32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
        };
        Ok(Self {
            suid: field(0),
            skey: field(1),
            duid: field(2),
            dkey: field(3),
            sport: field(4),
            dport: field(5),
            cmd: field(6),
            conv: field(7),
        })
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        for v in [
            self.suid, self.skey, self.duid, self.dkey, self.sport, self.dport, self.cmd,
            self.conv,
        ] {
            buf.put_i32(v);
        }
    }
}

/// Splits a datagram into its header and body.
pub fn split_packet(buf: &[u8]) -> Result<(Header, &[u8])> {
    if buf.len() < HEAD_LEN {
        return Err(Error::Format(format!("datagram of {} bytes", buf.len())));
    }
    let (head, body) = buf.split_at(HEAD_LEN);
    Ok((Header::decode(head)?, body))
}

/// Header followed by `body`, ready for the wire.
pub fn build_packet(header: &Header, body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEAD_LEN + body.len());
    header.encode_into(&mut buf);
    buf.put_slice(body);
    buf
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_layout() {
        let header = Header {
            suid: 1,
            skey: -1,
            duid: i32::MAX,
            dkey: i32::MIN,
            sport: 0,
            dport: 7,
            cmd: 0x4001,
            conv: -42,
        };
        let packet = build_packet(&header, b"body");
        assert_eq!(packet.len(), HEAD_LEN + 4);
        assert_eq!(&packet[..8], &[0, 0, 0, 1, 0xff, 0xff, 0xff, 0xff]);
        assert_eq!(&packet[24..28], &[0, 0, 0x40, 0x01]);
        let (decoded, body) = split_packet(&packet).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(body, b"body");
    }

    #[test]
    fn header_size_must_match() {
        assert!(Header::decode(&[0; 31]).is_err());
        assert!(Header::decode(&[0; 33]).is_err());
        assert!(split_packet(&[0; 20]).is_err());
        assert_eq!(Header::decode(&[0; 32]).unwrap(), Header::default());
    }
}
