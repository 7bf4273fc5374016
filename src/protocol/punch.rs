//! Text bodies of the hole-punching messages.
//!
//! Fields are comma separated. A candidate is written as `ip:port,mode`
//! where bit 0 of `mode` means "via relay" and bit 1 marks a path substituted
//! from an observed datagram source rather than a declared address.
//!
//! ```text
//! PROPOSE          ts,target_addr,target_mode,descriptor
//! ACK / CONFIRM /  ts,local_addr,local_mode,remote_addr,remote_mode
//! CONFIRM-ACK
//! PING / PONG      ts
//! ```

use std::str::FromStr;

use punchlink_core::extend::addr::{addr_to_text, text_to_addr};
use punchlink_core::nat::Endpoint;
use punchlink_core::route::PathCandidate;

use crate::error::{Error, Result};

const MODE_RELAY: i32 = 0x1;
const MODE_OBSERVED: i32 = 0x2;

pub(crate) fn body_text(body: &[u8]) -> Result<&str> {
    std::str::from_utf8(body).map_err(|_| Error::Format("body is not utf-8".into()))
}

fn number<T: FromStr>(text: &str) -> Result<T> {
    text.trim()
        .parse()
        .map_err(|_| Error::Format(format!("bad number {text:?}")))
}

pub(crate) fn parse_candidate(addr: &str, mode: &str) -> Result<(PathCandidate, i32)> {
    let addr = text_to_addr(addr.trim()).map_err(|e| Error::Format(e.to_string()))?;
    let mode: i32 = number(mode)?;
    Ok((PathCandidate::new(addr, mode & MODE_RELAY != 0), mode))
}

pub(crate) fn write_candidate(out: &mut String, candidate: &PathCandidate, observed: bool) {
    let mut mode = 0;
    if candidate.relay {
        mode |= MODE_RELAY;
    }
    if observed {
        mode |= MODE_OBSERVED;
    }
    out.push_str(&addr_to_text(&candidate.addr));
    out.push(',');
    out.push_str(&mode.to_string());
}

/// PROPOSE: asks the owner of `target` to answer on every candidate of
/// `descriptor`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProposeBody {
    pub ts: u64,
    pub target: PathCandidate,
    pub descriptor: Endpoint,
}

impl ProposeBody {
    pub fn encode(&self) -> String {
        let mut out = format!("{},", self.ts);
        write_candidate(&mut out, &self.target, false);
        out.push(',');
        out.push_str(&self.descriptor.encode());
        out
    }
    pub fn decode(body: &[u8]) -> Result<Self> {
        let text = body_text(body)?;
        let fields: Vec<&str> = text.splitn(4, ',').collect();
        let [ts, addr, mode, descriptor] = fields[..] else {
            return Err(Error::Format(format!("propose body {text:?}")));
        };
        Ok(Self {
            ts: number(ts)?,
            target: parse_candidate(addr, mode)?.0,
            descriptor: Endpoint::decode(descriptor),
        })
    }
}

/// ACK, CONFIRM and CONFIRM-ACK all carry one path.
///
/// `local` is where the responder reaches the prober, `remote` where the
/// prober reaches the responder.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProbeBody {
    pub ts: u64,
    pub local: PathCandidate,
    pub remote: PathCandidate,
    /// `remote` was taken from an observed source address.
    pub observed: bool,
}

impl ProbeBody {
    pub fn new(ts: u64, local: PathCandidate, remote: PathCandidate) -> Self {
        Self {
            ts,
            local,
            remote,
            observed: false,
        }
    }
    pub fn encode(&self) -> String {
        let mut out = format!("{},", self.ts);
        write_candidate(&mut out, &self.local, false);
        out.push(',');
        write_candidate(&mut out, &self.remote, self.observed);
        out
    }
    pub fn decode(body: &[u8]) -> Result<Self> {
        let text = body_text(body)?;
        let fields: Vec<&str> = text.split(',').collect();
        let [ts, addr1, mode1, addr2, mode2] = fields[..] else {
            return Err(Error::Format(format!("probe body {text:?}")));
        };
        let (local, _) = parse_candidate(addr1, mode1)?;
        let (remote, flags) = parse_candidate(addr2, mode2)?;
        Ok(Self {
            ts: number(ts)?,
            local,
            remote,
            observed: flags & MODE_OBSERVED != 0,
        })
    }
}

/// PING and PONG: a timestamp echoed back.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PingBody {
    pub ts: u64,
}

impl PingBody {
    pub fn encode(&self) -> String {
        self.ts.to_string()
    }
    pub fn decode(body: &[u8]) -> Result<Self> {
        Ok(Self {
            ts: number(body_text(body)?)?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn candidate(s: &str, relay: bool) -> PathCandidate {
        PathCandidate::new(s.parse().unwrap(), relay)
    }

    #[test]
    fn propose_text() {
        let body = ProposeBody {
            ts: 1234,
            target: candidate("1.2.3.4:5000", true),
            descriptor: Endpoint::decode("192.168.1.2:3000+10.0.0.2:3000/9.9.9.9:1"),
        };
        let text = body.encode();
        assert_eq!(
            text,
            "1234,1.2.3.4:5000,1,192.168.1.2:3000+10.0.0.2:3000/9.9.9.9:1"
        );
        assert_eq!(ProposeBody::decode(text.as_bytes()).unwrap(), body);
    }

    #[test]
    fn propose_without_descriptor() {
        let body = ProposeBody::decode(b"7,1.2.3.4:5000,0,").unwrap();
        assert!(body.descriptor.is_empty());
    }

    #[test]
    fn probe_flags_are_independent() {
        let mut body = ProbeBody::new(
            9,
            candidate("10.0.0.1:1", true),
            candidate("10.0.0.2:2", false),
        );
        body.observed = true;
        let text = body.encode();
        assert_eq!(text, "9,10.0.0.1:1,1,10.0.0.2:2,2");
        let decoded = ProbeBody::decode(text.as_bytes()).unwrap();
        assert_eq!(decoded, body);
        assert!(!decoded.remote.relay);
    }

    #[test]
    fn malformed_bodies() {
        assert!(ProposeBody::decode(b"x,1.2.3.4:1,0,").is_err());
        assert!(ProbeBody::decode(b"1,1.2.3.4:1,0").is_err());
        assert!(ProbeBody::decode(b"1,nowhere,0,1.2.3.4:1,0").is_err());
        assert!(PingBody::decode(&[0xff, 0xfe]).is_err());
        assert_eq!(PingBody::decode(b"55").unwrap().ts, 55);
    }
}
