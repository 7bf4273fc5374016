//! Handshake bodies. Only SYN1 carries one: the path the initiator adopted,
//! in the same candidate notation as the punching messages.

use punchlink_core::route::{Path, PathCandidate, DEFAULT_RTT};

use crate::error::{Error, Result};
use crate::protocol::punch::{body_text, parse_candidate, write_candidate};

/// The initiator's view of the path: `local` is where the responder reaches
/// the initiator, `remote` where the initiator reaches the responder.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PathBody {
    pub local: PathCandidate,
    pub remote: PathCandidate,
}

impl PathBody {
    pub fn encode(&self) -> String {
        let mut out = String::new();
        write_candidate(&mut out, &self.local, false);
        out.push(',');
        write_candidate(&mut out, &self.remote, false);
        out
    }
    pub fn decode(body: &[u8]) -> Result<Self> {
        let text = body_text(body)?;
        let fields: Vec<&str> = text.split(',').collect();
        let [addr1, mode1, addr2, mode2] = fields[..] else {
            return Err(Error::Format(format!("path body {text:?}")));
        };
        Ok(Self {
            local: parse_candidate(addr1, mode1)?.0,
            remote: parse_candidate(addr2, mode2)?.0,
        })
    }
    /// The same path seen from the responder's side.
    pub fn reversed(&self) -> Path {
        Path::new(self.remote, self.local, DEFAULT_RTT)
    }
}

impl From<&Path> for PathBody {
    fn from(path: &Path) -> Self {
        Self {
            local: path.local,
            remote: path.remote,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn path_body() {
        let body = PathBody {
            local: PathCandidate::relayed("1.1.1.1:1".parse().unwrap()),
            remote: PathCandidate::direct("2.2.2.2:2".parse().unwrap()),
        };
        assert_eq!(body.encode(), "1.1.1.1:1,1,2.2.2.2:2,0");
        assert_eq!(PathBody::decode(body.encode().as_bytes()).unwrap(), body);
        let reversed = body.reversed();
        assert_eq!(reversed.local, body.remote);
        assert_eq!(reversed.remote, body.local);
        assert!(PathBody::decode(b"").is_err());
    }
}
