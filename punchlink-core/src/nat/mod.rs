//! Endpoint model: the set of addresses a host can be reached on.
//!
//! An [`Endpoint`] carries the local interface candidates plus, when the
//! rendezvous service has mirrored it, the externally observed address.
//! Its text form (the "descriptor") is what peers exchange out of band and
//! inside PROPOSE messages:
//!
//! ```text
//! 192.168.1.2:3000+10.0.0.2:3000/218.107.55.254:1234
//! ```
//!
//! # Examples
//!
//! ```rust
//! use punchlink_core::nat::{Endpoint, Locality};
//!
//! let ep = Endpoint::decode("192.168.1.2:3000/1.2.3.4:5000");
//! assert_eq!(ep.locality(), Locality::BehindTranslation);
//! assert_eq!(Endpoint::decode(&ep.encode()), ep);
//! ```

use std::net::SocketAddr;

use crate::extend::addr::{addr_to_text, text_to_addr};

const CANDIDATE_SEPARATOR: char = '+';
const EXTERNAL_SEPARATOR: char = '/';

/// Derived reachability class of an [`Endpoint`].
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Hash)]
pub enum Locality {
    /// No external address known.
    #[default]
    Normal,
    /// The external address differs from every local candidate.
    BehindTranslation,
    /// The external address is one of the local candidates.
    PubliclyReachable,
}

impl Locality {
    #[inline]
    pub fn is_translated(&self) -> bool {
        self == &Locality::BehindTranslation
    }
    #[inline]
    pub fn is_public(&self) -> bool {
        self == &Locality::PubliclyReachable
    }
}

/// Candidate addresses of one host.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Endpoint {
    local: Vec<SocketAddr>,
    external: Option<SocketAddr>,
    locality: Locality,
}

impl Endpoint {
    pub fn new(local: Vec<SocketAddr>, external: Option<SocketAddr>) -> Self {
        let mut endpoint = Self {
            local,
            external,
            locality: Locality::Normal,
        };
        endpoint.classify();
        endpoint
    }

    fn classify(&mut self) -> Locality {
        self.locality = match self.external {
            None => Locality::Normal,
            Some(external) if self.local.contains(&external) => Locality::PubliclyReachable,
            Some(_) => Locality::BehindTranslation,
        };
        self.locality
    }

    pub fn local(&self) -> &[SocketAddr] {
        &self.local
    }
    pub fn external(&self) -> Option<SocketAddr> {
        self.external
    }
    pub fn locality(&self) -> Locality {
        self.locality
    }
    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.external.is_none()
    }

    pub fn set_local(&mut self, local: Vec<SocketAddr>) {
        self.local = local;
        self.classify();
    }
    pub fn push_local(&mut self, addr: SocketAddr) {
        self.local.push(addr);
        self.classify();
    }
    pub fn set_external(&mut self, external: Option<SocketAddr>) {
        self.external = external;
        self.classify();
    }

    /// Canonical descriptor text. Two endpoints are route-equivalent iff
    /// their encodings match.
    pub fn encode(&self) -> String {
        let mut text = self
            .local
            .iter()
            .map(addr_to_text)
            .collect::<Vec<_>>()
            .join(&CANDIDATE_SEPARATOR.to_string());
        if let Some(external) = &self.external {
            text.push(EXTERNAL_SEPARATOR);
            text.push_str(&addr_to_text(external));
        }
        text
    }

    /// Parses a descriptor. Unparseable tokens are skipped, so malformed
    /// input yields a partial or empty endpoint rather than an error.
    pub fn decode(text: &str) -> Self {
        let text = text.trim();
        let (candidates, external) = match text.split_once(EXTERNAL_SEPARATOR) {
            Some((candidates, external)) => (candidates, text_to_addr(external).ok()),
            None => (text, None),
        };
        let local = candidates
            .split(CANDIDATE_SEPARATOR)
            .filter(|token| !token.trim().is_empty())
            .filter_map(|token| match text_to_addr(token) {
                Ok(addr) => Some(addr),
                Err(e) => {
                    log::debug!("skip descriptor token {token:?}: {e}");
                    None
                }
            })
            .collect();
        Self::new(local, external)
    }

    pub fn route_equivalent(&self, other: &Endpoint) -> bool {
        self.encode() == other.encode()
    }
}
