use std::fmt;

/// Identity of a host: an id plus a capability key.
///
/// The key only reduces accidental delivery between hosts that happen to
/// reuse an id; it is not a credential.
///
/// # Examples
///
/// ```rust
/// use punchlink::PeerIdentity;
///
/// let a = PeerIdentity::new(100, 1);
/// assert_eq!(a.to_string(), "100:1");
/// assert_ne!(a, PeerIdentity::new(100, 2));
/// ```
#[derive(Hash, Eq, PartialEq, Ord, PartialOrd, Copy, Clone, Debug, Default)]
pub struct PeerIdentity {
    pub id: i32,
    pub key: i32,
}

impl PeerIdentity {
    pub const fn new(id: i32, key: i32) -> Self {
        Self { id, key }
    }
}

impl From<(i32, i32)> for PeerIdentity {
    fn from((id, key): (i32, i32)) -> Self {
        Self::new(id, key)
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.key)
    }
}
