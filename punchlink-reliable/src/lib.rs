//! Windowed, sequenced, retransmitting delivery of whole messages over an
//! unreliable datagram path.
//!
//! [`ArqSession`] does no I/O of its own: the owner feeds received datagrams
//! to [`ArqSession::input`], calls [`ArqSession::update`] once per tick with
//! the current time and an [`ArqOutput`] that carries the produced datagrams
//! away, and pops delivered messages with [`ArqSession::recv`].
//!
//! ```rust
//! use bytes::Bytes;
//! use punchlink_reliable::{ArqConfig, ArqSession};
//! use std::time::Instant;
//!
//! let mut a = ArqSession::new(7, ArqConfig::default());
//! let mut b = ArqSession::new(7, ArqConfig::default());
//! a.send(Bytes::from_static(b"hello")).unwrap();
//!
//! let now = Instant::now();
//! let mut wire = Vec::new();
//! a.update(now, &mut |datagram| wire.push(datagram));
//! for datagram in wire {
//!     b.input(&datagram).unwrap();
//! }
//! assert_eq!(b.recv().unwrap(), Bytes::from_static(b"hello"));
//! ```

pub use arq::segment::{Segment, SegmentKind, ARQ_MARKER, SEGMENT_HEAD_LEN};
pub use arq::{ArqOutput, ArqSession};
pub use config::ArqConfig;
pub use error::{Error, Result};

pub mod arq;
pub mod config;
pub mod error;
