//! # punchlink-core
//!
//! Building blocks for UDP hole punching, used by the `punchlink` crate:
//!
//! - [`nat`] - a host's candidate addresses and their locality class
//! - [`route`] - path candidates, path ranking and per-peer route records
//! - [`punch`] - candidate enumeration and coordinator timers
//! - [`socket`] - the raw datagram transport contract, a UDP implementation
//!   and an in-memory simulated network
//! - [`relay`] - the rendezvous/relay service
//!
//! Nothing in here blocks or spawns; every timer-driven type takes the
//! current `Instant` from its caller.

pub mod error;
pub mod extend;
pub mod nat;
pub mod punch;
pub mod relay;
pub mod route;
pub mod socket;

pub use error::{Error, Result};
