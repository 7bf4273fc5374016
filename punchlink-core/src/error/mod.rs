use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io")]
    Io(#[from] io::Error),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("invalid relay frame")]
    InvalidRelayFrame,
    #[error("only IPv4 is supported by the relay frame")]
    NotSupportIPV6,
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;
