// Jackson Coxson

use std::{io, net::SocketAddrV4};

use thiserror::Error;

use crate::session::Leg;

/// Failures of the two startup lookups. Every one of these is recovered by
/// falling back to the compiled-in default.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("hub ports request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("hub ports response contained no valid ports")]
    NoPorts,

    #[error("lookup failed: {0}")]
    Lookup(#[from] io::Error),

    #[error("no IPv4 address found for {0}")]
    NoIpv4Record(String),

    #[error("lookup of {0} timed out")]
    Timeout(String),
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("[{port}] Server error: {source}")]
    Bind { port: u16, source: io::Error },

    #[error("Failed to connect to target server {target}: {source}")]
    Dial {
        target: SocketAddrV4,
        source: io::Error,
    },

    #[error("Timed out connecting to target server {target}")]
    DialTimeout { target: SocketAddrV4 },

    #[error("Relay failed on the {leg} side: {source}")]
    Relay { leg: Leg, source: io::Error },
}

impl ProxyError {
    pub fn is_addr_in_use(&self) -> bool {
        matches!(self, ProxyError::Bind { source, .. } if source.kind() == io::ErrorKind::AddrInUse)
    }
}
