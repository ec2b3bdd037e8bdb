use crate::haproxy;
use snafu::Snafu;
use std::{fmt, io, net::SocketAddr};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// A PROXY signature was found but the header behind it is malformed.
    #[snafu(display("invalid PROXY header from {}: {}", peer, source))]
    ProxyProtoInvalid {
        peer: SocketAddr,
        source: haproxy::ParseError,
    },

    /// Strict mode refused a peer outside of the trusted networks.
    #[snafu(display("{} is not a trusted proxy", peer))]
    ProxyProtoUntrusted { peer: SocketAddr },

    /// Strict mode could not read a signature at all.
    #[snafu(display("{} did not send a PROXY header: {}", peer, reason))]
    ProxyProtoRequired {
        peer: SocketAddr,
        reason: PeekFailure,
    },

    /// Strict mode read bytes matching neither PROXY signature.
    #[snafu(display("{} sent data that is not a PROXY header", peer))]
    ProxyProtoUnknownProto { peer: SocketAddr },

    /// The header deadline passed after a signature had been recognised.
    #[snafu(display("timed out reading the PROXY header from {}", peer))]
    HeaderTimeout { peer: SocketAddr },

    #[snafu(display("could not read the PROXY header from {}: {}", peer, source))]
    HeaderRead { peer: SocketAddr, source: io::Error },

    #[snafu(display("could not query the local address for {}: {}", peer, source))]
    LocalAddr { peer: SocketAddr, source: io::Error },

    #[snafu(display("could not accept a connection: {}", source))]
    Accept { source: io::Error },

    #[snafu(display("could not bind the listener: {}", source))]
    Bind { source: io::Error },

    #[snafu(display("invalid CIDR {:?}: {}", cidr, source))]
    InvalidCidr {
        cidr: String,
        source: ipnet::AddrParseError,
    },

    #[snafu(display("unknown PROXY protocol mode {:?}", mode))]
    InvalidMode { mode: String },
}

impl Error {
    /// Whether this error only concerns the one accepted connection.
    ///
    /// Accept loops should keep going on these.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::ProxyProtoInvalid { .. }
            | Self::ProxyProtoUntrusted { .. }
            | Self::ProxyProtoRequired { .. }
            | Self::ProxyProtoUnknownProto { .. }
            | Self::HeaderTimeout { .. }
            | Self::HeaderRead { .. }
            | Self::LocalAddr { .. } => true,

            Self::Accept { .. }
            | Self::Bind { .. }
            | Self::InvalidCidr { .. }
            | Self::InvalidMode { .. } => false,
        }
    }
}

/// Why no signature could be peeked from a connection.
#[derive(Debug)]
pub enum PeekFailure {
    /// The peer closed the connection before a signature could be decided on.
    Closed,
    TimedOut,
    Io(io::Error),
}

impl fmt::Display for PeekFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("connection closed before a signature was read"),
            Self::TimedOut => f.write_str("header timeout elapsed"),
            Self::Io(e) => write!(f, "{}", e),
        }
    }
}
