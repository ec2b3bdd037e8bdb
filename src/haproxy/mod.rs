//! The HAProxy PROXY protocol, receiving side.
//!
//! Both the human-readable v1 header and the binary v2 header are parsed.
//! Only what is needed to recover the connection endpoints is looked at; v2
//! TLVs are skipped along with the rest of the address block.
//!
//! This has been implemented by the specification:
//! <https://www.haproxy.org/download/2.4/doc/proxy-protocol.txt>

pub mod version1;
pub mod version2;

use bytes::Buf;
use snafu::{ResultExt as _, Snafu};
use std::{fmt, net::SocketAddr};

/// The 6 bytes every v1 header starts with.
pub const V1_SIGNATURE: &[u8; 6] = b"PROXY ";

/// The 12 bytes required to notify of being a V2 binary PROXY protocol
/// connection.
///
/// Excerpt from the specification:
///
/// > The binary header format starts with a constant 12 bytes block containing the
/// > protocol signature :
/// >
/// >    `\x0D \x0A \x0D \x0A \x00 \x0D \x0A \x51 \x55 \x49 \x54 \x0A`
pub const V2_SIGNATURE: &[u8; 12] = &[
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum ParseError {
    #[snafu(display("the given data is not a PROXY header"))]
    NotProxyHeader,

    #[snafu(display("there was an error while parsing the v1 header: {}", source))]
    Version1 { source: version1::ParseError },

    #[snafu(display("there was an error while parsing the v2 header: {}", source))]
    Version2 { source: version2::ParseError },
}

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum ProxyVersion {
    V1,
    V2,
}

impl fmt::Display for ProxyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V1 => f.write_str("v1"),
            Self::V2 => f.write_str("v2"),
        }
    }
}

/// The command carried by a header. v1 headers are always [ProxyCommand::Proxy].
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum ProxyCommand {
    /// The proxy opened the connection itself, e.g. for a health check.
    Local,
    Proxy,
}

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum ProxyTransport {
    Unspec,
    Stream,
    Datagram,
}

/// The endpoints a proxy declared for a relayed connection.
///
/// Either both addresses are present or neither is. They are absent for
/// `PROXY UNKNOWN`, for the v2 `LOCAL` command and for v2 families that carry
/// no IP endpoints; the connection then keeps its real socket addresses.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct ProxyHeader {
    version: ProxyVersion,
    command: ProxyCommand,
    transport: ProxyTransport,
    addresses: Option<(SocketAddr, SocketAddr)>,
}

impl ProxyHeader {
    pub(crate) fn proxied(
        version: ProxyVersion,
        transport: ProxyTransport,
        source: SocketAddr,
        destination: SocketAddr,
    ) -> Self {
        Self {
            version,
            command: ProxyCommand::Proxy,
            transport,
            addresses: Some((source, destination)),
        }
    }

    pub(crate) fn without_addresses(
        version: ProxyVersion,
        command: ProxyCommand,
        transport: ProxyTransport,
    ) -> Self {
        Self {
            version,
            command,
            transport,
            addresses: None,
        }
    }

    /// The original client endpoint.
    pub fn source_addr(&self) -> Option<SocketAddr> {
        self.addresses.map(|(source, _)| source)
    }

    /// The endpoint the original client connected to.
    pub fn dest_addr(&self) -> Option<SocketAddr> {
        self.addresses.map(|(_, destination)| destination)
    }

    pub fn version(&self) -> ProxyVersion {
        self.version
    }

    pub fn command(&self) -> ProxyCommand {
        self.command
    }

    pub fn transport(&self) -> ProxyTransport {
        self.transport
    }
}

/// The outcome of looking at the first bytes of a stream.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Detection {
    /// A full signature of this version is present.
    Signature(ProxyVersion),

    /// The bytes diverge from both signatures.
    NotProxy,

    /// The bytes are a prefix of at least one signature; more are needed.
    Incomplete,
}

enum Prefix {
    Full,
    Partial,
    Mismatch,
}

fn compare(data: &[u8], signature: &[u8]) -> Prefix {
    let len = data.len().min(signature.len());
    if data[..len] != signature[..len] {
        Prefix::Mismatch
    } else if len == signature.len() {
        Prefix::Full
    } else {
        Prefix::Partial
    }
}

/// Decide which version, if any, `data` starts with, without consuming anything.
pub fn detect(data: &[u8]) -> Detection {
    // The two signatures already differ in their first byte, so at most one
    // of them can match.
    match (compare(data, V1_SIGNATURE), compare(data, V2_SIGNATURE)) {
        (Prefix::Full, _) => Detection::Signature(ProxyVersion::V1),
        (_, Prefix::Full) => Detection::Signature(ProxyVersion::V2),
        (Prefix::Mismatch, Prefix::Mismatch) => Detection::NotProxy,
        _ => Detection::Incomplete,
    }
}

/// Parse a PROXY header of either version from the given buffer.
///
/// NOTE: The buffer must have a continuous representation of the header
/// available through [Buf::chunk]. On success exactly the header is consumed.
pub fn parse(buf: &mut impl Buf) -> Result<ProxyHeader, ParseError> {
    match detect(buf.chunk()) {
        Detection::Signature(ProxyVersion::V1) => version1::parse(buf).context(Version1),
        Detection::Signature(ProxyVersion::V2) => version2::parse(buf).context(Version2),
        Detection::NotProxy | Detection::Incomplete => NotProxyHeader.fail(),
    }
}
