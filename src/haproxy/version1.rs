use super::{ProxyCommand, ProxyHeader, ProxyTransport, ProxyVersion, V1_SIGNATURE};
use bytes::Buf;
use snafu::{ensure, ResultExt as _, Snafu};
use std::{
    net::{AddrParseError, IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    str::Utf8Error,
};

/// The longest a v1 header may be, CRLF included.
///
/// Excerpt from the specification:
///
/// > So a 108-byte buffer is always enough to store all the line and a
/// > trailing zero for string processing.
pub const MAX_LINE_LENGTH: usize = 107;

const CRLF: &[u8] = b"\r\n";

#[derive(Debug, Snafu)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum ParseError {
    #[snafu(display("an unexpected eof was hit"))]
    UnexpectedEof,

    #[snafu(display("the header line is {} bytes long, at most 107 are allowed", length))]
    LineTooLong { length: usize },

    #[snafu(display("illegal header ending"))]
    IllegalHeaderEnding,

    #[snafu(display("the header does not start with \"PROXY \""))]
    MissingPrefix,

    #[snafu(display("an illegal protocol {:?} was presented", protocol))]
    IllegalProtocol { protocol: String },

    #[snafu(display("expected 5 fields, {} were given", count))]
    FieldCount { count: usize },

    #[snafu(display("the given input is not valid ascii text"))]
    NonAscii { source: Utf8Error },

    #[snafu(display("invalid ip address"))]
    InvalidAddress { source: AddrParseError },

    #[snafu(display("invalid port {:?}", port))]
    InvalidPort { port: String },

    #[snafu(display("the addresses do not match the declared protocol"))]
    AddressFamilyMismatch,
}

/// Find the end of the header line in `data`.
///
/// Returns the line length including the LF once it is known, `None` while
/// more data may still complete a valid line.
pub fn line_length(data: &[u8]) -> Result<Option<usize>, ParseError> {
    let window = &data[..data.len().min(MAX_LINE_LENGTH + 1)];
    match window.iter().position(|&b| b == b'\n') {
        Some(idx) => {
            let length = idx + 1;
            ensure!(length <= MAX_LINE_LENGTH, LineTooLong { length });
            Ok(Some(length))
        }
        None if window.len() > MAX_LINE_LENGTH => LineTooLong {
            length: window.len(),
        }
        .fail(),
        None => Ok(None),
    }
}

/// Parse a v1 header, consuming exactly its line from `buf`.
///
/// NOTE: The whole line must be available through [Buf::chunk].
pub fn parse(buf: &mut impl Buf) -> Result<ProxyHeader, ParseError> {
    let length = line_length(buf.chunk())?.ok_or(ParseError::UnexpectedEof)?;
    let line = buf.copy_to_bytes(length);
    parse_line(&line)
}

/// Parse a single header line, CRLF included.
pub fn parse_line(line: &[u8]) -> Result<ProxyHeader, ParseError> {
    ensure!(line.len() <= MAX_LINE_LENGTH, LineTooLong { length: line.len() });
    ensure!(line.ends_with(CRLF), IllegalHeaderEnding);

    let line = &line[..line.len() - CRLF.len()];
    ensure!(line.starts_with(V1_SIGNATURE), MissingPrefix);

    let fields: Vec<&[u8]> = line[V1_SIGNATURE.len()..].splitn(5, |&b| b == b' ').collect();

    // Excerpt from the specification:
    //
    // > For "UNKNOWN", the rest of the line before the CRLF may be omitted by
    // > the sender, and the receiver must ignore anything presented before the
    // > CRLF is found.
    if fields[0] == b"UNKNOWN" {
        return Ok(ProxyHeader::without_addresses(
            ProxyVersion::V1,
            ProxyCommand::Proxy,
            ProxyTransport::Unspec,
        ));
    }

    ensure!(fields.len() == 5, FieldCount { count: fields.len() });

    let tcp4 = match fields[0] {
        b"TCP4" => true,
        b"TCP6" => false,
        protocol => {
            return IllegalProtocol {
                protocol: String::from_utf8_lossy(protocol),
            }
            .fail()
        }
    };

    let source = parse_ip(fields[1])?;
    let destination = parse_ip(fields[2])?;
    let (source, destination) = if tcp4 {
        match (as_ipv4(source), as_ipv4(destination)) {
            (Some(source), Some(destination)) => (IpAddr::V4(source), IpAddr::V4(destination)),
            _ => return AddressFamilyMismatch.fail(),
        }
    } else {
        match (as_ipv6(source), as_ipv6(destination)) {
            (Some(source), Some(destination)) => (IpAddr::V6(source), IpAddr::V6(destination)),
            _ => return AddressFamilyMismatch.fail(),
        }
    };

    let source_port = parse_port(fields[3])?;
    let destination_port = parse_port(fields[4])?;

    Ok(ProxyHeader::proxied(
        ProxyVersion::V1,
        ProxyTransport::Stream,
        SocketAddr::new(source, source_port),
        SocketAddr::new(destination, destination_port),
    ))
}

fn parse_ip(field: &[u8]) -> Result<IpAddr, ParseError> {
    std::str::from_utf8(field)
        .context(NonAscii)?
        .parse()
        .context(InvalidAddress)
}

fn parse_port(field: &[u8]) -> Result<u16, ParseError> {
    let port = std::str::from_utf8(field).context(NonAscii)?;
    port.parse().ok().ok_or_else(|| ParseError::InvalidPort {
        port: port.to_owned(),
    })
}

/// The 4-byte form of an address, if it has one. IPv4-mapped IPv6 addresses do.
fn as_ipv4(ip: IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(ip) => ip.to_ipv4_mapped(),
    }
}

/// A genuine IPv6 address: neither IPv4 nor IPv4-mapped.
fn as_ipv6(ip: IpAddr) -> Option<Ipv6Addr> {
    match ip {
        IpAddr::V6(ip) if ip.to_ipv4_mapped().is_none() => Some(ip),
        _ => None,
    }
}

#[cfg(test)]
mod parse_tests {
    use super::*;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use std::net::{SocketAddrV4, SocketAddrV6};

    fn valid_v4(
        (a, b, c, d): (u8, u8, u8, u8),
        e: u16,
        (f, g, h, i): (u8, u8, u8, u8),
        j: u16,
    ) -> ProxyHeader {
        ProxyHeader::proxied(
            ProxyVersion::V1,
            ProxyTransport::Stream,
            SocketAddrV4::new(Ipv4Addr::new(a, b, c, d), e).into(),
            SocketAddrV4::new(Ipv4Addr::new(f, g, h, i), j).into(),
        )
    }

    fn valid_v6(source: Ipv6Addr, i: u16, destination: Ipv6Addr, r: u16) -> ProxyHeader {
        ProxyHeader::proxied(
            ProxyVersion::V1,
            ProxyTransport::Stream,
            SocketAddrV6::new(source, i, 0, 0).into(),
            SocketAddrV6::new(destination, r, 0, 0).into(),
        )
    }

    #[test]
    fn test_valid_unknown_cases() {
        let unknown = Ok(ProxyHeader::without_addresses(
            ProxyVersion::V1,
            ProxyCommand::Proxy,
            ProxyTransport::Unspec,
        ));
        assert_eq!(parse_line(b"PROXY UNKNOWN\r\n"), unknown);
        assert_eq!(parse_line(b"PROXY UNKNOWN this is bogus data!\r\r\r\n"), unknown);
        assert_eq!(
            parse_line(b"PROXY UNKNOWN 192.168.0.1 192.168.1.1 123 321\r\n"),
            unknown,
        );
        assert_eq!(parse_line(b"PROXY UNKNOWN \xff\xfe\r\n"), unknown);
    }

    #[test]
    fn test_valid_ipv4_cases() {
        assert_eq!(
            parse_line(b"PROXY TCP4 192.168.201.102 1.2.3.4 0 65535\r\n"),
            Ok(valid_v4((192, 168, 201, 102), 0, (1, 2, 3, 4), 65535)),
        );
        assert_eq!(
            parse_line(b"PROXY TCP4 0.0.0.0 0.0.0.0 0 0\r\n"),
            Ok(valid_v4((0, 0, 0, 0), 0, (0, 0, 0, 0), 0)),
        );
        assert_eq!(
            parse_line(b"PROXY TCP4 255.255.255.255 255.255.255.255 65535 65535\r\n"),
            Ok(valid_v4(
                (255, 255, 255, 255),
                65535,
                (255, 255, 255, 255),
                65535,
            )),
        );
    }

    #[test]
    fn test_ipv4_mapped_is_accepted_as_tcp4() {
        assert_eq!(
            parse_line(b"PROXY TCP4 ::ffff:10.0.0.1 10.0.0.2 1 2\r\n"),
            Ok(valid_v4((10, 0, 0, 1), 1, (10, 0, 0, 2), 2)),
        );
        assert_eq!(
            parse_line(b"PROXY TCP6 ::ffff:10.0.0.1 ::1 1 2\r\n"),
            Err(ParseError::AddressFamilyMismatch),
        );
    }

    #[test]
    fn test_valid_ipv6_cases() {
        assert_eq!(
            parse_line(b"PROXY TCP6 ab:ce:ef:01:23:45:67:89 ::1 0 65535\r\n"),
            Ok(valid_v6(
                Ipv6Addr::new(0xAB, 0xCE, 0xEF, 0x01, 0x23, 0x45, 0x67, 0x89),
                0,
                Ipv6Addr::LOCALHOST,
                65535,
            )),
        );
        assert_eq!(
            parse_line(b"PROXY TCP6 :: :: 0 0\r\n"),
            Ok(valid_v6(Ipv6Addr::UNSPECIFIED, 0, Ipv6Addr::UNSPECIFIED, 0)),
        );
        assert_eq!(
            parse_line(b"PROXY TCP6 2001:db8::1 2001:db8::2 11111 9090\r\n"),
            Ok(valid_v6(
                Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1),
                11111,
                Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 2),
                9090,
            )),
        );
    }

    #[test]
    fn test_line_limits() {
        // Exactly 107 bytes is the largest legal header.
        let mut line = b"PROXY UNKNOWN ".to_vec();
        line.resize(MAX_LINE_LENGTH - 2, b'x');
        line.extend_from_slice(CRLF);
        assert_eq!(line.len(), MAX_LINE_LENGTH);
        assert!(parse_line(&line).is_ok());
        assert_eq!(line_length(&line), Ok(Some(MAX_LINE_LENGTH)));

        let mut line = b"PROXY UNKNOWN ".to_vec();
        line.resize(MAX_LINE_LENGTH - 1, b'x');
        line.extend_from_slice(CRLF);
        assert_eq!(parse_line(&line), Err(ParseError::LineTooLong { length: 108 }));
        assert_eq!(line_length(&line), Err(ParseError::LineTooLong { length: 108 }));

        // No LF within reach at all.
        let line = vec![b'x'; 500];
        assert_eq!(line_length(&line), Err(ParseError::LineTooLong { length: 108 }));
        assert_eq!(line_length(&line[..107]), Ok(None));
    }

    #[test]
    fn test_invalid_cases() {
        assert_eq!(
            parse_line(b"PROXY TCP4 10.0.0.1 10.0.0.2 1 2\n"),
            Err(ParseError::IllegalHeaderEnding),
        );
        assert_eq!(
            parse_line(b"PROXY UNKNOWN\r"),
            Err(ParseError::IllegalHeaderEnding),
        );
        assert_eq!(parse_line(b"PROXZ UNKNOWN\r\n"), Err(ParseError::MissingPrefix));
        assert_eq!(
            parse_line(b"PROXY UDP4 10.0.0.1 10.0.0.2 1 2\r\n"),
            Err(ParseError::IllegalProtocol {
                protocol: "UDP4".into()
            }),
        );
        assert_eq!(
            parse_line(b"PROXY TCP5 not an address 2\r\n"),
            Err(ParseError::IllegalProtocol {
                protocol: "TCP5".into()
            }),
        );
        assert_eq!(
            parse_line(b"PROXY TCP4 10.0.0.1 10.0.0.2 1\r\n"),
            Err(ParseError::FieldCount { count: 4 }),
        );
        assert_eq!(
            parse_line(b"PROXY TCP4 10.0.0.1 10.0.0.2 1 2 3\r\n"),
            Err(ParseError::InvalidPort {
                port: "2 3".into()
            }),
        );
        assert_eq!(
            parse_line(b"PROXY TCP4 10.0.0.1 10.0.0.2 1 65536\r\n"),
            Err(ParseError::InvalidPort {
                port: "65536".into()
            }),
        );
        assert_eq!(
            parse_line(b"PROXY TCP4 10.0.0.1 10.0.0.2 http 2\r\n"),
            Err(ParseError::InvalidPort {
                port: "http".into()
            }),
        );
        assert!(matches!(
            parse_line(b"PROXY TCP4 10.0.0.300 10.0.0.2 1 2\r\n"),
            Err(ParseError::InvalidAddress { .. }),
        ));
        assert!(matches!(
            parse_line(b"PROXY TCP4  10.0.0.2 1 2\r\n"),
            Err(ParseError::InvalidAddress { .. }),
        ));
        assert!(matches!(
            parse_line(b"PROXY TCP4 \xff 10.0.0.2 1 2\r\n"),
            Err(ParseError::NonAscii { .. }),
        ));
    }

    #[test]
    fn test_family_mismatch() {
        assert_eq!(
            parse_line(b"PROXY TCP4 2001:db8::1 10.0.0.2 1 2\r\n"),
            Err(ParseError::AddressFamilyMismatch),
        );
        assert_eq!(
            parse_line(b"PROXY TCP4 10.0.0.1 ::1 1 2\r\n"),
            Err(ParseError::AddressFamilyMismatch),
        );
        assert_eq!(
            parse_line(b"PROXY TCP6 10.0.0.1 ::1 1 2\r\n"),
            Err(ParseError::AddressFamilyMismatch),
        );
    }

    #[test]
    fn test_parse_consumes_only_the_line() {
        let mut buf = Bytes::from_static(b"PROXY TCP4 10.0.0.1 10.0.0.2 54321 8080\r\nhello");
        assert_eq!(
            parse(&mut buf),
            Ok(valid_v4((10, 0, 0, 1), 54321, (10, 0, 0, 2), 8080)),
        );
        assert_eq!(buf, Bytes::from_static(b"hello"));

        let mut buf = Bytes::from_static(b"PROXY UNKNOWN\r\nPROXY UNKNOWN\r\n");
        assert!(parse(&mut buf).is_ok());
        assert_eq!(buf, Bytes::from_static(b"PROXY UNKNOWN\r\n"));
    }

    #[test]
    fn test_parse_incomplete() {
        let mut buf = Bytes::from_static(b"PROXY TCP4 10.0.0.1 10.0");
        assert_eq!(parse(&mut buf), Err(ParseError::UnexpectedEof));
        assert_eq!(buf.len(), 24); // Nothing was consumed.
    }
}
