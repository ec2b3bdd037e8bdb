use super::{ProxyCommand, ProxyHeader, ProxyTransport, ProxyVersion, V2_SIGNATURE};
use bytes::Buf;
use snafu::{ensure, Snafu};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

/// Signature, version/command, family/transport and the 2 byte length.
pub const FIXED_HEADER_LENGTH: usize = 16;

const IPV4_BLOCK_LENGTH: usize = 4 + 4 + 2 + 2;
const IPV6_BLOCK_LENGTH: usize = 16 + 16 + 2 + 2;

#[derive(Debug, Snafu)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum ParseError {
    #[snafu(display("an unexpected eof was hit"))]
    UnexpectedEof,

    #[snafu(display("the binary signature is missing"))]
    InvalidSignature,

    #[snafu(display("invalid version and command: {:#04x}", cmd))]
    UnknownCommand { cmd: u8 },

    #[snafu(display("invalid address family and transport: {:#04x}", family))]
    UnknownAddressFamily { family: u8 },

    #[snafu(display("insufficient length specified: {}, requires minimum {}", given, needs))]
    InsufficientLengthSpecified { given: usize, needs: usize },
}

/// The full length of the header starting `data`, once the fixed part is present.
pub fn header_length(data: &[u8]) -> Option<usize> {
    if data.len() < FIXED_HEADER_LENGTH {
        return None;
    }
    Some(FIXED_HEADER_LENGTH + u16::from_be_bytes([data[14], data[15]]) as usize)
}

/// Parse a v2 header, consuming exactly the fixed header and its address block.
pub fn parse(buf: &mut impl Buf) -> Result<ProxyHeader, ParseError> {
    // We need to parse the following:
    //
    // > struct proxy_hdr_v2 {
    // >     uint8_t sig[12];  /* hex 0D 0A 0D 0A 00 0D 0A 51 55 49 54 0A */
    // >     uint8_t ver_cmd;  /* protocol version and command */
    // >     uint8_t fam;      /* protocol family and address */
    // >     uint16_t len;     /* number of following bytes part of the header */
    // > };
    ensure!(buf.remaining() >= FIXED_HEADER_LENGTH, UnexpectedEof);

    let mut signature = [0u8; 12];
    buf.copy_to_slice(&mut signature);
    ensure!(&signature == V2_SIGNATURE, InvalidSignature);

    // The version nibble must be 2; checking the whole byte covers both.
    let command = match buf.get_u8() {
        0x20 => ProxyCommand::Local,
        0x21 => ProxyCommand::Proxy,
        cmd => return UnknownCommand { cmd }.fail(),
    };
    let family = buf.get_u8();
    let length = buf.get_u16() as usize;

    // Never parse a partial block; the caller gets to read more or give up.
    ensure!(buf.remaining() >= length, UnexpectedEof);
    let mut block = buf.copy_to_bytes(length);

    // Excerpt from the specification:
    //
    // > The receiver must accept this connection as valid and must use the
    // > real connection endpoints and discard the protocol block including the
    // > family which is ignored.
    if command == ProxyCommand::Local {
        return Ok(ProxyHeader::without_addresses(
            ProxyVersion::V2,
            command,
            transport(family),
        ));
    }

    // Time to parse the following:
    //
    // > union proxy_addr {
    // >     struct {        /* for TCP/UDP over IPv4, len = 12 */
    // >         uint32_t src_addr;
    // >         uint32_t dst_addr;
    // >         uint16_t src_port;
    // >         uint16_t dst_port;
    // >     } ipv4_addr;
    // >     struct {        /* for TCP/UDP over IPv6, len = 36 */
    // >          uint8_t  src_addr[16];
    // >          uint8_t  dst_addr[16];
    // >          uint16_t src_port;
    // >          uint16_t dst_port;
    // >     } ipv6_addr;
    // >     struct {        /* for AF_UNIX sockets, len = 216 */
    // >          uint8_t src_addr[108];
    // >          uint8_t dst_addr[108];
    // >     } unix_addr;
    // > };
    //
    // Whatever follows the addresses (TLVs) is dropped with the block.
    let (source, destination) = match family {
        // UNSPEC, UNIX stream, UNIX datagram: nothing a TCP endpoint can use.
        0x00 | 0x31 | 0x32 => {
            return Ok(ProxyHeader::without_addresses(
                ProxyVersion::V2,
                command,
                transport(family),
            ))
        }
        0x11 | 0x12 => {
            ensure!(
                length >= IPV4_BLOCK_LENGTH,
                InsufficientLengthSpecified {
                    given: length,
                    needs: IPV4_BLOCK_LENGTH,
                },
            );
            let source = Ipv4Addr::from(block.get_u32());
            let destination = Ipv4Addr::from(block.get_u32());
            (
                SocketAddr::new(source.into(), block.get_u16()),
                SocketAddr::new(destination.into(), block.get_u16()),
            )
        }
        0x21 | 0x22 => {
            ensure!(
                length >= IPV6_BLOCK_LENGTH,
                InsufficientLengthSpecified {
                    given: length,
                    needs: IPV6_BLOCK_LENGTH,
                },
            );
            let source = Ipv6Addr::from(block.get_u128());
            let destination = Ipv6Addr::from(block.get_u128());
            (
                SocketAddr::new(source.into(), block.get_u16()),
                SocketAddr::new(destination.into(), block.get_u16()),
            )
        }
        family => return UnknownAddressFamily { family }.fail(),
    };

    Ok(ProxyHeader::proxied(
        ProxyVersion::V2,
        transport(family),
        source,
        destination,
    ))
}

fn transport(family: u8) -> ProxyTransport {
    match family & 0x0F {
        0x1 => ProxyTransport::Stream,
        0x2 => ProxyTransport::Datagram,
        _ => ProxyTransport::Unspec,
    }
}

#[cfg(test)]
mod parse_tests {
    use super::*;
    use bytes::{BufMut as _, Bytes, BytesMut};
    use pretty_assertions::assert_eq;
    use proxy_protocol::version2::{ProxyAddresses, ProxyTransportProtocol};

    fn signed(buf: &[u8]) -> Bytes {
        let mut bytes = BytesMut::from(&V2_SIGNATURE[..]);
        bytes.extend_from_slice(buf);
        bytes.freeze()
    }

    fn encode(command: proxy_protocol::version2::ProxyCommand, addresses: ProxyAddresses) -> BytesMut {
        proxy_protocol::encode(proxy_protocol::ProxyHeader::Version2 {
            command,
            transport_protocol: ProxyTransportProtocol::Stream,
            addresses,
        })
        .unwrap()
    }

    #[test]
    fn test_round_trip_ipv4() {
        let mut data = encode(
            proxy_protocol::version2::ProxyCommand::Proxy,
            ProxyAddresses::Ipv4 {
                source: (Ipv4Addr::new(10, 0, 0, 1), Some(54321)),
                destination: (Ipv4Addr::new(10, 0, 0, 2), Some(8080)),
            },
        );
        data.put_slice(b"payload");

        let header = parse(&mut data).unwrap();
        assert_eq!(header.source_addr(), Some("10.0.0.1:54321".parse().unwrap()));
        assert_eq!(header.dest_addr(), Some("10.0.0.2:8080".parse().unwrap()));
        assert_eq!(header.command(), ProxyCommand::Proxy);
        assert_eq!(header.transport(), ProxyTransport::Stream);
        assert_eq!(&data[..], b"payload");
    }

    #[test]
    fn test_round_trip_ipv6() {
        let mut data = encode(
            proxy_protocol::version2::ProxyCommand::Proxy,
            ProxyAddresses::Ipv6 {
                source: ("2001:db8::1".parse().unwrap(), Some(11111)),
                destination: ("2001:db8::2".parse().unwrap(), Some(9090)),
            },
        );

        let header = parse(&mut data).unwrap();
        assert_eq!(
            header.source_addr(),
            Some("[2001:db8::1]:11111".parse().unwrap())
        );
        assert_eq!(
            header.dest_addr(),
            Some("[2001:db8::2]:9090".parse().unwrap())
        );
        assert!(!data.has_remaining());
    }

    #[test]
    fn test_local_discards_addresses() {
        let mut data = encode(
            proxy_protocol::version2::ProxyCommand::Local,
            ProxyAddresses::Ipv4 {
                source: (Ipv4Addr::new(127, 0, 0, 1), Some(1)),
                destination: (Ipv4Addr::new(127, 0, 0, 1), Some(2)),
            },
        );
        let header = parse(&mut data).unwrap();
        assert_eq!(header.command(), ProxyCommand::Local);
        assert_eq!(header.source_addr(), None);
        assert_eq!(header.dest_addr(), None);
        assert!(!data.has_remaining());

        // LOCAL ignores the family byte entirely.
        let mut data = signed(&[0x20, 0xFF, 0, 2, 1, 2]);
        assert!(parse(&mut data).unwrap().source_addr().is_none());
        assert!(!data.has_remaining());
    }

    #[test]
    fn test_ipv4_with_tlv() {
        assert_eq!(
            parse(
                &mut signed(&[
                    // Proxy command
                    0x21,
                    // Inet << 4 | Stream
                    (1 << 4) | 1,
                    // Length beyond this: 12
                    // Let's throw in a TLV with no data; 3 bytes.
                    0,
                    15,
                    // Source IP
                    127,
                    0,
                    0,
                    1,
                    // Destination IP
                    192,
                    168,
                    0,
                    1,
                    // Source port
                    // 65535 = [255, 255]
                    255,
                    255,
                    // Destination port
                    // 257 = [1, 1]
                    1,
                    1,
                    // TLV
                    69,
                    0,
                    0,
                ])
            ),
            Ok(ProxyHeader::proxied(
                ProxyVersion::V2,
                ProxyTransport::Stream,
                "127.0.0.1:65535".parse().unwrap(),
                "192.168.0.1:257".parse().unwrap(),
            )),
        );
    }

    #[test]
    fn test_datagram_families_carry_endpoints() {
        let mut data = signed(&[
            0x21, 0x12, 0, 12, 1, 2, 3, 4, 5, 6, 7, 8, 0, 53, 0, 54, // Extra data
            1, 2, 3, 4,
        ]);
        assert_eq!(
            parse(&mut data),
            Ok(ProxyHeader::proxied(
                ProxyVersion::V2,
                ProxyTransport::Datagram,
                "1.2.3.4:53".parse().unwrap(),
                "5.6.7.8:54".parse().unwrap(),
            )),
        );
        assert_eq!(data.remaining(), 4); // Consume the entire header
    }

    #[test]
    fn test_families_without_endpoints() {
        for &family in &[0x00u8, 0x31, 0x32] {
            let mut data = signed(&[0x21, family, 0, 4, 9, 9, 9, 9]);
            let header = parse(&mut data).unwrap();
            assert_eq!(header.command(), ProxyCommand::Proxy);
            assert_eq!(header.source_addr(), None);
            assert!(!data.has_remaining());
        }
    }

    #[test]
    fn test_invalid_data() {
        assert_eq!(
            parse(&mut signed(&[0x22, 0x11, 0, 0])),
            Err(ParseError::UnknownCommand { cmd: 0x22 }),
        );
        assert_eq!(
            parse(&mut signed(&[0x11, 0x11, 0, 0])),
            Err(ParseError::UnknownCommand { cmd: 0x11 }),
        );
        assert_eq!(
            parse(&mut signed(&[0x21, 0x13, 0, 0])),
            Err(ParseError::UnknownAddressFamily { family: 0x13 }),
        );
        assert_eq!(
            parse(&mut signed(&[0x21, 0x41, 0, 0])),
            Err(ParseError::UnknownAddressFamily { family: 0x41 }),
        );
        assert_eq!(
            parse(&mut signed(&[
                0x21, 0x11,
                // 3 bytes is clearly too few if we expect 2 IPv4s and ports
                0, 3, 1, 2, 3,
            ])),
            Err(ParseError::InsufficientLengthSpecified {
                given: 3,
                needs: 4 * 2 + 2 * 2,
            }),
        );
        assert_eq!(
            parse(&mut signed(&[0x21, 0x21, 0, 12, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0])),
            Err(ParseError::InsufficientLengthSpecified {
                given: 12,
                needs: 16 * 2 + 2 * 2,
            }),
        );
        assert_eq!(
            parse(&mut &b"\r\n\r\n\x00\r\nQUIX\n\x21\x11\x00\x00"[..]),
            Err(ParseError::InvalidSignature),
        );
    }

    #[test]
    fn test_short_reads() {
        assert_eq!(parse(&mut &V2_SIGNATURE[..]), Err(ParseError::UnexpectedEof));
        // Declares 12 bytes, carries 4.
        assert_eq!(
            parse(&mut signed(&[0x21, 0x11, 0, 12, 1, 2, 3, 4])),
            Err(ParseError::UnexpectedEof),
        );
    }

    #[test]
    fn test_header_length() {
        assert_eq!(header_length(&V2_SIGNATURE[..]), None);
        assert_eq!(header_length(&signed(&[0x21, 0x11, 0, 12])), Some(28));
        assert_eq!(header_length(&signed(&[0x21, 0x11, 0xFF, 0xFF])), Some(16 + 65535));
    }
}
