use futures::FutureExt as _;
use proxy_ingress::ProxyProtoStream;
use snafu::{ResultExt as _, Snafu};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use tokio::{io::AsyncWriteExt as _, net::TcpStream};
use tracing::{debug, info};

#[derive(Debug, Snafu)]
pub enum RelayError {
    Io {
        source: tokio::io::Error,
    },
    UpstreamConnectionUnattainable {
        source: tokio::io::Error,
    },
    ProxyProtocolEncoding {
        source: proxy_protocol::EncodeError,
    },
}

type Result<T, E = RelayError> = std::result::Result<T, E>;

/// Copy the connection to and from `upstream` until either side is done.
pub async fn relay(
    mut stream: ProxyProtoStream,
    upstream: SocketAddr,
    send_proxy_protocol: bool,
) -> Result<()> {
    let client = stream.remote_addr();
    stream.get_ref().set_nodelay(true).context(Io)?;

    let mut outbound = TcpStream::connect(upstream)
        .await
        .context(UpstreamConnectionUnattainable)?;
    outbound.set_nodelay(true).context(Io)?;
    info!(
        ?client,
        proxy = ?stream.real_remote_addr(),
        ?upstream,
        send_proxy_protocol,
        "relaying connection",
    );

    if send_proxy_protocol {
        let encoded = encode_header(client, stream.local_addr())?;
        outbound.write_all(&encoded).await.context(Io)?;
        outbound.flush().await.context(Io)?;
    }

    let (mut ri, mut wi) = tokio::io::split(stream);
    let (mut ro, mut wo) = outbound.split();

    let client_to_server = tokio::io::copy(&mut ri, &mut wo);
    let server_to_client = tokio::io::copy(&mut ro, &mut wi);

    debug!(?client, "joining copiers");
    let _ = futures::future::try_select(client_to_server.boxed(), server_to_client.boxed()).await;

    drop(ro);
    drop(wo);
    let mut stream = ri.unsplit(wi);
    let _ = futures::future::join(stream.shutdown(), outbound.shutdown()).await;

    debug!(?client, "finished relaying");
    Ok(())
}

/// A v2 header announcing the recovered endpoints to the upstream.
fn encode_header(source: SocketAddr, destination: SocketAddr) -> Result<bytes::BytesMut> {
    use proxy_protocol::version2::{ProxyAddresses, ProxyCommand, ProxyTransportProtocol};

    let addresses = match (source.ip(), destination.ip()) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => ProxyAddresses::Ipv4 {
            source: (src, Some(source.port())),
            destination: (dst, Some(destination.port())),
        },
        (src, dst) => ProxyAddresses::Ipv6 {
            source: (to_ipv6(src), Some(source.port())),
            destination: (to_ipv6(dst), Some(destination.port())),
        },
    };
    proxy_protocol::encode(proxy_protocol::ProxyHeader::Version2 {
        command: ProxyCommand::Proxy,
        transport_protocol: ProxyTransportProtocol::Stream,
        addresses,
    })
    .context(ProxyProtocolEncoding)
}

fn to_ipv6(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V6(v6) => v6,
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
    }
}
