//! A TCP listener that recovers client endpoints from PROXY headers.
//!
//! Every `accept` walks the same states:
//!
//! ```text
//! Accepted -> TrustChecked -> StrictPath | AutoPath -> Peeked
//!          -> Parse | PassThrough -> Wrapped
//! ```
//!
//! Any failure on the way drops (and thereby closes) the socket and is
//! returned for that connection only; the listener keeps working.

use crate::{
    cidr::CidrMatcher,
    config::{ProxyProtoConfig, ProxyProtoMode},
    error::*,
    haproxy::{self, version1, version2, Detection, ProxyHeader, ProxyVersion},
    prelude::*,
    wrappers::ProxyProtoStream,
};
use ipnet::IpNet;
use std::{
    io,
    net::{IpAddr, SocketAddr},
    time::Duration,
};
use tokio::{
    io::AsyncReadExt as _,
    net::{TcpListener, TcpStream, ToSocketAddrs},
    time::{timeout_at, Instant},
};

/// Enough for either header in the common case; TLV heavy v2 headers grow it.
const INITIAL_BUFFER: usize = 256;

/// How the peer's own address relates to the trusted networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Trust {
    Trusted,
    Untrusted,
    /// No trusted networks are configured.
    Unchecked,
}

#[derive(Debug)]
pub(crate) enum Peeked {
    Signature(ProxyVersion),
    NotProxy,
    Failed(PeekFailure),
}

#[derive(Debug)]
pub(crate) enum AcceptState {
    Accepted,
    TrustChecked(Trust),
    StrictPath,
    AutoPath,
    Peeked(Peeked),
    Parse(ProxyVersion),
    PassThrough,
    Wrapped(Option<ProxyHeader>),
}

/// Decide where a classified connection goes next.
pub(crate) fn after_trust(mode: ProxyProtoMode, trust: Trust, peer: SocketAddr) -> Result<AcceptState> {
    Ok(match (mode, trust) {
        // Refused before a single byte of the stream is looked at.
        (ProxyProtoMode::Strict, Trust::Untrusted) => {
            return Err(Error::ProxyProtoUntrusted { peer })
        }
        (ProxyProtoMode::Strict, _) => AcceptState::StrictPath,
        // Untrusted peers never get to claim another identity.
        (ProxyProtoMode::Auto, Trust::Untrusted) => AcceptState::PassThrough,
        (ProxyProtoMode::Auto, _) => AcceptState::AutoPath,
    })
}

/// Decide what to do with the outcome of peeking at the stream.
pub(crate) fn after_peek(mode: ProxyProtoMode, peeked: Peeked, peer: SocketAddr) -> Result<AcceptState> {
    Ok(match (mode, peeked) {
        (_, Peeked::Signature(version)) => AcceptState::Parse(version),
        (ProxyProtoMode::Strict, Peeked::NotProxy) => {
            return Err(Error::ProxyProtoUnknownProto { peer })
        }
        (ProxyProtoMode::Strict, Peeked::Failed(reason)) => {
            return Err(Error::ProxyProtoRequired { peer, reason })
        }
        (ProxyProtoMode::Auto, Peeked::NotProxy) => AcceptState::PassThrough,
        (ProxyProtoMode::Auto, Peeked::Failed(reason)) => {
            debug!(?peer, %reason, "no PROXY signature");
            AcceptState::PassThrough
        }
    })
}

/// A freshly accepted socket and everything read from it so far.
struct Handshake {
    stream: TcpStream,
    buf: BytesMut,
    peer: SocketAddr,
    deadline: Option<Instant>,
}

enum Fill {
    Read,
    Eof,
}

impl Handshake {
    async fn fill(&mut self) -> Result<Fill, PeekFailure> {
        reserve_at_least(&mut self.buf, INITIAL_BUFFER);
        let read = self.stream.read_buf(&mut self.buf);
        let n = match self.deadline {
            Some(deadline) => timeout_at(deadline, read)
                .await
                .map_err(|_| PeekFailure::TimedOut)?,
            None => read.await,
        }
        .map_err(PeekFailure::Io)?;
        trace!(peer = ?self.peer, n, buffered = self.buf.len(), "read header bytes");
        Ok(if n == 0 { Fill::Eof } else { Fill::Read })
    }

    /// Read until the buffered bytes settle on a signature or rule both out.
    async fn peek(&mut self) -> Peeked {
        loop {
            match haproxy::detect(&self.buf) {
                Detection::Signature(version) => return Peeked::Signature(version),
                Detection::NotProxy => return Peeked::NotProxy,
                Detection::Incomplete => {}
            }
            match self.fill().await {
                Ok(Fill::Read) => {}
                Ok(Fill::Eof) => return Peeked::Failed(PeekFailure::Closed),
                Err(e) => return Peeked::Failed(e),
            }
        }
    }

    /// Read one complete header of `version` and consume it from the buffer.
    async fn read_header(&mut self, version: ProxyVersion) -> Result<ProxyHeader> {
        let peer = self.peer;
        loop {
            let complete = match version {
                ProxyVersion::V1 => version1::line_length(&self.buf)
                    .context(haproxy::Version1)
                    .context(ProxyProtoInvalid { peer })?
                    .is_some(),
                ProxyVersion::V2 => version2::header_length(&self.buf)
                    .map_or(false, |length| self.buf.len() >= length),
            };
            if complete {
                break;
            }

            match self.fill().await {
                Ok(Fill::Read) => {}
                // Let the parser report what is missing.
                Ok(Fill::Eof) => break,
                Err(PeekFailure::TimedOut) => return HeaderTimeout { peer }.fail(),
                Err(PeekFailure::Io(source)) => return Err(Error::HeaderRead { peer, source }),
                Err(PeekFailure::Closed) => break,
            }
        }

        let header = match version {
            ProxyVersion::V1 => version1::parse(&mut self.buf).context(haproxy::Version1),
            ProxyVersion::V2 => version2::parse(&mut self.buf).context(haproxy::Version2),
        }
        .context(ProxyProtoInvalid { peer })?;
        debug!(?peer, ?version, source = ?header.source_addr(), "parsed PROXY header");
        Ok(header)
    }
}

/// A [TcpListener] whose connections report the endpoints declared in PROXY
/// headers, subject to the configured mode and trusted networks.
#[derive(Debug)]
pub struct ProxyProtoListener {
    inner: TcpListener,
    mode: ProxyProtoMode,
    header_timeout: Duration,
    trusted: CidrMatcher,
}

impl ProxyProtoListener {
    pub fn new(inner: TcpListener, config: ProxyProtoConfig) -> Self {
        ProxyProtoListener {
            inner,
            mode: config.mode,
            header_timeout: config.header_timeout,
            trusted: CidrMatcher::new(config.trusted_proxies),
        }
    }

    /// Bind a TCP listener on `addr` and wrap it.
    pub async fn bind<A: ToSocketAddrs>(addr: A, config: ProxyProtoConfig) -> Result<Self> {
        let inner = TcpListener::bind(addr).await.context(Bind)?;
        Ok(Self::new(inner, config))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn mode(&self) -> ProxyProtoMode {
        self.mode
    }

    /// Trust another network from now on.
    pub fn trust(&mut self, net: IpNet) {
        self.trusted.add(net);
    }

    pub fn into_inner(self) -> TcpListener {
        self.inner
    }

    /// Accept the next connection and settle its PROXY header.
    ///
    /// An error other than [Error::Accept] concerns only the connection that
    /// caused it, which has already been closed; keep accepting.
    pub async fn accept(&self) -> Result<ProxyProtoStream> {
        let (stream, peer) = self.inner.accept().await.context(Accept)?;
        let local = stream.local_addr().context(LocalAddr { peer })?;

        let mut handshake = Handshake {
            stream,
            buf: BytesMut::new(),
            peer,
            // The deadline covers the header only; it is gone with the handshake.
            deadline: if self.header_timeout.as_nanos() == 0 {
                None
            } else {
                Instant::now().checked_add(self.header_timeout)
            },
        };

        let mut state = AcceptState::Accepted;
        loop {
            trace!(?peer, ?state, "accept state");
            state = match state {
                AcceptState::Accepted => AcceptState::TrustChecked(self.classify(peer.ip())),
                AcceptState::TrustChecked(trust) => after_trust(self.mode, trust, peer)?,
                AcceptState::StrictPath | AcceptState::AutoPath => {
                    AcceptState::Peeked(handshake.peek().await)
                }
                AcceptState::Peeked(peeked) => after_peek(self.mode, peeked, peer)?,
                AcceptState::Parse(version) => {
                    AcceptState::Wrapped(Some(handshake.read_header(version).await?))
                }
                AcceptState::PassThrough => {
                    debug!(?peer, mode = ?self.mode, "passing connection through");
                    AcceptState::Wrapped(None)
                }
                AcceptState::Wrapped(header) => {
                    return Ok(ProxyProtoStream::new(
                        handshake.stream,
                        handshake.buf,
                        header,
                        peer,
                        local,
                    ))
                }
            };
        }
    }

    fn classify(&self, ip: IpAddr) -> Trust {
        if self.trusted.is_empty() {
            Trust::Unchecked
        } else if self.trusted.contains(ip) {
            Trust::Trusted
        } else {
            Trust::Untrusted
        }
    }
}
