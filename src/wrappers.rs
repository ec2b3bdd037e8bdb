use crate::haproxy::ProxyHeader;
use bytes::{Buf as _, BytesMut};
use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

/// An accepted connection that may have carried a PROXY header.
///
/// Bytes read past the header while accepting are kept and handed out first,
/// so the application sees its stream exactly as the client sent it.
#[derive(Debug)]
pub struct ProxyProtoStream {
    inner: TcpStream,
    buf: BytesMut,
    header: Option<ProxyHeader>,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
}

impl ProxyProtoStream {
    pub(crate) fn new(
        inner: TcpStream,
        buf: BytesMut,
        header: Option<ProxyHeader>,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
    ) -> Self {
        ProxyProtoStream {
            inner,
            buf,
            header,
            peer_addr,
            local_addr,
        }
    }

    /// The client endpoint: the header's source if it declared one, otherwise
    /// the socket's peer.
    pub fn remote_addr(&self) -> SocketAddr {
        self.header
            .and_then(|header| header.source_addr())
            .unwrap_or(self.peer_addr)
    }

    /// The endpoint the client connected to: the header's destination if it
    /// declared one, otherwise the socket's local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.header
            .and_then(|header| header.dest_addr())
            .unwrap_or(self.local_addr)
    }

    /// The immediate TCP peer, i.e. the proxy when a header was sent.
    pub fn real_remote_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn real_local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The parsed header, `None` for pass-through connections.
    pub fn proxy_header(&self) -> Option<&ProxyHeader> {
        self.header.as_ref()
    }

    /// The socket, for options like `set_nodelay`.
    ///
    /// Reading from it directly skips any buffered bytes.
    pub fn get_ref(&self) -> &TcpStream {
        &self.inner
    }

    /// How many bytes were read from the socket but not yet handed out.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Take the socket back along with the bytes that must be processed
    /// before anything read from it.
    pub fn into_parts(self) -> (TcpStream, BytesMut) {
        (self.inner, self.buf)
    }
}

impl AsyncRead for ProxyProtoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.buf.is_empty() {
            let len = this.buf.len().min(out.remaining());
            out.put_slice(&this.buf[..len]);
            this.buf.advance(len);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, out)
    }
}

impl AsyncWrite for ProxyProtoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
