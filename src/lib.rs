//! Accept TCP connections that sit behind a PROXY protocol speaking load
//! balancer, and hand them out with the addresses of the original client.
//!
//! ```no_run
//! use proxy_ingress::{ProxyProtoConfig, ProxyProtoListener};
//! use std::time::Duration;
//!
//! # async fn run() -> proxy_ingress::Result<()> {
//! let config = ProxyProtoConfig::strict()
//!     .with_header_timeout(Duration::from_secs(5))
//!     .with_trusted_proxy("10.0.0.0/8".parse().unwrap());
//! let listener = ProxyProtoListener::bind("0.0.0.0:8000", config).await?;
//! loop {
//!     match listener.accept().await {
//!         Ok(stream) => println!("client at {}", stream.remote_addr()),
//!         Err(e) if e.is_connection_error() => continue,
//!         Err(e) => return Err(e),
//!     }
//! }
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]

pub mod cidr;
pub mod config;
pub mod error;
pub mod haproxy;
pub mod listener;
pub mod wrappers;

pub use self::{
    cidr::CidrMatcher,
    config::{ProxyProtoConfig, ProxyProtoMode},
    error::{Error, PeekFailure, Result},
    haproxy::{ProxyCommand, ProxyHeader, ProxyTransport, ProxyVersion},
    listener::ProxyProtoListener,
    wrappers::ProxyProtoStream,
};

pub(crate) mod prelude {
    pub use bytes::BytesMut;
    pub use snafu::ResultExt;
    pub use tracing::{debug, trace};

    /// Make sure at least `bytes` more can be written without reallocating.
    pub fn reserve_at_least(buf: &mut BytesMut, bytes: usize) {
        let spare = buf.capacity() - buf.len();
        if spare < bytes {
            // This will likely reserve a fair bit more.
            buf.reserve(bytes);
        }
    }
}
