#![warn(rust_2018_idioms)]
#![warn(clippy::all)]

mod relay;

use eyre::{Report, WrapErr as _};
use proxy_ingress::{ProxyProtoConfig, ProxyProtoListener};
use serde::{Deserialize, Serialize};
use std::{env, net::SocketAddr, sync::Arc};
use tokio::io::ErrorKind;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> Result<(), Report> {
    // We first need Eyre to work correctly...
    stable_eyre::install()?;

    // Now to init the .env file...
    match dotenv::dotenv() {
        Ok(_) => (),
        Err(e) if e.not_found() => (),
        Err(e) => {
            return Err(e).wrap_err(".env file could not be loaded");
        }
    }

    // And now tracing, as that depends on .env...
    tracing_subscriber::fmt::init();

    info!(concat!(
        env!("CARGO_PKG_NAME"),
        " (v",
        env!("CARGO_PKG_VERSION"),
        ")"
    ));

    let relay_file = env::var("RELAY_FILE").unwrap_or_else(|_| String::from("relay.json"));
    let relay: Relay = {
        let contents = std::fs::read_to_string(&relay_file)
            .wrap_err_with(|| format!("{} could not be read", relay_file))?;
        serde_json::from_str(&contents)?
    };
    debug!(?relay, "relay was loaded");

    let addr = env::var("ADDRESS")
        .ok()
        .unwrap_or_else(|| "0.0.0.0:8000".into());
    debug!(?addr, "binding to address");

    let listener = ProxyProtoListener::bind(&addr, relay.proxy_protocol.clone()).await?;
    info!(
        ?addr,
        mode = %listener.mode(),
        trusted = relay.proxy_protocol.trusted_proxies.len(),
        "listening",
    );

    accept_connections(listener, Arc::new(relay)).await;

    Ok(())
}

async fn accept_connections(listener: ProxyProtoListener, relay: Arc<Relay>) {
    loop {
        let stream = match listener.accept().await {
            Ok(stream) => stream,
            // Only that one connection is gone.
            Err(e) if e.is_connection_error() => {
                debug!(error = %e, "connection refused");
                continue;
            }
            Err(e) => {
                error!("Error occurred while listening: {:?}", e);
                continue;
            }
        };

        let relay = Arc::clone(&relay);
        let task = async move {
            let addr = stream.remote_addr();
            if let Err(e) = relay::relay(stream, relay.upstream, relay.send_proxy_protocol).await {
                if let relay::RelayError::Io { source } = e {
                    match source.kind() {
                        ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::BrokenPipe
                        | ErrorKind::NotConnected
                        | ErrorKind::TimedOut => {
                            debug!(?source, ?addr, "connection closed");
                        }

                        _ => {
                            error!(?source, ?addr, "error during relay");
                        }
                    }
                } else {
                    error!(?e, ?addr, "error during relay");
                }
            }
        };

        tokio::spawn(task);
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Relay {
    pub upstream: SocketAddr,
    #[serde(default)]
    pub send_proxy_protocol: bool,
    #[serde(default)]
    pub proxy_protocol: ProxyProtoConfig,
}
