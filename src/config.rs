//! PROXY protocol listener configuration.

use crate::error::{Error, Result};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::Duration};

/// Whether a PROXY header is required or merely recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtoMode {
    /// Every accepted connection must start with a header.
    Strict,

    /// A header is parsed when one is present; other connections pass through.
    Auto,
}

impl Default for ProxyProtoMode {
    fn default() -> Self {
        Self::Strict
    }
}

impl FromStr for ProxyProtoMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("strict") {
            Ok(Self::Strict)
        } else if s.eq_ignore_ascii_case("auto") {
            Ok(Self::Auto)
        } else {
            Err(Error::InvalidMode { mode: s.to_owned() })
        }
    }
}

impl fmt::Display for ProxyProtoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Strict => f.write_str("strict"),
            Self::Auto => f.write_str("auto"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyProtoConfig {
    pub mode: ProxyProtoMode,

    /// How long a connection may take to deliver its header. Zero disables
    /// the limit.
    #[serde(rename = "header_timeout_ms", with = "millis")]
    pub header_timeout: Duration,

    /// Peers allowed to send a header. Empty means every peer is.
    pub trusted_proxies: Vec<IpNet>,
}

impl ProxyProtoConfig {
    pub fn strict() -> Self {
        Self {
            mode: ProxyProtoMode::Strict,
            ..Self::default()
        }
    }

    pub fn auto() -> Self {
        Self {
            mode: ProxyProtoMode::Auto,
            ..Self::default()
        }
    }

    pub fn with_header_timeout(mut self, timeout: Duration) -> Self {
        self.header_timeout = timeout;
        self
    }

    pub fn with_trusted_proxy(mut self, net: IpNet) -> Self {
        self.trusted_proxies.push(net);
        self
    }
}

mod millis {
    use serde::{Deserialize as _, Deserializer, Serializer};
    use std::{convert::TryFrom as _, time::Duration};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
