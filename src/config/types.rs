use serde::{Deserialize, Serialize};

/// Oldest client build the control plane still accepts. Configs announcing an
/// older `client_version` are told to upgrade before any task is scheduled.
pub const MINIMUM_CLIENT_VERSION: u32 = 12;

/// Top-level prober configuration, read from `./proxy_config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProberConfig {
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Build number of this deployment, compared against
    /// [`MINIMUM_CLIENT_VERSION`] to force upgrades.
    #[serde(default = "default_client_version")]
    pub client_version: u32,
}

/// Which protocol the vendor's endpoints speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ProxyProtocol {
    Socks5,
    HttpHttps,
}

impl TryFrom<u8> for ProxyProtocol {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ProxyProtocol::Socks5),
            1 => Ok(ProxyProtocol::HttpHttps),
            other => Err(format!("unknown proxy protocol index: {}", other)),
        }
    }
}

impl From<ProxyProtocol> for u8 {
    fn from(value: ProxyProtocol) -> Self {
        match value {
            ProxyProtocol::Socks5 => 0,
            ProxyProtocol::HttpHttps => 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// 0 = SOCKS5, 1 = HTTP/HTTPS forward proxy.
    #[serde(default = "default_protocol")]
    pub protocol: ProxyProtocol,

    /// Vendor URL that returns `ip:port[ user pass]` lines.
    #[serde(default)]
    pub target: String,

    /// Vendor URL that reports remaining extraction quota. Empty disables
    /// quota checking before refills.
    #[serde(default)]
    pub count_target: String,

    /// Account-level credentials used for `Proxy-Authorization` when an
    /// endpoint carries none of its own.
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,

    /// Publish refilled endpoints to sibling workers.
    #[serde(default)]
    pub share: bool,

    /// Concurrent probe sockets per task.
    #[serde(default = "default_socket_count")]
    pub socket_count: u32,

    /// Endpoints expected per vendor refill.
    #[serde(default = "default_per_fetch")]
    pub per_fetch: u32,

    /// Minimum seconds between consecutive vendor calls.
    #[serde(default = "default_fetch_interval")]
    pub fetch_interval: u64,

    /// Verify site TLS certificates. The probe workflow tolerates
    /// interception-grade proxies when this is off.
    #[serde(default = "default_tls_verify")]
    pub tls_verify: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            target: String::new(),
            count_target: String::new(),
            username: String::new(),
            password: String::new(),
            share: false,
            socket_count: default_socket_count(),
            per_fetch: default_per_fetch(),
            fetch_interval: default_fetch_interval(),
            tls_verify: default_tls_verify(),
        }
    }
}

fn default_protocol() -> ProxyProtocol {
    ProxyProtocol::Socks5
}

fn default_client_version() -> u32 {
    MINIMUM_CLIENT_VERSION
}

fn default_socket_count() -> u32 {
    8
}

fn default_per_fetch() -> u32 {
    50
}

fn default_fetch_interval() -> u64 {
    5
}

fn default_tls_verify() -> bool {
    true
}
