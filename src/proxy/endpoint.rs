use base64::Engine;
use std::net::SocketAddr;
use std::time::Instant;

/// Health of a single proxy endpoint. Only the worker currently holding the
/// endpoint moves it out of `Active`; `Waiting` flows back to `Active` during
/// selection once the cooldown has passed, everything else is terminal until
/// the pool prunes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Active,
    Blocked,
    MaxedOut,
    Waiting,
    Unresponsive,
}

/// Address and credentials of a vendor-issued proxy server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyServer {
    pub addr: SocketAddr,
    pub username: String,
    pub password: String,
}

impl ProxyServer {
    /// Parse one persisted or vendor-issued record: `ip:port[ user pass]`.
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut parts = line.split_whitespace();
        let addr_part = parts.next().ok_or_else(|| "empty record".to_string())?;
        let addr: SocketAddr = addr_part
            .parse()
            .map_err(|e| format!("bad address {:?}: {}", addr_part, e))?;
        let username = parts.next().unwrap_or_default().to_string();
        let password = parts.next().unwrap_or_default().to_string();
        Ok(Self {
            addr,
            username,
            password,
        })
    }

    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }

    /// `Proxy-Authorization` value for HTTP-proxy mode.
    pub fn basic_auth(&self) -> String {
        let token = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", self.username, self.password));
        format!("Basic {}", token)
    }

    /// Persisted form, one record per line.
    pub fn to_record(&self) -> String {
        format!("{} {} {}", self.addr, self.username, self.password)
    }
}

/// Mutable per-endpoint state, owned by the pool's slot arena.
#[derive(Debug)]
pub struct Endpoint {
    pub server: ProxyServer,
    pub state: EndpointState,
    pub scanned_count: u32,
    pub last_used: Instant,
}

impl Endpoint {
    pub fn new(server: ProxyServer) -> Self {
        Self {
            server,
            state: EndpointState::Active,
            scanned_count: 0,
            last_used: Instant::now(),
        }
    }
}

/// Opaque reference to a pool slot. Validity is re-checked on every use: a
/// pruned-and-reused slot bumps its generation, so stale handles go inert
/// instead of touching a different endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}
