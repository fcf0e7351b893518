use std::fmt;

/// Crate-wide error taxonomy. Variants map to the recovery policy applied by
/// the caller: transport and parse failures are absorbed by the probe worker,
/// pool exhaustion and sink failures surface as task status.
#[derive(Debug)]
pub enum ProbeError {
    /// The number stream has no retry entries and the input file is drained.
    Empty,
    /// The proxy pool has no usable endpoint and refill retries are exhausted.
    Exhausted,
    /// The vendor fetch actor failed or timed out.
    FetchFailed(String),
    /// TCP / SOCKS5 / TLS failure on the path to the target site.
    ProxyBroken(String),
    /// The site response could not be exchanged (request write / response read).
    Http(String),
    /// Output sink open or write failure, fatal to the task.
    Sink(std::io::Error),
    Store(String),
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::Empty => write!(f, "number stream empty"),
            ProbeError::Exhausted => write!(f, "proxy pool exhausted"),
            ProbeError::FetchFailed(msg) => write!(f, "proxy fetch failed: {}", msg),
            ProbeError::ProxyBroken(msg) => write!(f, "proxy transport broken: {}", msg),
            ProbeError::Http(msg) => write!(f, "http exchange error: {}", msg),
            ProbeError::Sink(e) => write!(f, "sink error: {}", e),
            ProbeError::Store(msg) => write!(f, "store error: {}", msg),
        }
    }
}

impl std::error::Error for ProbeError {}

impl From<std::io::Error> for ProbeError {
    fn from(e: std::io::Error) -> Self {
        ProbeError::ProxyBroken(e.to_string())
    }
}
