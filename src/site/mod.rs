//! Site adapters: per-website request shaping and response classification.
//!
//! Each target website contributes two things: how to ask "is this number
//! registered?" and how to read the answer. Everything else (proxies,
//! tunnels, retries, sinks) is shared machinery.

pub mod catalog;
pub mod jjgames;
pub mod qunar;

use crate::transport::SiteResponse;
use bytes::Bytes;
use http_body_util::Full;
use rand::Rng;
use std::sync::Arc;

/// Four-way probe classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Site confirmed the number is not in use.
    NotRegistered,
    /// Site confirmed the number is already registered.
    Registered,
    /// Response parsed but the classification is ambiguous.
    Unknown,
    /// Protocol-level signal that probing must halt.
    RequestStop,
}

/// What the adapter wants the probe worker to do with a response.
#[derive(Debug)]
pub enum Verdict {
    /// The number is classified; `evidence` optionally carries a secondary
    /// positive line for the auxiliary sink.
    Classified {
        outcome: Outcome,
        evidence: Option<String>,
    },
    /// Endpoint is banned for this site. Mark Blocked, rotate, retry the
    /// same number.
    ProxyBlocked,
    /// Endpoint is throttled. Mark Waiting, rotate, retry the same number.
    ProxyWait,
    /// The response smells like proxy interference rather than a site
    /// answer. Mark Unresponsive, rotate, retry the same number.
    ProxyUnresponsive,
    /// Proxy wants credentials. Retry once with the auth header set.
    AuthRequired,
    /// The site refuses this traffic shape outright.
    Stop,
}

impl Verdict {
    pub fn classified(outcome: Outcome) -> Self {
        Verdict::Classified {
            outcome,
            evidence: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Per-request knobs owned by the worker, not the adapter: whether a
/// `Proxy-Authorization` header must be attached (after a 407) and whether
/// the request line needs the absolute form (HTTP-proxy mode).
#[derive(Debug, Default, Clone)]
pub struct RequestContext {
    pub proxy_auth: Option<String>,
    pub absolute_form: bool,
}

pub type SiteRequest = http::Request<Full<Bytes>>;

pub trait SiteAdapter: Send + Sync {
    /// Short name used for sink directories.
    fn alias(&self) -> &str;

    fn host(&self) -> &str;

    fn scheme(&self) -> Scheme;

    fn port(&self) -> u16 {
        self.scheme().default_port()
    }

    fn prepare_request(&self, number: &str, ctx: &RequestContext) -> SiteRequest;

    fn classify(&self, response: &SiteResponse) -> Verdict;
}

/// Resolve the adapter for a website address recorded by the control plane.
pub fn adapter_for(address: &str) -> Option<Arc<dyn SiteAdapter>> {
    if address.contains("qunar") {
        return Some(Arc::new(qunar::Qunar));
    }
    if address.contains("jj.cn") || address.contains("jjgames") {
        return Some(Arc::new(jjgames::JjGames));
    }
    catalog::find(address)
        .map(|site| Arc::new(catalog::CatalogAdapter::new(site)) as Arc<dyn SiteAdapter>)
}

// ---- Shared classification helpers ----

/// Proxy-policy statuses every adapter must honor before looking at the body.
pub fn classify_status(status: u16) -> Option<Verdict> {
    match status {
        300..=399 => Some(Verdict::ProxyBlocked),
        400 => Some(Verdict::Stop),
        407 => Some(Verdict::AuthRequired),
        _ => None,
    }
}

/// Clip JSONP-style noise (`callback({...})`, stray log lines) to the
/// outermost JSON object: first `{` through last `}`.
pub fn clip_to_braces(body: &str) -> Option<&str> {
    let open = body.find('{')?;
    let close = body.rfind('}')?;
    if close < open {
        return None;
    }
    Some(&body[open..=close])
}

/// Parse a JSON object out of a possibly noisy body.
pub fn parse_object(body: &str) -> Option<serde_json::Map<String, serde_json::Value>> {
    if let Ok(serde_json::Value::Object(object)) = serde_json::from_str(body) {
        return Some(object);
    }
    let clipped = clip_to_braces(body)?;
    match serde_json::from_str(clipped) {
        Ok(serde_json::Value::Object(object)) => Some(object),
        _ => None,
    }
}

// ---- Request shaping helpers ----

/// Request target for the chosen transport: origin-form through a tunnel,
/// absolute-form when the forward proxy terminates the connection.
pub fn request_target(scheme: Scheme, host: &str, path: &str, ctx: &RequestContext) -> String {
    if ctx.absolute_form {
        format!("{}://{}{}", scheme.as_str(), host, path)
    } else {
        path.to_string()
    }
}

/// Browser pool the probes rotate through; a stable fingerprint per request
/// keeps per-IP heuristics from keying on the client string.
const USER_AGENTS: [&str; 14] = [
    "Mozilla/5.0 (Windows NT 6.1) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/41.0.2228.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 6.1; WOW64; rv:40.0) Gecko/20100101 Firefox/40.1",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/79.0.3945.130 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:72.0) Gecko/20100101 Firefox/72.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_2) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/79.0.3945.130 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:72.0) Gecko/20100101 Firefox/72.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/79.0.3945.117 Safari/537.36",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:72.0) Gecko/20100101 Firefox/72.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_2) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/13.0.4 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 6.3; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/78.0.3904.108 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/78.0.3904.97 Safari/537.36 Edg/78.0.276.19",
    "Mozilla/5.0 (Windows NT 6.1; Win64; x64; rv:71.0) Gecko/20100101 Firefox/71.0",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 13_3 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/13.0.4 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Linux; Android 9; SM-G960F) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/78.0.3904.96 Mobile Safari/537.36",
];

pub fn random_user_agent() -> &'static str {
    USER_AGENTS[rand::thread_rng().gen_range(0..USER_AGENTS.len())]
}

/// Milliseconds since the epoch plus a callback id, for sites whose endpoints
/// take cache-busting timestamp parameters.
pub fn time_params() -> (u64, u64) {
    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let jitter = rand::thread_rng().gen_range(0..1000u64);
    (now_ms, now_ms + jitter)
}
