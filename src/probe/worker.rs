use crate::config::ProxyProtocol;
use crate::error::ProbeError;
use crate::proxy::{EndpointHandle, EndpointState, ProxyPool, ProxyServer};
use crate::site::{Outcome, RequestContext, Scheme, SiteAdapter, Verdict};
use crate::task::stream::NumberStream;
use crate::transport::{socks5, tls, HttpExchange};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(5_000);
/// Connect attempts per endpoint before it is written off.
const MAX_CONNECT_RETRIES: u32 = 2;

/// What a worker reports back to its executor.
#[derive(Debug)]
pub enum ProbeEvent {
    Classified {
        number: String,
        outcome: Outcome,
        evidence: Option<String>,
    },
    /// Probing cannot continue (pool exhausted or the site told us to stop).
    /// The in-flight number has already been pushed back.
    RequestStop,
}

/// One live connection through the current proxy.
struct Session {
    handle: EndpointHandle,
    exchange: HttpExchange,
    /// Set after a 407: requests carry `Proxy-Authorization` from here on.
    authenticated: bool,
}

enum NumberResult {
    Classified {
        outcome: Outcome,
        evidence: Option<String>,
    },
    Stop,
    Cancelled,
}

/// Probe worker: pulls a number, drives it through proxy acquisition, the
/// SOCKS5/TLS handshakes and the site exchange, classifies the answer, and
/// loops until the stream drains or someone pulls the plug. A number that is
/// not classified is always pushed back before the worker abandons it.
pub struct ProbeWorker {
    pool: Arc<ProxyPool>,
    numbers: Arc<NumberStream>,
    adapter: Arc<dyn SiteAdapter>,
    tls: TlsConnector,
    protocol: ProxyProtocol,
    scans_per_ip: u32,
    /// Account-level Basic credentials, used when an endpoint has none.
    account_auth: Option<String>,
    cancel: CancellationToken,
    events: mpsc::Sender<ProbeEvent>,
    session: Option<Session>,
}

impl ProbeWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Arc<ProxyPool>,
        numbers: Arc<NumberStream>,
        adapter: Arc<dyn SiteAdapter>,
        tls: TlsConnector,
        protocol: ProxyProtocol,
        scans_per_ip: u32,
        account_auth: Option<String>,
        cancel: CancellationToken,
        events: mpsc::Sender<ProbeEvent>,
    ) -> Self {
        Self {
            pool,
            numbers,
            adapter,
            tls,
            protocol,
            scans_per_ip,
            account_auth,
            cancel,
            events,
            session: None,
        }
    }

    pub async fn run(mut self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let number = match self.numbers.get() {
                Ok(number) => number,
                Err(_) => break,
            };
            match self.probe_number(&number).await {
                NumberResult::Classified { outcome, evidence } => {
                    metrics::counter!(
                        "numprobe_probe_total",
                        "outcome" => outcome_label(outcome),
                    )
                    .increment(1);
                    let event = ProbeEvent::Classified {
                        number,
                        outcome,
                        evidence,
                    };
                    if self.events.send(event).await.is_err() {
                        break;
                    }
                }
                NumberResult::Stop => {
                    self.numbers.push_back(number);
                    let _ = self.events.send(ProbeEvent::RequestStop).await;
                    break;
                }
                NumberResult::Cancelled => {
                    self.numbers.push_back(number);
                    break;
                }
            }
        }
        self.close_session(None);
    }

    /// Drive one number to a classification, rotating endpoints as proxy
    /// policy demands.
    async fn probe_number(&mut self, number: &str) -> NumberResult {
        let mut auth_retried = false;
        loop {
            if self.cancel.is_cancelled() {
                return NumberResult::Cancelled;
            }

            if self.session.as_ref().map(|s| s.exchange.is_closed()) == Some(true) {
                self.close_session(None);
            }
            if self.session.is_none() {
                match self.open_session().await {
                    Ok(session) => self.session = Some(session),
                    Err(ProbeError::Empty) => return NumberResult::Cancelled,
                    Err(_) => return NumberResult::Stop,
                }
            }
            let (handle, authenticated) = {
                let session = self.session.as_ref().expect("session just ensured");
                (session.handle, session.authenticated)
            };

            // Per-IP scan cap applies before every send.
            if self.scans_per_ip > 0 {
                let scanned = self.pool.scanned_count(handle).unwrap_or_default();
                if scanned >= self.scans_per_ip {
                    self.close_session(Some(EndpointState::MaxedOut));
                    continue;
                }
            }
            self.pool.record_scan(handle);

            let ctx = RequestContext {
                proxy_auth: if authenticated {
                    self.proxy_auth_value(handle)
                } else {
                    None
                },
                absolute_form: self.protocol == ProxyProtocol::HttpHttps,
            };
            let request = self.adapter.prepare_request(number, &ctx);

            let send = self
                .session
                .as_mut()
                .expect("session just ensured")
                .exchange
                .send(request);
            let response = match send.await {
                Ok(response) => response,
                Err(_) => {
                    self.close_session(Some(EndpointState::Unresponsive));
                    continue;
                }
            };

            match self.adapter.classify(&response) {
                Verdict::Classified { outcome, evidence } => {
                    return NumberResult::Classified { outcome, evidence };
                }
                Verdict::ProxyBlocked => {
                    self.close_session(Some(EndpointState::Blocked));
                }
                Verdict::ProxyWait => {
                    self.close_session(Some(EndpointState::Waiting));
                }
                Verdict::ProxyUnresponsive => {
                    self.close_session(Some(EndpointState::Unresponsive));
                }
                Verdict::AuthRequired => {
                    if auth_retried {
                        // Credentials did not satisfy the proxy either.
                        self.close_session(Some(EndpointState::Unresponsive));
                    } else {
                        auth_retried = true;
                        let session = self.session.as_mut().expect("session live");
                        session.authenticated = true;
                        if session.exchange.is_closed() {
                            let handle = session.handle;
                            if let Err(e) = self.reopen_same_endpoint(handle).await {
                                tracing::debug!(
                                    "probe: auth reconnect failed, error={}",
                                    e
                                );
                                self.close_session(Some(EndpointState::Unresponsive));
                            }
                        }
                    }
                }
                Verdict::Stop => return NumberResult::Stop,
            }
        }
    }

    /// Acquire an endpoint and connect through it, rotating past dead ones.
    /// `Exhausted` bubbles up once the pool has given up refilling.
    async fn open_session(&mut self) -> Result<Session, ProbeError> {
        loop {
            let handle = tokio::select! {
                handle = self.pool.next_endpoint() => handle?,
                _ = self.cancel.cancelled() => return Err(ProbeError::Empty),
            };
            let Some(server) = self.pool.server(handle) else {
                self.pool.release(handle);
                continue;
            };
            match self.connect_endpoint(handle, &server).await {
                Ok(session) => return Ok(session),
                Err(e) => {
                    tracing::debug!(
                        "probe: endpoint failed, addr={}, error={}",
                        server.addr,
                        e
                    );
                    continue;
                }
            }
        }
    }

    /// TCP connect (bounded retries) plus the protocol handshakes. On
    /// failure the endpoint is already marked Unresponsive and released.
    async fn connect_endpoint(
        &mut self,
        handle: EndpointHandle,
        server: &ProxyServer,
    ) -> Result<Session, ProbeError> {
        let mut last_error = String::new();
        for _ in 0..MAX_CONNECT_RETRIES {
            match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(server.addr)).await {
                Ok(Ok(stream)) => {
                    return match self.handshake(stream, server).await {
                        Ok(exchange) => Ok(Session {
                            handle,
                            exchange,
                            authenticated: false,
                        }),
                        Err(e) => {
                            self.pool.mark(handle, EndpointState::Unresponsive);
                            self.pool.release(handle);
                            Err(e)
                        }
                    };
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = "connect timed out".to_string(),
            }
        }
        self.pool.mark(handle, EndpointState::Unresponsive);
        self.pool.release(handle);
        Err(ProbeError::ProxyBroken(last_error))
    }

    /// SOCKS5 (and TLS for HTTPS sites) when tunneling; a bare exchange in
    /// HTTP-proxy mode where the proxy terminates TLS itself.
    async fn handshake(
        &self,
        mut stream: TcpStream,
        server: &ProxyServer,
    ) -> Result<HttpExchange, ProbeError> {
        match self.protocol {
            ProxyProtocol::Socks5 => {
                let host = self.adapter.host();
                let port = self.adapter.port();
                socks5::establish(&mut stream, server, host, port).await?;
                if self.adapter.scheme() == Scheme::Https {
                    let tls_stream = tls::handshake(&self.tls, host, stream).await?;
                    HttpExchange::handshake(tls_stream).await
                } else {
                    HttpExchange::handshake(stream).await
                }
            }
            ProxyProtocol::HttpHttps => HttpExchange::handshake(stream).await,
        }
    }

    /// Rebuild the connection to the endpoint we already hold (407 retry).
    async fn reopen_same_endpoint(&mut self, handle: EndpointHandle) -> Result<(), ProbeError> {
        let server = self
            .pool
            .server(handle)
            .ok_or_else(|| ProbeError::ProxyBroken("endpoint pruned".to_string()))?;
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(server.addr))
            .await
            .map_err(|_| ProbeError::ProxyBroken("connect timed out".to_string()))??;
        let exchange = self.handshake(stream, &server).await?;
        if let Some(session) = self.session.as_mut() {
            session.exchange = exchange;
        }
        Ok(())
    }

    fn proxy_auth_value(&self, handle: EndpointHandle) -> Option<String> {
        if let Some(server) = self.pool.server(handle) {
            if server.has_credentials() {
                return Some(server.basic_auth());
            }
        }
        self.account_auth.clone()
    }

    /// Tear down the current session, optionally recording a terminal state
    /// on the endpoint first.
    fn close_session(&mut self, state: Option<EndpointState>) {
        if let Some(session) = self.session.take() {
            if let Some(state) = state {
                self.pool.mark(session.handle, state);
            }
            self.pool.release(session.handle);
        }
    }
}

fn outcome_label(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::NotRegistered => "not_registered",
        Outcome::Registered => "registered",
        Outcome::Unknown => "unknown",
        Outcome::RequestStop => "request_stop",
    }
}
