use crate::error::ProbeError;
use crate::transport::tls;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(20);

/// Status line and collected body of one probe response.
#[derive(Debug)]
pub struct SiteResponse {
    pub status: u16,
    pub body: String,
}

/// One HTTP/1.1 connection over an already-established stream (plain TCP,
/// SOCKS5 tunnel, or TLS). Keep-alive is driven by the site adapter's
/// headers; consecutive numbers reuse the same exchange until the peer or a
/// proxy decision closes it.
pub struct HttpExchange {
    sender: http1::SendRequest<Full<Bytes>>,
}

impl HttpExchange {
    pub async fn handshake<S>(stream: S) -> Result<Self, ProbeError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let (sender, connection) = http1::handshake(io)
            .await
            .map_err(|e| ProbeError::Http(e.to_string()))?;
        tokio::spawn(async move {
            // Missing close_notify and peer resets land here; the next
            // `send` observes the closed connection and the worker rotates.
            if let Err(e) = connection.await {
                tracing::debug!("transport: connection ended, error={}", e);
            }
        });
        Ok(Self { sender })
    }

    /// True once the peer has hung up; the worker acquires a fresh tunnel.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Write one request and collect the full response body. A body cut
    /// short by a missing TLS close_notify still yields what arrived.
    pub async fn send(
        &mut self,
        request: http::Request<Full<Bytes>>,
    ) -> Result<SiteResponse, ProbeError> {
        tokio::time::timeout(WRITE_TIMEOUT, self.sender.ready())
            .await
            .map_err(|_| ProbeError::Http("request write timed out".to_string()))?
            .map_err(|e| ProbeError::Http(e.to_string()))?;

        let response = tokio::time::timeout(READ_TIMEOUT, self.sender.send_request(request))
            .await
            .map_err(|_| ProbeError::Http("response timed out".to_string()))?
            .map_err(|e| ProbeError::Http(e.to_string()))?;

        let status = response.status().as_u16();
        let mut body = response.into_body();
        let mut collected: Vec<u8> = Vec::new();
        loop {
            let frame = match tokio::time::timeout(READ_TIMEOUT, body.frame()).await {
                Err(_) => return Err(ProbeError::Http("response body timed out".to_string())),
                Ok(None) => break,
                Ok(Some(Ok(frame))) => frame,
                Ok(Some(Err(e))) => {
                    // Sites that skip close_notify truncate the stream
                    // instead of ending the body; whatever arrived is the
                    // response.
                    if is_truncated_close(&e) {
                        break;
                    }
                    return Err(ProbeError::Http(e.to_string()));
                }
            };
            if let Ok(data) = frame.into_data() {
                collected.extend_from_slice(&data);
            }
        }

        Ok(SiteResponse {
            status,
            body: String::from_utf8_lossy(&collected).into_owned(),
        })
    }
}

/// Whether a body read failed only because the peer tore the stream down
/// without a close_notify (close-delimited responses over TLS).
fn is_truncated_close(e: &hyper::Error) -> bool {
    let mut source = std::error::Error::source(e);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return tls::is_benign_close(io);
        }
        source = cause.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_exchange_round_trip() {
        let (client, mut server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let n = server.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).into_owned();
            let body = r#"{"success":true}"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            server.write_all(response.as_bytes()).await.unwrap();
            request
        });

        let mut exchange = HttpExchange::handshake(client).await.unwrap();
        let request = http::Request::builder()
            .method("POST")
            .uri("/ajax/validator.jsp")
            .header("host", "site.example")
            .body(Full::new(Bytes::from("method=13000000001")))
            .unwrap();
        let response = exchange.send(request).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body, r#"{"success":true}"#);
        let written = server_task.await.unwrap();
        assert!(written.starts_with("POST /ajax/validator.jsp HTTP/1.1\r\n"));
        assert!(written.contains("host: site.example"));
        assert!(written.ends_with("method=13000000001"));
    }

    #[tokio::test]
    async fn test_close_delimited_body() {
        let (client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let _ = server.read(&mut buf).await.unwrap();
            // No content-length: the body runs until the peer hangs up.
            server
                .write_all(b"HTTP/1.1 200 OK\r\nconnection: close\r\n\r\n{\"errCode\":21006}")
                .await
                .unwrap();
            drop(server);
        });

        let mut exchange = HttpExchange::handshake(client).await.unwrap();
        let request = http::Request::builder()
            .method("GET")
            .uri("/check")
            .header("host", "site.example")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = exchange.send(request).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, r#"{"errCode":21006}"#);
    }

    #[tokio::test]
    async fn test_peer_close_detected() {
        let (client, server) = tokio::io::duplex(64);
        let exchange = HttpExchange::handshake(client).await.unwrap();
        drop(server);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(exchange.is_closed());
    }

    #[tokio::test]
    async fn test_absolute_form_target_preserved() {
        let (client, mut server) = tokio::io::duplex(4096);
        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let n = server.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).into_owned();
            server
                .write_all(b"HTTP/1.1 204 No Content\r\ncontent-length: 0\r\n\r\n")
                .await
                .unwrap();
            request
        });

        let mut exchange = HttpExchange::handshake(client).await.unwrap();
        let request = http::Request::builder()
            .method("GET")
            .uri("http://site.example/check")
            .header("host", "site.example")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = exchange.send(request).await.unwrap();
        assert_eq!(response.status, 204);

        let written = server_task.await.unwrap();
        assert!(written.starts_with("GET http://site.example/check HTTP/1.1\r\n"));
    }
}
