use crate::error::ProbeError;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Per-request HTTP timeout against the vendor.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
/// Total budget for one queue entry, connection setup included.
const RESULT_BUDGET: Duration = Duration::from_secs(60);

pub struct FetchResult {
    pub status: u16,
    pub body: String,
}

struct FetchRequest {
    url: String,
    reply: oneshot::Sender<Result<FetchResult, ProbeError>>,
}

/// Handle to the process-wide vendor fetch actor. Cheap to clone; every pool
/// funnels its vendor calls through the same queue so that the vendor's rate
/// interval is honored globally, not per task.
#[derive(Clone)]
pub struct FetcherHandle {
    tx: mpsc::Sender<FetchRequest>,
}

impl FetcherHandle {
    /// Submit a vendor URL and wait for the serialized result.
    pub async fn fetch(&self, url: String) -> Result<FetchResult, ProbeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = FetchRequest {
            url,
            reply: reply_tx,
        };
        self.tx
            .send(request)
            .await
            .map_err(|_| ProbeError::FetchFailed("fetcher is shut down".to_string()))?;
        reply_rx
            .await
            .map_err(|_| ProbeError::FetchFailed("fetcher dropped the request".to_string()))?
    }
}

/// Spawn the singleton fetch actor. Consecutive vendor calls are separated by
/// at least `fetch_interval` seconds regardless of how many pools are asking.
/// On shutdown the queue is drained before the actor exits, so no caller is
/// left waiting on a dead oneshot.
pub fn spawn(fetch_interval: u64, shutdown: CancellationToken) -> FetcherHandle {
    let (tx, mut rx) = mpsc::channel::<FetchRequest>(64);

    tokio::spawn(async move {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .no_proxy()
            .build()
            .expect("failed to build vendor HTTP client");
        let interval = Duration::from_secs(fetch_interval.max(1));
        let mut last_fetch: Option<Instant> = None;

        loop {
            let request = tokio::select! {
                req = rx.recv() => match req {
                    Some(req) => req,
                    None => break,
                },
                _ = shutdown.cancelled() => {
                    // Serve whatever is already queued, then exit.
                    match rx.try_recv() {
                        Ok(req) => req,
                        Err(_) => break,
                    }
                }
            };

            if let Some(at) = last_fetch {
                let since = at.elapsed();
                if since < interval {
                    tokio::time::sleep(interval - since).await;
                }
            }

            let outcome = fetch_once(&client, &request.url).await;
            last_fetch = Some(Instant::now());
            match &outcome {
                Ok(result) => {
                    metrics::counter!("numprobe_vendor_fetch_total", "result" => "success")
                        .increment(1);
                    tracing::debug!(
                        "fetcher: vendor call completed, status={}, bytes={}",
                        result.status,
                        result.body.len()
                    );
                }
                Err(e) => {
                    metrics::counter!("numprobe_vendor_fetch_total", "result" => "error")
                        .increment(1);
                    tracing::warn!("fetcher: vendor call failed, error={}", e);
                }
            }
            let _ = request.reply.send(outcome);
        }
        tracing::info!("fetcher: shut down");
    });

    FetcherHandle { tx }
}

async fn fetch_once(client: &reqwest::Client, url: &str) -> Result<FetchResult, ProbeError> {
    let exchange = async {
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| ProbeError::FetchFailed(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| ProbeError::FetchFailed(e.to_string()))?;
        Ok(FetchResult { status, body })
    };
    tokio::time::timeout(RESULT_BUDGET, exchange)
        .await
        .map_err(|_| ProbeError::FetchFailed("vendor call timed out".to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn serve_once(body: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
        });
        format!("http://{}/extract", addr)
    }

    #[tokio::test]
    async fn test_fetch_round_trip() {
        let url = serve_once("1.2.3.4:1080 u p\n").await;
        let handle = spawn(1, CancellationToken::new());
        let result = handle.fetch(url).await.unwrap();
        assert_eq!(result.status, 200);
        assert_eq!(result.body, "1.2.3.4:1080 u p\n");
    }

    #[tokio::test]
    async fn test_fetch_connection_refused_is_error() {
        let handle = spawn(1, CancellationToken::new());
        let result = handle.fetch("http://127.0.0.1:1/x".to_string()).await;
        assert!(matches!(result, Err(ProbeError::FetchFailed(_))));
    }

    #[tokio::test]
    async fn test_calls_are_spaced_by_interval() {
        let url_a = serve_once("a").await;
        let url_b = serve_once("b").await;
        let handle = spawn(1, CancellationToken::new());
        let started = std::time::Instant::now();
        handle.fetch(url_a).await.unwrap();
        handle.fetch(url_b).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(1));
    }
}
