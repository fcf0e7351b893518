//! End-to-end scenarios against in-process mock proxies and sites: the
//! scheduler dispatches real tasks, executors fan out real workers, and the
//! mock on the other end scripts the site's answers.

use numprobe::config::{ProberConfig, ProxyProtocol};
use numprobe::db::{MemoryStore, TaskStore, UploadRecord, WebsiteRecord};
use numprobe::proxy::{fetcher, PoolContext, ProxyPool, ShareBus, WorkerRegistry};
use numprobe::site::{
    self, Outcome, RequestContext, Scheme, SiteAdapter, SiteRequest, Verdict,
};
use numprobe::task::types::TaskKind;
use numprobe::task::{NumberStream, TaskContext, TaskScheduler};
use numprobe::task::{AtomicTask, TaskStatus};
use numprobe::transport::SiteResponse;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

// ---- Mock servers ----

struct ParsedRequest {
    request_line: String,
    head: String,
    body: String,
}

impl ParsedRequest {
    fn has_proxy_auth(&self) -> bool {
        self.head.to_ascii_lowercase().contains("proxy-authorization:")
    }

    /// Number out of a qunar-style form body (`method=<number>&...`).
    fn form_number(&self) -> String {
        self.body
            .strip_prefix("method=")
            .and_then(|rest| rest.split('&').next())
            .unwrap_or_default()
            .to_string()
    }
}

type Responder = Arc<dyn Fn(&ParsedRequest) -> String + Send + Sync>;

fn json_response(status: u16, reason: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    )
}

async fn read_one_request<R>(reader: &mut BufReader<R>) -> Option<ParsedRequest>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut head = String::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await.ok()?;
        if n == 0 {
            return None;
        }
        if line == "\r\n" {
            break;
        }
        head.push_str(&line);
    }
    let content_length = head
        .lines()
        .find_map(|line| {
            line.to_ascii_lowercase()
                .strip_prefix("content-length:")
                .map(|v| v.trim().parse::<usize>().unwrap_or(0))
        })
        .unwrap_or(0);
    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        reader.read_exact(&mut body).await.ok()?;
    }
    Some(ParsedRequest {
        request_line: head.lines().next().unwrap_or_default().to_string(),
        head,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

async fn serve_http(stream: TcpStream, responder: Responder, delay: Option<Duration>) {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    while let Some(request) = read_one_request(&mut reader).await {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let response = responder(&request);
        if write.write_all(response.as_bytes()).await.is_err() {
            return;
        }
    }
}

/// HTTP forward proxy and site rolled into one.
async fn spawn_http_proxy(responder: Responder, delay: Option<Duration>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(serve_http(stream, responder.clone(), delay));
        }
    });
    addr
}

/// SOCKS5 proxy that, once the tunnel is "established", answers site
/// requests itself.
async fn spawn_socks5_site(responder: Responder) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let responder = responder.clone();
            tokio::spawn(async move {
                let mut greeting_head = [0u8; 2];
                stream.read_exact(&mut greeting_head).await.unwrap();
                let mut methods = vec![0u8; greeting_head[1] as usize];
                stream.read_exact(&mut methods).await.unwrap();
                stream.write_all(&[0x05, 0x00]).await.unwrap();

                let mut connect_head = [0u8; 5];
                stream.read_exact(&mut connect_head).await.unwrap();
                let mut tail = vec![0u8; connect_head[4] as usize + 2];
                stream.read_exact(&mut tail).await.unwrap();
                stream
                    .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                    .await
                    .unwrap();

                serve_http(stream, responder, None).await;
            });
        }
    });
    addr
}

/// Vendor extraction endpoint that always answers an empty body.
async fn spawn_empty_vendor() -> SocketAddr {
    let responder: Responder = Arc::new(|_| {
        "HTTP/1.1 200 OK\r\ncontent-length: 1\r\n\r\n\n".to_string()
    });
    spawn_http_proxy(responder, None).await
}

// ---- Harness ----

struct Harness {
    dir: tempfile::TempDir,
    store: Arc<MemoryStore>,
    context: Arc<TaskContext>,
    queue: numprobe::task::TaskQueue,
    _shutdown: CancellationToken,
}

fn qunar_website() -> WebsiteRecord {
    WebsiteRecord {
        id: 7,
        address: "https://user.qunar.com".to_string(),
        alias: "qunar".to_string(),
    }
}

impl Harness {
    fn start(mut config: ProberConfig, proxies: &[SocketAddr]) -> Self {
        config.proxy.fetch_interval = 1;
        let dir = tempfile::tempdir().unwrap();
        if !proxies.is_empty() {
            let records: String = proxies
                .iter()
                .map(|addr| format!("{} user pass\n", addr))
                .collect();
            let file = match config.proxy.protocol {
                ProxyProtocol::Socks5 => "socks5_proxy_servers.txt",
                ProxyProtocol::HttpHttps => "http_proxy_servers.txt",
            };
            std::fs::write(dir.path().join(file), records).unwrap();
        }

        let store = Arc::new(MemoryStore::new());
        store.insert_website(qunar_website());

        let shutdown = CancellationToken::new();
        let fetch_handle = fetcher::spawn(config.proxy.fetch_interval, shutdown.clone());
        let context = Arc::new(TaskContext {
            config: Arc::new(config),
            store: store.clone() as Arc<dyn TaskStore>,
            fetcher: fetch_handle,
            bus: ShareBus::new(),
            worker_registry: Arc::new(WorkerRegistry::new()),
            tasks: Default::default(),
            work_dir: dir.path().to_path_buf(),
        });
        let (queue, scheduler) = TaskScheduler::new(context.clone(), shutdown.clone());
        tokio::spawn(scheduler.run());

        Self {
            dir,
            store,
            context,
            queue,
            _shutdown: shutdown,
        }
    }

    fn upload_numbers(&self, id: u32, numbers: &[&str]) {
        let path = self.dir.path().join(format!("upload_{}.txt", id));
        std::fs::write(&path, numbers.join("\n")).unwrap();
        self.store.insert_upload(UploadRecord {
            id,
            name_on_disk: path,
        });
    }

    async fn wait_for_terminal(&self, task_id: u32) -> TaskStatus {
        for _ in 0..600 {
            if let Some((_, _, status)) = self.store.progress(task_id) {
                if matches!(
                    status,
                    TaskStatus::Completed
                        | TaskStatus::Stopped
                        | TaskStatus::Erred
                        | TaskStatus::AutoStopped
                ) {
                    return status;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("task {} never reached a terminal status", task_id);
    }

    fn sink_lines(&self, task_id: u32, kind: &str) -> Vec<String> {
        let handle = self.context.tasks.get(task_id).expect("task registered");
        let paths = handle.sink_paths();
        let path = match kind {
            "ok" => paths.ok,
            "ok2" => paths.ok2,
            "not_ok" => paths.not_ok,
            _ => paths.unknown,
        };
        read_lines(&path)
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

fn http_mode_config() -> ProberConfig {
    let mut config = ProberConfig::default();
    config.proxy.protocol = ProxyProtocol::HttpHttps;
    config.proxy.socket_count = 1;
    config
}

/// qunar semantics: numbers ending in an odd digit are registered.
fn qunar_responder() -> Responder {
    Arc::new(|request: &ParsedRequest| {
        let number = request.form_number();
        let odd = number
            .chars()
            .last()
            .and_then(|c| c.to_digit(10))
            .map(|d| d % 2 == 1)
            .unwrap_or(false);
        let body = if odd {
            r#"{"errCode":11009}"#
        } else {
            r#"{"errCode":21006}"#
        };
        json_response(200, "OK", body)
    })
}

// ---- Scenarios ----

#[tokio::test(flavor = "multi_thread")]
async fn scenario_fresh_task_completes_and_routes_sinks() {
    let proxy = spawn_http_proxy(qunar_responder(), None).await;
    let harness = Harness::start(http_mode_config(), &[proxy]);
    harness.upload_numbers(1, &["13000000001", "13000000002", "13000000004"]);

    harness
        .queue
        .submit(AtomicTask::fresh(42, 7, 0, vec![1]));
    let status = harness.wait_for_terminal(42).await;
    assert_eq!(status, TaskStatus::Completed);

    let (processed, _, _) = harness.store.progress(42).unwrap();
    assert_eq!(processed, 3);

    let mut ok = harness.sink_lines(42, "ok");
    ok.sort();
    assert_eq!(ok, vec!["13000000002", "13000000004"]);
    assert_eq!(harness.sink_lines(42, "not_ok"), vec!["13000000001"]);
    assert!(harness.sink_lines(42, "unknown").is_empty());

    let handle = harness.context.tasks.get(42).unwrap();
    assert_eq!(handle.counts(), (2, 1, 0));

    // Completed tasks clean their temp input up (the delete lands just
    // after the final progress write, so give it a beat).
    let mut leftovers = usize::MAX;
    for _ in 0..50 {
        leftovers = std::fs::read_dir(harness.dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with('.'))
            .count();
        if leftovers == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(leftovers, 0, "input file should be deleted");
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_proxy_auth_retry_after_407() {
    let challenged = Arc::new(AtomicBool::new(false));
    let responder: Responder = {
        let challenged = challenged.clone();
        Arc::new(move |request: &ParsedRequest| {
            if !request.has_proxy_auth() {
                challenged.store(true, Ordering::Relaxed);
                return json_response(407, "Proxy Authentication Required", "");
            }
            json_response(200, "OK", r#"{"errCode":21006}"#)
        })
    };
    let proxy = spawn_http_proxy(responder, None).await;
    let harness = Harness::start(http_mode_config(), &[proxy]);
    harness.upload_numbers(1, &["13000000002"]);

    harness.queue.submit(AtomicTask::fresh(43, 7, 0, vec![1]));
    assert_eq!(harness.wait_for_terminal(43).await, TaskStatus::Completed);

    assert!(challenged.load(Ordering::Relaxed), "407 must be exercised");
    assert_eq!(harness.sink_lines(43, "ok"), vec!["13000000002"]);
    let (processed, _, _) = harness.store.progress(43).unwrap();
    assert_eq!(processed, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_blocked_proxy_is_rotated_past() {
    // First endpoint redirects everything (IP ban), second one answers.
    let banned: Responder = Arc::new(|_| {
        "HTTP/1.1 302 Found\r\nlocation: /denied\r\ncontent-length: 0\r\n\r\n".to_string()
    });
    let proxy_a = spawn_http_proxy(banned, None).await;
    let proxy_b = spawn_http_proxy(qunar_responder(), None).await;
    let harness = Harness::start(http_mode_config(), &[proxy_a, proxy_b]);
    harness.upload_numbers(1, &["13000000002", "13000000003"]);

    harness.queue.submit(AtomicTask::fresh(44, 7, 0, vec![1]));
    assert_eq!(harness.wait_for_terminal(44).await, TaskStatus::Completed);

    assert_eq!(harness.sink_lines(44, "ok"), vec!["13000000002"]);
    assert_eq!(harness.sink_lines(44, "not_ok"), vec!["13000000003"]);
    let handle = harness.context.tasks.get(44).unwrap();
    assert_eq!(handle.counts(), (1, 1, 0));
    assert_eq!(handle.processed(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_stop_with_save_then_resume_completes() {
    let numbers: Vec<String> = (0..40).map(|i| format!("130000000{:02}", i)).collect();
    let number_refs: Vec<&str> = numbers.iter().map(String::as_str).collect();

    let proxy = spawn_http_proxy(qunar_responder(), Some(Duration::from_millis(60))).await;
    let harness = Harness::start(http_mode_config(), &[proxy]);
    harness.upload_numbers(1, &number_refs);

    harness.queue.submit(AtomicTask::fresh(45, 7, 0, vec![1]));

    // Let a few classifications land, then pull the plug with saving on.
    let handle = loop {
        if let Some(handle) = harness.context.tasks.get(45) {
            if handle.processed() >= 5 {
                break handle;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    handle.request_stop(true);

    assert_eq!(harness.wait_for_terminal(45).await, TaskStatus::Stopped);
    let processed_at_stop = handle.processed();
    assert!(processed_at_stop < 40, "stop landed before completion");

    // Checkpoint holds exactly the unclassified remainder.
    let stopped_rows = harness.store.stopped_tasks();
    assert_eq!(stopped_rows.len(), 1);
    let row = &stopped_rows[0];
    assert_eq!(row.processed, processed_at_stop);
    let checkpoint = PathBuf::from(&row.input_filename);
    assert!(checkpoint.starts_with(harness.dir.path().join("stopped_files")));
    let remaining = read_lines(&checkpoint);
    assert_eq!(remaining.len(), 40 - processed_at_stop as usize);

    // Resume from the persisted row and let it finish. The progress row
    // still says Stopped, so wait for Completed specifically.
    let mut resumed = row.clone();
    resumed.kind = TaskKind::Resumed;
    harness.queue.submit(resumed);
    for _ in 0..600 {
        if harness.store.progress(45).map(|(_, _, s)| s) == Some(TaskStatus::Completed) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(
        harness.store.progress(45).map(|(_, _, s)| s),
        Some(TaskStatus::Completed)
    );

    let (processed, _, _) = harness.store.progress(45).unwrap();
    assert_eq!(processed, 40);

    // Union of the sinks across both runs covers every number exactly once.
    let mut classified = harness.sink_lines(45, "ok");
    classified.extend(harness.sink_lines(45, "not_ok"));
    classified.sort();
    let mut expected = numbers.clone();
    expected.sort();
    assert_eq!(classified, expected);
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_pool_exhaustion_autostops_and_checkpoints() {
    let vendor = spawn_empty_vendor().await;
    let mut config = http_mode_config();
    config.proxy.target = format!("http://{}/extract", vendor);

    // No proxy file: the pool is empty and every refill comes back dry.
    let harness = Harness::start(config, &[]);
    harness.upload_numbers(1, &["13000000001", "13000000002"]);

    harness.queue.submit(AtomicTask::fresh(46, 7, 0, vec![1]));
    let status = harness.wait_for_terminal(46).await;
    assert_eq!(status, TaskStatus::AutoStopped);

    let (processed, ip_used, _) = harness.store.progress(46).unwrap();
    assert_eq!(processed, 0);
    assert_eq!(ip_used, 0);

    // Both numbers survive into the checkpoint for a later retry.
    let stopped_rows = harness.store.stopped_tasks();
    assert_eq!(stopped_rows.len(), 1);
    let remaining = read_lines(Path::new(&stopped_rows[0].input_filename));
    assert_eq!(remaining.len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_completion_with_dead_store_leaves_breadcrumb() {
    let proxy = spawn_http_proxy(qunar_responder(), None).await;
    let harness = Harness::start(http_mode_config(), &[proxy]);
    harness.upload_numbers(1, &["13000000002"]);
    harness.store.fail_progress_writes(true);

    harness.queue.submit(AtomicTask::fresh(47, 7, 0, vec![1]));

    let breadcrumb = harness.dir.path().join("erred_saving.txt");
    for _ in 0..600 {
        if breadcrumb.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let content = std::fs::read_to_string(&breadcrumb).expect("breadcrumb written");
    assert!(content.contains("ID: 47"));

    // Progress never landed, so the input must NOT have been deleted.
    let leftovers: Vec<_> = std::fs::read_dir(harness.dir.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with('.'))
        .collect();
    assert_eq!(leftovers.len(), 1, "input file is kept for recovery");
}

// ---- Worker-level SOCKS5 flow ----

/// Minimal plain-HTTP site for driving the worker through a real SOCKS5
/// handshake without a TLS stack on the mock side.
struct MockSite;

impl SiteAdapter for MockSite {
    fn alias(&self) -> &str {
        "mocksite"
    }

    fn host(&self) -> &str {
        "site.example"
    }

    fn scheme(&self) -> Scheme {
        Scheme::Http
    }

    fn prepare_request(&self, number: &str, ctx: &RequestContext) -> SiteRequest {
        let target = site::request_target(
            self.scheme(),
            self.host(),
            &format!("/check?number={}", number),
            ctx,
        );
        http::Request::builder()
            .method("GET")
            .uri(target)
            .header("host", self.host())
            .body(http_body_util::Full::new(bytes::Bytes::new()))
            .unwrap()
    }

    fn classify(&self, response: &SiteResponse) -> Verdict {
        if let Some(verdict) = site::classify_status(response.status) {
            return verdict;
        }
        match response.body.contains("\"exists\":true") {
            true => Verdict::classified(Outcome::Registered),
            false => Verdict::classified(Outcome::NotRegistered),
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn worker_probes_through_socks5_tunnel() {
    use numprobe::probe::{ProbeEvent, ProbeWorker};

    let responder: Responder = Arc::new(|request: &ParsedRequest| {
        let exists = request.request_line.contains("number=13000000001");
        let body = format!("{{\"exists\":{}}}", exists);
        json_response(200, "OK", &body)
    });
    let proxy = spawn_socks5_site(responder).await;

    let dir = tempfile::tempdir().unwrap();
    let pool_file = dir.path().join("socks5_proxy_servers.txt");
    std::fs::write(&pool_file, format!("{}\n", proxy)).unwrap();

    let config = Arc::new(numprobe::config::ProxyConfig {
        fetch_interval: 1,
        ..Default::default()
    });
    let pool = Arc::new(ProxyPool::new(
        PoolContext {
            config,
            fetcher: fetcher::spawn(1, CancellationToken::new()),
            bus: ShareBus::new(),
            registry: Arc::new(WorkerRegistry::new()),
        },
        9,
        pool_file,
    ));
    assert_eq!(pool.len(), 1);

    let input = dir.path().join("numbers.txt");
    std::fs::write(&input, "13000000001\n13000000002\n").unwrap();
    let numbers = Arc::new(NumberStream::open(&input).unwrap());

    let (events_tx, mut events_rx) = tokio::sync::mpsc::channel(8);
    let worker = ProbeWorker::new(
        pool.clone(),
        numbers,
        Arc::new(MockSite),
        numprobe::transport::tls::connector(false),
        ProxyProtocol::Socks5,
        0,
        None,
        CancellationToken::new(),
        events_tx,
    );
    tokio::spawn(worker.run());

    let mut registered = Vec::new();
    let mut not_registered = Vec::new();
    while let Some(event) = events_rx.recv().await {
        match event {
            ProbeEvent::Classified {
                number, outcome, ..
            } => match outcome {
                Outcome::Registered => registered.push(number),
                Outcome::NotRegistered => not_registered.push(number),
                other => panic!("unexpected outcome {:?}", other),
            },
            ProbeEvent::RequestStop => panic!("pool should not exhaust"),
        }
    }
    assert_eq!(registered, vec!["13000000001"]);
    assert_eq!(not_registered, vec!["13000000002"]);
}
