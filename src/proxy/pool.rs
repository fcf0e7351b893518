use crate::config::{ProxyConfig, ProxyProtocol};
use crate::error::ProbeError;
use crate::proxy::endpoint::{Endpoint, EndpointHandle, EndpointState, ProxyServer};
use crate::proxy::fetcher::FetcherHandle;
use crate::proxy::share::{ShareBus, ShareMessage, WorkerRegistry};
use crate::proxy::vendor::{parse_count_response, split_proxy_lines, ExtractionStats};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Hard cap on endpoints held by one pool.
const MAX_CAPACITY: usize = 5_000;
/// Cap on endpoints restored from the persistence file.
const MAX_READ_ALLOWED: usize = 300;
/// A `Waiting` endpoint becomes selectable again after this long.
const WAIT_COOLDOWN: Duration = Duration::from_secs(600);
/// Empty refills are retried this many times before the pool gives up.
const REFILL_MAX_RETRIES: u32 = 5;
/// Upper bound on waiting for the fetch actor to answer one refill.
const REFILL_REPLY_BUDGET: Duration = Duration::from_secs(300);
/// Persisted endpoints older than this are discarded along with their file.
const STALE_FILE_AGE: Duration = Duration::from_secs(3600);

/// Shared collaborators handed to every pool in the process.
#[derive(Clone)]
pub struct PoolContext {
    pub config: Arc<ProxyConfig>,
    pub fetcher: FetcherHandle,
    pub bus: ShareBus,
    pub registry: Arc<WorkerRegistry>,
}

struct Slot {
    generation: u32,
    /// Number of in-flight workers holding this slot's handle.
    borrowed: u32,
    /// Pruned while borrowed: freed on last release instead.
    detached: bool,
    endpoint: Option<Endpoint>,
}

struct PoolInner {
    slots: Vec<Slot>,
    /// Round-robin order of live slot indices.
    order: Vec<u32>,
    free: Vec<u32>,
    cursor: usize,
    total_used: u64,
}

/// Per-task repository of proxy endpoints.
///
/// Endpoints live in a slot arena owned by the pool; workers hold
/// `EndpointHandle`s (index + generation) whose validity is re-checked on
/// every access, so pruning can never leave a worker pointing at a recycled
/// record. Selection is round-robin over `Active` entries; refills go through
/// the process-wide fetch actor; refilled batches are optionally published to
/// sibling pools.
pub struct ProxyPool {
    context: PoolContext,
    web_id: u32,
    worker_key: u64,
    file: PathBuf,
    confirm_count: bool,
    error_flag: AtomicBool,
    wait_cooldown_ms: AtomicU64,
    count_client: reqwest::Client,
    stats: Mutex<ExtractionStats>,
    inner: Mutex<PoolInner>,
}

impl ProxyPool {
    /// Default persistence file for a protocol, colocated with the binary.
    pub fn default_file(protocol: ProxyProtocol) -> PathBuf {
        match protocol {
            ProxyProtocol::Socks5 => PathBuf::from("./socks5_proxy_servers.txt"),
            ProxyProtocol::HttpHttps => PathBuf::from("./http_proxy_servers.txt"),
        }
    }

    pub fn new(context: PoolContext, web_id: u32, file: PathBuf) -> Self {
        let worker_key = context.registry.register(web_id);
        let confirm_count = !context.config.count_target.is_empty();
        let count_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .no_proxy()
            .build()
            .expect("failed to build count HTTP client");

        let pool = Self {
            context,
            web_id,
            worker_key,
            file,
            confirm_count,
            error_flag: AtomicBool::new(false),
            wait_cooldown_ms: AtomicU64::new(WAIT_COOLDOWN.as_millis() as u64),
            count_client,
            stats: Mutex::new(ExtractionStats::default()),
            inner: Mutex::new(PoolInner {
                slots: Vec::new(),
                order: Vec::new(),
                free: Vec::new(),
                cursor: 0,
                total_used: 0,
            }),
        };
        pool.load_proxy_file();
        pool
    }

    pub fn protocol(&self) -> ProxyProtocol {
        self.context.config.protocol
    }

    pub fn web_id(&self) -> u32 {
        self.web_id
    }

    pub fn has_error(&self) -> bool {
        self.error_flag.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.lock_inner().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cumulative endpoints handed to this pool, persisted as `ip_used`.
    pub fn total_used(&self) -> u64 {
        self.lock_inner().total_used
    }

    /// Restore the counter when resuming a checkpointed task.
    pub fn set_total_used(&self, value: u64) {
        self.lock_inner().total_used = value;
    }

    pub fn extraction_stats(&self) -> ExtractionStats {
        self.stats.lock().expect("stats poisoned").clone()
    }

    #[cfg(test)]
    pub fn set_wait_cooldown(&self, cooldown: Duration) {
        self.wait_cooldown_ms
            .store(cooldown.as_millis() as u64, Ordering::Relaxed);
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner.lock().expect("proxy pool poisoned")
    }

    // ---- Handle accessors ----

    fn with_endpoint<T>(
        &self,
        handle: EndpointHandle,
        f: impl FnOnce(&mut Endpoint) -> T,
    ) -> Option<T> {
        let mut inner = self.lock_inner();
        let slot = inner.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.endpoint.as_mut().map(f)
    }

    /// Address and credentials behind a handle, if it is still valid.
    pub fn server(&self, handle: EndpointHandle) -> Option<ProxyServer> {
        self.with_endpoint(handle, |ep| ep.server.clone())
    }

    /// Holder-side state transition. `Waiting` also stamps `last_used` so the
    /// cooldown clock starts now.
    pub fn mark(&self, handle: EndpointHandle, state: EndpointState) {
        self.with_endpoint(handle, |ep| {
            ep.state = state;
            if state == EndpointState::Waiting {
                ep.last_used = Instant::now();
            }
        });
    }

    pub fn state(&self, handle: EndpointHandle) -> Option<EndpointState> {
        self.with_endpoint(handle, |ep| ep.state)
    }

    /// Bump the per-endpoint scan counter; returns the new value.
    pub fn record_scan(&self, handle: EndpointHandle) -> Option<u32> {
        self.with_endpoint(handle, |ep| {
            ep.scanned_count += 1;
            ep.last_used = Instant::now();
            ep.scanned_count
        })
    }

    pub fn scanned_count(&self, handle: EndpointHandle) -> Option<u32> {
        self.with_endpoint(handle, |ep| ep.scanned_count)
    }

    /// Give a handle back. The slot is freed here if it was pruned while the
    /// worker still held it.
    pub fn release(&self, handle: EndpointHandle) {
        let mut inner = self.lock_inner();
        let Some(slot) = inner.slots.get_mut(handle.index as usize) else {
            return;
        };
        if slot.generation != handle.generation {
            return;
        }
        slot.borrowed = slot.borrowed.saturating_sub(1);
        if slot.detached && slot.borrowed == 0 {
            slot.endpoint = None;
            slot.detached = false;
            slot.generation = slot.generation.wrapping_add(1);
            inner.free.push(handle.index);
        }
    }

    // ---- Selection ----

    /// Round-robin pick of the next `Active` endpoint, promoting cooled-down
    /// `Waiting` entries and pruning dead ones when a full scan comes up dry.
    /// Returns `None` when only a refill can help.
    pub fn try_select(&self) -> Option<EndpointHandle> {
        let mut inner = self.lock_inner();

        if let Some(handle) = Self::scan_active(&mut inner) {
            return Some(handle);
        }
        inner.cursor = 0;
        if let Some(handle) = Self::scan_active(&mut inner) {
            return Some(handle);
        }

        // No Active endpoint anywhere: drop everything that can never come
        // back, then give cooled-down Waiting entries another run.
        Self::prune_dead(&mut inner);
        let cooldown = Duration::from_millis(self.wait_cooldown_ms.load(Ordering::Relaxed));
        let mut promoted: Option<usize> = None;
        for position in 0..inner.order.len() {
            let index = inner.order[position] as usize;
            let Some(endpoint) = inner.slots[index].endpoint.as_mut() else {
                continue;
            };
            if endpoint.state == EndpointState::Waiting && endpoint.last_used.elapsed() >= cooldown
            {
                endpoint.state = EndpointState::Active;
                if promoted.is_none() {
                    promoted = Some(position);
                }
            }
        }
        if let Some(position) = promoted {
            let index = inner.order[position];
            inner.cursor = position + 1;
            let slot = &mut inner.slots[index as usize];
            slot.borrowed += 1;
            return Some(EndpointHandle {
                index,
                generation: slot.generation,
            });
        }
        None
    }

    fn scan_active(inner: &mut PoolInner) -> Option<EndpointHandle> {
        while inner.cursor < inner.order.len() {
            let index = inner.order[inner.cursor];
            inner.cursor += 1;
            let slot = &mut inner.slots[index as usize];
            let is_active = slot
                .endpoint
                .as_ref()
                .map(|ep| ep.state == EndpointState::Active)
                .unwrap_or(false);
            if is_active {
                slot.borrowed += 1;
                return Some(EndpointHandle {
                    index,
                    generation: slot.generation,
                });
            }
        }
        None
    }

    /// Drop entries that are neither `Active` nor `Waiting`. Slots still
    /// borrowed by an in-flight worker are detached from the rotation and
    /// reclaimed on release.
    fn prune_dead(inner: &mut PoolInner) {
        let PoolInner {
            ref mut slots,
            ref mut order,
            ref mut free,
            ref mut cursor,
            ..
        } = *inner;
        let mut removed_before_cursor = 0usize;
        let mut position = 0usize;
        order.retain(|&index| {
            let slot = &mut slots[index as usize];
            let keep = slot
                .endpoint
                .as_ref()
                .map(|ep| matches!(ep.state, EndpointState::Active | EndpointState::Waiting))
                .unwrap_or(false);
            if !keep {
                if slot.borrowed == 0 {
                    slot.endpoint = None;
                    slot.generation = slot.generation.wrapping_add(1);
                    free.push(index);
                } else {
                    slot.detached = true;
                }
                if position < *cursor {
                    removed_before_cursor += 1;
                }
            }
            position += 1;
            keep
        });
        *cursor = cursor.saturating_sub(removed_before_cursor);
    }

    // ---- Refill ----

    /// Next usable endpoint, refilling from the vendor when the pool runs
    /// dry. Fails with `Exhausted` once refill retries are spent, or
    /// immediately when the vendor answer is garbage (`error_flag`).
    pub async fn next_endpoint(&self) -> Result<EndpointHandle, ProbeError> {
        if let Some(handle) = self.try_select() {
            return Ok(handle);
        }

        let interval = Duration::from_secs(self.context.config.fetch_interval.max(1));
        let mut attempt = 0u32;
        loop {
            match self.refill().await {
                Ok(added) => {
                    if added > 0 {
                        if let Some(handle) = self.try_select() {
                            return Ok(handle);
                        }
                    }
                }
                Err(e) => {
                    if self.has_error() {
                        tracing::error!("pool: refill aborted, web_id={}, error={}", self.web_id, e);
                        return Err(ProbeError::Exhausted);
                    }
                    tracing::warn!("pool: refill failed, web_id={}, error={}", self.web_id, e);
                }
            }
            attempt += 1;
            if attempt > REFILL_MAX_RETRIES {
                return Err(ProbeError::Exhausted);
            }
            tokio::time::sleep(interval).await;
            // A sibling pool may have shared endpoints while we slept.
            if let Some(handle) = self.try_select() {
                return Ok(handle);
            }
        }
    }

    async fn refill(&self) -> Result<usize, ProbeError> {
        if self.confirm_count {
            let stats = self.fetch_remain_count().await;
            let remaining = stats.remaining_extracts;
            *self.stats.lock().expect("stats poisoned") = stats;
            if remaining <= 0 {
                tracing::warn!(
                    "pool: vendor extraction quota exhausted, web_id={}",
                    self.web_id
                );
                return Ok(0);
            }
        }

        let fetch = self.context.fetcher.fetch(self.context.config.target.clone());
        let result = tokio::time::timeout(REFILL_REPLY_BUDGET, fetch)
            .await
            .map_err(|_| ProbeError::FetchFailed("refill result timed out".to_string()))??;

        if result.status != 200 {
            self.error_flag.store(true, Ordering::Relaxed);
            return Err(ProbeError::FetchFailed(format!(
                "vendor status {}",
                result.status
            )));
        }
        // A JSON payload on the extraction URL is the vendor's error channel.
        if result.body.contains('{') {
            self.error_flag.store(true, Ordering::Relaxed);
            return Err(ProbeError::FetchFailed(format!(
                "vendor error payload: {}",
                result.body.trim()
            )));
        }

        let lines = split_proxy_lines(&result.body);
        if lines.is_empty() {
            return Ok(0);
        }
        let mut servers = Vec::with_capacity(self.context.config.per_fetch as usize);
        for line in lines {
            match ProxyServer::parse(line) {
                Ok(server) => servers.push(server),
                Err(e) => {
                    self.error_flag.store(true, Ordering::Relaxed);
                    return Err(ProbeError::FetchFailed(format!("bad vendor record: {}", e)));
                }
            }
        }

        let added = servers.len();
        tracing::info!("pool: grabbed {} proxies, web_id={}", added, self.web_id);

        if self.context.config.share {
            let message = ShareMessage {
                source_worker: self.worker_key,
                source_web_id: self.web_id,
                protocol: self.protocol(),
                shared_web_ids: Arc::new(Mutex::new(HashSet::from([self.web_id]))),
                endpoints: Arc::new(servers.clone()),
            };
            self.context.bus.publish(message);
        }

        self.append_servers(servers);
        self.context
            .registry
            .record_added(self.worker_key, added as u64);
        {
            let mut inner = self.lock_inner();
            inner.total_used += added as u64;
        }
        self.save_proxy_file();
        metrics::counter!("numprobe_pool_refill_endpoints_total").increment(added as u64);
        metrics::gauge!("numprobe_pool_size", "web_id" => self.web_id.to_string())
            .set(self.len() as f64);
        Ok(added)
    }

    async fn fetch_remain_count(&self) -> ExtractionStats {
        let url = &self.context.config.count_target;
        let response = self
            .count_client
            .get(url)
            .header("user-agent", crate::site::random_user_agent())
            .send()
            .await;
        match response {
            Ok(response) if response.status().as_u16() == 200 => match response.text().await {
                Ok(body) => parse_count_response(&body),
                Err(e) => {
                    tracing::error!("pool: count body read failed, error={}", e);
                    ExtractionStats::default()
                }
            },
            Ok(response) => {
                tracing::error!("pool: count endpoint status {}", response.status());
                ExtractionStats::default()
            }
            Err(e) => {
                tracing::error!("pool: count endpoint unreachable, error={}", e);
                ExtractionStats::default()
            }
        }
    }

    // ---- Sharing ----

    /// Merge a sibling's refill batch. Rejected when it is our own, targets
    /// the same website, speaks another protocol, was already claimed for
    /// this website, or the pool is full.
    pub fn add_more(&self, message: &ShareMessage) -> usize {
        if message.source_worker == self.worker_key || message.source_web_id == self.web_id {
            return 0;
        }
        if message.protocol != self.protocol() {
            return 0;
        }
        if self.len() >= MAX_CAPACITY {
            return 0;
        }
        if !message.claim(self.web_id) {
            return 0;
        }
        let added = message.endpoints.len();
        self.append_servers(message.endpoints.as_ref().clone());
        self.context
            .registry
            .record_added(self.worker_key, added as u64);
        let mut inner = self.lock_inner();
        inner.total_used += added as u64;
        added
    }

    // ---- Arena maintenance ----

    fn append_servers(&self, servers: Vec<ProxyServer>) {
        let mut inner = self.lock_inner();
        if inner.order.len() >= MAX_CAPACITY {
            Self::trim_oldest(&mut inner, servers.len());
        }
        for server in servers {
            Self::push_endpoint(&mut inner, Endpoint::new(server));
        }
    }

    fn push_endpoint(inner: &mut PoolInner, endpoint: Endpoint) {
        let index = match inner.free.pop() {
            Some(index) => {
                let slot = &mut inner.slots[index as usize];
                slot.endpoint = Some(endpoint);
                slot.detached = false;
                index
            }
            None => {
                inner.slots.push(Slot {
                    generation: 0,
                    borrowed: 0,
                    detached: false,
                    endpoint: Some(endpoint),
                });
                (inner.slots.len() - 1) as u32
            }
        };
        inner.order.push(index);
    }

    fn trim_oldest(inner: &mut PoolInner, count: usize) {
        let count = count.min(inner.order.len());
        let removed: Vec<u32> = inner.order.drain(..count).collect();
        for index in removed {
            let slot = &mut inner.slots[index as usize];
            if slot.borrowed == 0 {
                slot.endpoint = None;
                slot.generation = slot.generation.wrapping_add(1);
                inner.free.push(index);
            } else {
                slot.detached = true;
            }
        }
        inner.cursor = inner.cursor.saturating_sub(count);
    }

    // ---- Persistence ----

    /// Restore endpoints persisted by a previous run. Files older than an
    /// hour are deleted: vendor leases are short and stale endpoints would
    /// only burn connect timeouts.
    fn load_proxy_file(&self) {
        if !self.file.exists() {
            return;
        }
        if is_stale(&self.file) {
            if let Err(e) = std::fs::remove_file(&self.file) {
                tracing::warn!("pool: failed to remove stale proxy file, error={}", e);
            }
            return;
        }
        let Ok(content) = std::fs::read_to_string(&self.file) else {
            return;
        };
        let mut inner = self.lock_inner();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(server) = ProxyServer::parse(line) else {
                tracing::warn!("pool: skipping bad persisted record: {:?}", line);
                continue;
            };
            if inner.order.len() >= MAX_READ_ALLOWED {
                Self::trim_oldest(&mut inner, 1);
            }
            Self::push_endpoint(&mut inner, Endpoint::new(server));
        }
        tracing::info!(
            "pool: loaded {} persisted proxies, web_id={}",
            inner.order.len(),
            self.web_id
        );
    }

    /// Append the pool's current endpoints to the persistence file, one
    /// record per line, deduplicated by address within this batch.
    fn save_proxy_file(&self) {
        use std::io::Write;

        let records: Vec<String> = {
            let inner = self.lock_inner();
            let mut seen = HashSet::new();
            inner
                .order
                .iter()
                .filter_map(|&index| inner.slots[index as usize].endpoint.as_ref())
                .filter(|ep| seen.insert(ep.server.addr))
                .map(|ep| ep.server.to_record())
                .collect()
        };
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file)
            .and_then(|mut file| {
                for record in &records {
                    writeln!(file, "{}", record)?;
                }
                Ok(())
            });
        if let Err(e) = result {
            tracing::error!("pool: failed to persist proxies, error={}", e);
        }
    }
}

impl Drop for ProxyPool {
    fn drop(&mut self) {
        self.context.registry.deregister(self.worker_key);
    }
}

fn is_stale(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    let Ok(modified) = metadata.modified() else {
        return false;
    };
    match modified.elapsed() {
        Ok(age) => age > STALE_FILE_AGE,
        Err(_) => false,
    }
}
