use crate::config::ProxyProtocol;
use crate::proxy::endpoint::ProxyServer;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Publication from one pool to its siblings after a successful refill.
///
/// `shared_web_ids` is mutated by receivers: a pool that merges the batch adds
/// its own website id so the same batch is not merged twice when several pools
/// probe the same site.
#[derive(Clone)]
pub struct ShareMessage {
    pub source_worker: u64,
    pub source_web_id: u32,
    pub protocol: ProxyProtocol,
    pub shared_web_ids: Arc<Mutex<HashSet<u32>>>,
    pub endpoints: Arc<Vec<ProxyServer>>,
}

impl ShareMessage {
    /// Atomically claim this batch for `web_id`. Returns false when another
    /// pool probing the same site already merged it.
    pub fn claim(&self, web_id: u32) -> bool {
        self.shared_web_ids
            .lock()
            .expect("share set poisoned")
            .insert(web_id)
    }
}

/// Broadcast channel connecting every live pool in the process.
#[derive(Clone)]
pub struct ShareBus {
    tx: broadcast::Sender<ShareMessage>,
}

impl Default for ShareBus {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }
}

impl ShareBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, message: ShareMessage) {
        // No receivers is fine: the publishing pool keeps its own copy.
        let _ = self.tx.send(message);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShareMessage> {
        self.tx.subscribe()
    }
}

#[derive(Debug, Default)]
pub struct WorkerProxyInfo {
    pub web_id: u32,
    pub proxy_count: u64,
}

/// Process-wide registry of live pools and how many endpoints each has been
/// handed. Entries are registered at pool construction and dropped with the
/// pool, so the map stays bounded by the number of concurrent tasks.
#[derive(Default)]
pub struct WorkerRegistry {
    next_key: AtomicU64,
    counts: DashMap<u64, WorkerProxyInfo>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, web_id: u32) -> u64 {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.counts.insert(
            key,
            WorkerProxyInfo {
                web_id,
                proxy_count: 0,
            },
        );
        key
    }

    pub fn deregister(&self, key: u64) {
        self.counts.remove(&key);
    }

    pub fn record_added(&self, key: u64, added: u64) {
        if let Some(mut entry) = self.counts.get_mut(&key) {
            entry.proxy_count += added;
        }
    }

    pub fn proxy_count(&self, key: u64) -> u64 {
        self.counts
            .get(&key)
            .map(|entry| entry.proxy_count)
            .unwrap_or(0)
    }
}
