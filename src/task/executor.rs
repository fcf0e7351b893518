use crate::probe::{ProbeEvent, ProbeWorker};
use crate::proxy::{PoolContext, ProxyPool};
use crate::site::{Outcome, SiteAdapter};
use crate::task::stream::NumberStream;
use crate::task::types::{SinkPaths, TaskHandle, TaskStatus};
use crate::task::TaskContext;
use crate::transport::tls;
use base64::Engine;
use futures_util::StreamExt;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

/// The four output files of one task, opened append so a resumed task keeps
/// writing where it left off.
struct Sinks {
    ok: File,
    ok2: File,
    not_ok: File,
    unknown: File,
}

impl Sinks {
    fn open(paths: &SinkPaths) -> std::io::Result<Self> {
        Ok(Self {
            ok: open_sink(&paths.ok)?,
            ok2: open_sink(&paths.ok2)?,
            not_ok: open_sink(&paths.not_ok)?,
            unknown: open_sink(&paths.unknown)?,
        })
    }

    /// One line per classification, flushed immediately: a crash must not
    /// lose classified numbers that were already counted.
    fn record(
        &mut self,
        outcome: Outcome,
        number: &str,
        evidence: Option<&str>,
    ) -> std::io::Result<()> {
        let sink = match outcome {
            Outcome::NotRegistered => &mut self.ok,
            Outcome::Registered => &mut self.not_ok,
            Outcome::Unknown => &mut self.unknown,
            Outcome::RequestStop => return Ok(()),
        };
        writeln!(sink, "{}", number)?;
        sink.flush()?;
        if let Some(evidence) = evidence {
            writeln!(self.ok2, "{} {}", number, evidence)?;
            self.ok2.flush()?;
        }
        Ok(())
    }
}

fn open_sink(path: &std::path::Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new().create(true).append(true).open(path)
}

/// Executor for one task: owns the sinks and the progress counters, fans out
/// to N probe workers sharing one proxy pool and one number stream, and
/// reduces their classifications into files and store updates.
pub struct TaskExecutor {
    context: Arc<TaskContext>,
    handle: Arc<TaskHandle>,
    adapter: Arc<dyn SiteAdapter>,
    numbers: Arc<NumberStream>,
    input_path: PathBuf,
}

impl TaskExecutor {
    pub fn new(
        context: Arc<TaskContext>,
        handle: Arc<TaskHandle>,
        adapter: Arc<dyn SiteAdapter>,
        numbers: Arc<NumberStream>,
        input_path: PathBuf,
    ) -> Self {
        Self {
            context,
            handle,
            adapter,
            numbers,
            input_path,
        }
    }

    pub async fn run(&self) -> TaskStatus {
        let mut sinks = match self.open_output_files() {
            Ok(sinks) => sinks,
            Err(e) => {
                tracing::error!(
                    "executor: unable to open output files, task_id={}, error={}",
                    self.handle.task_id,
                    e
                );
                let _ = std::fs::remove_file(&self.input_path);
                self.handle.set_status(TaskStatus::Erred);
                return TaskStatus::Erred;
            }
        };

        let paths = self.handle.sink_paths();
        if let Err(e) = self.context.store.set_task_files(
            self.handle.task_id,
            &self.input_path.to_string_lossy(),
            &paths.ok.to_string_lossy(),
            &paths.ok2.to_string_lossy(),
            &paths.not_ok.to_string_lossy(),
            &paths.unknown.to_string_lossy(),
        ) {
            tracing::error!(
                "executor: could not record task files, task_id={}, error={}",
                self.handle.task_id,
                e
            );
            self.handle.set_status(TaskStatus::Erred);
            return TaskStatus::Erred;
        }

        let proxy_config = Arc::new(self.context.config.proxy.clone());
        let pool = Arc::new(ProxyPool::new(
            PoolContext {
                config: proxy_config.clone(),
                fetcher: self.context.fetcher.clone(),
                bus: self.context.bus.clone(),
                registry: self.context.worker_registry.clone(),
            },
            self.handle.website_id,
            self.context
                .work_dir
                .join(ProxyPool::default_file(proxy_config.protocol)),
        ));
        pool.set_total_used(self.handle.ip_used());

        self.handle.set_status(TaskStatus::Ongoing);
        let cancel = self.handle.cancel_token();

        // Sibling pools publish refilled batches; merge them while we run.
        if proxy_config.share {
            let pool = pool.clone();
            let mut share_rx = self.context.bus.subscribe();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        message = share_rx.recv() => match message {
                            Ok(message) => {
                                let merged = pool.add_more(&message);
                                if merged > 0 {
                                    tracing::debug!("executor: merged {} shared proxies", merged);
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(_) => break,
                        },
                        _ = cancel.cancelled() => break,
                    }
                }
            });
        }

        let socket_count = self.context.config.proxy.socket_count.max(1) as usize;
        let (events_tx, mut events_rx) = mpsc::channel::<ProbeEvent>(socket_count * 2);
        let tls = tls::connector(self.context.config.proxy.tls_verify);
        let account_auth = account_basic_auth(&self.context.config.proxy);

        let mut worker_pool = Vec::with_capacity(socket_count);
        for _ in 0..socket_count {
            worker_pool.push(ProbeWorker::new(
                pool.clone(),
                self.numbers.clone(),
                self.adapter.clone(),
                tls.clone(),
                proxy_config.protocol,
                self.handle.scans_per_ip,
                account_auth.clone(),
                cancel.clone(),
                events_tx.clone(),
            ));
        }
        drop(events_tx);

        // All of a task's connection state machines share this future; the
        // reducer runs alongside them so sink writes and counters stay on
        // the executor.
        let drive_workers = futures_util::stream::iter(worker_pool)
            .for_each_concurrent(socket_count, |worker| worker.run());

        let progress_every = (socket_count as u32).max(25);
        let reduce_events = async {
            while let Some(event) = events_rx.recv().await {
                match event {
                    ProbeEvent::Classified {
                        number,
                        outcome,
                        evidence,
                    } => {
                        let processed = self.handle.record(outcome);
                        if let Err(e) = sinks.record(outcome, &number, evidence.as_deref()) {
                            tracing::error!(
                                "executor: sink write failed, task_id={}, error={}",
                                self.handle.task_id,
                                e
                            );
                            self.handle.set_status(TaskStatus::Erred);
                            self.handle.force_stop();
                            continue;
                        }
                        if processed % progress_every == 0 {
                            if let Err(e) = self.context.store.update_progress(
                                self.handle.task_id,
                                processed,
                                pool.total_used(),
                                TaskStatus::Ongoing,
                            ) {
                                tracing::error!(
                                    "executor: progress write failed, task_id={}, error={}",
                                    self.handle.task_id,
                                    e
                                );
                            }
                        }
                        // Runaway guard: more classifications than numbers
                        // means something upstream is broken.
                        if processed > self.handle.total() + 10 {
                            tracing::error!(
                                "executor: processed overran total, task_id={}, processed={}, total={}",
                                self.handle.task_id,
                                processed,
                                self.handle.total()
                            );
                            self.handle.set_status(TaskStatus::AutoStopped);
                            self.handle.force_stop();
                        }
                    }
                    ProbeEvent::RequestStop => {
                        if self.handle.status() == TaskStatus::Ongoing {
                            self.handle.set_status(TaskStatus::AutoStopped);
                        }
                        self.handle.force_stop();
                    }
                }
            }
        };
        tokio::join!(drive_workers, reduce_events);

        // Ends the share-merge task for tasks that ran to natural completion.
        cancel.cancel();

        self.handle.set_ip_used(pool.total_used());

        let status = match self.handle.status() {
            TaskStatus::Ongoing => {
                if self.numbers.is_empty() && !self.handle.is_stopped() {
                    TaskStatus::Completed
                } else {
                    // Workers bailed with numbers left; park the task so it
                    // can be resumed.
                    self.handle.force_stop();
                    TaskStatus::Stopped
                }
            }
            status => status,
        };
        self.handle.set_status(status);
        status
    }

    /// Open the four sinks, assigning fresh dated paths when the task does
    /// not carry any (`./over/<alias>/<kind>/<yyyy_mm_dd>/<HH_MM_SS>.txt`).
    fn open_output_files(&self) -> std::io::Result<Sinks> {
        let mut paths = self.handle.sink_paths();
        if !paths.is_assigned() {
            let now = chrono::Local::now();
            let date = now.format("%Y_%m_%d").to_string();
            let file = format!("{}.txt", now.format("%H_%M_%S"));
            let base = self
                .context
                .work_dir
                .join("over")
                .join(self.adapter.alias());
            paths = SinkPaths {
                ok: base.join("ok").join(&date).join(&file),
                ok2: base.join("ok2").join(&date).join(&file),
                not_ok: base.join("not_ok").join(&date).join(&file),
                unknown: base.join("unknown").join(&date).join(&file),
            };
            self.handle.set_sink_paths(paths.clone());
        }
        Sinks::open(&paths)
    }
}

fn account_basic_auth(config: &crate::config::ProxyConfig) -> Option<String> {
    if config.username.is_empty() {
        return None;
    }
    let token = base64::engine::general_purpose::STANDARD
        .encode(format!("{}:{}", config.username, config.password));
    Some(format!("Basic {}", token))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sinks_route_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let paths = SinkPaths {
            ok: dir.path().join("ok/f.txt"),
            ok2: dir.path().join("ok2/f.txt"),
            not_ok: dir.path().join("not_ok/f.txt"),
            unknown: dir.path().join("unknown/f.txt"),
        };
        let mut sinks = Sinks::open(&paths).unwrap();
        sinks
            .record(Outcome::NotRegistered, "1", Some("usable"))
            .unwrap();
        sinks.record(Outcome::Registered, "2", None).unwrap();
        sinks.record(Outcome::Unknown, "3", None).unwrap();
        sinks.record(Outcome::RequestStop, "4", None).unwrap();

        assert_eq!(std::fs::read_to_string(&paths.ok).unwrap(), "1\n");
        assert_eq!(std::fs::read_to_string(&paths.ok2).unwrap(), "1 usable\n");
        assert_eq!(std::fs::read_to_string(&paths.not_ok).unwrap(), "2\n");
        assert_eq!(std::fs::read_to_string(&paths.unknown).unwrap(), "3\n");
    }

    #[test]
    fn test_sinks_append_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let paths = SinkPaths {
            ok: dir.path().join("ok.txt"),
            ok2: dir.path().join("ok2.txt"),
            not_ok: dir.path().join("not_ok.txt"),
            unknown: dir.path().join("unknown.txt"),
        };
        {
            let mut sinks = Sinks::open(&paths).unwrap();
            sinks.record(Outcome::NotRegistered, "1", None).unwrap();
        }
        let mut sinks = Sinks::open(&paths).unwrap();
        sinks.record(Outcome::NotRegistered, "2", None).unwrap();
        assert_eq!(std::fs::read_to_string(&paths.ok).unwrap(), "1\n2\n");
    }

    #[test]
    fn test_account_auth_requires_username() {
        let mut config = crate::config::ProxyConfig::default();
        assert!(account_basic_auth(&config).is_none());
        config.username = "acct".to_string();
        config.password = "secret".to_string();
        assert_eq!(
            account_basic_auth(&config).unwrap(),
            "Basic YWNjdDpzZWNyZXQ="
        );
    }
}
