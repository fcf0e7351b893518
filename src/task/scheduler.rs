use crate::db::UploadRecord;
use crate::error::ProbeError;
use crate::site::{self, SiteAdapter};
use crate::task::executor::TaskExecutor;
use crate::task::stream::{count_valid_numbers, NumberStream};
use crate::task::types::{AtomicTask, TaskHandle, TaskKind, TaskStatus};
use crate::task::TaskContext;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Producer side of the scheduler's FIFO. The control plane clones this and
/// submits atomic tasks; the scheduler loop consumes them one at a time.
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<AtomicTask>,
}

impl TaskQueue {
    pub fn submit(&self, task: AtomicTask) -> bool {
        self.tx.send(task).is_ok()
    }
}

/// Single-threaded task scheduler: dequeues atomic tasks, materializes their
/// inputs, runs one executor at a time, and persists the terminal state.
pub struct TaskScheduler {
    context: Arc<TaskContext>,
    rx: mpsc::UnboundedReceiver<AtomicTask>,
    shutdown: CancellationToken,
}

struct Dispatched {
    handle: Arc<TaskHandle>,
    adapter: Arc<dyn SiteAdapter>,
    numbers: Arc<NumberStream>,
    input_path: PathBuf,
}

impl TaskScheduler {
    pub fn new(context: Arc<TaskContext>, shutdown: CancellationToken) -> (TaskQueue, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            TaskQueue { tx },
            Self {
                context,
                rx,
                shutdown,
            },
        )
    }

    pub async fn run(mut self) {
        loop {
            let task = tokio::select! {
                task = self.rx.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
                _ = self.shutdown.cancelled() => break,
            };
            self.execute(task).await;
        }
        tracing::info!("scheduler: shut down");
    }

    async fn execute(&self, mut task: AtomicTask) {
        tracing::info!(
            "scheduler: task dequeued, task_id={}, website_id={}",
            task.task_id,
            task.website_id
        );
        let dispatched = match self.dispatch(&mut task) {
            Ok(dispatched) => dispatched,
            Err(e) => {
                tracing::error!(
                    "scheduler: dispatch failed, task_id={}, error={}",
                    task.task_id,
                    e
                );
                self.on_dispatch_failure(&task);
                return;
            }
        };

        let _ = self.context.store.update_progress(
            task.task_id,
            task.processed,
            task.ip_used,
            TaskStatus::Ongoing,
        );

        let executor = TaskExecutor::new(
            self.context.clone(),
            dispatched.handle.clone(),
            dispatched.adapter.clone(),
            dispatched.numbers.clone(),
            dispatched.input_path.clone(),
        );
        let status = executor.run().await;
        tracing::info!(
            "scheduler: task finished, task_id={}, status={:?}, processed={}",
            task.task_id,
            status,
            dispatched.handle.processed()
        );

        metrics::counter!("numprobe_tasks_total", "status" => format!("{:?}", status))
            .increment(1);
        match status {
            TaskStatus::Stopped | TaskStatus::AutoStopped => self.on_stopped(&task, &dispatched),
            TaskStatus::Completed => self.on_completed(&dispatched),
            TaskStatus::Erred => self.on_erred(&task, &dispatched),
            _ => {}
        }
        dispatched.numbers.close();
    }

    // ---- Dispatch ----

    fn dispatch(&self, task: &mut AtomicTask) -> Result<Dispatched, ProbeError> {
        match task.kind {
            TaskKind::Fresh => self.dispatch_fresh(task),
            _ if task.is_free_resume() => self.dispatch_free_resume(task),
            _ => self.dispatch_resumed(task),
        }
    }

    /// Fresh task: concatenate the referenced uploads into a private input
    /// file and start with zeroed counters.
    fn dispatch_fresh(&self, task: &mut AtomicTask) -> Result<Dispatched, ProbeError> {
        let adapter = self.resolve_website(task)?;
        let uploads = self.context.store.uploads(&task.number_ids)?;
        if uploads.is_empty() {
            return Err(ProbeError::Store("no uploads for task".to_string()));
        }

        let input_path = self
            .context
            .work_dir
            .join(format!(".{}.txt", random_string()));
        concat_uploads(&uploads, &input_path)?;

        let total = count_valid_numbers(&input_path).map_err(ProbeError::Sink)?;
        if total == 0 {
            let _ = std::fs::remove_file(&input_path);
            return Err(ProbeError::Store("input contains no numbers".to_string()));
        }

        let handle = Arc::new(TaskHandle::new(
            task.task_id,
            task.website_id,
            task.scans_per_ip,
        ));
        handle.set_total(total);
        task.total = total;
        self.context.tasks.insert(handle.clone());

        let numbers = Arc::new(NumberStream::open(&input_path).map_err(ProbeError::Sink)?);
        Ok(Dispatched {
            handle,
            adapter,
            numbers,
            input_path,
        })
    }

    /// Resumed task with a checkpoint file: open it as the input directly.
    fn dispatch_resumed(&self, task: &mut AtomicTask) -> Result<Dispatched, ProbeError> {
        let adapter = self.resolve_website(task)?;
        let input_path = PathBuf::from(&task.input_filename);
        if !input_path.exists() {
            return Err(ProbeError::Store(format!(
                "checkpoint file is gone: {}",
                input_path.display()
            )));
        }

        let handle = self.rebuild_handle(task);
        if handle.total() == 0 {
            let total = if task.total > 0 {
                task.total
            } else {
                count_valid_numbers(&input_path).map_err(ProbeError::Sink)?
            };
            if total == 0 {
                return Err(ProbeError::Store("resumed task has no numbers".to_string()));
            }
            handle.set_total(total);
        }
        self.context.tasks.insert(handle.clone());

        let numbers = Arc::new(NumberStream::open(&input_path).map_err(ProbeError::Sink)?);
        Ok(Dispatched {
            handle,
            adapter,
            numbers,
            input_path,
        })
    }

    /// Resumed task that never checkpointed (`{free}` marker): rebuild the
    /// input from upload ids like a fresh task, but keep any counters the
    /// registry still holds for it.
    fn dispatch_free_resume(&self, task: &mut AtomicTask) -> Result<Dispatched, ProbeError> {
        let ids = parse_id_list(&task.input_filename);
        task.number_ids = ids;
        task.input_filename.clear();
        task.ok_filename.clear();
        task.ok2_filename.clear();
        task.not_ok_filename.clear();
        task.unknown_filename.clear();

        let previous = self.context.tasks.get(task.task_id);
        let mut dispatched = self.dispatch_fresh(task)?;
        if let Some(previous) = previous {
            dispatched.handle.adopt_counters(&previous);
            self.context.tasks.insert(dispatched.handle.clone());
        }
        Ok(dispatched)
    }

    fn resolve_website(&self, task: &mut AtomicTask) -> Result<Arc<dyn SiteAdapter>, ProbeError> {
        let website = self
            .context
            .store
            .website(task.website_id)?
            .ok_or_else(|| ProbeError::Store(format!("no such website: {}", task.website_id)))?;
        task.website_address = website.address.clone();
        site::adapter_for(&website.address).ok_or_else(|| {
            ProbeError::Store(format!("unsupported website: {}", website.address))
        })
    }

    /// A task resumed in the same process reuses its registry counters; the
    /// cancellation token is always fresh.
    fn rebuild_handle(&self, task: &AtomicTask) -> Arc<TaskHandle> {
        let handle = Arc::new(TaskHandle::resumed(task));
        if let Some(previous) = self.context.tasks.get(task.task_id) {
            handle.adopt_counters(&previous);
        }
        handle
    }

    // ---- Terminal persistence ----

    fn on_stopped(&self, task: &AtomicTask, dispatched: &Dispatched) {
        let handle = &dispatched.handle;
        if handle.saving_state() {
            self.checkpoint(task, dispatched);
        }
        // The status row lands last so a resumed-task query never races a
        // half-written checkpoint.
        let _ = self.context.store.update_progress(
            handle.task_id,
            handle.processed(),
            handle.ip_used(),
            handle.status(),
        );
    }

    fn checkpoint(&self, task: &AtomicTask, dispatched: &Dispatched) {
        let handle = &dispatched.handle;
        let remaining = dispatched.numbers.drain_remaining();
        let checkpoint = match self.unique_checkpoint_path() {
            Ok(path) => path,
            Err(e) => {
                tracing::error!(
                    "scheduler: cannot allocate checkpoint, task_id={}, error={}",
                    handle.task_id,
                    e
                );
                return;
            }
        };
        if let Err(e) = write_lines(&checkpoint, &remaining) {
            tracing::error!(
                "scheduler: checkpoint write failed, task_id={}, error={}",
                handle.task_id,
                e
            );
            let _ = std::fs::remove_file(&checkpoint);
            return;
        }

        let row = self.stopped_row(task, handle, &checkpoint);
        if self.context.store.save_stopped_task(&row).is_ok() {
            let _ = std::fs::remove_file(&dispatched.input_path);
            tracing::info!(
                "scheduler: saved task to persistent storage, task_id={}, remaining={}",
                handle.task_id,
                remaining.len()
            );
        } else {
            let _ = std::fs::remove_file(&checkpoint);
            tracing::error!(
                "scheduler: unable to save stopped task, task_id={}",
                handle.task_id
            );
        }
    }

    fn on_completed(&self, dispatched: &Dispatched) {
        let handle = &dispatched.handle;
        let recorded = self
            .context
            .store
            .update_progress(
                handle.task_id,
                handle.total(),
                handle.ip_used(),
                TaskStatus::Completed,
            )
            .is_ok();
        if recorded {
            let _ = std::fs::remove_file(&dispatched.input_path);
            tracing::info!("scheduler: task completed, task_id={}", handle.task_id);
            return;
        }

        // The store refused the final write: dump whatever is left where an
        // operator can find it, and leave a breadcrumb per task.
        let remaining = dispatched.numbers.drain_remaining();
        let dump = self
            .context
            .work_dir
            .join(format!("{}.txt", random_string()));
        let _ = write_lines(&dump, &remaining);
        let paths = handle.sink_paths();
        let breadcrumb = format!(
            "ID: {}, OK: {}, OK2: {}, NOT_OK: {}, Unknown: {}, WEB_ID: {}, DUMP: {}\n\n",
            handle.task_id,
            paths.ok.display(),
            paths.ok2.display(),
            paths.not_ok.display(),
            paths.unknown.display(),
            handle.website_id,
            dump.display(),
        );
        let erred_saving = self.context.work_dir.join("erred_saving.txt");
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&erred_saving)
            .and_then(|mut file| file.write_all(breadcrumb.as_bytes()));
        if let Err(e) = result {
            tracing::error!(
                "scheduler: unable to record completion failure, task_id={}, error={}",
                handle.task_id,
                e
            );
        }
    }

    fn on_erred(&self, task: &AtomicTask, dispatched: &Dispatched) {
        let handle = &dispatched.handle;
        let row = self.stopped_row(task, handle, &dispatched.input_path);
        let _ = self.context.store.save_erred_task(&row);
        let _ = self.context.store.update_progress(
            handle.task_id,
            handle.processed(),
            handle.ip_used(),
            TaskStatus::Erred,
        );
    }

    fn on_dispatch_failure(&self, task: &AtomicTask) {
        if task.kind != TaskKind::Fresh {
            let _ = self.context.store.save_stopped_task(task);
        }
        let _ = self.context.store.update_progress(
            task.task_id,
            task.processed,
            task.ip_used,
            TaskStatus::Erred,
        );
    }

    fn stopped_row(&self, task: &AtomicTask, handle: &TaskHandle, input: &Path) -> AtomicTask {
        let (ok, not_ok, unknown) = handle.counts();
        let paths = handle.sink_paths();
        AtomicTask {
            kind: TaskKind::Resumed,
            task_id: handle.task_id,
            website_id: handle.website_id,
            scans_per_ip: handle.scans_per_ip,
            ip_used: handle.ip_used(),
            processed: handle.processed(),
            total: handle.total(),
            ok_count: ok,
            not_ok_count: not_ok,
            unknown_count: unknown,
            input_filename: input.to_string_lossy().into_owned(),
            ok_filename: paths.ok.to_string_lossy().into_owned(),
            ok2_filename: paths.ok2.to_string_lossy().into_owned(),
            not_ok_filename: paths.not_ok.to_string_lossy().into_owned(),
            unknown_filename: paths.unknown.to_string_lossy().into_owned(),
            website_address: task.website_address.clone(),
            number_ids: Vec::new(),
        }
    }

    fn unique_checkpoint_path(&self) -> std::io::Result<PathBuf> {
        let dir = self.context.work_dir.join("stopped_files");
        std::fs::create_dir_all(&dir)?;
        loop {
            let candidate = dir.join(format!("{}.txt", random_string()));
            if !candidate.exists() {
                return Ok(candidate);
            }
        }
    }
}

fn random_string() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}

fn parse_id_list(raw: &str) -> Vec<u32> {
    raw.split(',')
        .filter_map(|part| part.trim().parse::<u32>().ok())
        .collect()
}

fn concat_uploads(uploads: &[UploadRecord], dest: &Path) -> Result<(), ProbeError> {
    let mut out = std::fs::File::create(dest).map_err(ProbeError::Sink)?;
    for upload in uploads {
        match std::fs::read(&upload.name_on_disk) {
            Ok(content) => {
                out.write_all(&content).map_err(ProbeError::Sink)?;
                if !content.ends_with(b"\n") {
                    out.write_all(b"\n").map_err(ProbeError::Sink)?;
                }
            }
            Err(e) => {
                tracing::warn!(
                    "scheduler: skipping unreadable upload, id={}, error={}",
                    upload.id,
                    e
                );
            }
        }
    }
    Ok(())
}

/// Checkpoint format: one number per line, unread tail first, retries after.
fn write_lines(path: &Path, lines: &[String]) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    for line in lines {
        if !line.is_empty() {
            writeln!(file, "{}", line)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_id_list() {
        assert_eq!(parse_id_list("1, 2,3"), vec![1, 2, 3]);
        assert_eq!(parse_id_list("7"), vec![7]);
        assert!(parse_id_list("a,b").is_empty());
    }

    #[test]
    fn test_concat_uploads_joins_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, "13000000001\n13000000002").unwrap();
        std::fs::write(&b, "13000000003\n").unwrap();

        let dest = dir.path().join("input.txt");
        let uploads = vec![
            UploadRecord {
                id: 1,
                name_on_disk: a,
            },
            UploadRecord {
                id: 2,
                name_on_disk: b,
            },
            UploadRecord {
                id: 3,
                name_on_disk: dir.path().join("missing.txt"),
            },
        ];
        concat_uploads(&uploads, &dest).unwrap();
        let content = std::fs::read_to_string(&dest).unwrap();
        assert_eq!(content, "13000000001\n13000000002\n13000000003\n");
    }

    #[test]
    fn test_write_lines_skips_empties() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.txt");
        write_lines(
            &path,
            &["1".to_string(), String::new(), "2".to_string()],
        )
        .unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1\n2\n");
    }

    #[test]
    fn test_random_string_shape() {
        let name = random_string();
        assert_eq!(name.len(), 12);
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
