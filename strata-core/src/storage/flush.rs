//! Background flush of frozen memtables

use super::partition::{TimePartition, WorkingFile};
use crate::memtable::MemTable;
use crate::resource::TsFileResource;
use crate::tsfile::{TsFileConfig, TsFileSummary, TsFileWriter};
use crate::{Result, StrataError};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error};

type FlushResult = Result<Option<Arc<TsFileResource>>>;

/// Called after every successful flush
pub type FlushListener = Arc<dyn Fn(&Arc<TimePartition>) + Send + Sync>;

/// Write every non-empty series of `memtable` to a new file at `path`
pub(crate) fn write_memtable(
    path: &Path,
    memtable: &MemTable,
    config: &TsFileConfig,
) -> Result<TsFileSummary> {
    let mut writer = TsFileWriter::create(path, config.clone())?;
    for series in memtable.series_keys() {
        let Some(chunk) = memtable.chunk(&series) else {
            continue;
        };
        let list = chunk.sorted_list_for_flush();
        if list.is_empty() {
            continue;
        }
        writer.write_series(&series, chunk.data_type(), list.to_pairs())?;
    }
    writer.finish()
}

struct FlushJob {
    partition: Arc<TimePartition>,
    file: WorkingFile,
    done: Sender<FlushResult>,
}

enum FlushMessage {
    Flush(FlushJob),
    Close,
}

/// Pending flushes; `wait` returns the sealed files
#[derive(Default)]
pub struct FlushHandle {
    receivers: Vec<Receiver<FlushResult>>,
}

impl FlushHandle {
    pub fn len(&self) -> usize {
        self.receivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receivers.is_empty()
    }

    pub fn merge(&mut self, other: FlushHandle) {
        self.receivers.extend(other.receivers);
    }

    /// Block until every flush finished; the first failure is returned
    pub fn wait(self) -> Result<Vec<Arc<TsFileResource>>> {
        let mut sealed = Vec::with_capacity(self.receivers.len());
        let mut first_error = None;
        for receiver in self.receivers {
            match receiver.recv() {
                Ok(Ok(Some(resource))) => sealed.push(resource),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    first_error.get_or_insert(StrataError::Internal(
                        "flush worker exited".into(),
                    ));
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(sealed),
        }
    }
}

/// Fixed pool of flush workers
pub struct FlushManager {
    sender: Mutex<Option<Sender<FlushMessage>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
    listener: Option<FlushListener>,
}

impl FlushManager {
    pub fn new(thread_count: usize, listener: Option<FlushListener>) -> Result<Self> {
        let thread_count = thread_count.max(1);
        let (sender, receiver) = unbounded::<FlushMessage>();
        let pending = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(thread_count);
        for worker_id in 0..thread_count {
            let receiver = receiver.clone();
            let pending = Arc::clone(&pending);
            let listener = listener.clone();
            let handle = std::thread::Builder::new()
                .name(format!("strata-flush-{}", worker_id))
                .spawn(move || {
                    while let Ok(message) = receiver.recv() {
                        let job = match message {
                            FlushMessage::Flush(job) => job,
                            FlushMessage::Close => break,
                        };
                        run_job(job, listener.as_ref());
                        pending.fetch_sub(1, Ordering::AcqRel);
                    }
                    debug!("Flush worker #{} closed", worker_id);
                })?;
            workers.push(handle);
        }

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            pending,
            listener,
        })
    }

    /// Flushes queued or running
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Queue a frozen file; after shutdown it is flushed on the caller's thread
    pub(crate) fn submit(&self, partition: Arc<TimePartition>, file: WorkingFile) -> FlushHandle {
        let (done, receiver) = bounded(1);
        let job = FlushJob {
            partition,
            file,
            done,
        };

        let job = {
            let sender = self.sender.lock();
            match sender.as_ref() {
                Some(sender) => {
                    self.pending.fetch_add(1, Ordering::AcqRel);
                    match sender.send(FlushMessage::Flush(job)) {
                        Ok(()) => None,
                        Err(err) => {
                            self.pending.fetch_sub(1, Ordering::AcqRel);
                            match err.into_inner() {
                                FlushMessage::Flush(job) => Some(job),
                                FlushMessage::Close => None,
                            }
                        }
                    }
                }
                None => Some(job),
            }
        };
        if let Some(job) = job {
            run_job(job, self.listener.as_ref());
        }

        FlushHandle {
            receivers: vec![receiver],
        }
    }

    /// Finish queued flushes and stop the workers
    pub fn shutdown(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        if let Some(sender) = self.sender.lock().take() {
            for _ in &workers {
                let _ = sender.send(FlushMessage::Close);
            }
        }
        for handle in workers {
            if handle.join().is_err() {
                error!("Flush worker panicked");
            }
        }
    }
}

impl Drop for FlushManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_job(job: FlushJob, listener: Option<&FlushListener>) {
    let FlushJob {
        partition,
        file,
        done,
    } = job;
    let result = partition.flush_file(file);
    match &result {
        Ok(_) => {
            if let Some(listener) = listener {
                listener(&partition);
            }
        }
        Err(e) => error!("Flush on {} failed: {}", partition.key(), e),
    }
    // nobody may be waiting
    let _ = done.send(result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageConfig;
    use crate::{SeriesKey, TsValue};
    use tempfile::tempdir;

    fn partition(dir: &Path) -> Arc<TimePartition> {
        let config = Arc::new(StorageConfig {
            data_dir: dir.to_path_buf(),
            ..Default::default()
        });
        Arc::new(TimePartition::open("root.sg", 0, dir, config).unwrap())
    }

    #[test]
    fn test_flush_seals_files_and_notifies() {
        let dir = tempdir().unwrap();
        let partition = partition(dir.path());
        let key = SeriesKey::new("root.sg.d1", "s1");
        for t in (0..100).rev() {
            partition.insert(&key, t, TsValue::Int64(t)).unwrap();
        }

        let notified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notified);
        let listener: FlushListener = Arc::new(move |_: &Arc<TimePartition>| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let manager = FlushManager::new(2, Some(listener)).unwrap();

        let mut handle = FlushHandle::default();
        for file in partition.freeze() {
            handle.merge(manager.submit(Arc::clone(&partition), file));
        }
        let sealed = handle.wait().unwrap();

        assert_eq!(sealed.len(), 1);
        assert!(sealed[0].is_closed());
        assert_eq!(sealed[0].time_range("root.sg.d1").map(|r| (r.start, r.end)), Some((0, 99)));
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_submit_after_shutdown_flushes_inline() {
        let dir = tempdir().unwrap();
        let partition = partition(dir.path());
        partition
            .insert(&SeriesKey::new("root.sg.d1", "s1"), 1, TsValue::Double(1.0))
            .unwrap();

        let manager = FlushManager::new(1, None).unwrap();
        manager.shutdown();
        let mut handle = FlushHandle::default();
        for file in partition.freeze() {
            handle.merge(manager.submit(Arc::clone(&partition), file));
        }
        assert_eq!(handle.wait().unwrap().len(), 1);
    }
}
