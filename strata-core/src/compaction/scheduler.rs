//! Compaction admission control and worker pool

use super::{
    CompactionConfig, CompactionKind, CompactionOutcome, CompactionPriority, CompactionStrategy,
    CompactionTask, PartitionHandle, PartitionKey,
};
use crate::resource::TsFileResource;
use crate::{Lane, Result, StrataError};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Number of finished tasks kept for inspection
const RECENT_RESULTS: usize = 32;

/// Completion report of one task
#[derive(Debug, Clone)]
pub struct CompactionResult {
    pub task_id: Uuid,
    pub kind: CompactionKind,
    pub partition: PartitionKey,
    pub outcome: std::result::Result<CompactionOutcome, String>,
    pub elapsed: Duration,
}

/// Counters of the task manager
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompactionStats {
    pub running: usize,
    pub compacting_partitions: usize,
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Shared {
    current_task_num: AtomicUsize,
    compacting: Mutex<HashSet<PartitionKey>>,
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    shutdown: AtomicBool,
    recent: Mutex<VecDeque<CompactionResult>>,
}

impl Shared {
    fn release(&self, key: &PartitionKey) {
        self.compacting.lock().remove(key);
    }
}

/// Exclusive claim on a partition, released on drop unless a task takes it over
pub struct PartitionPermit {
    key: Option<PartitionKey>,
    shared: Arc<Shared>,
}

impl PartitionPermit {
    pub fn key(&self) -> Option<&PartitionKey> {
        self.key.as_ref()
    }
}

impl Drop for PartitionPermit {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.shared.release(&key);
        }
    }
}

/// Runs exactly once per submitted task, however the task ends
struct TaskGuard {
    key: PartitionKey,
    sources: Vec<Arc<TsFileResource>>,
    shared: Arc<Shared>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        for source in &self.sources {
            if !source.is_deleted() {
                source.set_merging(false);
            }
        }
        self.shared.current_task_num.fetch_sub(1, Ordering::AcqRel);
        self.shared.release(&self.key);
        debug!("Released compaction claim on {}", self.key);
    }
}

enum WorkerMessage {
    Run(Box<CompactionTask>, TaskGuard),
    Close,
}

/// Fixed pool of compaction workers plus partition-level admission state
pub struct CompactionTaskManager {
    shared: Arc<Shared>,
    sender: Mutex<Option<Sender<WorkerMessage>>>,
    receiver: Receiver<WorkerMessage>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    collector: Mutex<Option<JoinHandle<()>>>,
}

impl CompactionTaskManager {
    /// Start `pool_size` workers and the result collector
    pub fn new(pool_size: usize) -> Result<Self> {
        let shared = Arc::new(Shared::default());
        let (sender, receiver) = unbounded::<WorkerMessage>();
        let (result_tx, result_rx) = unbounded::<CompactionResult>();

        debug!("Starting compaction pool with {} threads", pool_size);
        let mut workers = Vec::with_capacity(pool_size);
        for worker_id in 0..pool_size {
            let receiver = receiver.clone();
            let results = result_tx.clone();
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("strata-compaction-{}", worker_id))
                .spawn(move || worker_loop(worker_id, receiver, results, shared))?;
            workers.push(handle);
        }
        drop(result_tx);

        let collector_shared = Arc::clone(&shared);
        let collector = std::thread::Builder::new()
            .name("strata-compaction-results".to_string())
            .spawn(move || collect_results(result_rx, collector_shared))?;

        Ok(Self {
            shared,
            sender: Mutex::new(Some(sender)),
            receiver,
            workers: Mutex::new(workers),
            collector: Mutex::new(Some(collector)),
        })
    }

    /// Tasks submitted and not yet finished
    pub fn current_task_num(&self) -> usize {
        self.shared.current_task_num.load(Ordering::Acquire)
    }

    pub fn is_partition_compacting(&self, key: &PartitionKey) -> bool {
        self.shared.compacting.lock().contains(key)
    }

    /// Claim `key` for one selection; `None` if it is already compacting
    pub fn try_reserve(&self, key: &PartitionKey) -> Option<PartitionPermit> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return None;
        }
        if !self.shared.compacting.lock().insert(key.clone()) {
            return None;
        }
        Some(PartitionPermit {
            key: Some(key.clone()),
            shared: Arc::clone(&self.shared),
        })
    }

    /// Queue a task; the partition stays claimed until it finishes
    pub fn submit_task(&self, mut permit: PartitionPermit, task: CompactionTask) -> Result<()> {
        let key = permit
            .key
            .take()
            .ok_or_else(|| StrataError::Internal("permit already used".into()))?;
        if &key != task.partition() {
            self.shared.release(&key);
            return Err(StrataError::Internal(format!(
                "permit for {} used on {}",
                key,
                task.partition()
            )));
        }

        self.shared.current_task_num.fetch_add(1, Ordering::AcqRel);
        self.shared.submitted.fetch_add(1, Ordering::Relaxed);
        let guard = TaskGuard {
            key,
            sources: task.source_files().cloned().collect(),
            shared: Arc::clone(&self.shared),
        };

        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) => sender
                .send(WorkerMessage::Run(Box::new(task), guard))
                .map_err(|_| StrataError::Shutdown),
            None => Err(StrataError::Shutdown),
        }
    }

    /// Wait until no task is running or queued
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.current_task_num() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        true
    }

    pub fn stats(&self) -> CompactionStats {
        CompactionStats {
            running: self.current_task_num(),
            compacting_partitions: self.shared.compacting.lock().len(),
            submitted: self.shared.submitted.load(Ordering::Relaxed),
            succeeded: self.shared.succeeded.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
        }
    }

    /// Most recent results, oldest first
    pub fn recent_results(&self) -> Vec<CompactionResult> {
        self.shared.recent.lock().iter().cloned().collect()
    }

    /// Stop accepting tasks, drop queued ones and wait for running ones
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let workers = std::mem::take(&mut *self.workers.lock());
        if let Some(sender) = self.sender.lock().take() {
            for _ in &workers {
                let _ = sender.send(WorkerMessage::Close);
            }
        }

        // queued tasks release their claims as they are dropped
        let mut cancelled = 0;
        while let Ok(message) = self.receiver.try_recv() {
            if matches!(message, WorkerMessage::Run(..)) {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!("Cancelled {} queued compaction tasks", cancelled);
        }

        for handle in workers {
            if handle.join().is_err() {
                error!("Compaction worker panicked");
            }
        }
        if let Some(collector) = self.collector.lock().take() {
            let _ = collector.join();
        }
    }
}

impl Drop for CompactionTaskManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    worker_id: usize,
    receiver: Receiver<WorkerMessage>,
    results: Sender<CompactionResult>,
    shared: Arc<Shared>,
) {
    while let Ok(message) = receiver.recv() {
        let (task, guard) = match message {
            WorkerMessage::Run(task, guard) => (task, guard),
            WorkerMessage::Close => break,
        };

        let started = Instant::now();
        let outcome = match catch_unwind(AssertUnwindSafe(|| task.execute())) {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("compaction task panicked".to_string()),
        };
        match outcome {
            Ok(_) => shared.succeeded.fetch_add(1, Ordering::Relaxed),
            Err(_) => shared.failed.fetch_add(1, Ordering::Relaxed),
        };

        let result = CompactionResult {
            task_id: task.id(),
            kind: task.kind(),
            partition: task.partition().clone(),
            outcome,
            elapsed: started.elapsed(),
        };
        drop(task);
        drop(guard);
        if results.send(result).is_err() {
            warn!("Compaction worker #{} lost its result collector", worker_id);
        }
    }
    debug!("Compaction worker #{} closed", worker_id);
}

fn collect_results(results: Receiver<CompactionResult>, shared: Arc<Shared>) {
    for result in results {
        match &result.outcome {
            Ok(outcome) => info!(
                "Compaction {} ({}) on {} succeeded in {:?}: {} -> {} files",
                result.task_id,
                result.kind,
                result.partition,
                result.elapsed,
                outcome.source_files,
                outcome.target_files
            ),
            Err(e) => error!(
                "Compaction {} ({}) on {} failed after {:?}: {}",
                result.task_id, result.kind, result.partition, result.elapsed, e
            ),
        }
        let mut recent = shared.recent.lock();
        if recent.len() == RECENT_RESULTS {
            recent.pop_front();
        }
        recent.push_back(result);
    }
}

/// Run one scheduling cycle on a partition; returns the number of tasks admitted
pub fn schedule_compaction(
    partition: &PartitionHandle,
    config: &CompactionConfig,
    manager: &CompactionTaskManager,
) -> usize {
    let inner = |lane: Lane| {
        CompactionStrategy::InnerSizeTiered
            .selector(partition, lane, config, manager)
            .select_and_submit()
    };
    let cross = || {
        CompactionStrategy::CrossInplace
            .selector(partition, Lane::Sequence, config, manager)
            .select_and_submit()
    };
    let saturated = || manager.current_task_num() >= config.concurrent_compaction_thread;

    let mut submitted = 0;
    match config.compaction_priority {
        CompactionPriority::Balance => loop {
            if saturated() {
                break;
            }
            let round = [
                inner(Lane::Sequence),
                inner(Lane::Unsequence),
                cross(),
            ]
            .into_iter()
            .filter(|admitted| *admitted)
            .count();
            if round == 0 {
                break;
            }
            submitted += round;
        },
        CompactionPriority::InnerCross => {
            for admitted in [inner(Lane::Sequence), inner(Lane::Unsequence), cross()] {
                submitted += usize::from(admitted);
            }
        }
        CompactionPriority::CrossInner => {
            for admitted in [cross(), inner(Lane::Sequence), inner(Lane::Unsequence)] {
                submitted += usize::from(admitted);
            }
        }
    }
    submitted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::test_util::{add_file, partition};
    use crate::query::{Filter, QueryContext, QueryDataSource};
    use crate::{SeriesKey, TimeRange, TimeValuePair};
    use tempfile::tempdir;

    const D1: [(&str, &str); 1] = [("root.sg.d1", "s1")];

    #[test]
    fn test_reservation_is_exclusive() {
        let manager = CompactionTaskManager::new(1).unwrap();
        let key = PartitionKey::new("root.sg", 3);

        let permit = manager.try_reserve(&key).unwrap();
        assert!(manager.try_reserve(&key).is_none());
        assert!(manager.try_reserve(&PartitionKey::new("root.sg", 4)).is_some());
        assert!(manager.is_partition_compacting(&key));

        drop(permit);
        assert!(!manager.is_partition_compacting(&key));
        assert!(manager.try_reserve(&key).is_some());
    }

    #[test]
    fn test_concurrent_selectors_admit_one_task() {
        let dir = tempdir().unwrap();
        let handle = partition(dir.path());
        for v in 1..=4 {
            add_file(&handle, Lane::Sequence, v, &D1, &[(v as i64 * 10, 1)]);
        }
        let manager = CompactionTaskManager::new(0).unwrap();
        let config = CompactionConfig {
            concurrent_compaction_thread: 8,
            ..Default::default()
        };

        let admitted: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        CompactionStrategy::InnerSizeTiered
                            .selector(&handle, Lane::Sequence, &config, &manager)
                            .select_and_submit()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| usize::from(h.join().unwrap()))
                .sum()
        });

        assert_eq!(admitted, 1);
        assert_eq!(manager.current_task_num(), 1);
        manager.shutdown();
        assert_eq!(manager.current_task_num(), 0);
    }

    #[test]
    fn test_cycle_runs_and_releases() {
        let dir = tempdir().unwrap();
        let handle = partition(dir.path());
        let key = SeriesKey::new("root.sg.d1", "s1");
        add_file(&handle, Lane::Sequence, 1, &D1, &[(0, 0), (10, 0)]);
        add_file(&handle, Lane::Sequence, 2, &D1, &[(20, 0), (30, 0)]);
        add_file(&handle, Lane::Unsequence, 3, &D1, &[(10, 3), (25, 3)]);
        add_file(&handle, Lane::Unsequence, 4, &D1, &[(10, 4)]);

        let manager = CompactionTaskManager::new(2).unwrap();
        // inner-space would pick up the new targets once the claim is released
        let config = CompactionConfig {
            compaction_priority: CompactionPriority::CrossInner,
            enable_seq_space_compaction: false,
            enable_unseq_space_compaction: false,
            ..Default::default()
        };

        assert_eq!(schedule_compaction(&handle, &config, &manager), 1);
        assert!(manager.wait_idle(Duration::from_secs(10)));
        assert!(handle.unseq.is_empty());
        assert!(!manager.is_partition_compacting(&handle.key));
        assert_eq!(manager.stats().succeeded, 1);

        let points = QueryDataSource::capture(&key, TimeRange::all(), &handle.seq, &handle.unseq)
            .into_reader(Filter::default(), &QueryContext::new())
            .unwrap()
            .read_all()
            .unwrap();
        assert_eq!(
            points,
            vec![
                TimeValuePair::new(0, 0i64),
                TimeValuePair::new(10, 4i64),
                TimeValuePair::new(20, 0i64),
                TimeValuePair::new(25, 3i64),
                TimeValuePair::new(30, 0i64),
            ]
        );
        manager.shutdown();
    }

    #[test]
    fn test_failed_task_releases_claims() {
        let dir = tempdir().unwrap();
        let handle = partition(dir.path());
        let a = add_file(&handle, Lane::Sequence, 1, &D1, &[(1, 1)]);
        let b = add_file(&handle, Lane::Sequence, 2, &D1, &[(2, 1)]);
        std::fs::write(b.path(), b"garbage").unwrap();

        let manager = CompactionTaskManager::new(1).unwrap();
        let config = CompactionConfig::default();
        assert_eq!(
            schedule_compaction(
                &handle,
                &CompactionConfig {
                    compaction_priority: CompactionPriority::InnerCross,
                    ..config
                },
                &manager
            ),
            1
        );
        assert!(manager.wait_idle(Duration::from_secs(10)));

        assert!(!a.is_merging() && !b.is_merging());
        assert_eq!(handle.seq.len(), 2);
        assert_eq!(manager.stats().failed, 1);
        manager.shutdown();
        let recent = manager.recent_results();
        assert_eq!(recent.len(), 1);
        assert!(recent[0].outcome.is_err());
    }

    #[test]
    fn test_submit_after_shutdown_is_rejected() {
        let dir = tempdir().unwrap();
        let handle = partition(dir.path());
        let manager = CompactionTaskManager::new(1).unwrap();
        let permit = manager.try_reserve(&handle.key).unwrap();
        manager.shutdown();

        let task = CompactionTask::inner(handle.clone(), Lane::Sequence, Vec::new());
        assert!(matches!(
            manager.submit_task(permit, task),
            Err(StrataError::Shutdown)
        ));
        assert_eq!(manager.current_task_num(), 0);
        assert!(!manager.is_partition_compacting(&handle.key));
    }
}
