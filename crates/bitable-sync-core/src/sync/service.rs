//! Replication service: the polling loops and their lifecycle.
//!
//! Three named threads share one [`ServiceInner`]:
//! - remote loop: snapshot diff per table, changes applied to SQLite
//! - relational loop: outbound queue drained into the remote store
//! - cleanup loop: completed queue items and old log entries pruned
//!
//! Each loop checks the `running` flag between cycles and sleeps in short
//! slices, so `stop()` returns promptly. Calls already in flight finish on
//! their own; transport timeouts bound them.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::capture::install_capture_triggers;
use super::change_detector::detect_changes;
use super::snapshot_store::{SnapshotStore, SqliteSnapshotStore};
use super::types::QueueStats;
use super::worker::{ApplyOutcome, SyncWorker};
use crate::error::{CoreError, SyncError};
use crate::remote::RemoteStore;
use crate::storage::{Database, SyncConfig, TableMapping};

const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Applied/skipped/failed totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub applied: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl CounterSnapshot {
    fn record(&mut self, outcome: &ApplyOutcome) {
        match outcome {
            ApplyOutcome::Applied => self.applied += 1,
            ApplyOutcome::Skipped(_) => self.skipped += 1,
            ApplyOutcome::Failed(_) => self.failed += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.applied + self.skipped + self.failed
    }
}

#[derive(Debug, Default)]
struct DirectionCounters {
    applied: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

impl DirectionCounters {
    fn add(&self, tally: &CounterSnapshot) {
        self.applied.fetch_add(tally.applied, Ordering::Relaxed);
        self.skipped.fetch_add(tally.skipped, Ordering::Relaxed);
        self.failed.fetch_add(tally.failed, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            applied: self.applied.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Lifetime counters, one set per direction.
#[derive(Debug, Default)]
struct SyncCounters {
    remote_to_relational: DirectionCounters,
    relational_to_remote: DirectionCounters,
}

/// Outcome of one pass in each direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub remote_to_relational: CounterSnapshot,
    pub relational_to_remote: CounterSnapshot,
}

/// Rows removed by [`SyncService::cleanup`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub queue_items: usize,
    pub log_entries: usize,
}

/// Health snapshot of a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_seconds: u64,
    pub remote_to_relational: CounterSnapshot,
    pub relational_to_remote: CounterSnapshot,
    pub queue: QueueStats,
    pub oldest_pending_age_seconds: Option<i64>,
}

struct ServiceInner {
    config: SyncConfig,
    db: Database,
    remote: Arc<dyn RemoteStore>,
    snapshots: Arc<dyn SnapshotStore>,
    worker: SyncWorker,
    running: AtomicBool,
    started_at: Mutex<Option<DateTime<Utc>>>,
    counters: SyncCounters,
}

impl ServiceInner {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Sleep up to `total`, waking early once the service stops.
    fn sleep(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while self.is_running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }

    fn remote_cycle(&self) -> CounterSnapshot {
        let mut tally = CounterSnapshot::default();
        for mapping in &self.config.tables {
            let table = self.sync_table(mapping);
            tally.applied += table.applied;
            tally.skipped += table.skipped;
            tally.failed += table.failed;
        }
        self.counters.remote_to_relational.add(&tally);
        tally
    }

    fn sync_table(&self, mapping: &TableMapping) -> CounterSnapshot {
        let table = mapping.relational_table.as_str();
        let mut tally = CounterSnapshot::default();

        let previous = match self.snapshots.load(table) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(table, error = %e, "failed to load snapshot");
                return tally;
            }
        };
        let (events, mut next) = match detect_changes(self.remote.as_ref(), mapping, &previous) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(table, remote_table = %mapping.remote_table, error = %e, "change detection failed");
                return tally;
            }
        };

        for event in &events {
            let outcome = self.worker.apply_remote(event);
            if let ApplyOutcome::Failed(e) = &outcome {
                if e.is_retryable() {
                    // Detected again on the next pass.
                    next.restore_record(&event.record_id, &previous);
                }
            }
            tally.record(&outcome);
        }

        if let Err(e) = self.snapshots.save(table, &next) {
            tracing::error!(table, error = %e, "failed to save snapshot");
        }
        if !events.is_empty() {
            tracing::info!(
                table,
                changes = events.len(),
                applied = tally.applied,
                skipped = tally.skipped,
                failed = tally.failed,
                "remote pass finished"
            );
        }
        tally
    }

    fn relational_cycle(&self) -> CounterSnapshot {
        let mut tally = CounterSnapshot::default();
        let items = match self.worker.queue().dequeue_pending(self.config.batch_size) {
            Ok(items) => items,
            Err(e) => {
                tracing::error!(error = %e, "failed to read outbound queue");
                return tally;
            }
        };
        for item in &items {
            tally.record(&self.worker.apply_relational(item));
        }
        if !items.is_empty() {
            tracing::info!(
                items = items.len(),
                applied = tally.applied,
                skipped = tally.skipped,
                failed = tally.failed,
                "relational pass finished"
            );
        }
        self.counters.relational_to_remote.add(&tally);
        tally
    }

    fn cleanup(&self) -> Result<CleanupReport, CoreError> {
        let report = CleanupReport {
            queue_items: self.worker.queue().cleanup(self.config.queue_retention())?,
            log_entries: self.worker.log().cleanup(self.config.log_retention())?,
        };
        if report.queue_items + report.log_entries > 0 {
            tracing::info!(
                queue_items = report.queue_items,
                log_entries = report.log_entries,
                "pruned replication history"
            );
        }
        Ok(report)
    }
}

fn run_loop(inner: Arc<ServiceInner>, name: &'static str, interval: Duration, step: fn(&ServiceInner)) {
    tracing::info!(loop_name = name, interval_secs = interval.as_secs(), "loop started");
    while inner.is_running() {
        step(&inner);
        inner.sleep(interval);
    }
    tracing::info!(loop_name = name, "loop stopped");
}

/// Bidirectional replication between a remote store and SQLite.
pub struct SyncService {
    inner: Arc<ServiceInner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncService {
    /// Service with snapshots persisted in the same database.
    pub fn new(config: SyncConfig, db: Database, remote: Arc<dyn RemoteStore>) -> Self {
        let snapshots = Arc::new(SqliteSnapshotStore::new(db.clone()));
        Self::with_snapshot_store(config, db, remote, snapshots)
    }

    pub fn with_snapshot_store(
        config: SyncConfig,
        db: Database,
        remote: Arc<dyn RemoteStore>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Self {
        let worker = SyncWorker::new(db.clone(), remote.clone(), &config);
        Self {
            inner: Arc::new(ServiceInner {
                config,
                db,
                remote,
                snapshots,
                worker,
                running: AtomicBool::new(false),
                started_at: Mutex::new(None),
                counters: SyncCounters::default(),
            }),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    pub fn worker(&self) -> &SyncWorker {
        &self.inner.worker
    }

    /// Check both stores, prepare the queue and spawn the loops.
    ///
    /// # Errors
    /// Returns an error if either store is unreachable, capture triggers
    /// cannot be installed, or a thread cannot be spawned. The service is
    /// left stopped in that case.
    pub fn start(&self) -> Result<(), CoreError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("sync service already running");
            return Ok(());
        }
        if let Err(e) = self.prepare() {
            self.inner.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let config = &self.inner.config;
        let loops: [(&'static str, Duration, fn(&ServiceInner)); 3] = [
            ("remote", config.remote_poll_interval(), |inner| {
                inner.remote_cycle();
            }),
            ("relational", config.relational_poll_interval(), |inner| {
                inner.relational_cycle();
            }),
            ("cleanup", config.cleanup_interval(), |inner| {
                if let Err(e) = inner.cleanup() {
                    tracing::error!(error = %e, "cleanup failed");
                }
            }),
        ];

        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        for (name, interval, step) in loops {
            let inner = Arc::clone(&self.inner);
            let spawned = thread::Builder::new()
                .name(format!("bitable-sync-{name}"))
                .spawn(move || run_loop(inner, name, interval, step));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    drop(handles);
                    self.stop();
                    return Err(e.into());
                }
            }
        }

        *self.inner.started_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        tracing::info!(tables = config.tables.len(), "sync service started");
        Ok(())
    }

    /// Check both stores, requeue items an interrupted run left in
    /// processing and install capture triggers. `start()` runs this first.
    ///
    /// # Errors
    /// Returns an error if either store is unreachable or a trigger cannot
    /// be installed.
    pub fn prepare(&self) -> Result<(), CoreError> {
        self.inner.db.ping()?;
        self.inner.remote.ping()?;

        let recovered = self.inner.worker.queue().recover_processing()?;
        if recovered > 0 {
            tracing::info!(recovered, "requeued items left in processing");
        }
        for mapping in self.inner.config.tables.iter().filter(|t| t.capture) {
            install_capture_triggers(&self.inner.db, &mapping.relational_table, &mapping.key_column)?;
        }
        Ok(())
    }

    /// Signal the loops to stop and wait up to the shutdown timeout.
    /// Threads still busy after that are detached.
    pub fn stop(&self) {
        let was_running = self.inner.running.swap(false, Ordering::SeqCst);
        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        let deadline = Instant::now() + self.inner.config.shutdown_timeout();
        while handles.iter().any(|h| !h.is_finished()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }

        for handle in handles {
            let name = handle.thread().name().unwrap_or("unnamed").to_string();
            if handle.is_finished() {
                if handle.join().is_err() {
                    tracing::error!(thread = %name, "sync loop panicked");
                }
            } else {
                tracing::warn!(thread = %name, "sync loop did not stop in time, detaching");
            }
        }

        *self.inner.started_at.lock().unwrap_or_else(PoisonError::into_inner) = None;
        if was_running {
            tracing::info!("sync service stopped");
        }
    }

    /// One pass in each direction, remote first. Does not need `start()`.
    pub fn run_once(&self) -> CycleReport {
        CycleReport {
            remote_to_relational: self.inner.remote_cycle(),
            relational_to_remote: self.inner.relational_cycle(),
        }
    }

    /// Forget the remote snapshot of `table`; the next pass re-reads every
    /// record as an insert.
    ///
    /// # Errors
    /// Returns an error if `table` is not mapped or the reset fails.
    pub fn reset_snapshot(&self, table: &str) -> Result<(), CoreError> {
        if self.inner.config.table(table).is_none() {
            return Err(SyncError::MissingTableMapping(table.to_string()).into());
        }
        self.inner.snapshots.reset(table)?;
        tracing::info!(table, "snapshot reset");
        Ok(())
    }

    /// Prune completed queue items and old log entries.
    ///
    /// # Errors
    /// Returns an error if a delete fails.
    pub fn cleanup(&self) -> Result<CleanupReport, CoreError> {
        self.inner.cleanup()
    }

    /// # Errors
    /// Returns an error if the queue statistics cannot be read.
    pub fn status(&self) -> Result<ServiceStatus, CoreError> {
        let now = Utc::now();
        let started_at = *self.inner.started_at.lock().unwrap_or_else(PoisonError::into_inner);
        let queue = self.inner.worker.queue().stats()?;
        Ok(ServiceStatus {
            running: self.is_running(),
            started_at,
            uptime_seconds: started_at
                .map(|t| u64::try_from((now - t).num_seconds()).unwrap_or(0))
                .unwrap_or(0),
            remote_to_relational: self.inner.counters.remote_to_relational.snapshot(),
            relational_to_remote: self.inner.counters.relational_to_remote.snapshot(),
            oldest_pending_age_seconds: queue.oldest_pending_age_seconds(now),
            queue,
        })
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}
