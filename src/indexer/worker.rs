//! Background propagation worker.
//!
//! Drains submitted write records in batches on a dedicated thread. One batch is one
//! propagation cycle: records with a wrong-dimension vector are rejected, the rest are
//! compacted to the highest version per id and applied through the coordinator in
//! parallel. A write accepted in a cycle is visible to queries when that cycle ends.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::indexer::coordinator::{ApplyOutcome, CoordinatorError, IndexCoordinator};
use crate::model::types::{EntityClass, IndexWriteRecord};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkerError {
    #[error("propagation worker channel closed")]
    ChannelClosed,
}

/// Messages sent to the background worker.
#[derive(Debug)]
pub enum WorkerMessage {
    Submit(IndexWriteRecord),
    /// Acknowledge once every earlier submission has been applied.
    Flush(Sender<()>),
    Shutdown,
}

/// Most recent write errors kept in a [`PropagationReport`]; older ones are only counted.
pub const MAX_REPORTED_ERRORS: usize = 100;

/// Running totals for the worker's lifetime.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PropagationReport {
    pub cycles: u64,
    pub received: u64,
    /// Superseded by a higher version in the same cycle.
    pub compacted: u64,
    pub applied: u64,
    pub reconciled: u64,
    pub duplicate: u64,
    pub stale: u64,
    /// Writes that were rejected or did not complete, over the worker's lifetime.
    pub failed: u64,
    /// The last [`MAX_REPORTED_ERRORS`] of those failures, oldest first.
    pub errors: VecDeque<CoordinatorError>,
}

impl PropagationReport {
    fn record(&mut self, result: Result<ApplyOutcome, CoordinatorError>) {
        match result {
            Ok(ApplyOutcome::Applied) => self.applied += 1,
            Ok(ApplyOutcome::Reconciled) => self.reconciled += 1,
            Ok(ApplyOutcome::Duplicate) => self.duplicate += 1,
            Ok(ApplyOutcome::Stale { .. }) => self.stale += 1,
            Err(err) => {
                self.failed += 1;
                if self.errors.len() == MAX_REPORTED_ERRORS {
                    self.errors.pop_front();
                }
                self.errors.push_back(err);
            }
        }
    }
}

/// Handle for sending records to the background worker.
#[derive(Clone)]
pub struct PropagationHandle {
    sender: Sender<WorkerMessage>,
}

impl PropagationHandle {
    pub fn submit(&self, record: IndexWriteRecord) -> Result<(), WorkerError> {
        self.sender
            .send(WorkerMessage::Submit(record))
            .map_err(|_| WorkerError::ChannelClosed)
    }

    /// Block until everything submitted so far has been applied.
    pub fn flush(&self) -> Result<(), WorkerError> {
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        self.sender
            .send(WorkerMessage::Flush(ack_tx))
            .map_err(|_| WorkerError::ChannelClosed)?;
        ack_rx.recv().map_err(|_| WorkerError::ChannelClosed)
    }

    /// Request the worker to shut down after draining what it already received.
    pub fn shutdown(&self) -> Result<(), WorkerError> {
        self.sender
            .send(WorkerMessage::Shutdown)
            .map_err(|_| WorkerError::ChannelClosed)
    }
}

pub struct PropagationWorker {
    receiver: Receiver<WorkerMessage>,
    coordinator: Arc<IndexCoordinator>,
    batch_size: usize,
}

impl PropagationWorker {
    pub fn new(coordinator: Arc<IndexCoordinator>) -> (Self, PropagationHandle) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let batch_size = coordinator.config().propagation_batch.max(1);
        let worker = Self {
            receiver,
            coordinator,
            batch_size,
        };
        (worker, PropagationHandle { sender })
    }

    /// Start the worker on its own thread.
    pub fn spawn(
        coordinator: Arc<IndexCoordinator>,
    ) -> std::io::Result<(PropagationHandle, JoinHandle<PropagationReport>)> {
        let (worker, handle) = Self::new(coordinator);
        let join = std::thread::Builder::new()
            .name("talent-match-propagation".into())
            .spawn(move || worker.run())?;
        Ok((handle, join))
    }

    /// Run the worker loop (blocking). Returns when shut down or every handle is dropped.
    pub fn run(self) -> PropagationReport {
        info!(batch_size = self.batch_size, "propagation worker started");
        let mut report = PropagationReport::default();

        while let Ok(first) = self.receiver.recv() {
            let mut batch = Vec::new();
            let mut acks = Vec::new();
            let mut stop = false;

            let mut next = Some(first);
            while let Some(msg) = next.take() {
                match msg {
                    WorkerMessage::Submit(record) => batch.push(record),
                    WorkerMessage::Flush(ack) => acks.push(ack),
                    WorkerMessage::Shutdown => stop = true,
                }
                if stop || batch.len() >= self.batch_size {
                    break;
                }
                next = self.receiver.try_recv().ok();
            }

            if !batch.is_empty() {
                self.run_cycle(batch, &mut report);
            }
            for ack in acks {
                let _ = ack.send(());
            }
            if stop {
                info!("propagation worker shutting down");
                break;
            }
        }

        info!(
            cycles = report.cycles,
            applied = report.applied,
            failed = report.failed,
            "propagation worker stopped"
        );
        report
    }

    fn run_cycle(&self, batch: Vec<IndexWriteRecord>, report: &mut PropagationReport) {
        let received = batch.len();
        let mut results: Vec<Result<ApplyOutcome, CoordinatorError>> = Vec::new();
        let mut valid = Vec::with_capacity(received);
        for record in batch {
            match self.coordinator.check_dimension(&record) {
                Ok(()) => valid.push(record),
                Err(err) => results.push(Err(err)),
            }
        }
        let valid_count = valid.len();
        let records = compact(valid);
        let compacted = valid_count - records.len();

        results.par_extend(
            records
                .into_par_iter()
                .map(|record| self.coordinator.apply(record)),
        );

        report.cycles += 1;
        report.received += received as u64;
        report.compacted += compacted as u64;
        let mut failures = 0usize;
        for result in results {
            if let Err(err) = &result {
                failures += 1;
                warn!(error = %err, "propagation write did not complete");
            }
            report.record(result);
        }
        debug!(
            cycle = report.cycles,
            received,
            compacted,
            failures,
            "propagation cycle complete"
        );
    }
}

/// Keep only the highest version per (class, id). On a tie the first submission wins,
/// as applying the records one by one would treat the later one as a duplicate.
/// Output is ordered by (class, id).
pub fn compact(batch: Vec<IndexWriteRecord>) -> Vec<IndexWriteRecord> {
    let mut latest: FxHashMap<(EntityClass, String), IndexWriteRecord> = FxHashMap::default();
    for record in batch {
        let key = (record.class, record.id.clone());
        match latest.get(&key) {
            Some(existing) if existing.version >= record.version => {}
            _ => {
                latest.insert(key, record);
            }
        }
    }
    let mut out: Vec<_> = latest.into_values().collect();
    out.sort_by(|a, b| (a.class, &a.id).cmp(&(b.class, &b.id)));
    out
}
