//! The hierarchical sphere scheduler: one root control thread dispatching
//! to N worker spheres over a shared channel, synchronized at an epoch
//! barrier, followed by a single deterministic reduce-and-optimize step.
//!
//! Workers are spawned fresh each epoch with [`std::thread::scope`] rather
//! than kept alive across epochs: scoped threads let the dispatch loop
//! borrow the model, the lattice table, and each sphere's private gradient
//! segment directly, with no `Arc`/`Mutex`/`unsafe` needed to share
//! read-only state across the epoch. The join point `thread::scope`
//! inserts when its closure returns is the epoch barrier §4.H.2 describes;
//! there is no separate `std::sync::Barrier` object because scope already
//! gives the same guarantee (root proceeds only once every worker has
//! finished) for free.

pub mod gradient;
pub mod metrics;
mod sphere;

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use crate::batch::{Batch, BatchIterator};
use crate::config::TrainingConfig;
use crate::error::{TrainingError, TrainingResult};
use crate::handle::EpochReport;
use crate::lattice::LatticeTable;
use crate::model::{Model, ModelGradients, ModelShape};
use crate::optimizer::Optimizer;

use gradient::GradientBuffer;
use metrics::{MetricsSnapshot, SphereCounters};
use sphere::{process_batch, SphereContext};

enum WorkItem {
    Batch(Batch),
    Shutdown,
}

/// Owns the per-sphere state that lives across epochs: gradient segments,
/// counters, and the cooperative cancel flag. Rebuilt once per training
/// run, not once per epoch.
pub struct Scheduler {
    n_spheres: usize,
    grad_buffer: GradientBuffer,
    reduced: ModelGradients,
    counters: Vec<SphereCounters>,
    cancel: AtomicBool,
    epoch: u64,
    last_snapshot: MetricsSnapshot,
}

impl Scheduler {
    pub fn new(shape: &ModelShape, config: &TrainingConfig) -> Self {
        let n_spheres = config.resolved_thread_count();
        Scheduler {
            n_spheres,
            grad_buffer: GradientBuffer::new(shape, n_spheres),
            reduced: ModelGradients::zeros_like(shape),
            counters: (0..n_spheres).map(|_| SphereCounters::new()).collect(),
            cancel: AtomicBool::new(false),
            epoch: 0,
            last_snapshot: MetricsSnapshot::empty(),
        }
    }

    pub fn n_spheres(&self) -> usize {
        self.n_spheres
    }

    /// Requests cooperative shutdown. Workers observe this at most one
    /// in-flight batch later; the epoch in progress (if any) returns
    /// `Err(TrainingError::Cancelled)` without touching the model.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn last_snapshot(&self) -> MetricsSnapshot {
        self.last_snapshot.clone()
    }

    /// Runs one full epoch: resets the batch stream, dispatches every
    /// window it yields (up to `max_batches_per_epoch`) across the
    /// sphere pool, reduces their gradients, and applies one optimizer
    /// step — unless the epoch was cancelled, a sphere was poisoned by an
    /// unrecoverable error, or the reduced gradient turned out non-finite,
    /// in which case the optimizer step is skipped (§4.F, §4.H.4, §7).
    pub fn run_epoch(
        &mut self,
        model: &mut Model,
        lattice: &LatticeTable,
        batches: &mut BatchIterator,
        optimizer: &mut Optimizer,
        config: &TrainingConfig,
    ) -> TrainingResult<EpochReport> {
        batches.reset();
        self.grad_buffer.zero_all();
        for c in &self.counters {
            c.reset();
        }

        let mut collected = Vec::new();
        while collected.len() < config.max_batches_per_epoch {
            if self.is_cancelled() {
                break;
            }
            match batches.next() {
                Some(batch) => collected.push(batch),
                None => break,
            }
        }

        if collected.is_empty() {
            debug!(epoch = self.epoch, "epoch had no batches to process");
            self.epoch += 1;
            return Ok(EpochReport {
                epoch: self.epoch,
                step: optimizer.step_count(),
                batches_processed: 0,
                loss: 0.0,
                grad_norm: 0.0,
                lr: 0.0,
                skipped: false,
                cancelled: false,
                per_sphere: Vec::new(),
            });
        }

        let poisoned = AtomicBool::new(false);
        let n_spheres = self.n_spheres;
        let cancel = &self.cancel;
        let counters = &self.counters;
        let grad_buffer = &mut self.grad_buffer;

        std::thread::scope(|scope| {
            let (tx, rx) = crossbeam::channel::unbounded::<WorkItem>();

            let mut handles = Vec::with_capacity(n_spheres);
            let mut segments = grad_buffer.segments_mut().iter_mut();
            for sphere_id in 0..n_spheres {
                let rx = rx.clone();
                let model = &*model;
                let lattice = lattice;
                let config = config;
                let grad_segment = segments.next().expect("one segment per sphere");
                let sphere_counters = &counters[sphere_id];
                let poisoned = &poisoned;
                let cancel = cancel;

                handles.push(scope.spawn(move || {
                    let ctx = SphereContext::new(sphere_id);
                    while let Ok(item) = rx.recv() {
                        if cancel.load(Ordering::SeqCst) || poisoned.load(Ordering::SeqCst) {
                            break;
                        }
                        match item {
                            WorkItem::Shutdown => break,
                            WorkItem::Batch(batch) => {
                                if let Err(err) = process_batch(
                                    model,
                                    lattice,
                                    &batch,
                                    config,
                                    grad_segment,
                                    sphere_counters,
                                ) {
                                    warn!(sphere = ctx.sphere_id, error = %err, "sphere poisoned");
                                    poisoned.store(true, Ordering::SeqCst);
                                    break;
                                }
                            }
                        }
                    }
                }));
            }

            for batch in collected {
                if cancel.load(Ordering::SeqCst) || poisoned.load(Ordering::SeqCst) {
                    break;
                }
                // An unbounded channel never blocks the sender, so there is
                // nothing to "drain" here beyond simply stopping early.
                if tx.send(WorkItem::Batch(batch)).is_err() {
                    break;
                }
            }
            for _ in 0..n_spheres {
                let _ = tx.send(WorkItem::Shutdown);
            }
            drop(tx);

            for handle in handles {
                let _ = handle.join();
            }
        });

        let total_batches: u64 = self.counters.iter().map(|c| c.snapshot(0, 0).batches_processed).sum();
        let per_sphere: Vec<_> = self
            .counters
            .iter()
            .enumerate()
            .map(|(i, c)| c.snapshot(i, (i % crate::lattice::NUM_DIMENSIONS) as u8))
            .collect();
        let total_valid: u64 = per_sphere.iter().map(|s| s.valid_positions).sum();
        let overall_loss = if total_valid > 0 {
            let weighted: f64 = per_sphere
                .iter()
                .map(|s| s.mean_loss as f64 * s.valid_positions as f64)
                .sum();
            (weighted / total_valid as f64) as f32
        } else {
            0.0
        };

        if self.is_cancelled() {
            info!(epoch = self.epoch, "epoch cancelled");
            return Err(TrainingError::Cancelled);
        }

        if poisoned.load(Ordering::SeqCst) {
            self.epoch += 1;
            return Err(TrainingError::TrainingAborted(
                "a worker sphere failed irrecoverably during the epoch".into(),
            ));
        }

        if !overall_loss.is_finite() {
            warn!(epoch = self.epoch, "non-finite loss observed, skipping optimizer step");
            self.epoch += 1;
            let report = EpochReport {
                epoch: self.epoch,
                step: optimizer.step_count(),
                batches_processed: total_batches,
                loss: overall_loss,
                grad_norm: 0.0,
                lr: 0.0,
                skipped: true,
                cancelled: false,
                per_sphere,
            };
            self.last_snapshot = report_to_snapshot(&report);
            return Ok(report);
        }

        self.grad_buffer.reduce_into(&mut self.reduced);

        let report = match optimizer.step(model, &self.reduced) {
            Ok(step_report) => {
                self.epoch += 1;
                EpochReport {
                    epoch: self.epoch,
                    step: optimizer.step_count(),
                    batches_processed: total_batches,
                    loss: overall_loss,
                    grad_norm: step_report.grad_norm,
                    lr: step_report.lr,
                    skipped: false,
                    cancelled: false,
                    per_sphere,
                }
            }
            Err(TrainingError::NonFiniteGradient { .. }) => {
                self.epoch += 1;
                EpochReport {
                    epoch: self.epoch,
                    step: optimizer.step_count(),
                    batches_processed: total_batches,
                    loss: overall_loss,
                    grad_norm: f32::NAN,
                    lr: 0.0,
                    skipped: true,
                    cancelled: false,
                    per_sphere,
                }
            }
            Err(other) => return Err(other),
        };

        self.last_snapshot = report_to_snapshot(&report);
        Ok(report)
    }
}

fn report_to_snapshot(report: &EpochReport) -> MetricsSnapshot {
    MetricsSnapshot {
        epoch: report.epoch,
        step: report.step,
        loss: report.loss,
        grad_norm: report.grad_norm,
        lr: report.lr,
        skipped: report.skipped,
        cancelled: report.cancelled,
        per_sphere: report.per_sphere.clone(),
    }
}
