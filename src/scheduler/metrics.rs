//! Per-sphere counters and the snapshot observers read.
//!
//! Workers update their own [`SphereStats`] locklessly (plain stores — a
//! sphere's counters are touched only by that sphere's own thread). The
//! root publishes a [`MetricsSnapshot`] at the barrier; observers (UI,
//! logs) only ever read from the published slot, never from a sphere
//! directly, so there is nothing for them to race with.

use std::sync::atomic::{AtomicU64, Ordering};

/// One sphere's running counters for the epoch in progress. `loss_bits`
/// stores the `f32` accumulated loss reinterpreted as bits so it can live
/// in an atomic alongside the integer counters; readers convert back with
/// `f32::from_bits`.
pub struct SphereCounters {
    pub batches_processed: AtomicU64,
    pub valid_positions: AtomicU64,
    loss_bits: AtomicU64,
}

impl SphereCounters {
    pub fn new() -> Self {
        SphereCounters {
            batches_processed: AtomicU64::new(0),
            valid_positions: AtomicU64::new(0),
            loss_bits: AtomicU64::new(0.0f64.to_bits()),
        }
    }

    /// Called once per batch by the owning worker after its backward pass.
    pub fn record_batch(&self, loss_sum: f64, valid_positions: u64) {
        self.batches_processed.fetch_add(1, Ordering::Relaxed);
        self.valid_positions.fetch_add(valid_positions, Ordering::Relaxed);
        // Relaxed read-modify-write is safe here because this counter is
        // only ever touched by the one worker thread that owns it.
        let current = f64::from_bits(self.loss_bits.load(Ordering::Relaxed));
        self.loss_bits.store((current + loss_sum).to_bits(), Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.batches_processed.store(0, Ordering::Relaxed);
        self.valid_positions.store(0, Ordering::Relaxed);
        self.loss_bits.store(0.0f64.to_bits(), Ordering::Relaxed);
    }

    pub fn snapshot(&self, sphere_id: usize, sym_group: u8) -> SphereStats {
        let batches = self.batches_processed.load(Ordering::Relaxed);
        let positions = self.valid_positions.load(Ordering::Relaxed);
        let loss_sum = f64::from_bits(self.loss_bits.load(Ordering::Relaxed));
        SphereStats {
            sphere_id,
            sym_group,
            batches_processed: batches,
            valid_positions: positions,
            mean_loss: if positions > 0 {
                (loss_sum / positions as f64) as f32
            } else {
                0.0
            },
        }
    }
}

impl Default for SphereCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// A read-only, point-in-time copy of one sphere's counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SphereStats {
    pub sphere_id: usize,
    pub sym_group: u8,
    pub batches_processed: u64,
    pub valid_positions: u64,
    pub mean_loss: f32,
}

/// Published once per epoch, after the barrier and after the optimizer
/// step completes (§4.H.2 — never before). `grad_norm` and `lr` describe
/// the optimizer call that just ran; `skipped` is set when a non-finite
/// gradient caused that call to be skipped (§4.F, §7).
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub epoch: u64,
    pub step: u64,
    pub loss: f32,
    pub grad_norm: f32,
    pub lr: f32,
    pub skipped: bool,
    pub cancelled: bool,
    pub per_sphere: Vec<SphereStats>,
}

impl MetricsSnapshot {
    pub fn empty() -> Self {
        MetricsSnapshot {
            epoch: 0,
            step: 0,
            loss: 0.0,
            grad_norm: 0.0,
            lr: 0.0,
            skipped: false,
            cancelled: false,
            per_sphere: Vec::new(),
        }
    }

    pub fn total_batches(&self) -> u64 {
        self.per_sphere.iter().map(|s| s.batches_processed).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_accumulate_across_batches() {
        let counters = SphereCounters::new();
        counters.record_batch(2.0, 4);
        counters.record_batch(1.0, 4);
        let snap = counters.snapshot(0, 0);
        assert_eq!(snap.batches_processed, 2);
        assert_eq!(snap.valid_positions, 8);
        assert!((snap.mean_loss - 3.0 / 8.0).abs() < 1e-6);
    }

    #[test]
    fn reset_clears_counters() {
        let counters = SphereCounters::new();
        counters.record_batch(5.0, 10);
        counters.reset();
        let snap = counters.snapshot(0, 0);
        assert_eq!(snap.batches_processed, 0);
        assert_eq!(snap.mean_loss, 0.0);
    }

    #[test]
    fn total_batches_sums_every_sphere() {
        let snap = MetricsSnapshot {
            per_sphere: vec![
                SphereStats { sphere_id: 0, sym_group: 0, batches_processed: 3, valid_positions: 10, mean_loss: 1.0 },
                SphereStats { sphere_id: 1, sym_group: 1, batches_processed: 5, valid_positions: 20, mean_loss: 1.0 },
            ],
            ..MetricsSnapshot::empty()
        };
        assert_eq!(snap.total_batches(), 8);
    }
}
