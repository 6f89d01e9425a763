//! A worker sphere: one thread, one gradient segment, one set of
//! lockless counters. [`process_batch`] is the worker-loop body from
//! §4.H.3, run once per batch a sphere claims off the shared work channel.

use crate::backward::backward;
use crate::batch::Batch;
use crate::config::TrainingConfig;
use crate::error::TrainingResult;
use crate::forward::forward;
use crate::lattice::LatticeTable;
use crate::loss::crystalline_loss;
use crate::model::{Model, ModelGradients};

use super::metrics::SphereCounters;

/// Identity and bookkeeping for one worker sphere. Spheres never share a
/// gradient segment or a counters block; the only things they read
/// concurrently are the model (read-only during the epoch) and the
/// lattice table (read-only for the run's entire lifetime).
pub struct SphereContext {
    pub sphere_id: usize,
    pub sym_group: u8,
}

impl SphereContext {
    pub fn new(sphere_id: usize) -> Self {
        SphereContext {
            sphere_id,
            sym_group: (sphere_id % crate::lattice::NUM_DIMENSIONS) as u8,
        }
    }
}

/// Runs forward, crystalline loss, and backward for every sequence in
/// `batch`, accumulating gradients into `grad` and recording the result
/// into `counters`. A worker never touches another sphere's segment or
/// writes to the model — both are structurally guaranteed by the caller
/// passing exclusive references scoped to this sphere alone.
pub fn process_batch(
    model: &Model,
    lattice: &LatticeTable,
    batch: &Batch,
    config: &TrainingConfig,
    grad: &mut ModelGradients,
    counters: &SphereCounters,
) -> TrainingResult<()> {
    let seq_len = batch.seq_len;
    let mut loss_sum = 0.0f64;
    let mut valid_positions = 0u64;

    for row in 0..batch.batch_size {
        let start = row * seq_len;
        let end = start + seq_len;
        let input_ids = &batch.input_ids[start..end];
        let target_ids = &batch.target_ids[start..end];
        let mask = &batch.mask[start..end];

        if mask.iter().all(|&m| m == 0) {
            continue;
        }

        let (logits, cache) = forward(model, input_ids, mask)?;
        let loss = crystalline_loss(
            &logits,
            target_ids,
            mask,
            lattice,
            config.lambda_prime,
            config.lambda_lattice,
            config.loss_top_k,
        );
        backward(model, &logits, target_ids, mask, &cache, grad)?;

        let row_valid = mask.iter().filter(|&&m| m != 0).count() as u64;
        loss_sum += loss as f64 * row_valid as f64;
        valid_positions += row_valid;
    }

    counters.record_batch(loss_sum, valid_positions);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lattice::LatticeTable;
    use crate::model::ModelGradients;

    fn small_config() -> TrainingConfig {
        let mut cfg = TrainingConfig::default();
        cfg.vocab_size = 24;
        cfg.d_model = 8;
        cfg.n_heads = 2;
        cfg.d_ff = 16;
        cfg.n_layers = 1;
        cfg.max_seq_len = 6;
        cfg.batch_size = 2;
        cfg.seq_len = 4;
        cfg
    }

    #[test]
    fn sphere_sym_group_is_sphere_id_mod_twelve() {
        let sphere = SphereContext::new(13);
        assert_eq!(sphere.sym_group, 1);
    }

    #[test]
    fn process_batch_accumulates_gradient_and_metrics() {
        let cfg = small_config();
        let model = Model::new(&cfg).unwrap();
        let lattice = LatticeTable::build(cfg.vocab_size).unwrap();
        let batch = Batch {
            input_ids: vec![0, 1, 2, 3, 4, 5, 6, 7],
            target_ids: vec![1, 2, 3, 4, 5, 6, 7, 8],
            mask: vec![1; 8],
            batch_size: 2,
            seq_len: 4,
        };
        let counters = SphereCounters::new();
        let mut grad = ModelGradients::zeros_like(&model.shape);

        process_batch(&model, &lattice, &batch, &cfg, &mut grad, &counters).unwrap();

        assert!(grad.all_finite());
        assert!(grad.global_l2_norm() > 0.0);
        let snap = counters.snapshot(0, 0);
        assert_eq!(snap.batches_processed, 1);
        assert_eq!(snap.valid_positions, 8);
    }

    #[test]
    fn fully_padded_batch_contributes_nothing() {
        let cfg = small_config();
        let model = Model::new(&cfg).unwrap();
        let lattice = LatticeTable::build(cfg.vocab_size).unwrap();
        let batch = Batch {
            input_ids: vec![0; 8],
            target_ids: vec![0; 8],
            mask: vec![0; 8],
            batch_size: 2,
            seq_len: 4,
        };
        let counters = SphereCounters::new();
        let mut grad = ModelGradients::zeros_like(&model.shape);

        process_batch(&model, &lattice, &batch, &cfg, &mut grad, &counters).unwrap();

        assert_eq!(grad.global_l2_norm(), 0.0);
        let snap = counters.snapshot(0, 0);
        assert_eq!(snap.batches_processed, 1);
        assert_eq!(snap.valid_positions, 0);
    }
}
