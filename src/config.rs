//! Validated configuration for a training run.

use serde::{Deserialize, Serialize};

use crate::error::{TrainingError, TrainingResult};

/// All knobs needed to construct a [`crate::model::Model`], a
/// [`crate::lattice::LatticeTable`], and a [`crate::scheduler::Scheduler`].
///
/// Every field has a default (see [`Default`]); callers normally start from
/// `TrainingConfig::default()` and override what they need, then call
/// [`TrainingConfig::validate`] — which [`crate::handle::train`] does for you
/// before any allocation happens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    // ─── Model shape ──────────────────────────────────────────────
    pub vocab_size: usize,
    pub d_model: usize,
    pub n_heads: usize,
    pub d_ff: usize,
    pub n_layers: usize,
    pub max_seq_len: usize,
    pub tie_output_embedding: bool,

    // ─── Batching ──────────────────────────────────────────────────
    pub batch_size: usize,
    pub seq_len: usize,
    pub drop_last: bool,
    pub shuffle: bool,
    pub rng_seed: u64,

    // ─── Training loop ─────────────────────────────────────────────
    pub epochs: usize,
    pub max_batches_per_epoch: usize,
    pub checkpoint_every_epochs: usize,

    // ─── Optimizer ──────────────────────────────────────────────────
    pub base_lr: f32,
    pub min_lr_ratio: f32,
    pub warmup_steps: u64,
    pub total_steps: u64,
    pub weight_decay: f32,
    pub max_grad_norm: f32,
    pub adam_beta1: f32,
    pub adam_beta2: f32,
    pub adam_epsilon: f32,

    // ─── Crystalline loss ───────────────────────────────────────────
    pub lambda_prime: f32,
    pub lambda_lattice: f32,
    pub loss_top_k: usize,

    // ─── Concurrency ─────────────────────────────────────────────────
    /// 0 means "auto": `max(1, available_parallelism - 1)`.
    pub num_threads: usize,
    pub thread_stack_bytes: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            vocab_size: 32_000,
            d_model: 256,
            n_heads: 8,
            d_ff: 1024,
            n_layers: 6,
            max_seq_len: 512,
            tie_output_embedding: true,

            batch_size: 32,
            seq_len: 128,
            drop_last: true,
            shuffle: true,
            rng_seed: 0,

            epochs: 1,
            max_batches_per_epoch: 1_000_000,
            checkpoint_every_epochs: 0,

            base_lr: 3e-4,
            min_lr_ratio: 0.1,
            warmup_steps: 1000,
            total_steps: 100_000,
            weight_decay: 0.01,
            max_grad_norm: 1.0,
            adam_beta1: 0.9,
            adam_beta2: 0.999,
            adam_epsilon: 1e-8,

            lambda_prime: 0.3,
            lambda_lattice: 0.2,
            loss_top_k: 8,

            num_threads: 0,
            thread_stack_bytes: 1 << 20,
        }
    }
}

impl TrainingConfig {
    /// Checks every shape and range invariant the rest of the engine
    /// assumes holds. Called by [`crate::handle::train`] before any
    /// allocation; never skip it when constructing a config by hand.
    pub fn validate(&self) -> TrainingResult<()> {
        if self.vocab_size == 0 {
            return Err(TrainingError::InvalidConfig(
                "vocab_size must be > 0".into(),
            ));
        }
        if self.d_model == 0 || self.n_heads == 0 {
            return Err(TrainingError::InvalidConfig(
                "d_model and n_heads must be > 0".into(),
            ));
        }
        if self.d_model % self.n_heads != 0 {
            return Err(TrainingError::InvalidConfig(format!(
                "d_model ({}) must be divisible by n_heads ({})",
                self.d_model, self.n_heads
            )));
        }
        if self.d_ff == 0 {
            return Err(TrainingError::InvalidConfig("d_ff must be > 0".into()));
        }
        if self.n_layers == 0 {
            return Err(TrainingError::InvalidConfig(
                "n_layers must be > 0".into(),
            ));
        }
        if self.batch_size == 0 || self.seq_len == 0 {
            return Err(TrainingError::InvalidConfig(
                "batch_size and seq_len must be > 0".into(),
            ));
        }
        if self.seq_len > self.max_seq_len {
            return Err(TrainingError::InvalidConfig(format!(
                "seq_len ({}) exceeds max_seq_len ({})",
                self.seq_len, self.max_seq_len
            )));
        }
        if !(0.0..=1.0).contains(&self.lambda_prime) {
            return Err(TrainingError::InvalidConfig(
                "lambda_prime must be in [0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.lambda_lattice) {
            return Err(TrainingError::InvalidConfig(
                "lambda_lattice must be in [0, 1]".into(),
            ));
        }
        if self.loss_top_k == 0 || self.loss_top_k > self.vocab_size {
            return Err(TrainingError::InvalidConfig(format!(
                "loss_top_k ({}) must be in [1, vocab_size]",
                self.loss_top_k
            )));
        }
        if self.base_lr <= 0.0 {
            return Err(TrainingError::InvalidConfig(
                "base_lr must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_lr_ratio) {
            return Err(TrainingError::InvalidConfig(
                "min_lr_ratio must be in [0, 1]".into(),
            ));
        }
        if self.max_grad_norm <= 0.0 {
            return Err(TrainingError::InvalidConfig(
                "max_grad_norm must be > 0".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.adam_beta1) || !(0.0..1.0).contains(&self.adam_beta2) {
            return Err(TrainingError::InvalidConfig(
                "adam_beta1 and adam_beta2 must be in [0, 1)".into(),
            ));
        }
        if self.thread_stack_bytes < 64 * 1024 {
            return Err(TrainingError::InvalidConfig(
                "thread_stack_bytes is too small to be usable".into(),
            ));
        }
        Ok(())
    }

    /// Resolves `num_threads == 0` ("auto") to a concrete worker count.
    pub fn resolved_thread_count(&self) -> usize {
        if self.num_threads > 0 {
            self.num_threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get().saturating_sub(1).max(1))
                .unwrap_or(1)
        }
    }

    pub fn head_dim(&self) -> usize {
        self.d_model / self.n_heads
    }
}
