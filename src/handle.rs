//! The public entry point: [`train`] wires a [`TrainingConfig`] up into a
//! [`TrainingHandle`] the caller drives one epoch at a time.

use std::io::{BufReader, BufWriter};
use std::path::Path;

use tracing::info;

use crate::batch::BatchIterator;
use crate::config::TrainingConfig;
use crate::error::{TrainingError, TrainingResult};
use crate::lattice::LatticeTable;
use crate::model::{self, Model};
use crate::optimizer::Optimizer;
use crate::scheduler::metrics::{MetricsSnapshot, SphereStats};
use crate::scheduler::Scheduler;

/// What happened during one call to [`TrainingHandle::step_epoch`].
#[derive(Debug, Clone)]
pub struct EpochReport {
    pub epoch: u64,
    pub step: u64,
    pub batches_processed: u64,
    pub loss: f32,
    pub grad_norm: f32,
    pub lr: f32,
    /// The optimizer step was skipped because the reduced gradient (or
    /// the reported loss) was non-finite. Training may continue.
    pub skipped: bool,
    pub cancelled: bool,
    pub per_sphere: Vec<SphereStats>,
}

/// Owns everything a training run needs between epochs: the model, the
/// token geometry, the batch stream, the optimizer state, and the
/// sphere scheduler. Call [`TrainingHandle::step_epoch`] repeatedly —
/// typically `config.epochs` times — to drive training forward.
pub struct TrainingHandle {
    config: TrainingConfig,
    model: Model,
    lattice: LatticeTable,
    batches: BatchIterator,
    optimizer: Optimizer,
    scheduler: Scheduler,
    epochs_run: u64,
}

impl TrainingHandle {
    /// Validates `config`, builds the lattice table, a freshly initialized
    /// model, and the sphere scheduler, and wraps the token stream in a
    /// [`BatchIterator`]. No allocation happens until `validate` passes.
    pub fn new(config: TrainingConfig, tokens: Vec<u32>) -> TrainingResult<Self> {
        config.validate()?;
        let model = Model::new(&config)?;
        Self::from_model(config, tokens, model)
    }

    /// Like [`TrainingHandle::new`], but resumes training on an existing
    /// model (e.g. one loaded via [`crate::model::io::load`]) instead of
    /// initializing fresh weights. `model`'s shape must already agree with
    /// `config` — callers that load from disk enforce this via
    /// [`crate::model::ModelShape`] equality at load time.
    pub fn from_model(config: TrainingConfig, tokens: Vec<u32>, model: Model) -> TrainingResult<Self> {
        config.validate()?;
        let expected_shape = model::ModelShape {
            vocab_size: config.vocab_size,
            d_model: config.d_model,
            n_heads: config.n_heads,
            d_ff: config.d_ff,
            n_layers: config.n_layers,
            max_seq_len: config.max_seq_len,
            tie_output_embedding: config.tie_output_embedding,
        };
        if model.shape != expected_shape {
            return Err(TrainingError::InvalidConfig(
                "model shape does not match training config".into(),
            ));
        }

        let lattice = LatticeTable::build(config.vocab_size)?;
        let batches = BatchIterator::new(
            tokens,
            config.batch_size,
            config.seq_len,
            config.drop_last,
            config.shuffle,
            config.rng_seed,
        );
        let optimizer = Optimizer::new(&model.shape, &config);
        let scheduler = Scheduler::new(&model.shape, &config);

        info!(
            n_spheres = scheduler.n_spheres(),
            vocab_size = config.vocab_size,
            d_model = config.d_model,
            "training handle constructed"
        );

        Ok(TrainingHandle {
            config,
            model,
            lattice,
            batches,
            optimizer,
            scheduler,
            epochs_run: 0,
        })
    }

    /// Runs one epoch over the full token stream: resets the batch
    /// iterator, dispatches every window across the sphere pool, reduces
    /// gradients, and applies one optimizer step (unless cancelled,
    /// poisoned, or non-finite — see [`crate::scheduler::Scheduler::run_epoch`]).
    pub fn step_epoch(&mut self) -> TrainingResult<EpochReport> {
        self.epochs_run += 1;
        self.scheduler.run_epoch(
            &mut self.model,
            &self.lattice,
            &mut self.batches,
            &mut self.optimizer,
            &self.config,
        )
    }

    /// Runs `self.config.epochs` epochs back to back, stopping early if
    /// any epoch returns an error other than a recoverable skip.
    pub fn run(&mut self) -> TrainingResult<Vec<EpochReport>> {
        let mut reports = Vec::with_capacity(self.config.epochs);
        for _ in 0..self.config.epochs {
            reports.push(self.step_epoch()?);
        }
        Ok(reports)
    }

    /// Requests cooperative cancellation. The epoch in progress (if any)
    /// will return `Err(TrainingError::Cancelled)` without applying its
    /// optimizer step; the model is left exactly as it was.
    pub fn cancel(&self) {
        self.scheduler.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.scheduler.is_cancelled()
    }

    /// The most recently published metrics snapshot (empty before the
    /// first completed epoch).
    pub fn snapshot_metrics(&self) -> MetricsSnapshot {
        self.scheduler.last_snapshot()
    }

    pub fn epochs_run(&self) -> u64 {
        self.epochs_run
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// True when `config.checkpoint_every_epochs` says a checkpoint should
    /// be written after the epoch that just completed.
    pub fn should_checkpoint(&self) -> bool {
        self.config.checkpoint_every_epochs > 0
            && self.epochs_run % self.config.checkpoint_every_epochs as u64 == 0
    }

    /// Serializes the current model to `path` in the crate's bit-exact
    /// binary format (see [`crate::model::io`]).
    pub fn save_checkpoint(&self, path: &Path) -> TrainingResult<()> {
        let file = std::fs::File::create(path).map_err(|source| TrainingError::IoError {
            path: path.to_path_buf(),
            source,
        })?;
        let mut writer = BufWriter::new(file);
        model::io::save(&self.model, &mut writer)
    }

    /// Loads a checkpoint from `path`, validating its shape against
    /// `config`, and wraps it in a fresh [`TrainingHandle`] over `tokens`.
    pub fn load_checkpoint(config: TrainingConfig, tokens: Vec<u32>, path: &Path) -> TrainingResult<Self> {
        let shape = model::ModelShape {
            vocab_size: config.vocab_size,
            d_model: config.d_model,
            n_heads: config.n_heads,
            d_ff: config.d_ff,
            n_layers: config.n_layers,
            max_seq_len: config.max_seq_len,
            tie_output_embedding: config.tie_output_embedding,
        };
        let file = std::fs::File::open(path).map_err(|source| TrainingError::IoError {
            path: path.to_path_buf(),
            source,
        })?;
        let mut reader = BufReader::new(file);
        let model = model::io::load(&mut reader, shape)?;
        Self::from_model(config, tokens, model)
    }
}

/// Validates `config`, builds a freshly initialized model, and returns a
/// [`TrainingHandle`] ready to drive with [`TrainingHandle::step_epoch`].
pub fn train(config: TrainingConfig, tokens: Vec<u32>) -> TrainingResult<TrainingHandle> {
    TrainingHandle::new(config, tokens)
}
