//! The model: parameter storage, initialization, and shape bookkeeping.
//!
//! A [`Model`] owns every parameter block listed in the data model: token
//! embeddings, per-layer attention and feed-forward weights, per-layer and
//! final layer-norm scale/shift, and (unless weight-tied) a separate output
//! projection. Nothing here runs a forward or backward pass — see
//! [`crate::forward`] and [`crate::backward`] — this module is purely
//! "what a model *is*".

pub mod io;

use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::config::TrainingConfig;
use crate::error::{TrainingError, TrainingResult};
use crate::tensor::Mat;

/// One transformer block's worth of parameters.
#[derive(Debug, Clone)]
pub struct LayerWeights {
    pub wq: Mat,
    pub wk: Mat,
    pub wv: Mat,
    pub wo: Mat,
    pub ffn_w1: Mat,
    pub ffn_b1: Vec<f32>,
    pub ffn_w2: Mat,
    pub ffn_b2: Vec<f32>,
    pub ln1_gamma: Vec<f32>,
    pub ln1_beta: Vec<f32>,
    pub ln2_gamma: Vec<f32>,
    pub ln2_beta: Vec<f32>,
}

/// Shape constants that must agree between a config and a serialized
/// model before [`io::load`] will accept the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelShape {
    pub vocab_size: usize,
    pub d_model: usize,
    pub n_heads: usize,
    pub d_ff: usize,
    pub n_layers: usize,
    pub max_seq_len: usize,
    pub tie_output_embedding: bool,
}

/// The full set of trainable parameters.
///
/// Every field is always present — there is no NULL/absent parameter
/// block. A model that should not have a separate output projection simply
/// sets `output_proj` to `None`, which is a normal, checked tagged variant,
/// not an uninitialized pointer.
#[derive(Debug, Clone)]
pub struct Model {
    pub shape: ModelShape,
    pub embedding: Mat,
    pub layers: Vec<LayerWeights>,
    pub ln_final_gamma: Vec<f32>,
    pub ln_final_beta: Vec<f32>,
    pub output_proj: Option<Mat>,
}

impl Model {
    /// Allocates and randomly initializes every parameter block per
    /// `config`. Uses Xavier/Glorot initialization for matrices (scaled by
    /// fan-in/fan-out), ones/zeros for layer-norm scale/shift, seeded from
    /// `config.rng_seed` so two calls with the same config and seed produce
    /// bit-identical parameters.
    pub fn new(config: &TrainingConfig) -> TrainingResult<Self> {
        config.validate()?;
        let mut rng = rand::rngs::StdRng::seed_from_u64(config.rng_seed);

        let embedding = xavier(&mut rng, config.vocab_size, config.d_model)?;

        let mut layers = Vec::with_capacity(config.n_layers);
        for _ in 0..config.n_layers {
            layers.push(LayerWeights {
                wq: xavier(&mut rng, config.d_model, config.d_model)?,
                wk: xavier(&mut rng, config.d_model, config.d_model)?,
                wv: xavier(&mut rng, config.d_model, config.d_model)?,
                wo: xavier(&mut rng, config.d_model, config.d_model)?,
                ffn_w1: xavier(&mut rng, config.d_model, config.d_ff)?,
                ffn_b1: vec![0.0; config.d_ff],
                ffn_w2: xavier(&mut rng, config.d_ff, config.d_model)?,
                ffn_b2: vec![0.0; config.d_model],
                ln1_gamma: vec![1.0; config.d_model],
                ln1_beta: vec![0.0; config.d_model],
                ln2_gamma: vec![1.0; config.d_model],
                ln2_beta: vec![0.0; config.d_model],
            });
        }

        let output_proj = if config.tie_output_embedding {
            None
        } else {
            Some(xavier(&mut rng, config.d_model, config.vocab_size)?)
        };

        Ok(Model {
            shape: ModelShape {
                vocab_size: config.vocab_size,
                d_model: config.d_model,
                n_heads: config.n_heads,
                d_ff: config.d_ff,
                n_layers: config.n_layers,
                max_seq_len: config.max_seq_len,
                tie_output_embedding: config.tie_output_embedding,
            },
            embedding,
            layers,
            ln_final_gamma: vec![1.0; config.d_model],
            ln_final_beta: vec![0.0; config.d_model],
            output_proj,
        })
    }

    /// Total scalar parameter count across every block, including biases
    /// and layer-norm scale/shift. Used to size the gradient buffer.
    pub fn num_parameters(&self) -> usize {
        let mut total = self.embedding.data.len();
        for layer in &self.layers {
            total += layer.wq.data.len()
                + layer.wk.data.len()
                + layer.wv.data.len()
                + layer.wo.data.len()
                + layer.ffn_w1.data.len()
                + layer.ffn_b1.len()
                + layer.ffn_w2.data.len()
                + layer.ffn_b2.len()
                + layer.ln1_gamma.len()
                + layer.ln1_beta.len()
                + layer.ln2_gamma.len()
                + layer.ln2_beta.len();
        }
        total += self.ln_final_gamma.len() + self.ln_final_beta.len();
        if let Some(proj) = &self.output_proj {
            total += proj.data.len();
        }
        total
    }
}

/// A gradient for every parameter block [`Model`] owns, same shapes,
/// always fully present and always zero-initialized rather than absent.
/// [`crate::backward::backward`] accumulates into one of these; the
/// scheduler keeps one per sphere and sums them at the epoch barrier (see
/// [`crate::scheduler::gradient::GradientBuffer`]); the optimizer consumes
/// the summed result.
#[derive(Debug, Clone)]
pub struct ModelGradients {
    pub embedding: Mat,
    pub layers: Vec<LayerGradients>,
    pub ln_final_gamma: Vec<f32>,
    pub ln_final_beta: Vec<f32>,
    pub output_proj: Option<Mat>,
}

/// Gradient counterpart of [`LayerWeights`].
#[derive(Debug, Clone)]
pub struct LayerGradients {
    pub wq: Mat,
    pub wk: Mat,
    pub wv: Mat,
    pub wo: Mat,
    pub ffn_w1: Mat,
    pub ffn_b1: Vec<f32>,
    pub ffn_w2: Mat,
    pub ffn_b2: Vec<f32>,
    pub ln1_gamma: Vec<f32>,
    pub ln1_beta: Vec<f32>,
    pub ln2_gamma: Vec<f32>,
    pub ln2_beta: Vec<f32>,
}

impl ModelGradients {
    /// Builds a zeroed gradient matching `shape`.
    pub fn zeros_like(shape: &ModelShape) -> Self {
        let layers = (0..shape.n_layers)
            .map(|_| LayerGradients {
                wq: Mat::zeros(shape.d_model, shape.d_model),
                wk: Mat::zeros(shape.d_model, shape.d_model),
                wv: Mat::zeros(shape.d_model, shape.d_model),
                wo: Mat::zeros(shape.d_model, shape.d_model),
                ffn_w1: Mat::zeros(shape.d_model, shape.d_ff),
                ffn_b1: vec![0.0; shape.d_ff],
                ffn_w2: Mat::zeros(shape.d_ff, shape.d_model),
                ffn_b2: vec![0.0; shape.d_model],
                ln1_gamma: vec![0.0; shape.d_model],
                ln1_beta: vec![0.0; shape.d_model],
                ln2_gamma: vec![0.0; shape.d_model],
                ln2_beta: vec![0.0; shape.d_model],
            })
            .collect();
        ModelGradients {
            embedding: Mat::zeros(shape.vocab_size, shape.d_model),
            layers,
            ln_final_gamma: vec![0.0; shape.d_model],
            ln_final_beta: vec![0.0; shape.d_model],
            output_proj: if shape.tie_output_embedding {
                None
            } else {
                Some(Mat::zeros(shape.d_model, shape.vocab_size))
            },
        }
    }

    /// Zeroes every element in place, reusing the existing allocation —
    /// called once per epoch rather than reallocating.
    pub fn zero(&mut self) {
        self.embedding.data.iter_mut().for_each(|v| *v = 0.0);
        for layer in self.layers.iter_mut() {
            for v in layer.wq.data.iter_mut() {
                *v = 0.0;
            }
            for v in layer.wk.data.iter_mut() {
                *v = 0.0;
            }
            for v in layer.wv.data.iter_mut() {
                *v = 0.0;
            }
            for v in layer.wo.data.iter_mut() {
                *v = 0.0;
            }
            for v in layer.ffn_w1.data.iter_mut() {
                *v = 0.0;
            }
            for v in layer.ffn_w2.data.iter_mut() {
                *v = 0.0;
            }
            layer.ffn_b1.iter_mut().for_each(|v| *v = 0.0);
            layer.ffn_b2.iter_mut().for_each(|v| *v = 0.0);
            layer.ln1_gamma.iter_mut().for_each(|v| *v = 0.0);
            layer.ln1_beta.iter_mut().for_each(|v| *v = 0.0);
            layer.ln2_gamma.iter_mut().for_each(|v| *v = 0.0);
            layer.ln2_beta.iter_mut().for_each(|v| *v = 0.0);
        }
        self.ln_final_gamma.iter_mut().for_each(|v| *v = 0.0);
        self.ln_final_beta.iter_mut().for_each(|v| *v = 0.0);
        if let Some(proj) = self.output_proj.as_mut() {
            proj.data.iter_mut().for_each(|v| *v = 0.0);
        }
    }

    /// Adds `other` into `self` elementwise. Used to sum one sphere's
    /// contribution into the running total at the epoch barrier.
    pub fn accumulate_from(&mut self, other: &ModelGradients) {
        crate::tensor::simd::add_into(&self.embedding.data.clone(), &other.embedding.data, &mut self.embedding.data);
        for (dst, src) in self.layers.iter_mut().zip(other.layers.iter()) {
            add_assign(&mut dst.wq.data, &src.wq.data);
            add_assign(&mut dst.wk.data, &src.wk.data);
            add_assign(&mut dst.wv.data, &src.wv.data);
            add_assign(&mut dst.wo.data, &src.wo.data);
            add_assign(&mut dst.ffn_w1.data, &src.ffn_w1.data);
            add_assign(&mut dst.ffn_w2.data, &src.ffn_w2.data);
            add_assign(&mut dst.ffn_b1, &src.ffn_b1);
            add_assign(&mut dst.ffn_b2, &src.ffn_b2);
            add_assign(&mut dst.ln1_gamma, &src.ln1_gamma);
            add_assign(&mut dst.ln1_beta, &src.ln1_beta);
            add_assign(&mut dst.ln2_gamma, &src.ln2_gamma);
            add_assign(&mut dst.ln2_beta, &src.ln2_beta);
        }
        add_assign(&mut self.ln_final_gamma, &other.ln_final_gamma);
        add_assign(&mut self.ln_final_beta, &other.ln_final_beta);
        if let (Some(dst), Some(src)) = (self.output_proj.as_mut(), other.output_proj.as_ref()) {
            add_assign(&mut dst.data, &src.data);
        }
    }

    /// Global L2 norm across every gradient element, used for clipping.
    pub fn global_l2_norm(&self) -> f32 {
        let mut sum_sq = crate::tensor::simd::sum_of_squares(&self.embedding.data);
        for layer in &self.layers {
            sum_sq += crate::tensor::simd::sum_of_squares(&layer.wq.data);
            sum_sq += crate::tensor::simd::sum_of_squares(&layer.wk.data);
            sum_sq += crate::tensor::simd::sum_of_squares(&layer.wv.data);
            sum_sq += crate::tensor::simd::sum_of_squares(&layer.wo.data);
            sum_sq += crate::tensor::simd::sum_of_squares(&layer.ffn_w1.data);
            sum_sq += crate::tensor::simd::sum_of_squares(&layer.ffn_w2.data);
            sum_sq += crate::tensor::simd::sum_of_squares(&layer.ffn_b1);
            sum_sq += crate::tensor::simd::sum_of_squares(&layer.ffn_b2);
            sum_sq += crate::tensor::simd::sum_of_squares(&layer.ln1_gamma);
            sum_sq += crate::tensor::simd::sum_of_squares(&layer.ln1_beta);
            sum_sq += crate::tensor::simd::sum_of_squares(&layer.ln2_gamma);
            sum_sq += crate::tensor::simd::sum_of_squares(&layer.ln2_beta);
        }
        sum_sq += crate::tensor::simd::sum_of_squares(&self.ln_final_gamma);
        sum_sq += crate::tensor::simd::sum_of_squares(&self.ln_final_beta);
        if let Some(proj) = &self.output_proj {
            sum_sq += crate::tensor::simd::sum_of_squares(&proj.data);
        }
        sum_sq.sqrt()
    }

    /// Scales every gradient element by `factor`, used by clipping.
    pub fn scale_all(&mut self, factor: f32) {
        crate::tensor::simd::scale_in_place(&mut self.embedding.data, factor);
        for layer in self.layers.iter_mut() {
            crate::tensor::simd::scale_in_place(&mut layer.wq.data, factor);
            crate::tensor::simd::scale_in_place(&mut layer.wk.data, factor);
            crate::tensor::simd::scale_in_place(&mut layer.wv.data, factor);
            crate::tensor::simd::scale_in_place(&mut layer.wo.data, factor);
            crate::tensor::simd::scale_in_place(&mut layer.ffn_w1.data, factor);
            crate::tensor::simd::scale_in_place(&mut layer.ffn_w2.data, factor);
            crate::tensor::simd::scale_in_place(&mut layer.ffn_b1, factor);
            crate::tensor::simd::scale_in_place(&mut layer.ffn_b2, factor);
            crate::tensor::simd::scale_in_place(&mut layer.ln1_gamma, factor);
            crate::tensor::simd::scale_in_place(&mut layer.ln1_beta, factor);
            crate::tensor::simd::scale_in_place(&mut layer.ln2_gamma, factor);
            crate::tensor::simd::scale_in_place(&mut layer.ln2_beta, factor);
        }
        crate::tensor::simd::scale_in_place(&mut self.ln_final_gamma, factor);
        crate::tensor::simd::scale_in_place(&mut self.ln_final_beta, factor);
        if let Some(proj) = self.output_proj.as_mut() {
            crate::tensor::simd::scale_in_place(&mut proj.data, factor);
        }
    }

    /// True if every gradient element is finite; a `false` here triggers
    /// [`TrainingError::NonFiniteGradient`] and a skipped optimizer step.
    pub fn all_finite(&self) -> bool {
        let mut all = self.embedding.data.iter().all(|v| v.is_finite());
        for layer in &self.layers {
            all &= layer.wq.data.iter().all(|v| v.is_finite());
            all &= layer.wk.data.iter().all(|v| v.is_finite());
            all &= layer.wv.data.iter().all(|v| v.is_finite());
            all &= layer.wo.data.iter().all(|v| v.is_finite());
            all &= layer.ffn_w1.data.iter().all(|v| v.is_finite());
            all &= layer.ffn_w2.data.iter().all(|v| v.is_finite());
            all &= layer.ffn_b1.iter().all(|v| v.is_finite());
            all &= layer.ffn_b2.iter().all(|v| v.is_finite());
            all &= layer.ln1_gamma.iter().all(|v| v.is_finite());
            all &= layer.ln1_beta.iter().all(|v| v.is_finite());
            all &= layer.ln2_gamma.iter().all(|v| v.is_finite());
            all &= layer.ln2_beta.iter().all(|v| v.is_finite());
        }
        all &= self.ln_final_gamma.iter().all(|v| v.is_finite());
        all &= self.ln_final_beta.iter().all(|v| v.is_finite());
        if let Some(proj) = &self.output_proj {
            all &= proj.data.iter().all(|v| v.is_finite());
        }
        all
    }
}

fn add_assign(dst: &mut [f32], src: &[f32]) {
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d += s;
    }
}

fn xavier(rng: &mut impl rand::RngCore, fan_in: usize, fan_out: usize) -> TrainingResult<Mat> {
    let std_dev = (2.0 / (fan_in + fan_out) as f64).sqrt();
    let normal = Normal::new(0.0, std_dev)
        .map_err(|e| TrainingError::InvalidConfig(format!("xavier init: {e}")))?;
    let mut data = Vec::new();
    data.try_reserve(fan_in * fan_out)
        .map_err(|e| TrainingError::AllocationFailure(e.to_string()))?;
    for _ in 0..(fan_in * fan_out) {
        data.push(normal.sample(rng) as f32);
    }
    Ok(Mat {
        rows: fan_in,
        cols: fan_out,
        data,
    })
}
