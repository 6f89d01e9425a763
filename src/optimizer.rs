//! Adam with decoupled weight decay, gradient clipping, and a
//! linear-warmup + cosine-decay learning-rate schedule.
//!
//! One [`AdamState`] mirrors [`ModelGradients`]'s shape exactly (first and
//! second moment per parameter) so the optimizer step never needs to
//! allocate or look anything up by name — it walks the same block order
//! the model and gradient buffer do (§3.1).

use tracing::warn;

use crate::error::{TrainingError, TrainingResult};
use crate::model::{LayerGradients, LayerWeights, Model, ModelGradients, ModelShape};

/// First and second moment buffers for one parameter block, same shape as
/// its [`LayerWeights`] counterpart.
#[derive(Debug, Clone)]
struct LayerMoments {
    wq: (Vec<f32>, Vec<f32>),
    wk: (Vec<f32>, Vec<f32>),
    wv: (Vec<f32>, Vec<f32>),
    wo: (Vec<f32>, Vec<f32>),
    ffn_w1: (Vec<f32>, Vec<f32>),
    ffn_b1: (Vec<f32>, Vec<f32>),
    ffn_w2: (Vec<f32>, Vec<f32>),
    ffn_b2: (Vec<f32>, Vec<f32>),
    ln1_gamma: (Vec<f32>, Vec<f32>),
    ln1_beta: (Vec<f32>, Vec<f32>),
    ln2_gamma: (Vec<f32>, Vec<f32>),
    ln2_beta: (Vec<f32>, Vec<f32>),
}

fn zero_pair(len: usize) -> (Vec<f32>, Vec<f32>) {
    (vec![0.0; len], vec![0.0; len])
}

impl LayerMoments {
    fn zeros(shape: &ModelShape) -> Self {
        LayerMoments {
            wq: zero_pair(shape.d_model * shape.d_model),
            wk: zero_pair(shape.d_model * shape.d_model),
            wv: zero_pair(shape.d_model * shape.d_model),
            wo: zero_pair(shape.d_model * shape.d_model),
            ffn_w1: zero_pair(shape.d_model * shape.d_ff),
            ffn_b1: zero_pair(shape.d_ff),
            ffn_w2: zero_pair(shape.d_ff * shape.d_model),
            ffn_b2: zero_pair(shape.d_model),
            ln1_gamma: zero_pair(shape.d_model),
            ln1_beta: zero_pair(shape.d_model),
            ln2_gamma: zero_pair(shape.d_model),
            ln2_beta: zero_pair(shape.d_model),
        }
    }
}

/// Adam moment state for every parameter block the [`Model`] owns, plus
/// the step counter the learning-rate schedule and bias correction need.
pub struct AdamState {
    step: u64,
    embedding: (Vec<f32>, Vec<f32>),
    layers: Vec<LayerMoments>,
    ln_final_gamma: (Vec<f32>, Vec<f32>),
    ln_final_beta: (Vec<f32>, Vec<f32>),
    output_proj: Option<(Vec<f32>, Vec<f32>)>,
}

impl AdamState {
    pub fn new(shape: &ModelShape) -> Self {
        AdamState {
            step: 0,
            embedding: zero_pair(shape.vocab_size * shape.d_model),
            layers: (0..shape.n_layers).map(|_| LayerMoments::zeros(shape)).collect(),
            ln_final_gamma: zero_pair(shape.d_model),
            ln_final_beta: zero_pair(shape.d_model),
            output_proj: if shape.tie_output_embedding {
                None
            } else {
                Some(zero_pair(shape.d_model * shape.vocab_size))
            },
        }
    }

    pub fn step(&self) -> u64 {
        self.step
    }
}

/// Result of one [`Optimizer::step`] call.
#[derive(Debug, Clone, Copy)]
pub struct OptimizerStepReport {
    pub applied: bool,
    pub grad_norm: f32,
    pub lr: f32,
}

/// Adam with decoupled weight decay (AdamW), gradient clipping by global
/// L2 norm, and a linear-warmup + cosine-decay schedule, applied over
/// every parameter block [`Model`] owns.
pub struct Optimizer {
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: f32,
    max_grad_norm: f32,
    base_lr: f32,
    min_lr_ratio: f32,
    warmup_steps: u64,
    total_steps: u64,
    state: AdamState,
}

impl Optimizer {
    pub fn new(shape: &ModelShape, config: &crate::config::TrainingConfig) -> Self {
        Optimizer {
            beta1: config.adam_beta1,
            beta2: config.adam_beta2,
            epsilon: config.adam_epsilon,
            weight_decay: config.weight_decay,
            max_grad_norm: config.max_grad_norm,
            base_lr: config.base_lr,
            min_lr_ratio: config.min_lr_ratio,
            warmup_steps: config.warmup_steps,
            total_steps: config.total_steps,
            state: AdamState::new(shape),
        }
    }

    pub fn step_count(&self) -> u64 {
        self.state.step
    }

    /// The learning-rate schedule: linear warmup over `warmup_steps`, then
    /// cosine decay to `min_lr_ratio * base_lr` by `total_steps`.
    fn learning_rate(&self, step: u64) -> f32 {
        if self.warmup_steps > 0 && step < self.warmup_steps {
            return self.base_lr * (step as f32 + 1.0) / self.warmup_steps as f32;
        }
        let total = self.total_steps.max(self.warmup_steps + 1);
        let progress = ((step.saturating_sub(self.warmup_steps)) as f32
            / (total - self.warmup_steps).max(1) as f32)
            .min(1.0);
        let cosine = 0.5 * (1.0 + (std::f32::consts::PI * progress).cos());
        let floor = self.min_lr_ratio;
        self.base_lr * (floor + (1.0 - floor) * cosine)
    }

    /// Clips `grad`'s global L2 norm to `max_grad_norm` in place, returning
    /// the norm it had before clipping.
    fn clip(&self, grad: &mut ModelGradients) -> f32 {
        let norm = grad.global_l2_norm();
        if norm > self.max_grad_norm && norm.is_finite() {
            grad.scale_all(self.max_grad_norm / norm);
        }
        norm
    }

    /// One optimizer call: clip, compute the scheduled learning rate,
    /// apply the Adam+weight-decay update to every block, then the caller
    /// is expected to zero `grad` for the next epoch (§4.F step 4 — done
    /// by the scheduler via [`crate::model::ModelGradients::zero`], not
    /// here, since zeroing is an epoch-boundary concern rather than an
    /// optimizer one).
    ///
    /// Returns `NonFiniteGradient` without mutating `model` or advancing
    /// the step counter if any gradient element is non-finite — the
    /// recoverable step-skip §4.F/§7 describes.
    pub fn step(&mut self, model: &mut Model, grad: &ModelGradients) -> TrainingResult<OptimizerStepReport> {
        if !grad.all_finite() {
            warn!(step = self.state.step, "non-finite gradient, skipping optimizer step");
            return Err(TrainingError::NonFiniteGradient {
                step: self.state.step,
                detail: "one or more gradient blocks contained NaN/Inf".into(),
            });
        }

        let mut grad = grad.clone();
        let norm = self.clip(&mut grad);

        self.state.step += 1;
        let lr = self.learning_rate(self.state.step - 1);
        let t = self.state.step;

        adam_update(
            &mut model.embedding.data,
            &grad.embedding.data,
            &mut self.state.embedding,
            lr,
            self.beta1,
            self.beta2,
            self.epsilon,
            self.weight_decay,
            t,
        );

        for ((layer, lg), lm) in model
            .layers
            .iter_mut()
            .zip(grad.layers.iter())
            .zip(self.state.layers.iter_mut())
        {
            update_layer(layer, lg, lm, lr, self.beta1, self.beta2, self.epsilon, self.weight_decay, t);
        }

        adam_update(
            &mut model.ln_final_gamma,
            &grad.ln_final_gamma,
            &mut self.state.ln_final_gamma,
            lr,
            self.beta1,
            self.beta2,
            self.epsilon,
            0.0,
            t,
        );
        adam_update(
            &mut model.ln_final_beta,
            &grad.ln_final_beta,
            &mut self.state.ln_final_beta,
            lr,
            self.beta1,
            self.beta2,
            self.epsilon,
            0.0,
            t,
        );

        if let (Some(proj), Some(gproj), Some(mproj)) = (
            model.output_proj.as_mut(),
            grad.output_proj.as_ref(),
            self.state.output_proj.as_mut(),
        ) {
            adam_update(
                &mut proj.data,
                &gproj.data,
                mproj,
                lr,
                self.beta1,
                self.beta2,
                self.epsilon,
                self.weight_decay,
                t,
            );
        }

        Ok(OptimizerStepReport {
            applied: true,
            grad_norm: norm,
            lr,
        })
    }
}

#[allow(clippy::too_many_arguments)]
fn update_layer(
    layer: &mut LayerWeights,
    grad: &LayerGradients,
    moments: &mut LayerMoments,
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: f32,
    t: u64,
) {
    adam_update(&mut layer.wq.data, &grad.wq.data, &mut moments.wq, lr, beta1, beta2, epsilon, weight_decay, t);
    adam_update(&mut layer.wk.data, &grad.wk.data, &mut moments.wk, lr, beta1, beta2, epsilon, weight_decay, t);
    adam_update(&mut layer.wv.data, &grad.wv.data, &mut moments.wv, lr, beta1, beta2, epsilon, weight_decay, t);
    adam_update(&mut layer.wo.data, &grad.wo.data, &mut moments.wo, lr, beta1, beta2, epsilon, weight_decay, t);
    adam_update(
        &mut layer.ffn_w1.data,
        &grad.ffn_w1.data,
        &mut moments.ffn_w1,
        lr,
        beta1,
        beta2,
        epsilon,
        weight_decay,
        t,
    );
    adam_update(&mut layer.ffn_b1, &grad.ffn_b1, &mut moments.ffn_b1, lr, beta1, beta2, epsilon, 0.0, t);
    adam_update(
        &mut layer.ffn_w2.data,
        &grad.ffn_w2.data,
        &mut moments.ffn_w2,
        lr,
        beta1,
        beta2,
        epsilon,
        weight_decay,
        t,
    );
    adam_update(&mut layer.ffn_b2, &grad.ffn_b2, &mut moments.ffn_b2, lr, beta1, beta2, epsilon, 0.0, t);
    adam_update(&mut layer.ln1_gamma, &grad.ln1_gamma, &mut moments.ln1_gamma, lr, beta1, beta2, epsilon, 0.0, t);
    adam_update(&mut layer.ln1_beta, &grad.ln1_beta, &mut moments.ln1_beta, lr, beta1, beta2, epsilon, 0.0, t);
    adam_update(&mut layer.ln2_gamma, &grad.ln2_gamma, &mut moments.ln2_gamma, lr, beta1, beta2, epsilon, 0.0, t);
    adam_update(&mut layer.ln2_beta, &grad.ln2_beta, &mut moments.ln2_beta, lr, beta1, beta2, epsilon, 0.0, t);
}

/// In-place AdamW update of one parameter block: `m`/`v` are the running
/// moment estimates (mutated), `t` is the 1-indexed step used for bias
/// correction. Weight decay is decoupled (applied directly to the
/// parameter, not folded into the gradient) per Loshchilov & Hutter.
#[allow(clippy::too_many_arguments)]
fn adam_update(
    param: &mut [f32],
    grad: &[f32],
    moments: &mut (Vec<f32>, Vec<f32>),
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: f32,
    t: u64,
) {
    let (m, v) = moments;
    let bias_correction1 = 1.0 - beta1.powi(t as i32);
    let bias_correction2 = 1.0 - beta2.powi(t as i32);

    for i in 0..param.len() {
        m[i] = beta1 * m[i] + (1.0 - beta1) * grad[i];
        v[i] = beta2 * v[i] + (1.0 - beta2) * grad[i] * grad[i];
        let m_hat = m[i] / bias_correction1;
        let v_hat = v[i] / bias_correction2;
        let update = lr * m_hat / (v_hat.sqrt() + epsilon);
        param[i] -= update + lr * weight_decay * param[i];
    }
}
