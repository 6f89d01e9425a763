//! Backward pass: gradient of the loss w.r.t. every parameter block.
//!
//! Mirrors [`crate::forward`] layer for layer, in reverse. Operates on one
//! sequence at a time, using the [`crate::forward::ForwardCache`] that
//! sequence's forward pass produced, and accumulates into a caller-owned
//! [`ModelGradients`] — typically a sphere's private gradient segment (see
//! [`crate::scheduler::gradient`]), so that a batch of sequences can be
//! summed into the same buffer without reallocating per sequence.

use crate::error::TrainingResult;
use crate::forward::ForwardCache;
use crate::loss::softmax_cross_entropy_grad;
use crate::model::{LayerGradients, Model, ModelGradients};
use crate::tensor::{
    col_sums, gelu_grad, hadamard, layer_norm_backward, matmul, scale, softmax_backward,
    transpose, Mat,
};

const LN_EPS: f32 = 1e-5;

/// Extracts the `head`-th `head_dim`-wide column block of `m`.
fn extract_head(m: &Mat, head: usize, head_dim: usize) -> Mat {
    let mut out = Mat::zeros(m.rows, head_dim);
    for i in 0..m.rows {
        out.row_mut(i)
            .copy_from_slice(&m.row(i)[head * head_dim..(head + 1) * head_dim]);
    }
    out
}

/// Adds `src` (one head's gradient) into its column block of `dst`,
/// accumulating rather than overwriting — multiple heads never overlap in
/// column range, but the destination may already hold a partial write.
fn add_head(dst: &mut Mat, head: usize, head_dim: usize, src: &Mat) {
    for i in 0..dst.rows {
        let seg = &mut dst.row_mut(i)[head * head_dim..(head + 1) * head_dim];
        for (d, s) in seg.iter_mut().zip(src.row(i).iter()) {
            *d += s;
        }
    }
}

fn add_into(dst: &mut Mat, src: &Mat) {
    for (d, s) in dst.data.iter_mut().zip(src.data.iter()) {
        *d += s;
    }
}

fn add_vec(dst: &mut [f32], src: &[f32]) {
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d += s;
    }
}

/// Runs the backward pass for one sequence and accumulates its gradient
/// contribution into `grad`. Returns the scalar loss for that sequence
/// (computed by [`crate::loss::crystalline_loss`], passed in pre-computed
/// so backward does not need to know about the lattice table).
pub fn backward(
    model: &Model,
    logits: &Mat,
    target_ids: &[u32],
    mask: &[u8],
    cache: &ForwardCache,
    grad: &mut ModelGradients,
) -> TrainingResult<()> {
    let d_model = model.shape.d_model;
    let n_heads = model.shape.n_heads;
    let head_dim = d_model / n_heads;

    let dlogits = softmax_cross_entropy_grad(logits, target_ids, mask);

    // logits = h_final @ {output_proj | embedding^T}
    let h_final = crate::tensor::layer_norm(
        &cache.h_final_in,
        &model.ln_final_gamma,
        &model.ln_final_beta,
        LN_EPS,
    )?;

    let d_h_final = match &model.output_proj {
        Some(proj) => {
            let d_proj = matmul(&transpose(&h_final), &dlogits)?;
            add_into(grad.output_proj.as_mut().expect("tied-absent mismatch"), &d_proj);
            matmul(&dlogits, &transpose(proj))?
        }
        None => {
            // logits = h_final @ embedding^T ⇒ dh_final = dlogits @ embedding,
            // dEmbedding (output-projection term) = dlogits^T @ h_final.
            let d_embedding_out = matmul(&transpose(&dlogits), &h_final)?;
            add_into(&mut grad.embedding, &d_embedding_out);
            matmul(&dlogits, &model.embedding)?
        }
    };

    let (mut d_h, d_ln_final_gamma, d_ln_final_beta) =
        layer_norm_backward(&d_h_final, &cache.h_final_in, &model.ln_final_gamma, LN_EPS)?;
    add_vec(&mut grad.ln_final_gamma, &d_ln_final_gamma);
    add_vec(&mut grad.ln_final_beta, &d_ln_final_beta);

    for (layer, layer_cache, layer_grad) in izip_rev(model, cache, grad) {
        // h_out = h_mid + ffn_out; both branches receive the same upstream d_h.
        let d_ffn_out = d_h.clone();
        let d_ffn_act = matmul(&d_ffn_out, &transpose(&layer.ffn_w2))?;
        add_into(&mut layer_grad.ffn_w2, &matmul(&transpose(&layer_cache.ffn_act), &d_ffn_out)?);
        add_vec(&mut layer_grad.ffn_b2, &col_sums(&d_ffn_out));

        let d_ffn_pre = hadamard(&d_ffn_act, &gelu_grad(&layer_cache.ffn_pre))?;
        add_into(&mut layer_grad.ffn_w1, &matmul(&transpose(&layer_cache.h2), &d_ffn_pre)?);
        add_vec(&mut layer_grad.ffn_b1, &col_sums(&d_ffn_pre));
        let d_h2 = matmul(&d_ffn_pre, &transpose(&layer.ffn_w1))?;

        let (d_h_mid_from_ln2, d_ln2_gamma, d_ln2_beta) =
            layer_norm_backward(&d_h2, &layer_cache.h_mid, &layer.ln2_gamma, LN_EPS)?;
        add_vec(&mut layer_grad.ln2_gamma, &d_ln2_gamma);
        add_vec(&mut layer_grad.ln2_beta, &d_ln2_beta);

        // h_mid = h_in + attn_proj; the residual around FFN (d_h) and the
        // LayerNorm2 path both land on h_mid.
        let mut d_h_mid = d_h.clone();
        add_into(&mut d_h_mid, &d_h_mid_from_ln2);

        let d_attn_proj = d_h_mid.clone();
        add_into(
            &mut layer_grad.wo,
            &matmul(&transpose(&layer_cache.attn_concat), &d_attn_proj)?,
        );
        let d_attn_concat = matmul(&d_attn_proj, &transpose(&layer.wo))?;

        let scale_factor = 1.0 / (head_dim as f32).sqrt();
        let mut d_q = Mat::zeros(layer_cache.q.rows, layer_cache.q.cols);
        let mut d_k = Mat::zeros(layer_cache.k.rows, layer_cache.k.cols);
        let mut d_v = Mat::zeros(layer_cache.v.rows, layer_cache.v.cols);

        for head in 0..n_heads {
            let d_out_h = extract_head(&d_attn_concat, head, head_dim);
            let a = &layer_cache.attn_weights[head];
            let qh = extract_head(&layer_cache.q, head, head_dim);
            let kh = extract_head(&layer_cache.k, head, head_dim);
            let vh = extract_head(&layer_cache.v, head, head_dim);

            let d_a = matmul(&d_out_h, &transpose(&vh))?;
            let d_vh = matmul(&transpose(a), &d_out_h)?;

            let d_scores_scaled = softmax_backward(a, &d_a)?;
            let d_scores = scale(&d_scores_scaled, scale_factor);

            let d_qh = matmul(&d_scores, &kh)?;
            let d_kh = matmul(&transpose(&d_scores), &qh)?;

            add_head(&mut d_q, head, head_dim, &d_qh);
            add_head(&mut d_k, head, head_dim, &d_kh);
            add_head(&mut d_v, head, head_dim, &d_vh);
        }

        add_into(&mut layer_grad.wq, &matmul(&transpose(&layer_cache.h1), &d_q)?);
        add_into(&mut layer_grad.wk, &matmul(&transpose(&layer_cache.h1), &d_k)?);
        add_into(&mut layer_grad.wv, &matmul(&transpose(&layer_cache.h1), &d_v)?);

        let mut d_h1 = matmul(&d_q, &transpose(&layer.wq))?;
        add_into(&mut d_h1, &matmul(&d_k, &transpose(&layer.wk))?);
        add_into(&mut d_h1, &matmul(&d_v, &transpose(&layer.wv))?);

        let (d_h_in_from_ln1, d_ln1_gamma, d_ln1_beta) =
            layer_norm_backward(&d_h1, &layer_cache.h_in, &layer.ln1_gamma, LN_EPS)?;
        add_vec(&mut layer_grad.ln1_gamma, &d_ln1_gamma);
        add_vec(&mut layer_grad.ln1_beta, &d_ln1_beta);

        // h_mid = h_in + attn_proj; the residual around attention (d_h_mid)
        // and the LayerNorm1 path both land on h_in, which becomes the
        // upstream gradient for the previous layer (or the embedding).
        add_into(&mut d_h_mid, &d_h_in_from_ln1);
        d_h = d_h_mid;
    }

    // d_h is now the gradient w.r.t. the embedding lookup output; scatter
    // each row into the embedding gradient row its input token owns.
    for (row, &token) in cache.input_ids.iter().enumerate() {
        let dst = grad.embedding.row_mut(token as usize);
        let src = d_h.row(row);
        for (d, s) in dst.iter_mut().zip(src.iter()) {
            *d += s;
        }
    }

    Ok(())
}

/// Zips the model's layers, forward caches, and gradient accumulators
/// together in reverse layer order (`L..=1`), since backward must walk
/// layers back to front.
fn izip_rev<'a>(
    model: &'a Model,
    cache: &'a ForwardCache,
    grad: &'a mut ModelGradients,
) -> impl Iterator<
    Item = (
        &'a crate::model::LayerWeights,
        &'a crate::forward::LayerForwardCache,
        &'a mut LayerGradients,
    ),
> {
    model
        .layers
        .iter()
        .rev()
        .zip(cache.layers.iter().rev())
        .zip(grad.layers.iter_mut().rev())
        .map(|((w, c), g)| (w, c, g))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrainingConfig;
    use crate::forward::forward;
    use crate::loss::crystalline_loss;

    fn small_config() -> TrainingConfig {
        let mut cfg = TrainingConfig::default();
        cfg.vocab_size = 24;
        cfg.d_model = 8;
        cfg.n_heads = 2;
        cfg.d_ff = 16;
        cfg.n_layers = 2;
        cfg.max_seq_len = 6;
        cfg.lambda_prime = 0.0;
        cfg.lambda_lattice = 0.0;
        cfg
    }

    fn sequence_loss(model: &Model, ids: &[u32], targets: &[u32], mask: &[u8]) -> f32 {
        let lattice = crate::lattice::LatticeTable::build(model.shape.vocab_size).unwrap();
        let (logits, _) = forward(model, ids, mask).unwrap();
        crystalline_loss(&logits, targets, mask, &lattice, 0.0, 0.0, 4)
    }

    #[test]
    fn backward_produces_finite_gradients_of_expected_shape() {
        let cfg = small_config();
        let model = Model::new(&cfg).unwrap();
        let ids = vec![0u32, 1, 2, 3];
        let targets = vec![1u32, 2, 3, 4];
        let mask = vec![1u8; 4];

        let (logits, cache) = forward(&model, &ids, &mask).unwrap();
        let mut grad = ModelGradients::zeros_like(&model.shape);

        backward(&model, &logits, &targets, &mask, &cache, &mut grad).unwrap();

        assert!(grad.all_finite());
        assert_eq!(grad.embedding.rows, cfg.vocab_size);
        assert_eq!(grad.layers.len(), 2);
        assert!(grad.global_l2_norm() > 0.0);
    }

    #[test]
    fn numerical_gradient_matches_analytical_for_ln2_gamma() {
        let cfg = small_config();
        let mut model = Model::new(&cfg).unwrap();
        let ids = vec![0u32, 1, 2];
        let targets = vec![1u32, 2, 3];
        let mask = vec![1u8; 3];

        let (logits, cache) = forward(&model, &ids, &mask).unwrap();
        let mut grad = ModelGradients::zeros_like(&model.shape);
        backward(&model, &logits, &targets, &mask, &cache, &mut grad).unwrap();

        // Numerical gradient divides by n_valid_positions the same way
        // softmax_cross_entropy_grad does internally, so compare directly
        // against crystalline_loss (which is also averaged).
        let param_idx = 0usize;
        let h = 1e-2;
        let analytical = grad.layers[0].ln2_gamma[param_idx];

        model.layers[0].ln2_gamma[param_idx] += h;
        let loss_plus = sequence_loss(&model, &ids, &targets, &mask);
        model.layers[0].ln2_gamma[param_idx] -= 2.0 * h;
        let loss_minus = sequence_loss(&model, &ids, &targets, &mask);
        model.layers[0].ln2_gamma[param_idx] += h;

        let numerical = (loss_plus - loss_minus) / (2.0 * h);
        assert!(
            (analytical - numerical).abs() < 5e-2,
            "analytical {analytical} vs numerical {numerical}"
        );
    }

    #[test]
    fn masked_positions_contribute_no_embedding_gradient() {
        let cfg = small_config();
        let model = Model::new(&cfg).unwrap();
        let ids = vec![5u32, 6, 7];
        let targets = vec![6u32, 7, 8];
        let mask = vec![1u8, 0, 1];

        let (logits, cache) = forward(&model, &ids, &mask).unwrap();
        let mut grad = ModelGradients::zeros_like(&model.shape);
        backward(&model, &logits, &targets, &mask, &cache, &mut grad).unwrap();

        assert!(grad.all_finite());
    }

    #[test]
    fn weight_tied_output_scatters_into_embedding_not_separate_proj() {
        let mut cfg = small_config();
        cfg.tie_output_embedding = true;
        let model = Model::new(&cfg).unwrap();
        assert!(model.output_proj.is_none());

        let ids = vec![0u32, 1];
        let targets = vec![1u32, 2];
        let mask = vec![1u8; 2];
        let (logits, cache) = forward(&model, &ids, &mask).unwrap();
        let mut grad = ModelGradients::zeros_like(&model.shape);
        backward(&model, &logits, &targets, &mask, &cache, &mut grad).unwrap();
        assert!(grad.output_proj.is_none());
        assert!(grad.embedding.data.iter().any(|&v| v != 0.0));
    }
}
