//! Forward pass: embedding → (attention, FFN, layer-norm) × L → logits.
//!
//! Operates on one sequence at a time (`[seq_len, d_model]`); the scheduler
//! loops a worker's batch of sequences through this and [`crate::backward`]
//! sequentially within the worker, which keeps every kernel here a plain
//! 2D matrix operation instead of a batched 3D one.

use crate::error::TrainingResult;
use crate::model::{LayerWeights, Model};
use crate::tensor::{gelu, layer_norm, matmul, matmul_add_bias, softmax_rowwise, transpose, Mat};

const LN_EPS: f32 = 1e-5;

/// Everything the backward pass needs to reconstruct gradients without
/// recomputing the forward pass from scratch.
pub struct LayerForwardCache {
    pub h_in: Mat,
    pub h1: Mat,
    pub q: Mat,
    pub k: Mat,
    pub v: Mat,
    pub attn_weights: Vec<Mat>,
    pub attn_concat: Mat,
    pub h_mid: Mat,
    pub h2: Mat,
    pub ffn_pre: Mat,
    pub ffn_act: Mat,
}

pub struct ForwardCache {
    pub input_ids: Vec<u32>,
    pub embedded: Mat,
    pub layers: Vec<LayerForwardCache>,
    pub h_final_in: Mat,
}

/// Extracts the `head`-th `head_dim`-wide column block of `m`.
fn extract_head(m: &Mat, head: usize, head_dim: usize) -> Mat {
    let mut out = Mat::zeros(m.rows, head_dim);
    for i in 0..m.rows {
        let src = &m.row(i)[head * head_dim..(head + 1) * head_dim];
        out.row_mut(i).copy_from_slice(src);
    }
    out
}

/// Writes `src` (a single head's output) into its column block of `dst`.
fn write_head(dst: &mut Mat, head: usize, head_dim: usize, src: &Mat) {
    for i in 0..dst.rows {
        let seg = &mut dst.row_mut(i)[head * head_dim..(head + 1) * head_dim];
        seg.copy_from_slice(src.row(i));
    }
}

/// Applies the causal + padding mask to raw attention scores in place:
/// position `j` is reachable from `i` only if `j <= i` and `mask[j] != 0`.
fn apply_attention_mask(scores: &mut Mat, mask: &[u8]) {
    for i in 0..scores.rows {
        for j in 0..scores.cols {
            if j > i || mask[j] == 0 {
                scores.row_mut(i)[j] = f32::NEG_INFINITY;
            }
        }
    }
}

fn attention(
    h1: &Mat,
    weights: &LayerWeights,
    n_heads: usize,
    head_dim: usize,
    mask: &[u8],
) -> TrainingResult<(Mat, Mat, Mat, Mat, Vec<Mat>, Mat)> {
    let q = matmul(h1, &weights.wq)?;
    let k = matmul(h1, &weights.wk)?;
    let v = matmul(h1, &weights.wv)?;

    let scale = 1.0 / (head_dim as f32).sqrt();
    let mut attn_weights = Vec::with_capacity(n_heads);
    let mut concat = Mat::zeros(h1.rows, n_heads * head_dim);

    for head in 0..n_heads {
        let qh = extract_head(&q, head, head_dim);
        let kh = extract_head(&k, head, head_dim);
        let vh = extract_head(&v, head, head_dim);

        let mut scores = matmul(&qh, &transpose(&kh))?;
        for v in scores.data.iter_mut() {
            *v *= scale;
        }
        apply_attention_mask(&mut scores, mask);
        let a = softmax_rowwise(&scores);
        let out_h = matmul(&a, &vh)?;
        write_head(&mut concat, head, head_dim, &out_h);
        attn_weights.push(a);
    }

    let attn_proj = matmul(&concat, &weights.wo)?;
    Ok((q, k, v, concat, attn_weights, attn_proj))
}

/// Runs the full forward pass for one sequence, returning logits over the
/// vocabulary at every position and the cache the backward pass needs.
pub fn forward(
    model: &Model,
    input_ids: &[u32],
    mask: &[u8],
) -> TrainingResult<(Mat, ForwardCache)> {
    let seq_len = input_ids.len();
    let d_model = model.shape.d_model;
    let n_heads = model.shape.n_heads;
    let head_dim = d_model / n_heads;

    let mut embedded = Mat::zeros(seq_len, d_model);
    for (row, &token) in input_ids.iter().enumerate() {
        embedded
            .row_mut(row)
            .copy_from_slice(model.embedding.row(token as usize));
    }

    let mut h = embedded.clone();
    let mut layer_caches = Vec::with_capacity(model.layers.len());

    for layer in &model.layers {
        let h_in = h.clone();
        let h1 = layer_norm(&h_in, &layer.ln1_gamma, &layer.ln1_beta, LN_EPS)?;
        let (q, k, v, attn_concat, attn_weights, attn_proj) =
            attention(&h1, layer, n_heads, head_dim, mask)?;

        let mut h_mid = h_in.clone();
        for (m, a) in h_mid.data.iter_mut().zip(attn_proj.data.iter()) {
            *m += a;
        }

        let h2 = layer_norm(&h_mid, &layer.ln2_gamma, &layer.ln2_beta, LN_EPS)?;
        let ffn_pre = matmul_add_bias(&h2, &layer.ffn_w1, &layer.ffn_b1)?;
        let ffn_act = gelu(&ffn_pre);
        let ffn_out = matmul_add_bias(&ffn_act, &layer.ffn_w2, &layer.ffn_b2)?;

        let mut h_out = h_mid.clone();
        for (m, f) in h_out.data.iter_mut().zip(ffn_out.data.iter()) {
            *m += f;
        }

        layer_caches.push(LayerForwardCache {
            h_in,
            h1,
            q,
            k,
            v,
            attn_weights,
            attn_concat,
            h_mid,
            h2,
            ffn_pre,
            ffn_act,
        });
        h = h_out;
    }

    let h_final_in = h.clone();
    let h_final = layer_norm(&h_final_in, &model.ln_final_gamma, &model.ln_final_beta, LN_EPS)?;

    let logits = match &model.output_proj {
        Some(proj) => matmul(&h_final, proj)?,
        None => matmul(&h_final, &transpose(&model.embedding))?,
    };

    Ok((
        logits,
        ForwardCache {
            input_ids: input_ids.to_vec(),
            embedded,
            layers: layer_caches,
            h_final_in,
        },
    ))
}
