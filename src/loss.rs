//! The crystalline loss: cross-entropy plus two prime/lattice regularizers.
//!
//! [`crystalline_loss`] is the scalar reported to the caller and to
//! [`crate::scheduler::metrics`]. The backward pass does not differentiate
//! through the regularizers — [`softmax_cross_entropy_grad`] is the only
//! gradient source into `logits`, matching the literal `dlogits` formula
//! the training loop is specified against. With `lambda_prime` and
//! `lambda_lattice` at zero (the gradient-sanity test configuration) the
//! two views coincide exactly.

use crate::lattice::{gcd, LatticeTable};
use crate::tensor::{softmax_rowwise, Mat};

/// Cross-entropy plus the prime-similarity and lattice-distance
/// regularizers, averaged over valid (unmasked) positions.
///
/// `logits` is `[seq_len, vocab_size]`; `target_ids` and `mask` are
/// `seq_len` long. Reduces to plain cross-entropy when both lambdas are
/// zero (§8 property 10).
pub fn crystalline_loss(
    logits: &Mat,
    target_ids: &[u32],
    mask: &[u8],
    lattice: &LatticeTable,
    lambda_prime: f32,
    lambda_lattice: f32,
    top_k: usize,
) -> f32 {
    let probs = softmax_rowwise(logits);
    let mut total = 0.0f32;
    let mut n_valid = 0usize;

    for row in 0..logits.rows {
        if mask[row] == 0 {
            continue;
        }
        n_valid += 1;
        let target = target_ids[row];
        let p = probs.row(row);

        let p_target = p[target as usize].max(f32::MIN_POSITIVE);
        let mut loss = -p_target.ln();

        if lambda_prime > 0.0 || lambda_lattice > 0.0 {
            let top = top_k_indices(p, top_k.min(p.len()));
            if lambda_prime > 0.0 {
                loss += lambda_prime * prime_similarity_term(&top, p, target, lattice);
            }
            if lambda_lattice > 0.0 {
                loss += lambda_lattice * lattice_distance_term(&top, p, target, lattice);
            }
        }

        total += loss;
    }

    if n_valid == 0 {
        0.0
    } else {
        total / n_valid as f32
    }
}

/// The gradient the backward pass actually uses: `(softmax(logits) -
/// one_hot(target)) * mask / n_valid_positions`, zero at masked rows.
pub fn softmax_cross_entropy_grad(logits: &Mat, target_ids: &[u32], mask: &[u8]) -> Mat {
    let n_valid = mask.iter().filter(|&&m| m != 0).count().max(1) as f32;
    let mut dlogits = softmax_rowwise(logits);
    for row in 0..dlogits.rows {
        if mask[row] == 0 {
            dlogits.row_mut(row).iter_mut().for_each(|v| *v = 0.0);
            continue;
        }
        let target = target_ids[row] as usize;
        let out_row = dlogits.row_mut(row);
        out_row[target] -= 1.0;
        for v in out_row.iter_mut() {
            *v /= n_valid;
        }
    }
    dlogits
}

/// Indices of the `k` largest values in `p`, not assumed sorted by the
/// caller beyond "largest first" — a partial selection sort is plenty for
/// the small `top_k` (single digits to low tens) this is called with.
fn top_k_indices(p: &[f32], k: usize) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..p.len()).collect();
    idx.sort_unstable_by(|&a, &b| p[b].partial_cmp(&p[a]).unwrap_or(std::cmp::Ordering::Equal));
    idx.truncate(k);
    idx
}

fn prime_similarity_term(top: &[usize], p: &[f32], target: u32, lattice: &LatticeTable) -> f32 {
    let target_prime = lattice.prime(target);
    let mut acc = 0.0f32;
    for &i in top {
        let prime_i = lattice.prime(i as u32);
        let sim = gcd(prime_i, target_prime) as f32 / prime_i.max(target_prime) as f32;
        acc += p[i] * (1.0 - sim);
    }
    acc
}

fn lattice_distance_term(top: &[usize], p: &[f32], target: u32, lattice: &LatticeTable) -> f32 {
    let target_coord = lattice.coord(target);
    let mut acc = 0.0f32;
    for &i in top {
        let coord_i = lattice.coord(i as u32);
        let dist = crate::lattice::coords::normalized_distance(coord_i, target_coord);
        acc += p[i] * dist;
    }
    acc
}
