//! 8-wide f32 SIMD primitives backing the dense kernels in [`super::ops`].
//!
//! Every function here has a scalar fallback tail for lengths not
//! divisible by 8; the two paths agree up to the order floating addition
//! happens in, never in the numeric type or rounding mode.

use wide::f32x8;

const LANES: usize = 8;

/// Dot product of two equal-length slices, vectorized 8-wide with a
/// scalar tail for the remainder.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let chunks = a.len() / LANES;
    let mut acc = f32x8::ZERO;
    for i in 0..chunks {
        let base = i * LANES;
        let va = f32x8::from(<[f32; 8]>::try_from(&a[base..base + LANES]).unwrap());
        let vb = f32x8::from(<[f32; 8]>::try_from(&b[base..base + LANES]).unwrap());
        acc += va * vb;
    }
    let mut total: f32 = acc.reduce_add();
    for i in (chunks * LANES)..a.len() {
        total += a[i] * b[i];
    }
    total
}

/// Elementwise `out[i] = a[i] + b[i]`.
pub fn add_into(a: &[f32], b: &[f32], out: &mut [f32]) {
    debug_assert_eq!(a.len(), b.len());
    debug_assert_eq!(a.len(), out.len());
    let chunks = a.len() / LANES;
    for i in 0..chunks {
        let base = i * LANES;
        let va = f32x8::from(<[f32; 8]>::try_from(&a[base..base + LANES]).unwrap());
        let vb = f32x8::from(<[f32; 8]>::try_from(&b[base..base + LANES]).unwrap());
        let vc: [f32; 8] = (va + vb).into();
        out[base..base + LANES].copy_from_slice(&vc);
    }
    for i in (chunks * LANES)..a.len() {
        out[i] = a[i] + b[i];
    }
}

/// Elementwise `out[i] += a[i] * scale`, the workhorse of gradient
/// accumulation and the Adam update.
pub fn scaled_add_into(a: &[f32], scale: f32, out: &mut [f32]) {
    debug_assert_eq!(a.len(), out.len());
    let chunks = a.len() / LANES;
    let vscale = f32x8::splat(scale);
    for i in 0..chunks {
        let base = i * LANES;
        let va = f32x8::from(<[f32; 8]>::try_from(&a[base..base + LANES]).unwrap());
        let vout = f32x8::from(<[f32; 8]>::try_from(&out[base..base + LANES]).unwrap());
        let vc: [f32; 8] = (vout + va * vscale).into();
        out[base..base + LANES].copy_from_slice(&vc);
    }
    for i in (chunks * LANES)..a.len() {
        out[i] += a[i] * scale;
    }
}

/// Sum of squares of a slice, used for gradient-norm computation.
pub fn sum_of_squares(a: &[f32]) -> f32 {
    let chunks = a.len() / LANES;
    let mut acc = f32x8::ZERO;
    for i in 0..chunks {
        let base = i * LANES;
        let va = f32x8::from(<[f32; 8]>::try_from(&a[base..base + LANES]).unwrap());
        acc += va * va;
    }
    let mut total: f32 = acc.reduce_add();
    for i in (chunks * LANES)..a.len() {
        total += a[i] * a[i];
    }
    total
}

/// Scales every element of `a` by `factor`, in place.
pub fn scale_in_place(a: &mut [f32], factor: f32) {
    let chunks = a.len() / LANES;
    let vfactor = f32x8::splat(factor);
    for i in 0..chunks {
        let base = i * LANES;
        let va = f32x8::from(<[f32; 8]>::try_from(&a[base..base + LANES]).unwrap());
        let vc: [f32; 8] = (va * vfactor).into();
        a[base..base + LANES].copy_from_slice(&vc);
    }
    for i in (chunks * LANES)..a.len() {
        a[i] *= factor;
    }
}
