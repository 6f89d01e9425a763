//! Token id → 12-dimensional lattice coordinate.
//!
//! The coordinate is a deterministic function of the token id alone: two
//! processes computing `lattice_coord(n)` for the same `n` always agree,
//! bit for bit, regardless of thread count or call order.

/// Number of dimensions in a lattice coordinate and the size of the
/// symmetry group partition (`token_id mod NUM_DIMENSIONS`).
pub const NUM_DIMENSIONS: usize = 12;

/// Per-dimension angular frequency, one of the 12th roots of unity spaced
/// around the circle. `phi[d] = 2*pi*d/12`.
fn dimensional_frequency(d: usize) -> f64 {
    const TAU: f64 = std::f64::consts::PI * 2.0;
    TAU * (d as f64) / (NUM_DIMENSIONS as f64)
}

/// Which concentric "ring" a token id belongs to, following a Babylonian
/// sexagesimal-like grouping: the first 12 tokens are ring 0, the next 60
/// are ring 1, the next 60 are ring 2, the next 100 are ring 3, and every
/// subsequent ring groups 1000 tokens.
fn ring_index(n: usize) -> u32 {
    const RING_SIZES: [usize; 4] = [12, 60, 60, 100];
    let mut remaining = n;
    for (ring, &size) in RING_SIZES.iter().enumerate() {
        if remaining < size {
            return ring as u32;
        }
        remaining -= size;
    }
    3 + 1 + (remaining / 1000) as u32
}

/// The L(n,d,k,lambda) position function: combines a ring-scaled base term
/// with a product of per-dimension cosine twists, before the caller clips
/// the result to the open interval `(-1, 1)`.
///
/// - `n` — token id.
/// - `d` — dimension index in `0..NUM_DIMENSIONS`.
/// - `k` — symmetry group (`n mod NUM_DIMENSIONS`), used to phase-shift the twist.
/// - `lambda` — the token id again, folded in as a slow-moving modulation so
///   that nearby token ids produce nearby but distinguishable coordinates.
fn position_function(n: usize, d: usize, k: usize, lambda: usize) -> f64 {
    let ring = ring_index(n) as f64;
    let base = 3f64.powf(ring);

    let theta = (n as f64) * 0.01 + (k as f64) * std::f64::consts::FRAC_PI_6;
    let phi_d = dimensional_frequency(d);
    let twist = (theta * phi_d).cos();

    let slow_mod = ((lambda as f64) * 0.001 + phi_d).sin() * 0.1;

    base * twist + slow_mod
}

/// Computes the full 12-dimensional coordinate for token `n`, tanh-bounded
/// to `(-1, 1)` and additionally clipped to `(-1+eps, 1-eps)` so downstream
/// distance computations never see an exact endpoint.
pub fn lattice_coord(n: usize) -> [f32; NUM_DIMENSIONS] {
    const EPS: f64 = 1e-6;
    let k = n % NUM_DIMENSIONS;
    let mut coord = [0f32; NUM_DIMENSIONS];
    for (d, slot) in coord.iter_mut().enumerate() {
        let raw = position_function(n, d, k, n);
        let bounded = (raw / 100.0).tanh();
        let clipped = bounded.clamp(-1.0 + EPS, 1.0 - EPS);
        *slot = clipped as f32;
    }
    coord
}

/// Symmetry group a token belongs to. Deliberately `token_id mod 12`, not
/// `prime mod 12` — composite-free primes above 3 only ever land in
/// residues {1, 5, 7, 11} mod 12, which would starve eight of the twelve
/// groups.
pub fn symmetry_group(token_id: usize) -> u8 {
    (token_id % NUM_DIMENSIONS) as u8
}

/// Euclidean distance between two lattice coordinates, normalized by
/// `sqrt(NUM_DIMENSIONS)` so it stays roughly comparable across dimensions.
pub fn normalized_distance(a: &[f32; NUM_DIMENSIONS], b: &[f32; NUM_DIMENSIONS]) -> f32 {
    let sum_sq: f32 = a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum();
    sum_sq.sqrt() / (NUM_DIMENSIONS as f32).sqrt()
}
