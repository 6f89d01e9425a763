//! The gradient accumulator: one private, full-shape buffer per sphere.
//!
//! §4.I of the design describes a single flat parameter-offset buffer
//! sliced into `N` contiguous segments, with boundary elements written via
//! relaxed atomics. That literal layout assumes every gradient write lands
//! in the range its writer owns, which does not hold here: a worker's
//! batch can touch *any* row of the embedding gradient (any token id can
//! appear in any batch, regardless of symmetry group), so a flat
//! offset-range split cannot actually keep embedding writes disjoint
//! between spheres without per-row bookkeeping.
//!
//! This engine keeps the property §4.I actually cares about — lock-free
//! accumulation with a single deterministic reduction at the barrier — by
//! giving every sphere its own full-shape [`ModelGradients`] ("segment" in
//! name only: there is no shared memory for it to contend over during the
//! epoch). [`GradientBuffer::reduce_into`] then performs the left-to-right
//! summation pass §4.I specifies, in fixed sphere-index order, which is
//! what makes determinism (§8 property 3) hold regardless of the order
//! workers happen to finish in.
use crate::model::{ModelGradients, ModelShape};

/// One [`ModelGradients`] per sphere, privately owned for the duration of
/// an epoch.
pub struct GradientBuffer {
    segments: Vec<ModelGradients>,
}

impl GradientBuffer {
    /// Allocates `n_spheres` zeroed segments, each shaped like `shape`.
    pub fn new(shape: &ModelShape, n_spheres: usize) -> Self {
        GradientBuffer {
            segments: (0..n_spheres.max(1))
                .map(|_| ModelGradients::zeros_like(shape))
                .collect(),
        }
    }

    pub fn n_segments(&self) -> usize {
        self.segments.len()
    }

    /// Mutable access to one sphere's private segment. Only that sphere's
    /// worker thread calls this during an epoch.
    pub fn segment_mut(&mut self, sphere_id: usize) -> &mut ModelGradients {
        &mut self.segments[sphere_id]
    }

    pub fn segment(&self, sphere_id: usize) -> &ModelGradients {
        &self.segments[sphere_id]
    }

    /// All segments as a mutable slice, so callers can split it into N
    /// disjoint `&mut ModelGradients` (one per sphere thread) via
    /// `iter_mut()` rather than taking N overlapping `&mut self` borrows.
    pub fn segments_mut(&mut self) -> &mut [ModelGradients] {
        &mut self.segments
    }

    /// Zeroes every segment in place at the start of an epoch (§4.H.2
    /// `EpochBegin`), reusing the existing allocations.
    pub fn zero_all(&mut self) {
        for seg in self.segments.iter_mut() {
            seg.zero();
        }
    }

    /// Sums every segment into `out`, left to right by sphere index — the
    /// single deterministic reduction pass §4.I describes. `out` is
    /// zeroed first so repeated calls (e.g. across epochs, reusing one
    /// scratch buffer) don't double-accumulate.
    pub fn reduce_into(&self, out: &mut ModelGradients) {
        out.zero();
        for seg in &self.segments {
            out.accumulate_from(seg);
        }
    }

    /// True if every segment's gradients are finite. A single poisoned
    /// segment fails the whole reduction (§4.H.4, §7 `NonFiniteGradient`).
    pub fn all_finite(&self) -> bool {
        self.segments.iter().all(|s| s.all_finite())
    }
}
