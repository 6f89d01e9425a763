//! The read-only, process-wide lattice table.

use rayon::prelude::*;

use crate::error::{TrainingError, TrainingResult};
use crate::lattice::coords::{self, NUM_DIMENSIONS};
use crate::lattice::primes::PrimeSieve;

/// Everything the rest of the engine needs to know about one token's
/// position in the crystalline lattice.
#[derive(Debug, Clone, Copy)]
pub struct TokenGeometry {
    pub prime: u64,
    pub coord: [f32; NUM_DIMENSIONS],
    pub sym_group: u8,
}

/// Prime, coordinate, and symmetry-group assignment for every token in the
/// vocabulary, built once before training starts and shared read-only by
/// every worker sphere for the remainder of the run.
pub struct LatticeTable {
    entries: Vec<TokenGeometry>,
}

impl LatticeTable {
    /// Builds the table for `vocab_size` tokens. The sieve grows
    /// sequentially (each prime depends on the ones before it), but once
    /// every prime up to the `vocab_size`-th is known, each token's
    /// coordinate and symmetry group depend only on its own id — that part
    /// fans out across `rayon`'s thread pool, since it is one-time setup
    /// work done before the sphere scheduler's epoch loop even starts.
    pub fn build(vocab_size: usize) -> TrainingResult<Self> {
        if vocab_size == 0 {
            return Err(TrainingError::InvalidConfig(
                "vocab_size must be > 0 to build a lattice table".into(),
            ));
        }

        let mut sieve = PrimeSieve::with_count(vocab_size);
        let mut primes = Vec::new();
        primes
            .try_reserve(vocab_size)
            .map_err(|e| TrainingError::AllocationFailure(e.to_string()))?;
        for token_id in 0..vocab_size {
            primes.push(sieve.nth_prime(token_id));
        }

        let mut entries = Vec::new();
        entries
            .try_reserve(vocab_size)
            .map_err(|e| TrainingError::AllocationFailure(e.to_string()))?;
        entries.resize(
            vocab_size,
            TokenGeometry {
                prime: 0,
                coord: [0.0; NUM_DIMENSIONS],
                sym_group: 0,
            },
        );
        entries
            .par_iter_mut()
            .enumerate()
            .for_each(|(token_id, entry)| {
                *entry = TokenGeometry {
                    prime: primes[token_id],
                    coord: coords::lattice_coord(token_id),
                    sym_group: coords::symmetry_group(token_id),
                };
            });

        Ok(LatticeTable { entries })
    }

    pub fn vocab_size(&self) -> usize {
        self.entries.len()
    }

    pub fn geometry(&self, token_id: u32) -> &TokenGeometry {
        &self.entries[token_id as usize]
    }

    pub fn prime(&self, token_id: u32) -> u64 {
        self.entries[token_id as usize].prime
    }

    pub fn coord(&self, token_id: u32) -> &[f32; NUM_DIMENSIONS] {
        &self.entries[token_id as usize].coord
    }

    pub fn sym_group(&self, token_id: u32) -> u8 {
        self.entries[token_id as usize].sym_group
    }

    /// Count of tokens assigned to each of the 12 symmetry groups. Used by
    /// both the scheduler (to balance sphere assignment) and tests (to
    /// assert the distribution stays within plus-or-minus one token).
    pub fn symmetry_histogram(&self) -> [usize; NUM_DIMENSIONS] {
        let mut hist = [0usize; NUM_DIMENSIONS];
        for entry in &self.entries {
            hist[entry.sym_group as usize] += 1;
        }
        hist
    }
}

/// Greatest common divisor, used by the crystalline loss's prime-similarity
/// term.
pub fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}
