//! Deterministic lattice geometry: token → prime → 12D coordinate → symmetry group.

pub mod coords;
pub mod primes;
pub mod table;

pub use coords::NUM_DIMENSIONS;
pub use table::{gcd, LatticeTable, TokenGeometry};
