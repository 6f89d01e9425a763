//! Incremental sieve producing the n-th prime for token ids.

/// Grows a sieve of Eratosthenes on demand and answers "what is the n-th
/// prime (0-indexed)" queries against it.
///
/// Built once for a given `vocab_size` and never mutated afterwards — see
/// [`crate::lattice::LatticeTable`].
pub struct PrimeSieve {
    /// `primes[i]` is the (i+1)-th prime, i.e. `primes[0] == 2`.
    primes: Vec<u64>,
}

impl PrimeSieve {
    /// Builds a sieve containing at least `count` primes.
    pub fn with_count(count: usize) -> Self {
        let mut sieve = PrimeSieve { primes: Vec::new() };
        if count > 0 {
            sieve.grow_to(count);
        }
        sieve
    }

    /// Returns the `n`-th prime (0-indexed: `nth_prime(0) == 2`).
    ///
    /// Grows the sieve further if `n` is beyond what has been computed so
    /// far; safe to call with ids up to `usize::MAX` in principle, bounded
    /// in practice by available memory.
    pub fn nth_prime(&mut self, n: usize) -> u64 {
        if n >= self.primes.len() {
            self.grow_to(n + 1);
        }
        self.primes[n]
    }

    /// Number of primes already computed.
    pub fn len(&self) -> usize {
        self.primes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primes.is_empty()
    }

    /// Extends `self.primes` with a classic sieve of Eratosthenes until it
    /// holds at least `target` primes. Uses the prime number theorem's
    /// `n * (ln n + ln ln n)` bound to size the first sieve pass, then
    /// doubles the bound if that undershoots (rare for small n).
    fn grow_to(&mut self, target: usize) {
        if self.primes.len() >= target {
            return;
        }
        let mut limit = estimate_upper_bound(target);
        loop {
            let found = sieve_up_to(limit);
            if found.len() >= target {
                self.primes = found;
                return;
            }
            limit *= 2;
        }
    }
}

/// Upper bound on the value of the `n`-th prime, from the prime number
/// theorem: for `n >= 6`, `p_n < n * (ln n + ln ln n)`.
fn estimate_upper_bound(n: usize) -> u64 {
    if n < 6 {
        return 15;
    }
    let nf = n as f64;
    let bound = nf * (nf.ln() + nf.ln().ln());
    bound.ceil() as u64 + 10
}

/// Classic sieve of Eratosthenes, returning every prime `<= limit`.
fn sieve_up_to(limit: u64) -> Vec<u64> {
    let limit = limit.max(2) as usize;
    let mut is_composite = vec![false; limit + 1];
    let mut primes = Vec::new();
    for i in 2..=limit {
        if !is_composite[i] {
            primes.push(i as u64);
            let mut j = i * i;
            while j <= limit {
                is_composite[j] = true;
                j += i;
            }
        }
    }
    primes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_primes_are_correct() {
        let mut sieve = PrimeSieve::with_count(10);
        let expected = [2u64, 3, 5, 7, 11, 13, 17, 19, 23, 29];
        for (i, &p) in expected.iter().enumerate() {
            assert_eq!(sieve.nth_prime(i), p);
        }
    }

    #[test]
    fn grows_past_initial_allocation() {
        let mut sieve = PrimeSieve::with_count(1);
        assert_eq!(sieve.nth_prime(0), 2);
        // Force growth well beyond the initial estimate.
        let p_999 = sieve.nth_prime(999);
        assert_eq!(p_999, 7919);
    }

    #[test]
    fn empty_sieve_has_zero_len() {
        let sieve = PrimeSieve::with_count(0);
        assert!(sieve.is_empty());
    }
}
