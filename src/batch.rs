//! Turns a flat token stream into `(input, target, mask)` batches.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// One training batch: `input_ids[b][s]` predicts `target_ids[b][s]`,
/// with `mask[b][s] == 0` marking padding positions that contribute
/// nothing to loss or gradients.
#[derive(Debug, Clone)]
pub struct Batch {
    pub input_ids: Vec<u32>,
    pub target_ids: Vec<u32>,
    pub mask: Vec<u8>,
    pub batch_size: usize,
    pub seq_len: usize,
}

impl Batch {
    pub fn valid_positions(&self) -> usize {
        self.mask.iter().filter(|&&m| m != 0).count()
    }
}

/// Slices a contiguous token stream into fixed-size `(input, target)`
/// windows, next-token-prediction style (`target[i] = stream[i+1]`).
///
/// `next()` returns `None` exactly when the stream is exhausted — callers
/// (the scheduler, in particular) rely on this as the sole termination
/// signal; there is no other way for this iterator to signal "done" and no
/// way for it to fail, since it performs no allocation beyond the batch
/// buffers it hands back.
pub struct BatchIterator {
    tokens: Vec<u32>,
    order: Vec<usize>,
    cursor: usize,
    batch_size: usize,
    seq_len: usize,
    drop_last: bool,
    shuffle: bool,
    rng: StdRng,
}

impl BatchIterator {
    /// `tokens` is the full token stream; windows of `seq_len + 1` tokens
    /// are drawn from it (the extra token supplies the final target).
    pub fn new(
        tokens: Vec<u32>,
        batch_size: usize,
        seq_len: usize,
        drop_last: bool,
        shuffle: bool,
        rng_seed: u64,
    ) -> Self {
        let window = seq_len + 1;
        let num_windows = tokens.len().saturating_sub(1) / seq_len.max(1);
        let order: Vec<usize> = (0..num_windows).collect();
        let mut it = BatchIterator {
            tokens,
            order,
            cursor: 0,
            batch_size,
            seq_len,
            drop_last,
            shuffle,
            rng: StdRng::seed_from_u64(rng_seed),
        };
        let _ = window;
        if it.shuffle {
            it.order.shuffle(&mut it.rng);
        }
        it
    }

    /// Number of windows not yet consumed in the current pass.
    pub fn remaining(&self) -> usize {
        self.order.len().saturating_sub(self.cursor)
    }

    /// Rewinds to the start of the stream, reshuffling if configured to.
    pub fn reset(&mut self) {
        self.cursor = 0;
        if self.shuffle {
            self.order.shuffle(&mut self.rng);
        }
    }

    /// Returns the next batch, or `None` once every window has been
    /// consumed for this pass.
    pub fn next(&mut self) -> Option<Batch> {
        if self.order.is_empty() {
            return None;
        }
        let remaining = self.remaining();
        if remaining == 0 {
            return None;
        }
        if remaining < self.batch_size && self.drop_last {
            return None;
        }

        let take = remaining.min(self.batch_size);
        let window_indices = &self.order[self.cursor..self.cursor + take];

        let mut input_ids = vec![0u32; self.batch_size * self.seq_len];
        let mut target_ids = vec![0u32; self.batch_size * self.seq_len];
        let mut mask = vec![0u8; self.batch_size * self.seq_len];

        for (row, &window_start_idx) in window_indices.iter().enumerate() {
            let start = window_start_idx * self.seq_len;
            for col in 0..self.seq_len {
                let row_base = row * self.seq_len + col;
                input_ids[row_base] = self.tokens[start + col];
                target_ids[row_base] = self.tokens[start + col + 1];
                mask[row_base] = 1;
            }
        }

        self.cursor += take;

        Some(Batch {
            input_ids,
            target_ids,
            mask,
            batch_size: self.batch_size,
            seq_len: self.seq_len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminates_on_exhaustion() {
        let tokens: Vec<u32> = (0..40).collect();
        let mut it = BatchIterator::new(tokens, 2, 8, true, false, 0);
        let mut count = 0;
        while it.next().is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
        assert!(it.next().is_none());
        assert!(it.next().is_none());
    }

    #[test]
    fn empty_stream_yields_no_batches() {
        let mut it = BatchIterator::new(Vec::new(), 4, 8, true, false, 0);
        assert!(it.next().is_none());
        assert_eq!(it.remaining(), 0);
    }

    #[test]
    fn reset_restarts_the_stream() {
        let tokens: Vec<u32> = (0..40).collect();
        let mut it = BatchIterator::new(tokens, 2, 8, true, false, 0);
        while it.next().is_some() {}
        assert!(it.next().is_none());
        it.reset();
        assert!(it.next().is_some());
    }

    #[test]
    fn deterministic_order_given_fixed_seed() {
        let tokens: Vec<u32> = (0..100).collect();
        let mut a = BatchIterator::new(tokens.clone(), 2, 8, true, true, 42);
        let mut b = BatchIterator::new(tokens, 2, 8, true, true, 42);
        loop {
            match (a.next(), b.next()) {
                (Some(ba), Some(bb)) => assert_eq!(ba.input_ids, bb.input_ids),
                (None, None) => break,
                _ => panic!("iterators disagreed on length"),
            }
        }
    }

    #[test]
    fn target_is_input_shifted_by_one() {
        let tokens: Vec<u32> = (0..16).collect();
        let mut it = BatchIterator::new(tokens, 1, 4, true, false, 0);
        let batch = it.next().unwrap();
        assert_eq!(batch.input_ids, vec![0, 1, 2, 3]);
        assert_eq!(batch.target_ids, vec![1, 2, 3, 4]);
    }
}
