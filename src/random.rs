use rand::{thread_rng, Rng};
use std::{
  fmt::Debug,
  sync::atomic::{AtomicUsize, Ordering},
};

/// Uniform index source used by the randomized load-balancing policies.
pub trait RandomSource: Debug + Send + Sync {
  /// Returns an index in `0..upper`. Callers never pass 0.
  fn next_index(&self, upper: usize) -> usize;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
  fn next_index(&self, upper: usize) -> usize {
    thread_rng().gen_range(0..upper)
  }
}

/// Replays a fixed sequence of indices, wrapping around at the end.
#[derive(Debug)]
pub struct SequenceRandom {
  sequence: Vec<usize>,
  position: AtomicUsize,
}

impl SequenceRandom {
  pub fn new(sequence: Vec<usize>) -> SequenceRandom {
    SequenceRandom {
      sequence,
      position: AtomicUsize::new(0),
    }
  }
}

impl RandomSource for SequenceRandom {
  fn next_index(&self, upper: usize) -> usize {
    if self.sequence.is_empty() {
      return 0;
    }
    let position = self.position.fetch_add(1, Ordering::Relaxed) % self.sequence.len();
    self.sequence[position] % upper
  }
}
