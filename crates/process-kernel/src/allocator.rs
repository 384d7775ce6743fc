//! Bounded-random identifier allocation
//!
//! Identifiers are drawn uniformly from `[1, modulus)`. Each collision with an
//! identifier already in use doubles the modulus, so a lightly loaded
//! namespace keeps small ids and a crowded one spreads out. After
//! [`MAX_ATTEMPTS`] collisions the allocator gives up and returns 0, which
//! callers map to an exhaustion error.

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::collections::HashSet;
use std::fmt;

/// Modulus used for the first draw
pub const INITIAL_MODULUS: u64 = 64;

/// Number of random draws before giving up
pub const MAX_ATTEMPTS: usize = 25;

/// Random identifier allocator for one namespace
pub struct IdAllocator {
    rng: Box<dyn RngCore + Send>,
    /// Largest id that may be handed out; `None` means the whole `u32` range
    capacity: Option<u32>,
}

impl IdAllocator {
    /// Create an unbounded allocator seeded from the operating system
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Create an unbounded allocator drawing from the given random source
    pub fn with_rng<R: RngCore + Send + 'static>(rng: R) -> Self {
        Self {
            rng: Box::new(rng),
            capacity: None,
        }
    }

    /// Create an allocator with a deterministic seed
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    /// Restrict ids to `1..=capacity`
    ///
    /// A bounded allocator sweeps the whole space once the random draws are
    /// used up, so it only returns 0 when every id is taken.
    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Largest id this allocator hands out
    pub fn capacity(&self) -> u32 {
        self.capacity.unwrap_or(u32::MAX)
    }

    /// Allocate an id absent from `existing`, or 0 when exhausted
    pub fn allocate(&mut self, existing: &HashSet<u32>) -> u32 {
        self.allocate_with(|id| existing.contains(&id))
    }

    /// Allocate an id for which `taken` returns false, or 0 when exhausted
    pub fn allocate_with<F>(&mut self, taken: F) -> u32
    where
        F: Fn(u32) -> bool,
    {
        let ceiling = u64::from(self.capacity());
        if ceiling == 0 {
            return 0;
        }

        let mut modulus = INITIAL_MODULUS;
        for _ in 0..MAX_ATTEMPTS {
            let upper = modulus.min(ceiling + 1);
            let candidate = self.rng.gen_range(1..upper) as u32;
            if !taken(candidate) {
                return candidate;
            }
            modulus = modulus.saturating_mul(2);
        }

        match self.capacity {
            Some(capacity) => (1..=capacity).find(|id| !taken(*id)).unwrap_or(0),
            None => 0,
        }
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for IdAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdAllocator")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draw(capacity: u32, requests: usize, seed: u64) -> (HashSet<u32>, usize) {
        let mut allocator = IdAllocator::seeded(seed).with_capacity(capacity);
        let mut existing = HashSet::new();
        let mut failures = 0;
        for _ in 0..requests {
            match allocator.allocate(&existing) {
                0 => failures += 1,
                id => {
                    assert!(existing.insert(id), "id {id} handed out twice");
                }
            }
        }
        (existing, failures)
    }

    #[test]
    fn test_capacity_exactly_filled() {
        let (ids, failures) = draw(10, 10, 1);
        assert_eq!(ids.len(), 10);
        assert_eq!(failures, 0);
        assert!(ids.iter().all(|id| (1..=10).contains(id)));
    }

    #[test]
    fn test_overflow_requests_fail() {
        let (ids, failures) = draw(10, 20, 2);
        assert_eq!(ids.len(), 10);
        assert_eq!(failures, 10);

        let (ids, failures) = draw(100, 101, 3);
        assert_eq!(ids.len(), 100);
        assert_eq!(failures, 1);
    }

    #[test]
    fn test_unbounded_ids_are_distinct_and_nonzero() {
        let mut allocator = IdAllocator::seeded(42);
        let mut existing = HashSet::new();
        for _ in 0..2000 {
            let id = allocator.allocate(&existing);
            assert_ne!(id, 0);
            assert!(existing.insert(id));
        }
    }

    #[test]
    fn test_unbounded_gives_up_after_attempts() {
        let mut allocator = IdAllocator::seeded(9);
        // Every id is taken, so all 25 draws collide
        assert_eq!(allocator.allocate_with(|_| true), 0);
    }

    #[test]
    fn test_first_draw_below_initial_modulus() {
        let mut allocator = IdAllocator::seeded(5);
        let id = allocator.allocate(&HashSet::new());
        assert!(id >= 1 && u64::from(id) < INITIAL_MODULUS);
    }

    #[test]
    fn test_seeded_allocators_agree() {
        let mut a = IdAllocator::seeded(77);
        let mut b = IdAllocator::seeded(77);
        let empty = HashSet::new();
        for _ in 0..16 {
            assert_eq!(a.allocate(&empty), b.allocate(&empty));
        }
    }

    #[test]
    fn test_zero_capacity_always_exhausted() {
        let mut allocator = IdAllocator::seeded(1).with_capacity(0);
        assert_eq!(allocator.allocate(&HashSet::new()), 0);
    }
}
