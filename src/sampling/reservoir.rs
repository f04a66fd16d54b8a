//! Single-pass reservoir sampling with mergeable partial reservoirs.
//!
//! Invariant: after observing `n` items, a reservoir of capacity `k` holds a
//! uniform random subset of size `min(k, n)` of those items, so each item is
//! included with probability `k/n`. Merging two reservoirs built over
//! disjoint streams yields a reservoir with the same guarantee over the
//! combined stream.

use rand::Rng;
use rand::seq::{SliceRandom, index};

/// Fixed-capacity uniform sample of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservoir<T> {
    capacity: usize,
    items: Vec<T>,
    seen: u64,
}

impl<T> Reservoir<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: Vec::with_capacity(capacity.min(1024)),
            seen: 0,
        }
    }

    /// Observe the next stream item.
    ///
    /// For the i-th item (1-indexed): append while not full, otherwise draw
    /// `j` uniformly from `[1, i]` and overwrite slot `j-1` when `j <= k`.
    pub fn observe<R: Rng + ?Sized>(&mut self, item: T, rng: &mut R) {
        self.seen += 1;
        if self.items.len() < self.capacity {
            self.items.push(item);
            return;
        }

        let j = rng.random_range(1..=self.seen);
        if j <= self.capacity as u64 {
            self.items[(j - 1) as usize] = item;
        }
    }

    /// Observe every item of a stream, in order.
    pub fn extend<I, R>(&mut self, stream: I, rng: &mut R)
    where
        I: IntoIterator<Item = T>,
        R: Rng + ?Sized,
    {
        for item in stream {
            self.observe(item, rng);
        }
    }

    /// Combine with a reservoir built over a disjoint stream.
    ///
    /// The number of merged items taken from `self` is drawn from the
    /// hypergeometric distribution over `n1 + n2` stream positions, so each
    /// side is represented in proportion to the stream length it covers,
    /// not to the size of its reservoir. The chosen items of each side keep
    /// their slot order; `self`'s items come first. The merged capacity is
    /// `self`'s capacity.
    pub fn merge<R: Rng + ?Sized>(self, other: Self, rng: &mut R) -> Self {
        let capacity = self.capacity;
        let seen = self.seen + other.seen;
        let target = (capacity as u64).min(seen) as usize;

        let mut remaining_left = self.seen;
        let mut remaining_right = other.seen;
        let mut from_left = 0usize;
        for _ in 0..target {
            if rng.random_range(0..remaining_left + remaining_right) < remaining_left {
                from_left += 1;
                remaining_left -= 1;
            } else {
                remaining_right -= 1;
            }
        }
        let from_right = target - from_left;

        // from_left <= min(k, n1) == self.items.len(), same for the right side
        let left_len = self.items.len();
        let right_len = other.items.len();
        let left_pick = index::sample(rng, left_len, from_left.min(left_len)).into_vec();
        let right_pick = index::sample(rng, right_len, from_right.min(right_len)).into_vec();

        let mut items = pick(self.items, left_pick);
        items.extend(pick(other.items, right_pick));

        Self {
            capacity,
            items,
            seen,
        }
    }

    /// Put the held items in uniformly random order.
    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.items.shuffle(rng);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of stream items observed so far.
    pub fn seen(&self) -> u64 {
        self.seen
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }
}

/// Keep the items at `indices`, preserving their original order.
fn pick<T>(items: Vec<T>, mut indices: Vec<usize>) -> Vec<T> {
    indices.sort_unstable();
    let mut wanted = indices.into_iter().peekable();
    items
        .into_iter()
        .enumerate()
        .filter_map(|(i, item)| {
            if wanted.peek() == Some(&i) {
                wanted.next();
                Some(item)
            } else {
                None
            }
        })
        .collect()
}
