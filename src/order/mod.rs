//! Round-Robin-Random Ordering
//!
//! Provides the probe-target sequence for the failure detector. Each element
//! is visited once per round in a random sequence, and the sequence is
//! reshuffled between rounds. In an order of n elements, successive visits to
//! the same element are therefore separated by at most 2n-1 calls to `next`.
//!
//! Randomness is supplied by the caller so that the protocol engine can be
//! driven deterministically under test.

use rand::Rng;
use rand::seq::SliceRandom;

/// A randomized round-based sequence of values. Every value is returned once
/// per round; the order of a round is not revealed in advance.
#[derive(Debug, Clone)]
pub struct Order<T> {
    items: Vec<T>,
    next: usize,
}

impl<T> Default for Order<T> {
    fn default() -> Self {
        Order {
            items: Vec::new(),
            next: 0,
        }
    }
}

impl<T: Clone + Eq> Order<T> {
    pub fn new() -> Self {
        Order {
            items: Vec::new(),
            next: 0,
        }
    }

    /// Returns the next value in the order, shuffling first if a round has
    /// just ended. Returns `None` if the order is empty.
    pub fn next<R: Rng>(&mut self, rng: &mut R) -> Option<T> {
        if self.items.is_empty() {
            return None;
        }
        if self.next == self.items.len() {
            self.next = 0;
            self.items.shuffle(rng);
        }
        let value = self.items[self.next].clone();
        self.next += 1;
        Some(value)
    }

    /// Inserts a value at a uniformly random position. Depending on where it
    /// lands relative to the visited prefix, the value may or may not be
    /// returned in the current round.
    pub fn add<R: Rng>(&mut self, value: T, rng: &mut R) {
        let pos = rng.gen_range(0..=self.items.len());
        self.add_at(value, pos);
    }

    // Inserts at index pos, which must be in [0, len]. Insertions into the
    // visited prefix advance the round cursor past the new value.
    fn add_at(&mut self, value: T, pos: usize) {
        self.items.push(value);
        let last = self.items.len() - 1;
        if pos < self.next {
            self.items.swap(self.next, last);
            self.next += 1;
        } else {
            self.items.swap(pos, last);
        }
    }

    /// Removes the first instance of a value, if present.
    pub fn remove(&mut self, value: &T) {
        if let Some(pos) = self.items.iter().position(|v| v == value) {
            self.remove_at(pos);
        }
    }

    fn remove_at(&mut self, mut pos: usize) {
        if pos < self.next {
            self.next -= 1;
            self.items.swap(pos, self.next);
            pos = self.next;
        }
        let last = self.items.len() - 1;
        self.items.swap(pos, last);
        self.items.pop();
    }

    /// Returns up to n distinct values other than `exclude`, chosen uniformly
    /// at random. Returns fewer than n only if the order does not hold that
    /// many other values.
    pub fn independent_sample<R: Rng>(&self, n: usize, exclude: &T, rng: &mut R) -> Vec<T> {
        let mut chosen = Vec::new();
        for i in rand::seq::index::sample(rng, self.items.len(), self.items.len()) {
            if chosen.len() == n {
                break;
            }
            let value = &self.items[i];
            if value == exclude {
                continue;
            }
            chosen.push(value.clone());
        }
        chosen
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, value: &T) -> bool {
        self.items.contains(value)
    }

    #[cfg(test)]
    fn from_parts(items: Vec<T>, next: usize) -> Self {
        Order { items, next }
    }

    #[cfg(test)]
    fn parts(&self) -> (&[T], usize) {
        (&self.items, self.next)
    }
}
