//! Generic binary min-heap over a growable array.
//!
//! The comparator defines the order; a max-heap is obtained by inverting it
//! (the full-text result iterator does exactly that). A freshly pushed
//! element rises above elements it compares equal to, so equal-keyed entries
//! pop in reverse insertion order.

use std::cmp::Ordering;

pub type Comparator<T> = fn(&T, &T) -> Ordering;

#[derive(Debug)]
pub struct MinHeap<T> {
    items: Vec<T>,
    cmp: Comparator<T>,
}

impl<T> MinHeap<T> {
    #[must_use]
    pub fn new(cmp: Comparator<T>) -> Self {
        Self {
            items: Vec::new(),
            cmp,
        }
    }

    #[must_use]
    pub fn with_capacity(cap: usize, cmp: Comparator<T>) -> Self {
        Self {
            items: Vec::with_capacity(cap),
            cmp,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The comparator-minimum element, if any.
    pub fn peek(&self) -> Option<&T> {
        self.items.first()
    }

    pub fn push(&mut self, item: T) {
        self.items.push(item);
        self.sift_up(self.items.len() - 1);
    }

    pub fn pop(&mut self) -> Option<T> {
        let last = self.items.len().checked_sub(1)?;
        self.items.swap(0, last);
        let item = self.items.pop()?;
        self.sift_down(0);
        Some(item)
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Unordered view of the stored elements.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    fn sift_up(&mut self, mut at: usize) {
        while at > 0 {
            let parent = (at - 1) / 2;
            if (self.cmp)(&self.items[at], &self.items[parent]) == Ordering::Greater {
                break;
            }
            self.items.swap(at, parent);
            at = parent;
        }
    }

    fn sift_down(&mut self, mut at: usize) {
        let len = self.items.len();
        loop {
            let left = 2 * at + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let mut child = left;
            if right < len && (self.cmp)(&self.items[right], &self.items[left]) == Ordering::Less {
                child = right;
            }
            if (self.cmp)(&self.items[child], &self.items[at]) == Ordering::Less {
                self.items.swap(at, child);
                at = child;
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use rand::{Rng, SeedableRng};

    use super::MinHeap;

    fn int_cmp(a: &i64, b: &i64) -> Ordering {
        a.cmp(b)
    }

    #[test]
    fn push_pop_sorted() {
        let mut heap = MinHeap::new(int_cmp);
        for v in [5i64, 3, 8, 1, 9, 2, 7] {
            heap.push(v);
        }
        assert_eq!(heap.len(), 7);
        assert_eq!(heap.peek(), Some(&1));

        let mut drained = Vec::new();
        while let Some(v) = heap.pop() {
            drained.push(v);
        }
        assert_eq!(drained, [1, 2, 3, 5, 7, 8, 9]);
        assert!(heap.pop().is_none());
        assert!(heap.peek().is_none());
    }

    #[test]
    fn push_from_empty_grows() {
        let mut heap = MinHeap::with_capacity(0, int_cmp);
        heap.push(1);
        assert_eq!(heap.peek(), Some(&1));
    }

    #[test]
    fn min_tracks_comparator_minimum() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut heap = MinHeap::new(int_cmp);
        let mut shadow: Vec<i64> = Vec::new();

        for _ in 0..1000 {
            if shadow.is_empty() || rng.gen_bool(0.6) {
                let v = rng.gen_range(-1000..1000);
                heap.push(v);
                shadow.push(v);
            } else {
                let popped = heap.pop().unwrap();
                let min_at = shadow
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, v)| **v)
                    .map(|(i, _)| i)
                    .unwrap();
                assert_eq!(popped, shadow.swap_remove(min_at));
            }
            assert_eq!(heap.peek().copied(), shadow.iter().min().copied());
        }
    }

    #[test]
    fn equal_keys_pop_in_reverse_insertion_order() {
        let mut heap: MinHeap<(i64, &str)> = MinHeap::new(|a, b| a.0.cmp(&b.0));
        heap.push((1, "first"));
        heap.push((1, "second"));
        heap.push((1, "third"));
        assert_eq!(heap.pop(), Some((1, "third")));
        assert_eq!(heap.pop(), Some((1, "second")));
        assert_eq!(heap.pop(), Some((1, "first")));
    }

    #[test]
    fn inverted_comparator_is_a_max_heap() {
        let mut heap: MinHeap<i64> = MinHeap::new(|a, b| b.cmp(a));
        for v in [2i64, 9, 4, 7] {
            heap.push(v);
        }
        assert_eq!(heap.pop(), Some(9));
        assert_eq!(heap.pop(), Some(7));
        assert_eq!(heap.pop(), Some(4));
        assert_eq!(heap.pop(), Some(2));
    }
}
