use crate::sequence::compare_sequence;
use crate::BatchItem;
use std::cmp::Ordering;

/// Decides which of two heap entries comes out first (`Greater` wins)
pub trait Comparator<T> {
    fn compare(&self, a: &T, b: &T) -> Ordering;
}

impl<T, F> Comparator<T> for F
where
    F: Fn(&T, &T) -> Ordering,
{
    fn compare(&self, a: &T, b: &T) -> Ordering {
        self(a, b)
    }
}

/// Array-backed max-heap whose ordering is supplied from outside
#[derive(Debug, Clone)]
pub struct Heap<T, C> {
    items: Vec<T>,
    cmp: C,
}

impl<T, C: Comparator<T>> Heap<T, C> {
    pub fn new(cmp: C) -> Self {
        Self {
            items: Vec::new(),
            cmp,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn peek(&self) -> Option<&T> {
        self.items.first()
    }

    pub fn push(&mut self, item: T) {
        self.items.push(item);
        self.sift_up(self.items.len() - 1);
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.items.is_empty() {
            return None;
        }
        let last = self.items.len() - 1;
        self.items.swap(0, last);
        let top = self.items.pop();
        if !self.items.is_empty() {
            self.sift_down(0);
        }
        top
    }

    /// Pop entries from the top for as long as `pred` accepts the top entry
    pub fn pop_while(&mut self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut out = Vec::new();
        while self.peek().map(&mut pred).unwrap_or(false) {
            if let Some(item) = self.pop() {
                out.push(item);
            }
        }
        out
    }

    /// Keep only the entries matching `keep`, restoring the heap afterwards
    pub fn retain(&mut self, keep: impl FnMut(&T) -> bool) {
        self.items.retain(keep);
        for i in (0..self.items.len() / 2).rev() {
            self.sift_down(i);
        }
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.cmp.compare(&self.items[i], &self.items[parent]) != Ordering::Greater {
                break;
            }
            self.items.swap(i, parent);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        let len = self.items.len();
        loop {
            let left = 2 * i + 1;
            let right = left + 1;
            let mut best = i;
            if left < len && self.cmp.compare(&self.items[left], &self.items[best]) == Ordering::Greater {
                best = left;
            }
            if right < len && self.cmp.compare(&self.items[right], &self.items[best]) == Ordering::Greater {
                best = right;
            }
            if best == i {
                break;
            }
            self.items.swap(i, best);
            i = best;
        }
    }
}

/// Orders batch items by their [SequenceKey](crate::SequenceKey)
#[derive(Debug, Clone, Copy, Default)]
pub struct BySequence;

impl Comparator<BatchItem> for BySequence {
    fn compare(&self, a: &BatchItem, b: &BatchItem) -> Ordering {
        compare_sequence(&a.sequence_key(), &b.sequence_key())
    }
}

pub type MergeQueue = Heap<BatchItem, BySequence>;

impl Default for MergeQueue {
    fn default() -> Self {
        Heap::new(BySequence)
    }
}
