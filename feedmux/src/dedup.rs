use crate::scan::ResumeSnapshot;
use crate::{ItemId, Timestamp};
use std::collections::HashSet;
use std::fmt;

/// How far down a cursor has proven its contribution complete
///
/// Variant order gives the ordering: `Floor` (-inf) < `At(_)` < `Ceiling` (+inf).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Watermark {
    Floor,
    At(Timestamp),
    Ceiling,
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Watermark::Floor => f.write_str("-inf"),
            Watermark::At(t) => write!(f, "{}", t.to_raw_u64()),
            Watermark::Ceiling => f.write_str("+inf"),
        }
    }
}

/// Watermark plus the ids already seen exactly at the watermark
///
/// Queries bounded above by the watermark are inclusive, so they return the
/// watermark's own timestamp again; the visited set filters those repeats.
#[derive(Debug, Clone)]
pub struct DedupBoundary {
    watermark: Watermark,
    visited: HashSet<ItemId>,
}

impl Default for DedupBoundary {
    fn default() -> Self {
        Self::new()
    }
}

impl DedupBoundary {
    pub fn new() -> Self {
        Self {
            watermark: Watermark::Ceiling,
            visited: HashSet::new(),
        }
    }

    /// Start at a previous session's lower edge, with its ids already seen
    pub fn seeded(snapshot: &ResumeSnapshot) -> Self {
        Self {
            watermark: Watermark::At(snapshot.lower_item_date),
            visited: snapshot.ids.iter().copied().collect(),
        }
    }

    pub fn watermark(&self) -> Watermark {
        self.watermark
    }

    pub fn visited_len(&self) -> usize {
        self.visited.len()
    }

    pub fn advance(&mut self, date: Timestamp) {
        if Watermark::At(date) < self.watermark {
            self.visited.clear();
            self.watermark = Watermark::At(date);
        }
    }

    /// Returns true if the item is fresh
    ///
    /// Anything above the watermark was already passed and counts as a duplicate.
    pub fn visit(&mut self, date: Timestamp, id: ItemId) -> bool {
        self.advance(date);
        if Watermark::At(date) != self.watermark {
            return false;
        }
        self.visited.insert(id)
    }

    /// Drop to -inf for good
    pub fn exhaust(&mut self) {
        self.visited.clear();
        self.watermark = Watermark::Floor;
    }
}
