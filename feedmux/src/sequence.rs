use crate::{Family, Identity, Timestamp};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    UserCreated,
    Open,
    Close,
    CommentA,
    CommentB,
}

impl ItemKind {
    pub fn is_comment(&self) -> bool {
        matches!(self, ItemKind::CommentA | ItemKind::CommentB)
    }
}

/// Total order key for the merged feed
///
/// `id` is the entity id: the item id for open/close events and comments, the
/// identity for user-created events. `owner` is the author of the item a comment
/// belongs to. `family` is unset for user-created events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SequenceKey {
    pub timestamp: Timestamp,
    pub kind: ItemKind,
    pub id: u64,
    pub owner: Identity,
    pub order: u32,
    pub family: Option<Family>,
}

/// Feed order: `Greater` means "emitted first"
///
/// - newer timestamps first
/// - at one timestamp, comments before everything else
/// - comments: B before A, then larger item owner, then larger order
/// - everything else: larger id, whatever the kind
///
/// The trailing comparisons (comment item id; non-comment kind, owner and
/// family) only break ties the rules above leave open, so the order is total.
pub fn compare_sequence(a: &SequenceKey, b: &SequenceKey) -> Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.kind.is_comment().cmp(&b.kind.is_comment()))
        .then_with(|| {
            if a.kind.is_comment() {
                comment_rank(a.kind)
                    .cmp(&comment_rank(b.kind))
                    .then_with(|| a.owner.cmp(&b.owner))
                    .then_with(|| a.order.cmp(&b.order))
                    .then_with(|| a.id.cmp(&b.id))
            } else {
                a.id.cmp(&b.id)
                    .then_with(|| a.kind.cmp(&b.kind))
                    .then_with(|| a.owner.cmp(&b.owner))
                    .then_with(|| a.family.cmp(&b.family))
            }
        })
}

fn comment_rank(kind: ItemKind) -> u8 {
    match kind {
        ItemKind::CommentB => 1,
        _ => 0,
    }
}

impl Ord for SequenceKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_sequence(self, other)
    }
}

impl PartialOrd for SequenceKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(ts: u64, kind: ItemKind, id: u64, owner: u64, order: u32) -> SequenceKey {
        let family = match kind {
            ItemKind::UserCreated => None,
            ItemKind::CommentB => Some(Family::B),
            _ => Some(Family::A),
        };
        SequenceKey {
            timestamp: Timestamp::from_raw_u64(ts),
            kind,
            id,
            owner: Identity(owner),
            order,
            family,
        }
    }

    #[test]
    fn newer_first() {
        let newer = key(20, ItemKind::UserCreated, 1, 1, 0);
        let older = key(10, ItemKind::CommentB, 99, 99, 9);
        assert_eq!(compare_sequence(&newer, &older), Ordering::Greater);
    }

    #[test]
    fn comments_precede_items_at_same_time() {
        let comment = key(10, ItemKind::CommentA, 1, 1, 0);
        let open = key(10, ItemKind::Open, 500, 500, 0);
        let close = key(10, ItemKind::Close, 500, 500, 0);
        assert_eq!(compare_sequence(&comment, &open), Ordering::Greater);
        assert_eq!(compare_sequence(&comment, &close), Ordering::Greater);
    }

    #[test]
    fn comment_b_before_comment_a() {
        let b = key(10, ItemKind::CommentB, 1, 1, 0);
        let a = key(10, ItemKind::CommentA, 9, 9, 9);
        assert_eq!(compare_sequence(&b, &a), Ordering::Greater);
    }

    #[test]
    fn comments_by_owner_then_order() {
        let big_owner = key(10, ItemKind::CommentA, 1, 7, 0);
        let small_owner = key(10, ItemKind::CommentA, 1, 3, 5);
        assert_eq!(compare_sequence(&big_owner, &small_owner), Ordering::Greater);

        let later = key(10, ItemKind::CommentA, 1, 3, 2);
        let earlier = key(10, ItemKind::CommentA, 1, 3, 1);
        assert_eq!(compare_sequence(&later, &earlier), Ordering::Greater);
    }

    #[test]
    fn non_comments_by_id_regardless_of_kind() {
        let open_big = key(10, ItemKind::Open, 8, 1, 0);
        let close_small = key(10, ItemKind::Close, 3, 1, 0);
        let created = key(10, ItemKind::UserCreated, 5, 5, 0);
        assert_eq!(compare_sequence(&open_big, &close_small), Ordering::Greater);
        assert_eq!(compare_sequence(&created, &close_small), Ordering::Greater);
        assert_eq!(compare_sequence(&open_big, &created), Ordering::Greater);
    }

    #[test]
    fn close_after_open_of_same_item_at_same_time() {
        let open = key(10, ItemKind::Open, 4, 1, 0);
        let close = key(10, ItemKind::Close, 4, 1, 0);
        assert_eq!(compare_sequence(&close, &open), Ordering::Greater);
    }

    #[test]
    fn same_id_in_both_families_still_orders() {
        let a = key(10, ItemKind::Open, 5, 1, 0);
        let b = SequenceKey {
            family: Some(Family::B),
            ..a
        };
        assert_eq!(compare_sequence(&b, &a), Ordering::Greater);
        assert_eq!(compare_sequence(&a, &b), Ordering::Less);

        let other_owner = key(10, ItemKind::Open, 5, 2, 0);
        assert_eq!(compare_sequence(&other_owner, &a), Ordering::Greater);
    }

    #[test]
    fn equal_keys() {
        let k = key(10, ItemKind::CommentB, 4, 1, 2);
        assert_eq!(compare_sequence(&k, &k), Ordering::Equal);
        assert_eq!(k.cmp(&k.clone()), Ordering::Equal);
    }
}
