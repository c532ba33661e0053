pub mod cursor;
pub mod db_types;
pub mod dedup;
pub mod error;
pub mod fixture;
pub mod messenger;
pub mod queue;
pub mod scan;
pub mod sequence;
pub mod storage;
pub mod storage_fjall;
pub mod storage_mem;
pub mod store_types;
pub mod stream;

#[cfg(test)]
mod test_support;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use sequence::{ItemKind, SequenceKey};

/// Opaque numeric id of a tracked user
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Encode, Decode,
)]
#[serde(transparent)]
pub struct Identity(pub u64);

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Id of a primary item, unique within its [Family]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Encode, Decode,
)]
#[serde(transparent)]
pub struct ItemId(pub u64);

/// One of the two parallel item families
///
/// Each family has its own open/close items and its own comment kind, and gets
/// its own scan per identity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Encode, Decode,
)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    A,
    B,
}

impl Family {
    pub const ALL: [Family; 2] = [Family::A, Family::B];

    pub fn comment_kind(&self) -> ItemKind {
        match self {
            Family::A => ItemKind::CommentA,
            Family::B => ItemKind::CommentB,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::A => f.write_str("a"),
            Family::B => f.write_str("b"),
        }
    }
}

/// Millisecond timestamp
///
/// Stored big-endian in keys, so key byte order is time order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Encode, Decode,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Get a Timestamp from raw unix milliseconds
    pub fn from_raw_u64(ms: u64) -> Self {
        Self(ms)
    }
    /// Get the raw unix milliseconds
    pub fn to_raw_u64(&self) -> u64 {
        self.0
    }
    /// Get a timestamp for a specific time
    ///
    /// Times before the unix epoch clamp to zero.
    pub fn at(t: SystemTime) -> Self {
        let ms = t
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self(ms)
    }
    pub fn now() -> Self {
        Self::at(SystemTime::now())
    }
}

impl From<Timestamp> for SystemTime {
    fn from(t: Timestamp) -> Self {
        UNIX_EPOCH + Duration::from_millis(t.0)
    }
}

/// A primary item: an open event, with an optional close
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: ItemId,
    pub owner: Identity,
    pub created_at: Timestamp,
    pub closed_at: Option<Timestamp>,
    pub comment_count: u32,
    pub title: Option<String>,
}

/// A comment, identified by (item_id, order)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentRecord {
    pub item_id: ItemId,
    pub order: u32,
    pub created_at: Timestamp,
    /// absent for anonymous comments
    pub author: Option<Identity>,
    pub text: Option<String>,
}

/// An item as the store hands it back: the item plus its ordered comments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredItem {
    pub family: Family,
    pub item: ItemRecord,
    pub comments: Vec<CommentRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct IdentityProfile {
    pub name: String,
    pub created_at: Option<Timestamp>,
}

/// One page of cached history, as written by a fetch collaborator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedPage {
    pub items: Vec<StoredItem>,
    /// the remote has nothing older than this page
    pub reached_end: bool,
}

/// Everything the merged feed can emit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatchItem {
    UserCreated {
        identity: Identity,
        created_at: Timestamp,
    },
    Opened {
        family: Family,
        item: ItemRecord,
    },
    Closed {
        family: Family,
        item: ItemRecord,
        closed_at: Timestamp,
    },
    Commented {
        family: Family,
        /// author of the item the comment belongs to
        item_owner: Identity,
        comment: CommentRecord,
    },
}

impl BatchItem {
    /// The tracked identity this item is attributed to
    pub fn identity(&self) -> Identity {
        match self {
            BatchItem::UserCreated { identity, .. } => *identity,
            BatchItem::Opened { item, .. } | BatchItem::Closed { item, .. } => item.owner,
            BatchItem::Commented { item_owner, .. } => *item_owner,
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        match self {
            BatchItem::UserCreated { created_at, .. } => *created_at,
            BatchItem::Opened { item, .. } => item.created_at,
            BatchItem::Closed { closed_at, .. } => *closed_at,
            BatchItem::Commented { comment, .. } => comment.created_at,
        }
    }

    pub fn kind(&self) -> ItemKind {
        match self {
            BatchItem::UserCreated { .. } => ItemKind::UserCreated,
            BatchItem::Opened { .. } => ItemKind::Open,
            BatchItem::Closed { .. } => ItemKind::Close,
            BatchItem::Commented { family, .. } => family.comment_kind(),
        }
    }

    pub fn sequence_key(&self) -> SequenceKey {
        match self {
            BatchItem::UserCreated {
                identity,
                created_at,
            } => SequenceKey {
                timestamp: *created_at,
                kind: ItemKind::UserCreated,
                id: identity.0,
                owner: *identity,
                order: 0,
                family: None,
            },
            BatchItem::Opened { family, item } => SequenceKey {
                timestamp: item.created_at,
                kind: ItemKind::Open,
                id: item.id.0,
                owner: item.owner,
                order: 0,
                family: Some(*family),
            },
            BatchItem::Closed {
                family,
                item,
                closed_at,
            } => SequenceKey {
                timestamp: *closed_at,
                kind: ItemKind::Close,
                id: item.id.0,
                owner: item.owner,
                order: 0,
                family: Some(*family),
            },
            BatchItem::Commented {
                family,
                item_owner,
                comment,
            } => SequenceKey {
                timestamp: comment.created_at,
                kind: family.comment_kind(),
                id: comment.item_id.0,
                owner: *item_owner,
                order: comment.order,
                family: Some(*family),
            },
        }
    }

    /// Expand a stored item into its open event, close event, and comments
    pub fn expand(stored: StoredItem) -> Vec<BatchItem> {
        let StoredItem {
            family,
            item,
            comments,
        } = stored;
        let mut out = Vec::with_capacity(2 + comments.len());
        let owner = item.owner;
        for comment in comments {
            out.push(BatchItem::Commented {
                family,
                item_owner: owner,
                comment,
            });
        }
        if let Some(closed_at) = item.closed_at {
            out.push(BatchItem::Closed {
                family,
                item: item.clone(),
                closed_at,
            });
        }
        out.push(BatchItem::Opened { family, item });
        out
    }
}
