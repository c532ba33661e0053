use crate::db_types::{CommentOrder, DbConcat, StaticStr, UseBincodePlz};
use crate::scan::ScanRecord;
use crate::{
    CommentRecord, Family, Identity, IdentityProfile, ItemId, ItemRecord, StoredItem, Timestamp,
};
use bincode::{Decode, Encode};

/// Bumped whenever the key or value layout changes
pub const FORMAT_VERSION: u32 = 1;

/// key format: ["format"]
#[derive(Debug, PartialEq)]
pub struct FormatVersionKey {}
impl StaticStr for FormatVersionKey {
    fn static_str() -> &'static str {
        "format"
    }
}
#[derive(Debug, PartialEq, Encode, Decode)]
pub struct FormatVersionValue(pub u32);
impl UseBincodePlz for FormatVersionValue {}

/// key format: [identity(u64)|family(u8)]
pub type ScanKey = DbConcat<Identity, Family>;
impl ScanKey {
    pub fn new(identity: Identity, family: Family) -> Self {
        Self::from_pair(identity, family)
    }
}
impl UseBincodePlz for ScanRecord {}
pub type ScanValue = ScanRecord;

type ItemPrefix = DbConcat<Identity, Family>;
type ItemSuffix = DbConcat<Timestamp, ItemId>;

/// key format: [identity(u64)|family(u8)|created_at(u64)|item_id(u64)]
///
/// all big-endian, so a reversed range walks one scan's items newest-first, ties by
/// descending id
pub type ItemKey = DbConcat<ItemPrefix, ItemSuffix>;
impl ItemKey {
    pub fn new(identity: Identity, family: Family, created_at: Timestamp, id: ItemId) -> Self {
        Self::from_pair(
            DbConcat::from_pair(identity, family),
            DbConcat::from_pair(created_at, id),
        )
    }
    /// Smallest possible key at this timestamp
    pub fn floor(identity: Identity, family: Family, at: Timestamp) -> Self {
        Self::new(identity, family, at, ItemId(0))
    }
    /// Largest possible key at this timestamp
    pub fn ceiling(identity: Identity, family: Family, at: Timestamp) -> Self {
        Self::new(identity, family, at, ItemId(u64::MAX))
    }
    pub fn identity(&self) -> Identity {
        self.prefix.prefix
    }
    pub fn family(&self) -> Family {
        self.prefix.suffix
    }
    pub fn created_at(&self) -> Timestamp {
        self.suffix.prefix
    }
    pub fn id(&self) -> ItemId {
        self.suffix.suffix
    }
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct ItemValue {
    pub closed_at: Option<Timestamp>,
    pub comment_count: u32,
    pub title: Option<String>,
}
impl UseBincodePlz for ItemValue {}
impl From<&ItemRecord> for ItemValue {
    fn from(item: &ItemRecord) -> Self {
        Self {
            closed_at: item.closed_at,
            comment_count: item.comment_count,
            title: item.title.clone(),
        }
    }
}

/// key format: [family(u8)|item_id(u64)|order(u32)]
pub type CommentKey = DbConcat<DbConcat<Family, ItemId>, CommentOrder>;
impl CommentKey {
    pub fn new(family: Family, item: ItemId, order: u32) -> Self {
        Self::from_pair(DbConcat::from_pair(family, item), CommentOrder(order))
    }
    pub fn first(family: Family, item: ItemId) -> Self {
        Self::new(family, item, 0)
    }
    pub fn last(family: Family, item: ItemId) -> Self {
        Self::new(family, item, u32::MAX)
    }
    pub fn item_id(&self) -> ItemId {
        self.prefix.suffix
    }
    pub fn order(&self) -> u32 {
        self.suffix.0
    }
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct CommentValue {
    pub created_at: Timestamp,
    pub author: Option<Identity>,
    pub text: Option<String>,
}
impl UseBincodePlz for CommentValue {}
impl From<&CommentRecord> for CommentValue {
    fn from(comment: &CommentRecord) -> Self {
        Self {
            created_at: comment.created_at,
            author: comment.author,
            text: comment.text.clone(),
        }
    }
}

/// key format: [identity(u64)]
pub type ProfileKey = Identity;
impl UseBincodePlz for IdentityProfile {}
pub type ProfileValue = IdentityProfile;

pub fn item_from_parts(key: &ItemKey, value: ItemValue) -> ItemRecord {
    ItemRecord {
        id: key.id(),
        owner: key.identity(),
        created_at: key.created_at(),
        closed_at: value.closed_at,
        comment_count: value.comment_count,
        title: value.title,
    }
}

pub fn comment_from_parts(key: &CommentKey, value: CommentValue) -> CommentRecord {
    CommentRecord {
        item_id: key.item_id(),
        order: key.order(),
        created_at: value.created_at,
        author: value.author,
        text: value.text,
    }
}

/// Every key/value pair needed to cache one stored item
pub struct ItemWrites {
    pub item: (ItemKey, ItemValue),
    pub comments: Vec<(CommentKey, CommentValue)>,
}

impl From<&StoredItem> for ItemWrites {
    fn from(stored: &StoredItem) -> Self {
        let item = &stored.item;
        Self {
            item: (
                ItemKey::new(item.owner, stored.family, item.created_at, item.id),
                item.into(),
            ),
            comments: stored
                .comments
                .iter()
                .map(|c| (CommentKey::new(stored.family, item.id, c.order), c.into()))
                .collect(),
        }
    }
}
