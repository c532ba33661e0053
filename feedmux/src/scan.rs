use crate::storage::{StorageResult, StoreReader};
use crate::{Family, Identity, ItemId, Timestamp};
use bincode::{Decode, Encode};

/// How far back caching has progressed for one (identity, family)
///
/// `lower_item_date..=upper_item_date` is the single contiguous interval already
/// cached. Both are meaningless while `empty`.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ScanRecord {
    pub begin_date: Timestamp,
    /// set once the scan reached the oldest record the remote has
    pub end_date: Option<Timestamp>,
    pub empty: bool,
    pub upper_item_date: Timestamp,
    pub lower_item_date: Timestamp,
    pub item_count: u64,
}

impl ScanRecord {
    pub fn begin(now: Timestamp) -> Self {
        Self {
            begin_date: now,
            end_date: None,
            empty: true,
            upper_item_date: now,
            lower_item_date: now,
            item_count: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.end_date.is_some()
    }

    /// The record after caching a page
    ///
    /// `dates` are the created-at times of the page's items, `inserted` how many of
    /// them were not cached before.
    pub fn with_page(
        &self,
        dates: impl IntoIterator<Item = Timestamp>,
        inserted: u64,
        reached_end: bool,
        now: Timestamp,
    ) -> Self {
        let mut next = self.clone();
        for date in dates {
            if next.empty {
                next.empty = false;
                next.upper_item_date = date;
                next.lower_item_date = date;
            } else {
                next.upper_item_date = next.upper_item_date.max(date);
                next.lower_item_date = next.lower_item_date.min(date);
            }
        }
        next.item_count += inserted;
        if reached_end && next.end_date.is_none() {
            next.end_date = Some(now);
        }
        next
    }
}

/// The lower edge of a scan and the ids cached exactly on it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeSnapshot {
    pub lower_item_date: Timestamp,
    pub ids: Vec<ItemId>,
}

pub fn get_resume_snapshot(
    reader: &impl StoreReader,
    identity: Identity,
    family: Family,
) -> StorageResult<Option<ResumeSnapshot>> {
    let Some(record) = reader.get_scan_record(identity, family)? else {
        return Ok(None);
    };
    if record.empty {
        return Ok(None);
    }
    let ids = reader.item_ids_at(identity, family, record.lower_item_date)?;
    Ok(Some(ResumeSnapshot {
        lower_item_date: record.lower_item_date,
        ids,
    }))
}
