use crate::error::StorageError;
use crate::scan::ScanRecord;
use crate::{FetchedPage, Family, Identity, IdentityProfile, ItemId, StoredItem, Timestamp};
use std::collections::HashMap;
use std::path::Path;

pub type StorageResult<T> = Result<T, StorageError>;

/// A descending range query over one scan's cached items
///
/// Both bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemQuery {
    pub identity: Identity,
    pub family: Family,
    pub upper: Timestamp,
    pub lower: Timestamp,
    pub limit: usize,
}

pub trait StorageWhatever<R: StoreReader, W: StoreWriter, C> {
    fn init(path: impl AsRef<Path>, config: C) -> StorageResult<(R, W)>
    where
        Self: Sized;
}

/// Write half, used by fetch collaborators to cache what they fetched
pub trait StoreWriter {
    /// Create the scan record for a pair if it does not exist yet
    fn begin_scan(
        &mut self,
        identity: Identity,
        family: Family,
        now: Timestamp,
    ) -> StorageResult<ScanRecord>;

    /// Cache a fetched page and advance the pair's scan record
    ///
    /// Items already cached are overwritten but not counted again.
    fn insert_page(
        &mut self,
        identity: Identity,
        family: Family,
        page: &FetchedPage,
        now: Timestamp,
    ) -> StorageResult<ScanRecord>;

    fn put_profile(&mut self, identity: Identity, profile: &IdentityProfile) -> StorageResult<()>;
}

/// Read half, used by the stream engine
pub trait StoreReader: Clone {
    fn check_available(&self) -> StorageResult<()>;

    fn get_scan_record(&self, identity: Identity, family: Family)
        -> StorageResult<Option<ScanRecord>>;

    /// Items in the query's range, newest first, ties by descending id
    fn query_items_descending(&self, query: &ItemQuery) -> StorageResult<Vec<StoredItem>>;

    /// Ids of this pair's items created exactly at `at`
    fn item_ids_at(
        &self,
        identity: Identity,
        family: Family,
        at: Timestamp,
    ) -> StorageResult<Vec<ItemId>>;

    fn get_profile(&self, identity: Identity) -> StorageResult<Option<IdentityProfile>>;

    /// Identities without a stored profile are left out
    fn resolve_display_names(
        &self,
        identities: &[Identity],
    ) -> StorageResult<HashMap<Identity, String>> {
        let mut names = HashMap::with_capacity(identities.len());
        for identity in identities {
            if let Some(profile) = self.get_profile(*identity)? {
                names.insert(*identity, profile.name);
            }
        }
        Ok(names)
    }
}

/// Pages only ever hold items of the pair they were fetched for
pub(crate) fn check_page_item(
    identity: Identity,
    family: Family,
    stored: &StoredItem,
) -> StorageResult<()> {
    if stored.family != family || stored.item.owner != identity {
        return Err(StorageError::BadStateError(format!(
            "page for {identity}/{family} contained item {:?} of {}/{}",
            stored.item.id, stored.item.owner, stored.family
        )));
    }
    Ok(())
}
