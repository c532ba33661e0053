use crate::db_types::{db_complete, key_range, DbBytes, DbStaticStr, StaticStr};
use crate::error::StorageError;
use crate::scan::ScanRecord;
use crate::storage::{
    check_page_item, ItemQuery, StorageResult, StorageWhatever, StoreReader, StoreWriter,
};
use crate::store_types::{
    comment_from_parts, item_from_parts, CommentKey, CommentValue, FormatVersionKey,
    FormatVersionValue, ItemKey, ItemValue, ItemWrites, ProfileKey, ProfileValue, ScanKey,
    ScanValue, FORMAT_VERSION,
};
use crate::{
    CommentRecord, FetchedPage, Family, Identity, IdentityProfile, ItemId, StoredItem, Timestamp,
};
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, Snapshot};
use std::collections::HashSet;
use std::path::Path;

/**
 * data format:
 *
 * Partition: 'global'
 *
 *  - Layout version, checked on open
 *      key: "format" (literal)
 *      val: u32
 *
 *
 * Partition: 'scans'
 *
 *  - How far back each (identity, family) has been cached
 *      key: u64 || u8 (identity, family tag)
 *      val: bincode ScanRecord
 *
 *
 * Partition: 'items'
 *
 *  - Primary items, walked newest-first with a reversed range
 *      key: u64 || u8 || u64 || u64 (identity, family tag, created_at, item id)
 *      val: bincode (closed_at, comment count, title)
 *
 *
 * Partition: 'comments'
 *
 *  - Comments per item, in order
 *      key: u8 || u64 || u32 (family tag, item id, order)
 *      val: bincode (created_at, author, text)
 *
 *
 * Partition: 'profiles'
 *
 *  - Display names and account creation times
 *      key: u64 (identity)
 *      val: bincode IdentityProfile
 **/
#[derive(Debug)]
pub struct FjallStorage {}

#[derive(Debug, Clone)]
pub struct FjallConfig {
    /// fsync interval for the journal, `None` leaves it to the os
    pub fsync_ms: Option<u16>,
}

impl Default for FjallConfig {
    fn default() -> Self {
        Self {
            #[cfg(not(test))]
            fsync_ms: Some(4_000),
            #[cfg(test)]
            fsync_ms: None,
        }
    }
}

impl StorageWhatever<FjallReader, FjallWriter, FjallConfig> for FjallStorage {
    fn init(
        path: impl AsRef<Path>,
        config: FjallConfig,
    ) -> StorageResult<(FjallReader, FjallWriter)> {
        log::info!("opening fjall store at {:?}", path.as_ref());
        let keyspace = Config::new(path).fsync_ms(config.fsync_ms).open()?;

        let global = keyspace.open_partition("global", PartitionCreateOptions::default())?;
        let scans = keyspace.open_partition("scans", PartitionCreateOptions::default())?;
        let items = keyspace.open_partition("items", PartitionCreateOptions::default())?;
        let comments = keyspace.open_partition("comments", PartitionCreateOptions::default())?;
        let profiles = keyspace.open_partition("profiles", PartitionCreateOptions::default())?;

        match get_static::<FormatVersionKey, FormatVersionValue>(&global)? {
            Some(FormatVersionValue(v)) if v == FORMAT_VERSION => {}
            Some(FormatVersionValue(v)) => {
                return Err(StorageError::InitError(format!(
                    "store has format {v} but this build writes {FORMAT_VERSION}, refusing to start."
                )))
            }
            None => {
                log::info!("new store, writing format {FORMAT_VERSION}");
                insert_static::<FormatVersionKey>(&global, FormatVersionValue(FORMAT_VERSION))?;
            }
        }

        let reader = FjallReader {
            keyspace: keyspace.clone(),
            global,
            scans: scans.clone(),
            items: items.clone(),
            comments: comments.clone(),
            profiles: profiles.clone(),
        };
        let writer = FjallWriter {
            keyspace,
            scans,
            items,
            comments,
            profiles,
        };
        Ok((reader, writer))
    }
}

#[derive(Clone)]
pub struct FjallReader {
    keyspace: Keyspace,
    global: PartitionHandle,
    scans: PartitionHandle,
    items: PartitionHandle,
    comments: PartitionHandle,
    profiles: PartitionHandle,
}

impl StoreReader for FjallReader {
    fn check_available(&self) -> StorageResult<()> {
        match get_static::<FormatVersionKey, FormatVersionValue>(&self.global)? {
            Some(_) => Ok(()),
            None => Err(StorageError::Unavailable(
                "format key is gone from the global partition".to_string(),
            )),
        }
    }

    fn get_scan_record(
        &self,
        identity: Identity,
        family: Family,
    ) -> StorageResult<Option<ScanRecord>> {
        let key_bytes = ScanKey::new(identity, family).to_db_bytes()?;
        let record = self
            .scans
            .get(&key_bytes)?
            .as_deref()
            .map(db_complete::<ScanValue>)
            .transpose()?;
        Ok(record)
    }

    fn query_items_descending(&self, query: &ItemQuery) -> StorageResult<Vec<StoredItem>> {
        if query.lower > query.upper || query.limit == 0 {
            return Ok(vec![]);
        }
        // items and their comments from the same point in time
        let instant = self.keyspace.instant();
        let items = self.items.snapshot_at(instant);
        let comments = self.comments.snapshot_at(instant);

        let range = key_range(
            &ItemKey::floor(query.identity, query.family, query.lower),
            &ItemKey::ceiling(query.identity, query.family, query.upper),
        )?;
        let mut out = Vec::with_capacity(query.limit.min(64));
        for kv in items.range(range).rev().take(query.limit) {
            let (key_bytes, val_bytes) = kv.map_err(fjall::Error::from)?;
            let key = db_complete::<ItemKey>(&key_bytes)?;
            let value = db_complete::<ItemValue>(&val_bytes)?;
            let item = item_from_parts(&key, value);
            let item_comments = get_comments(&comments, query.family, item.id)?;
            out.push(StoredItem {
                family: query.family,
                item,
                comments: item_comments,
            });
        }
        Ok(out)
    }

    fn item_ids_at(
        &self,
        identity: Identity,
        family: Family,
        at: Timestamp,
    ) -> StorageResult<Vec<ItemId>> {
        let range = key_range(
            &ItemKey::floor(identity, family, at),
            &ItemKey::ceiling(identity, family, at),
        )?;
        let mut ids = vec![];
        for kv in self.items.range(range) {
            let (key_bytes, _) = kv?;
            ids.push(db_complete::<ItemKey>(&key_bytes)?.id());
        }
        Ok(ids)
    }

    fn get_profile(&self, identity: Identity) -> StorageResult<Option<IdentityProfile>> {
        let key_bytes = ProfileKey::from(identity).to_db_bytes()?;
        let profile = self
            .profiles
            .get(&key_bytes)?
            .as_deref()
            .map(db_complete::<ProfileValue>)
            .transpose()?;
        Ok(profile)
    }
}

fn get_comments(
    comments: &Snapshot,
    family: Family,
    item: ItemId,
) -> StorageResult<Vec<CommentRecord>> {
    let range = key_range(&CommentKey::first(family, item), &CommentKey::last(family, item))?;
    let mut out = vec![];
    for kv in comments.range(range) {
        let (key_bytes, val_bytes) = kv.map_err(fjall::Error::from)?;
        let key = db_complete::<CommentKey>(&key_bytes)?;
        let value = db_complete::<CommentValue>(&val_bytes)?;
        out.push(comment_from_parts(&key, value));
    }
    Ok(out)
}

pub struct FjallWriter {
    keyspace: Keyspace,
    scans: PartitionHandle,
    items: PartitionHandle,
    comments: PartitionHandle,
    profiles: PartitionHandle,
}

impl StoreWriter for FjallWriter {
    fn begin_scan(
        &mut self,
        identity: Identity,
        family: Family,
        now: Timestamp,
    ) -> StorageResult<ScanRecord> {
        let key_bytes = ScanKey::new(identity, family).to_db_bytes()?;
        if let Some(existing) = self.scans.get(&key_bytes)? {
            return Ok(db_complete::<ScanValue>(&existing)?);
        }
        let record = ScanRecord::begin(now);
        self.scans.insert(&key_bytes, record.to_db_bytes()?)?;
        log::debug!("began scan for {identity}/{family}");
        Ok(record)
    }

    fn insert_page(
        &mut self,
        identity: Identity,
        family: Family,
        page: &FetchedPage,
        now: Timestamp,
    ) -> StorageResult<ScanRecord> {
        let scan_key_bytes = ScanKey::new(identity, family).to_db_bytes()?;
        let Some(record_bytes) = self.scans.get(&scan_key_bytes)? else {
            return Err(StorageError::BadStateError(format!(
                "no scan for {identity}/{family}, a page cannot be cached before begin_scan"
            )));
        };
        let record = db_complete::<ScanValue>(&record_bytes)?;

        let mut batch = self.keyspace.batch();
        let mut seen = HashSet::new();
        let mut inserted = 0;
        for stored in &page.items {
            check_page_item(identity, family, stored)?;
            let writes = ItemWrites::from(stored);
            let key_bytes = writes.item.0.to_db_bytes()?;
            if !self.items.contains_key(&key_bytes)? && seen.insert(key_bytes.clone()) {
                inserted += 1;
            }
            batch.insert(&self.items, &key_bytes, &writes.item.1.to_db_bytes()?);
            for (comment_key, comment_value) in writes.comments {
                batch.insert(
                    &self.comments,
                    &comment_key.to_db_bytes()?,
                    &comment_value.to_db_bytes()?,
                );
            }
        }

        let next = record.with_page(
            page.items.iter().map(|s| s.item.created_at),
            inserted,
            page.reached_end,
            now,
        );
        batch.insert(&self.scans, &scan_key_bytes, &next.to_db_bytes()?);
        batch.commit()?;
        log::debug!(
            "cached {} items ({inserted} new) for {identity}/{family}, end: {}",
            page.items.len(),
            page.reached_end
        );
        Ok(next)
    }

    fn put_profile(&mut self, identity: Identity, profile: &IdentityProfile) -> StorageResult<()> {
        let key_bytes = ProfileKey::from(identity).to_db_bytes()?;
        self.profiles.insert(&key_bytes, profile.to_db_bytes()?)?;
        Ok(())
    }
}

/// Get a value from a fixed key
fn get_static<K: StaticStr, V: DbBytes>(global: &PartitionHandle) -> StorageResult<Option<V>> {
    let key_bytes = DbStaticStr::<K>::default().to_db_bytes()?;
    let value = global
        .get(&key_bytes)?
        .map(|value_bytes| db_complete(&value_bytes))
        .transpose()?;
    Ok(value)
}

/// Set a value to a fixed key
fn insert_static<K: StaticStr>(global: &PartitionHandle, value: impl DbBytes) -> StorageResult<()> {
    let key_bytes = DbStaticStr::<K>::default().to_db_bytes()?;
    let value_bytes = value.to_db_bytes()?;
    global.insert(&key_bytes, &value_bytes)?;
    Ok(())
}
