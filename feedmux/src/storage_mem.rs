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
use std::collections::{BTreeMap, HashSet};
use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Same partitions and byte layout as the fjall store, kept in memory
///
/// Nothing is persisted, so the path given to `init` is ignored.
#[derive(Debug)]
pub struct MemStorage {}

#[derive(Debug, Default)]
pub struct MemConfig {
    /// start out failing every read, as if the store had gone away
    pub unavailable: bool,
}

fn poisoned<T>(_: T) -> StorageError {
    StorageError::BadStateError("mem store lock poisoned".to_string())
}

struct BatchSentinel {}

#[derive(Clone)]
struct MemKeyspace {
    keyspace_guard: Arc<RwLock<BatchSentinel>>,
}

impl MemKeyspace {
    pub fn open() -> Self {
        Self {
            keyspace_guard: Arc::new(RwLock::new(BatchSentinel {})),
        }
    }
    pub fn open_partition(&self, _name: &str) -> StorageResult<MemPartion> {
        Ok(MemPartion {
            keyspace_guard: self.keyspace_guard.clone(),
            contents: Default::default(),
        })
    }
    pub fn batch(&self) -> MemBatch {
        MemBatch {
            keyspace_guard: self.keyspace_guard.clone(),
            tasks: Vec::new(),
        }
    }
}

struct BatchInsert {
    p: MemPartion,
    key: Vec<u8>,
    val: Vec<u8>,
}

/// Applies all inserts under the keyspace write lock, so readers see all or none
struct MemBatch {
    keyspace_guard: Arc<RwLock<BatchSentinel>>,
    tasks: Vec<BatchInsert>,
}
impl MemBatch {
    pub fn insert(&mut self, p: &MemPartion, key: &[u8], val: &[u8]) {
        self.tasks.push(BatchInsert {
            p: p.clone(),
            key: key.to_vec(),
            val: val.to_vec(),
        });
    }
    pub fn commit(self) -> StorageResult<()> {
        let _guard = self.keyspace_guard.write().map_err(poisoned)?;
        for BatchInsert { p, key, val } in self.tasks {
            p.contents.lock().map_err(poisoned)?.insert(key, val);
        }
        Ok(())
    }
}

#[derive(Clone)]
struct MemPartion {
    keyspace_guard: Arc<RwLock<BatchSentinel>>,
    contents: Arc<Mutex<BTreeMap<Vec<u8>, Vec<u8>>>>,
}
impl MemPartion {
    pub fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let _guard = self.keyspace_guard.read().map_err(poisoned)?;
        Ok(self.contents.lock().map_err(poisoned)?.get(key).cloned())
    }
    pub fn contains_key(&self, key: &[u8]) -> StorageResult<bool> {
        Ok(self.get(key)?.is_some())
    }
    pub fn range(&self, r: RangeInclusive<Vec<u8>>) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let _guard = self.keyspace_guard.read().map_err(poisoned)?;
        Ok(self
            .contents
            .lock()
            .map_err(poisoned)?
            .range(r)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
    pub fn insert(&self, key: &[u8], val: &[u8]) -> StorageResult<()> {
        let _guard = self.keyspace_guard.read().map_err(poisoned)?;
        self.contents
            .lock()
            .map_err(poisoned)?
            .insert(key.to_vec(), val.to_vec());
        Ok(())
    }
}

impl StorageWhatever<MemReader, MemWriter, MemConfig> for MemStorage {
    fn init(_path: impl AsRef<Path>, config: MemConfig) -> StorageResult<(MemReader, MemWriter)> {
        let keyspace = MemKeyspace::open();

        let global = keyspace.open_partition("global")?;
        let scans = keyspace.open_partition("scans")?;
        let items = keyspace.open_partition("items")?;
        let comments = keyspace.open_partition("comments")?;
        let profiles = keyspace.open_partition("profiles")?;

        insert_static::<FormatVersionKey>(&global, FormatVersionValue(FORMAT_VERSION))?;

        let unavailable = Arc::new(AtomicBool::new(config.unavailable));
        let reader = MemReader {
            unavailable: unavailable.clone(),
            global,
            scans: scans.clone(),
            items: items.clone(),
            comments: comments.clone(),
            profiles: profiles.clone(),
        };
        let writer = MemWriter {
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
pub struct MemReader {
    unavailable: Arc<AtomicBool>,
    global: MemPartion,
    scans: MemPartion,
    items: MemPartion,
    comments: MemPartion,
    profiles: MemPartion,
}

impl MemReader {
    /// Make every read on this store (and all its clones) fail, or work again
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn guard(&self) -> StorageResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("mem store switched off".to_string()));
        }
        Ok(())
    }

    fn get_comments(&self, family: Family, item: ItemId) -> StorageResult<Vec<CommentRecord>> {
        let range = key_range(&CommentKey::first(family, item), &CommentKey::last(family, item))?;
        let mut out = vec![];
        for (key_bytes, val_bytes) in self.comments.range(range)? {
            let key = db_complete::<CommentKey>(&key_bytes)?;
            let value = db_complete::<CommentValue>(&val_bytes)?;
            out.push(comment_from_parts(&key, value));
        }
        Ok(out)
    }
}

impl StoreReader for MemReader {
    fn check_available(&self) -> StorageResult<()> {
        self.guard()?;
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
        self.guard()?;
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
        self.guard()?;
        if query.lower > query.upper || query.limit == 0 {
            return Ok(vec![]);
        }
        let range = key_range(
            &ItemKey::floor(query.identity, query.family, query.lower),
            &ItemKey::ceiling(query.identity, query.family, query.upper),
        )?;
        let mut out = vec![];
        for (key_bytes, val_bytes) in self.items.range(range)?.into_iter().rev().take(query.limit) {
            let key = db_complete::<ItemKey>(&key_bytes)?;
            let value = db_complete::<ItemValue>(&val_bytes)?;
            let item = item_from_parts(&key, value);
            let comments = self.get_comments(query.family, item.id)?;
            out.push(StoredItem {
                family: query.family,
                item,
                comments,
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
        self.guard()?;
        let range = key_range(
            &ItemKey::floor(identity, family, at),
            &ItemKey::ceiling(identity, family, at),
        )?;
        let mut ids = vec![];
        for (key_bytes, _) in self.items.range(range)? {
            ids.push(db_complete::<ItemKey>(&key_bytes)?.id());
        }
        Ok(ids)
    }

    fn get_profile(&self, identity: Identity) -> StorageResult<Option<IdentityProfile>> {
        self.guard()?;
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

pub struct MemWriter {
    keyspace: MemKeyspace,
    scans: MemPartion,
    items: MemPartion,
    comments: MemPartion,
    profiles: MemPartion,
}

impl StoreWriter for MemWriter {
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
        self.scans.insert(&key_bytes, &record.to_db_bytes()?)?;
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
        Ok(next)
    }

    fn put_profile(&mut self, identity: Identity, profile: &IdentityProfile) -> StorageResult<()> {
        let key_bytes = ProfileKey::from(identity).to_db_bytes()?;
        self.profiles.insert(&key_bytes, &profile.to_db_bytes()?)
    }
}

/// Get a value from a fixed key
fn get_static<K: StaticStr, V: DbBytes>(global: &MemPartion) -> StorageResult<Option<V>> {
    let key_bytes = DbStaticStr::<K>::default().to_db_bytes()?;
    let value = global
        .get(&key_bytes)?
        .map(|value_bytes| db_complete(&value_bytes))
        .transpose()?;
    Ok(value)
}

/// Set a value to a fixed key
fn insert_static<K: StaticStr>(global: &MemPartion, value: impl DbBytes) -> StorageResult<()> {
    let key_bytes = DbStaticStr::<K>::default().to_db_bytes()?;
    let value_bytes = value.to_db_bytes()?;
    global.insert(&key_bytes, &value_bytes)?;
    Ok(())
}
