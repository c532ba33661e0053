use crate::dedup::{DedupBoundary, Watermark};
use crate::scan::{ResumeSnapshot, ScanRecord};
use crate::storage::{ItemQuery, StorageResult, StoreReader};
use crate::{BatchItem, Family, Identity, StoredItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// no scan record yet, a scan has to be started
    NoScan,
    /// scan record known but not pulled since it last changed
    Ready,
    /// last pull produced fresh items
    Draining,
    /// cache is used up but the remote has older items
    NeedsFetch,
    /// cache is used up and the remote has nothing older
    Exhausted,
}

/// Ask the fetch collaborator for more of one scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FetchDemand {
    pub identity: Identity,
    pub family: Family,
    /// true when there is no scan for the pair yet
    pub start: bool,
}

/// Walks one (identity, family) scan backwards through the cache
#[derive(Debug)]
pub struct EntryCursor {
    identity: Identity,
    family: Family,
    state: CursorState,
    scan: Option<ScanRecord>,
    boundary: DedupBoundary,
}

impl EntryCursor {
    pub fn new(identity: Identity, family: Family) -> Self {
        Self {
            identity,
            family,
            state: CursorState::NoScan,
            scan: None,
            boundary: DedupBoundary::new(),
        }
    }

    /// Pick up below what an earlier session already went through
    pub fn resumed(identity: Identity, family: Family, snapshot: &ResumeSnapshot) -> Self {
        Self {
            boundary: DedupBoundary::seeded(snapshot),
            ..Self::new(identity, family)
        }
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    pub fn watermark(&self) -> Watermark {
        self.boundary.watermark()
    }

    pub fn is_exhausted(&self) -> bool {
        self.state == CursorState::Exhausted
    }

    pub fn fetch_demand(&self) -> Option<FetchDemand> {
        let start = match self.state {
            CursorState::NoScan => true,
            CursorState::NeedsFetch => false,
            _ => return None,
        };
        Some(FetchDemand {
            identity: self.identity,
            family: self.family,
            start,
        })
    }

    /// Re-read the scan record of a cursor that is waiting on the remote
    ///
    /// A changed record makes the cursor [CursorState::Ready]; otherwise the same
    /// demand comes back.
    pub fn refresh(&mut self, reader: &impl StoreReader) -> StorageResult<Option<FetchDemand>> {
        if !matches!(self.state, CursorState::NoScan | CursorState::NeedsFetch) {
            return Ok(None);
        }
        let record = reader.get_scan_record(self.identity, self.family)?;
        if record.is_some() && record != self.scan {
            log::debug!(
                "{}/{}: scan record changed, {:?} -> Ready",
                self.identity,
                self.family,
                self.state
            );
            self.scan = record;
            self.state = CursorState::Ready;
            return Ok(None);
        }
        Ok(self.fetch_demand())
    }

    /// Pull the next page from the cache into `out`, or say what to fetch
    ///
    /// Every cached item at the resulting watermark is pulled along with the
    /// page. Returns a demand when the cache has nothing fresh left but the
    /// remote might.
    pub fn pull_or_demand_fetch(
        &mut self,
        reader: &impl StoreReader,
        page_size: usize,
        out: &mut Vec<BatchItem>,
    ) -> StorageResult<Option<FetchDemand>> {
        match self.state {
            CursorState::Exhausted => return Ok(None),
            CursorState::NoScan | CursorState::NeedsFetch => return Ok(self.fetch_demand()),
            CursorState::Ready | CursorState::Draining => {}
        }
        let Some(scan) = self.scan.clone() else {
            self.state = CursorState::NoScan;
            return Ok(self.fetch_demand());
        };

        let mut fresh = 0;
        if let Some(query) = self.page_query(&scan, page_size) {
            let page = reader.query_items_descending(&query)?;
            let full = page.len() >= query.limit;
            let lowest = page.last().map(|stored| stored.item.created_at);
            fresh += self.absorb(page, out);
            // a full page may have cut through its lowest timestamp: finish it, so
            // nothing at the watermark is left in the cache
            if let Some(lowest) = lowest.filter(|_| full) {
                let rest = reader.query_items_descending(&ItemQuery {
                    upper: lowest,
                    lower: lowest,
                    limit: usize::MAX,
                    ..query
                })?;
                fresh += self.absorb(rest, out);
            }
        }

        if fresh > 0 {
            self.state = CursorState::Draining;
            log::trace!(
                "{}/{}: {fresh} fresh items, watermark now {}",
                self.identity,
                self.family,
                self.watermark()
            );
            Ok(None)
        } else if scan.is_complete() {
            log::debug!("{}/{}: exhausted", self.identity, self.family);
            self.boundary.exhaust();
            self.state = CursorState::Exhausted;
            Ok(None)
        } else {
            log::debug!(
                "{}/{}: cache used up at {}, needs fetch",
                self.identity,
                self.family,
                self.watermark()
            );
            self.state = CursorState::NeedsFetch;
            Ok(self.fetch_demand())
        }
    }

    /// The range still unseen: from the watermark (inclusive) down to the scan's
    /// lower edge
    ///
    /// The limit leaves room for every already-visited id at the watermark, so a
    /// short page means the range is used up.
    fn page_query(&self, scan: &ScanRecord, page_size: usize) -> Option<ItemQuery> {
        if scan.empty {
            return None;
        }
        let upper = match self.boundary.watermark() {
            Watermark::Ceiling => scan.upper_item_date,
            Watermark::At(t) => t.min(scan.upper_item_date),
            Watermark::Floor => return None,
        };
        if upper < scan.lower_item_date {
            return None;
        }
        Some(ItemQuery {
            identity: self.identity,
            family: self.family,
            upper,
            lower: scan.lower_item_date,
            limit: page_size + self.boundary.visited_len(),
        })
    }

    fn absorb(&mut self, page: Vec<StoredItem>, out: &mut Vec<BatchItem>) -> usize {
        let mut fresh = 0;
        for stored in page {
            if !self.boundary.visit(stored.item.created_at, stored.item.id) {
                continue;
            }
            fresh += 1;
            out.extend(BatchItem::expand(stored));
        }
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::get_resume_snapshot;
    use crate::storage::{StorageWhatever, StoreWriter};
    use crate::storage_mem::{MemConfig, MemReader, MemStorage, MemWriter};
    use crate::test_support::{item, page};
    use crate::Timestamp;

    const WHO: Identity = Identity(1);

    fn ts(n: u64) -> Timestamp {
        Timestamp::from_raw_u64(n)
    }

    fn store() -> anyhow::Result<(MemReader, MemWriter)> {
        Ok(MemStorage::init("", MemConfig::default())?)
    }

    fn opened(items: &[BatchItem]) -> Vec<u64> {
        items
            .iter()
            .filter_map(|i| match i {
                BatchItem::Opened { item, .. } => Some(item.id.0),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn no_scan_demands_start() -> anyhow::Result<()> {
        let (reader, _) = store()?;
        let mut cursor = EntryCursor::new(WHO, Family::A);
        let demand = cursor.refresh(&reader)?;
        assert_eq!(
            demand,
            Some(FetchDemand {
                identity: WHO,
                family: Family::A,
                start: true
            })
        );
        assert_eq!(cursor.state(), CursorState::NoScan);
        assert_eq!(cursor.watermark(), Watermark::Ceiling);

        let mut out = vec![];
        assert_eq!(cursor.pull_or_demand_fetch(&reader, 10, &mut out)?, demand);
        assert!(out.is_empty());
        Ok(())
    }

    #[test]
    fn empty_scan_needs_fetch() -> anyhow::Result<()> {
        let (reader, mut writer) = store()?;
        writer.begin_scan(WHO, Family::A, ts(1_000))?;
        let mut cursor = EntryCursor::new(WHO, Family::A);
        assert_eq!(cursor.refresh(&reader)?, None);
        assert_eq!(cursor.state(), CursorState::Ready);

        let mut out = vec![];
        let demand = cursor.pull_or_demand_fetch(&reader, 10, &mut out)?;
        assert_eq!(demand.map(|d| d.start), Some(false));
        assert_eq!(cursor.state(), CursorState::NeedsFetch);

        // nothing changed, same demand again
        assert_eq!(cursor.refresh(&reader)?, demand);
        Ok(())
    }

    #[test]
    fn pages_walk_down_then_exhaust() -> anyhow::Result<()> {
        let (reader, mut writer) = store()?;
        writer.begin_scan(WHO, Family::A, ts(1_000))?;
        writer.insert_page(
            WHO,
            Family::A,
            &page(
                WHO,
                Family::A,
                vec![item(5, 500), item(4, 400), item(3, 300)],
                true,
            ),
            ts(1_000),
        )?;
        let mut cursor = EntryCursor::new(WHO, Family::A);
        cursor.refresh(&reader)?;

        let mut out = vec![];
        assert_eq!(cursor.pull_or_demand_fetch(&reader, 2, &mut out)?, None);
        assert_eq!(opened(&out), vec![5, 4]);
        assert_eq!(cursor.watermark(), Watermark::At(ts(400)));
        assert_eq!(cursor.state(), CursorState::Draining);

        out.clear();
        assert_eq!(cursor.pull_or_demand_fetch(&reader, 2, &mut out)?, None);
        assert_eq!(opened(&out), vec![3]);

        out.clear();
        assert_eq!(cursor.pull_or_demand_fetch(&reader, 2, &mut out)?, None);
        assert!(out.is_empty());
        assert!(cursor.is_exhausted());
        assert_eq!(cursor.watermark(), Watermark::Floor);
        Ok(())
    }

    #[test]
    fn tie_across_pages_is_emitted_once() -> anyhow::Result<()> {
        let (reader, mut writer) = store()?;
        writer.begin_scan(WHO, Family::A, ts(1_000))?;
        writer.insert_page(
            WHO,
            Family::A,
            &page(
                WHO,
                Family::A,
                vec![item(7, 600), item(6, 500), item(5, 500), item(4, 500)],
                true,
            ),
            ts(1_000),
        )?;
        let mut cursor = EntryCursor::new(WHO, Family::A);
        cursor.refresh(&reader)?;

        let mut seen = vec![];
        for _ in 0..10 {
            let mut out = vec![];
            cursor.pull_or_demand_fetch(&reader, 1, &mut out)?;
            seen.extend(opened(&out));
            if cursor.is_exhausted() {
                break;
            }
        }
        assert_eq!(seen, vec![7, 6, 5, 4]);
        Ok(())
    }

    #[test]
    fn a_pull_finishes_its_lowest_timestamp() -> anyhow::Result<()> {
        let (reader, mut writer) = store()?;
        writer.begin_scan(WHO, Family::A, ts(1_000))?;
        writer.insert_page(
            WHO,
            Family::A,
            &page(
                WHO,
                Family::A,
                vec![item(9, 900), item(8, 500), item(7, 500), item(6, 500), item(5, 100)],
                true,
            ),
            ts(1_000),
        )?;
        let mut cursor = EntryCursor::new(WHO, Family::A);
        cursor.refresh(&reader)?;

        let mut out = vec![];
        cursor.pull_or_demand_fetch(&reader, 2, &mut out)?;
        assert_eq!(opened(&out), vec![9, 8, 7, 6]);
        assert_eq!(cursor.watermark(), Watermark::At(ts(500)));

        out.clear();
        cursor.pull_or_demand_fetch(&reader, 2, &mut out)?;
        assert_eq!(opened(&out), vec![5]);
        Ok(())
    }

    #[test]
    fn fetch_extends_and_cursor_continues() -> anyhow::Result<()> {
        let (reader, mut writer) = store()?;
        writer.begin_scan(WHO, Family::B, ts(1_000))?;
        writer.insert_page(
            WHO,
            Family::B,
            &page(WHO, Family::B, vec![item(9, 900), item(8, 800)], false),
            ts(1_000),
        )?;
        let mut cursor = EntryCursor::new(WHO, Family::B);
        cursor.refresh(&reader)?;
        let mut out = vec![];
        cursor.pull_or_demand_fetch(&reader, 10, &mut out)?;
        assert_eq!(opened(&out), vec![9, 8]);

        out.clear();
        let demand = cursor.pull_or_demand_fetch(&reader, 10, &mut out)?;
        assert_eq!(demand.map(|d| d.start), Some(false));

        // the remote page overlaps at the old lower edge
        writer.insert_page(
            WHO,
            Family::B,
            &page(WHO, Family::B, vec![item(8, 800), item(7, 700)], true),
            ts(1_001),
        )?;
        assert_eq!(cursor.refresh(&reader)?, None);
        assert_eq!(cursor.state(), CursorState::Ready);
        cursor.pull_or_demand_fetch(&reader, 10, &mut out)?;
        assert_eq!(opened(&out), vec![7]);
        cursor.pull_or_demand_fetch(&reader, 10, &mut out)?;
        assert!(cursor.is_exhausted());
        Ok(())
    }

    #[test]
    fn resumed_cursor_skips_snapshot_ids() -> anyhow::Result<()> {
        let (reader, mut writer) = store()?;
        writer.begin_scan(WHO, Family::A, ts(1_000))?;
        writer.insert_page(
            WHO,
            Family::A,
            &page(
                WHO,
                Family::A,
                vec![item(9, 900), item(7, 400), item(6, 400)],
                false,
            ),
            ts(1_000),
        )?;
        let snapshot = get_resume_snapshot(&reader, WHO, Family::A)?.expect("non-empty scan");
        let mut cursor = EntryCursor::resumed(WHO, Family::A, &snapshot);
        assert_eq!(cursor.watermark(), Watermark::At(ts(400)));

        writer.insert_page(
            WHO,
            Family::A,
            &page(WHO, Family::A, vec![item(5, 400), item(3, 100)], true),
            ts(1_001),
        )?;
        cursor.refresh(&reader)?;
        let mut out = vec![];
        for _ in 0..5 {
            cursor.pull_or_demand_fetch(&reader, 10, &mut out)?;
        }
        assert_eq!(opened(&out), vec![5, 3]);
        assert!(cursor.is_exhausted());
        Ok(())
    }
}
