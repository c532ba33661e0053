use crate::cursor::{CursorState, EntryCursor, FetchDemand};
use crate::dedup::Watermark;
use crate::error::StreamError;
use crate::queue::MergeQueue;
use crate::scan::get_resume_snapshot;
use crate::storage::StoreReader;
use crate::{BatchItem, CommentRecord, Family, Identity, SequenceKey};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// fresh items to ask the cache for per cursor pull
    pub page_size: usize,
    /// frontier rounds in one `pull` that may move no cursor before giving up
    pub max_frontier_rounds: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            max_frontier_rounds: 100,
        }
    }
}

/// Items ready for display, newest first
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub items: Vec<BatchItem>,
    /// display names for comment authors this stream has not named before
    pub names: HashMap<Identity, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Pull {
    /// the cache is used up for a pair, go get more from the remote
    Fetch(FetchDemand),
    Batch(Batch),
    End,
}

/// One time-ordered feed over every tracked identity's cached history
///
/// Nothing is emitted until every cursor has proven it has nothing newer
/// left, so batches across the life of a stream never go back up in time.
pub struct MultiplexedStream<R: StoreReader> {
    reader: R,
    config: StreamConfig,
    cursors: Vec<EntryCursor>,
    queue: MergeQueue,
    last_emitted: Option<SequenceKey>,
    known_names: HashSet<Identity>,
    failure: Option<StreamError>,
    dropped_late: usize,
}

impl<R: StoreReader> MultiplexedStream<R> {
    /// Start from the newest cached items
    pub fn new(
        reader: R,
        identities: &[Identity],
        config: StreamConfig,
    ) -> Result<Self, StreamError> {
        let cursors = identities
            .iter()
            .flat_map(|identity| Family::ALL.map(|family| EntryCursor::new(*identity, family)))
            .collect();
        Self::with_cursors(reader, identities, config, cursors)
    }

    /// Continue below where the scans' cached history ends
    ///
    /// Pairs without a non-empty scan start from the top.
    pub fn resume(
        reader: R,
        identities: &[Identity],
        config: StreamConfig,
    ) -> Result<Self, StreamError> {
        let mut cursors = Vec::with_capacity(identities.len() * Family::ALL.len());
        for identity in identities {
            for family in Family::ALL {
                let cursor = match get_resume_snapshot(&reader, *identity, family)? {
                    Some(snapshot) => {
                        log::debug!(
                            "{identity}/{family}: resuming below {} ({} ids on the edge)",
                            snapshot.lower_item_date.to_raw_u64(),
                            snapshot.ids.len()
                        );
                        EntryCursor::resumed(*identity, family, &snapshot)
                    }
                    None => EntryCursor::new(*identity, family),
                };
                cursors.push(cursor);
            }
        }
        Self::with_cursors(reader, identities, config, cursors)
    }

    fn with_cursors(
        reader: R,
        identities: &[Identity],
        config: StreamConfig,
        cursors: Vec<EntryCursor>,
    ) -> Result<Self, StreamError> {
        let mut queue = MergeQueue::default();
        for identity in identities {
            let Some(created_at) = reader.get_profile(*identity)?.and_then(|p| p.created_at) else {
                continue;
            };
            // a resumed identity already showed everything down to its seeded edge
            let edge = cursors
                .iter()
                .filter(|c| c.identity() == *identity)
                .filter_map(|c| match c.watermark() {
                    Watermark::At(t) => Some(t),
                    _ => None,
                })
                .max();
            if edge.is_some_and(|edge| created_at >= edge) {
                log::debug!("{identity}: creation at {} already shown", created_at.to_raw_u64());
                continue;
            }
            queue.push(BatchItem::UserCreated {
                identity: *identity,
                created_at,
            });
        }
        log::info!(
            "stream over {} identities, {} cursors",
            identities.len(),
            cursors.len()
        );
        Ok(Self {
            reader,
            config,
            cursors,
            queue,
            last_emitted: None,
            known_names: HashSet::new(),
            failure: None,
            dropped_late: 0,
        })
    }

    pub fn cursors(&self) -> &[EntryCursor] {
        &self.cursors
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Sub-records found after the feed had already moved past them
    pub fn dropped_late(&self) -> usize {
        self.dropped_late
    }

    /// Stop tracking an identity, dropping its cursors and anything it has queued
    pub fn untrack(&mut self, identity: Identity) {
        self.cursors.retain(|c| c.identity() != identity);
        self.queue.retain(|item| item.identity() != identity);
        log::info!("untracked {identity}");
    }

    /// Get the next thing the caller should do: fetch, show a batch, or stop
    ///
    /// Once the store has been seen unavailable every later call fails the same way.
    pub fn pull(&mut self) -> Result<Pull, StreamError> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        let pulled = self.pull_inner();
        if let Err(e @ StreamError::StoreUnavailable(_)) = &pulled {
            log::warn!("stream stopped: {e}");
            self.failure = Some(e.clone());
        }
        pulled
    }

    fn pull_inner(&mut self) -> Result<Pull, StreamError> {
        self.reader.check_available()?;

        for cursor in self.cursors.iter_mut() {
            if let Some(demand) = cursor.refresh(&self.reader)? {
                log::debug!("demanding fetch: {demand:?}");
                return Ok(Pull::Fetch(demand));
            }
        }

        for i in 0..self.cursors.len() {
            if self.cursors[i].state() != CursorState::Ready {
                continue;
            }
            if let Some(demand) = self.pull_cursor(i)? {
                return Ok(Pull::Fetch(demand));
            }
        }

        let mut stalled = 0;
        loop {
            let Some(i) = self.frontier_cursor() else {
                if self.queue.is_empty() {
                    log::info!("end of stream");
                    return Ok(Pull::End);
                }
                let items = self.drain_from(Watermark::Floor);
                return Ok(Pull::Batch(self.finish_batch(items)?));
            };
            let items = self.drain_from(self.cursors[i].watermark());
            if !items.is_empty() {
                return Ok(Pull::Batch(self.finish_batch(items)?));
            }

            let before = (
                self.cursors[i].watermark(),
                self.cursors[i].state(),
                self.queue.len(),
            );
            if let Some(demand) = self.pull_cursor(i)? {
                return Ok(Pull::Fetch(demand));
            }
            let after = (
                self.cursors[i].watermark(),
                self.cursors[i].state(),
                self.queue.len(),
            );
            if after != before {
                continue;
            }
            stalled += 1;
            if stalled > self.config.max_frontier_rounds {
                let cursor = &self.cursors[i];
                log::error!(
                    "frontier stuck on {}/{} at {} for {stalled} rounds",
                    cursor.identity(),
                    cursor.family(),
                    cursor.watermark()
                );
                return Err(StreamError::NoProgress {
                    identity: cursor.identity(),
                    family: cursor.family(),
                    rounds: stalled,
                });
            }
        }
    }

    /// The live cursor holding everything back: highest watermark, first in
    /// tracking order on ties
    fn frontier_cursor(&self) -> Option<usize> {
        let mut best: Option<(usize, Watermark)> = None;
        for (i, cursor) in self.cursors.iter().enumerate() {
            if cursor.is_exhausted() {
                continue;
            }
            let watermark = cursor.watermark();
            if best.map(|(_, w)| watermark > w).unwrap_or(true) {
                best = Some((i, watermark));
            }
        }
        best.map(|(i, _)| i)
    }

    fn pull_cursor(&mut self, i: usize) -> Result<Option<FetchDemand>, StreamError> {
        let mut found = vec![];
        let demand =
            self.cursors[i].pull_or_demand_fetch(&self.reader, self.config.page_size, &mut found)?;
        for item in found {
            self.enqueue(item);
        }
        if let Some(demand) = &demand {
            log::debug!("demanding fetch: {demand:?}");
        }
        Ok(demand)
    }

    fn enqueue(&mut self, item: BatchItem) {
        if let Some(last) = &self.last_emitted {
            if item.sequence_key() >= *last {
                log::warn!(
                    "dropping {:?} of {} at {}: the feed already moved past it",
                    item.kind(),
                    item.identity(),
                    item.timestamp().to_raw_u64()
                );
                self.dropped_late += 1;
                return;
            }
        }
        self.queue.push(item);
    }

    /// Everything at or above the frontier is final: cursors pull whole
    /// timestamps, so nothing newer can still come out of the cache
    fn drain_from(&mut self, frontier: Watermark) -> Vec<BatchItem> {
        self.queue
            .pop_while(|item| Watermark::At(item.timestamp()) >= frontier)
    }

    fn finish_batch(&mut self, items: Vec<BatchItem>) -> Result<Batch, StreamError> {
        if let Some(last) = items.last() {
            self.last_emitted = Some(last.sequence_key());
        }
        let mut unnamed = vec![];
        for item in &items {
            if let BatchItem::Commented {
                comment:
                    CommentRecord {
                        author: Some(author),
                        ..
                    },
                ..
            } = item
            {
                if !self.known_names.contains(author) && !unnamed.contains(author) {
                    unnamed.push(*author);
                }
            }
        }
        let names = if unnamed.is_empty() {
            HashMap::new()
        } else {
            self.reader.resolve_display_names(&unnamed)?
        };
        self.known_names.extend(names.keys().copied());
        log::info!(
            "batch of {} items, {} new names, {} still queued, {} late sub-records dropped so far",
            items.len(),
            names.len(),
            self.queue.len(),
            self.dropped_late
        );
        Ok(Batch { items, names })
    }
}
