use crate::messenger::{FetchNotification, FetchRequest, FetchStatus};
use crate::storage::{StorageResult, StoreWriter};
use crate::{
    CommentRecord, FetchedPage, Family, Identity, IdentityProfile, ItemId, ItemRecord, StoredItem,
    Timestamp,
};
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc::{Receiver, Sender},
    task::JoinHandle,
};

/// One line of a jsonl fixture: a profile, or the next remote page of a scan
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FixtureEntry {
    Profile {
        identity: Identity,
        name: String,
        #[serde(default)]
        created_at: Option<Timestamp>,
    },
    Page {
        identity: Identity,
        family: Family,
        #[serde(default)]
        items: Vec<FixtureItem>,
        #[serde(default)]
        end: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FixtureItem {
    pub id: ItemId,
    pub created_at: Timestamp,
    #[serde(default)]
    pub closed_at: Option<Timestamp>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub comments: Vec<FixtureComment>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FixtureComment {
    pub order: u32,
    pub created_at: Timestamp,
    #[serde(default)]
    pub author: Option<Identity>,
    #[serde(default)]
    pub text: Option<String>,
}

impl FixtureItem {
    fn into_stored(self, owner: Identity, family: Family) -> StoredItem {
        let comments: Vec<CommentRecord> = self
            .comments
            .into_iter()
            .map(|c| CommentRecord {
                item_id: self.id,
                order: c.order,
                created_at: c.created_at,
                author: c.author,
                text: c.text,
            })
            .collect();
        StoredItem {
            family,
            item: ItemRecord {
                id: self.id,
                owner,
                created_at: self.created_at,
                closed_at: self.closed_at,
                comment_count: comments.len() as u32,
                title: self.title,
            },
            comments,
        }
    }
}

/// Plays back recorded remote pages in place of a network fetcher
///
/// Each request caches the pair's next recorded page. Once a pair runs out of
/// pages it gets an empty final page, so its scan completes.
pub struct FixtureFetcher<W: StoreWriter> {
    writer: W,
    pages: HashMap<(Identity, Family), VecDeque<FetchedPage>>,
}

impl<W: StoreWriter> FixtureFetcher<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            pages: HashMap::new(),
        }
    }

    pub fn add_page(&mut self, identity: Identity, family: Family, page: FetchedPage) {
        self.pages
            .entry((identity, family))
            .or_default()
            .push_back(page);
    }

    /// Profiles are written straight to the store, pages wait for requests
    pub fn add_entry(&mut self, entry: FixtureEntry) -> StorageResult<()> {
        match entry {
            FixtureEntry::Profile {
                identity,
                name,
                created_at,
            } => self
                .writer
                .put_profile(identity, &IdentityProfile { name, created_at }),
            FixtureEntry::Page {
                identity,
                family,
                items,
                end,
            } => {
                let items = items
                    .into_iter()
                    .map(|i| i.into_stored(identity, family))
                    .collect();
                self.add_page(
                    identity,
                    family,
                    FetchedPage {
                        items,
                        reached_end: end,
                    },
                );
                Ok(())
            }
        }
    }

    pub fn pending_pages(&self) -> usize {
        self.pages.values().map(|q| q.len()).sum()
    }

    /// Cache the next page for the request's pair
    pub fn handle(&mut self, request: &FetchRequest) -> FetchNotification {
        match self.serve(request) {
            Ok(()) => FetchNotification::about(request, FetchStatus::Ready),
            Err(e) => {
                log::warn!("fixture fetch for {request:?} failed: {e}");
                FetchNotification::about(request, FetchStatus::Failed)
            }
        }
    }

    fn serve(&mut self, request: &FetchRequest) -> StorageResult<()> {
        let FetchRequest::Scan {
            family,
            identity,
            start,
        } = *request;
        let now = Timestamp::now();
        if start {
            log::debug!("starting scan for {identity}/{family}");
        }
        self.writer.begin_scan(identity, family, now)?;
        let page = self
            .pages
            .get_mut(&(identity, family))
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| FetchedPage {
                items: vec![],
                reached_end: true,
            });
        self.writer.insert_page(identity, family, &page, now)?;
        Ok(())
    }
}

impl<W: StoreWriter + Send + 'static> FixtureFetcher<W> {
    /// Read a jsonl fixture file
    pub async fn load(writer: W, path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let f = File::open(path).await?;
        let mut fetcher = Self::new(writer);
        let mut lines = BufReader::new(f).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let entry: FixtureEntry = serde_json::from_str(&line)?;
            fetcher.add_entry(entry)?;
        }
        log::info!("loaded fixture with {} pages", fetcher.pending_pages());
        Ok(fetcher)
    }

    /// Answer requests on a blocking thread until the request side hangs up
    pub fn spawn(
        mut self,
        mut requests: Receiver<FetchRequest>,
        notifications: Sender<FetchNotification>,
    ) -> JoinHandle<()> {
        tokio::task::spawn_blocking(move || {
            while let Some(request) = requests.blocking_recv() {
                let running = FetchNotification::about(&request, FetchStatus::Running);
                if notifications.blocking_send(running).is_err() {
                    break;
                }
                let done = self.handle(&request);
                if notifications.blocking_send(done).is_err() {
                    break;
                }
            }
            log::info!("fixture fetcher stopping");
        })
    }
}
