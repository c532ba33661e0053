use crate::fixture::FixtureFetcher;
use crate::messenger::FetchStatus;
use crate::storage::{StoreReader, StoreWriter};
use crate::stream::{MultiplexedStream, Pull};
use crate::{
    BatchItem, CommentRecord, FetchedPage, Family, Identity, IdentityProfile, ItemId, ItemRecord,
    StoredItem, Timestamp,
};

const MAX_PULLS: usize = 10_000;

/// An open item in family A with no comments; [page] sets the real owner
pub fn item(id: u64, at: u64) -> StoredItem {
    StoredItem {
        family: Family::A,
        item: ItemRecord {
            id: ItemId(id),
            owner: Identity(0),
            created_at: Timestamp::from_raw_u64(at),
            closed_at: None,
            comment_count: 0,
            title: None,
        },
        comments: vec![],
    }
}

pub fn closed(id: u64, at: u64, closed_at: u64) -> StoredItem {
    let mut stored = item(id, at);
    stored.item.closed_at = Some(Timestamp::from_raw_u64(closed_at));
    stored
}

pub fn comment(item_id: u64, order: u32, at: u64, author: Option<Identity>) -> CommentRecord {
    CommentRecord {
        item_id: ItemId(item_id),
        order,
        created_at: Timestamp::from_raw_u64(at),
        author,
        text: None,
    }
}

/// A page whose items all belong to `owner` in `family`
pub fn page(owner: Identity, family: Family, items: Vec<StoredItem>, end: bool) -> FetchedPage {
    let items = items
        .into_iter()
        .map(|mut stored| {
            stored.family = family;
            stored.item.owner = owner;
            stored.item.comment_count = stored.comments.len() as u32;
            for c in &mut stored.comments {
                c.item_id = stored.item.id;
            }
            stored
        })
        .collect();
    FetchedPage {
        items,
        reached_end: end,
    }
}

pub fn profile(name: &str, created_at: Option<u64>) -> IdentityProfile {
    IdentityProfile {
        name: name.to_string(),
        created_at: created_at.map(Timestamp::from_raw_u64),
    }
}

/// Pull until the end, answering every fetch demand from the fixture
pub fn drive<R: StoreReader, W: StoreWriter>(
    stream: &mut MultiplexedStream<R>,
    fetcher: &mut FixtureFetcher<W>,
) -> anyhow::Result<Vec<Vec<BatchItem>>> {
    let mut batches = vec![];
    for _ in 0..MAX_PULLS {
        match stream.pull()? {
            Pull::Fetch(demand) => {
                let notification = fetcher.handle(&demand.into());
                if notification.status == FetchStatus::Failed {
                    anyhow::bail!("fixture fetch failed for {demand:?}");
                }
            }
            Pull::Batch(batch) => batches.push(batch.items),
            Pull::End => return Ok(batches),
        }
    }
    anyhow::bail!("stream did not end after {MAX_PULLS} pulls")
}
