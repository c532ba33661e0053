use crate::cursor::FetchDemand;
use crate::error::MessengerError;
use crate::storage::StoreReader;
use crate::stream::{MultiplexedStream, Pull};
use crate::{BatchItem, Family, Identity};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{Receiver, Sender};

/// Sent to the fetch collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FetchRequest {
    Scan {
        family: Family,
        identity: Identity,
        /// no scan exists yet for the pair
        start: bool,
    },
}

impl From<FetchDemand> for FetchRequest {
    fn from(demand: FetchDemand) -> Self {
        FetchRequest::Scan {
            family: demand.family,
            identity: demand.identity,
            start: demand.start,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    Running,
    Ready,
    Failed,
}

/// Received from the fetch collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchNotification {
    /// missing means every family of the identity
    #[serde(default)]
    pub family: Option<Family>,
    pub identity: Identity,
    pub status: FetchStatus,
}

impl FetchNotification {
    pub fn about(request: &FetchRequest, status: FetchStatus) -> Self {
        let FetchRequest::Scan {
            family, identity, ..
        } = request;
        Self {
            family: Some(*family),
            identity: *identity,
            status,
        }
    }
}

/// What the presentation side can ask for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum MessengerCommand {
    RequestNextBatch,
    ReorderColumns { from: usize, to: usize },
    SetColumns { identities: Vec<Identity> },
    Untrack { identity: Identity },
}

/// A feed item and the columns showing its identity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnItem {
    pub item: BatchItem,
    pub columns: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MessengerEvent {
    Batch {
        items: Vec<ColumnItem>,
        names: HashMap<Identity, String>,
    },
    EndOfStream,
    FetchFailed {
        identity: Identity,
        family: Option<Family>,
    },
}

/// Column slots, each showing one identity
///
/// An identity may sit in several columns, or in none.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnMap {
    columns: Vec<Identity>,
}

impl ColumnMap {
    pub fn new(columns: Vec<Identity>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[Identity] {
        &self.columns
    }

    pub fn indices_of(&self, identity: Identity) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| **c == identity)
            .map(|(i, _)| i)
            .collect()
    }

    /// Move the column at `from` to `to`, shifting the ones between
    ///
    /// Returns false and changes nothing when either index is out of range.
    pub fn reorder(&mut self, from: usize, to: usize) -> bool {
        if from >= self.columns.len() || to >= self.columns.len() {
            return false;
        }
        let moved = self.columns.remove(from);
        self.columns.insert(to, moved);
        true
    }
}

/// Drives a [MultiplexedStream] for a presentation layer and an async fetcher
///
/// Fetch demands go out as [FetchRequest]s. A `ready` notification for a pair
/// we are waiting on pulls again without being asked.
pub struct StreamMessenger<R: StoreReader + Send + 'static> {
    stream: Arc<Mutex<MultiplexedStream<R>>>,
    columns: ColumnMap,
    awaited: HashSet<(Identity, Family)>,
    requests: Sender<FetchRequest>,
    events: Sender<MessengerEvent>,
}

impl<R: StoreReader + Send + 'static> StreamMessenger<R> {
    pub fn new(
        stream: MultiplexedStream<R>,
        columns: ColumnMap,
        requests: Sender<FetchRequest>,
        events: Sender<MessengerEvent>,
    ) -> Self {
        Self {
            stream: Arc::new(Mutex::new(stream)),
            columns,
            awaited: HashSet::new(),
            requests,
            events,
        }
    }

    pub fn columns(&self) -> &ColumnMap {
        &self.columns
    }

    pub fn is_awaiting(&self, identity: Identity, family: Family) -> bool {
        self.awaited.contains(&(identity, family))
    }

    pub async fn request_next_batch(&mut self) -> Result<(), MessengerError> {
        let stream = self.stream.clone();
        let pulled = tokio::task::spawn_blocking(move || {
            let mut stream = stream.lock().map_err(|_| MessengerError::Poisoned)?;
            Ok::<_, MessengerError>(stream.pull()?)
        })
        .await??;

        match pulled {
            Pull::Fetch(demand) => {
                if !self.awaited.insert((demand.identity, demand.family)) {
                    log::trace!("already waiting on {demand:?}, not asking again");
                    return Ok(());
                }
                self.requests
                    .send(demand.into())
                    .await
                    .map_err(|_| MessengerError::ChannelClosed("fetch request"))?;
            }
            Pull::Batch(batch) => {
                let items = batch
                    .items
                    .into_iter()
                    .map(|item| ColumnItem {
                        columns: self.columns.indices_of(item.identity()),
                        item,
                    })
                    .collect();
                self.emit(MessengerEvent::Batch {
                    items,
                    names: batch.names,
                })
                .await?;
            }
            Pull::End => self.emit(MessengerEvent::EndOfStream).await?,
        }
        Ok(())
    }

    pub async fn handle_notification(
        &mut self,
        notification: FetchNotification,
    ) -> Result<(), MessengerError> {
        let FetchNotification {
            family,
            identity,
            status,
        } = notification;
        let families = match family {
            Some(family) => vec![family],
            None => Family::ALL.to_vec(),
        };
        let waiting: Vec<Family> = families
            .into_iter()
            .filter(|f| self.awaited.contains(&(identity, *f)))
            .collect();
        if waiting.is_empty() {
            log::debug!("ignoring {status:?} for {identity}/{family:?}, not waiting on it");
            return Ok(());
        }

        match status {
            FetchStatus::Running => {
                log::trace!("fetch running for {identity}/{family:?}");
                Ok(())
            }
            FetchStatus::Ready => {
                for f in waiting {
                    self.awaited.remove(&(identity, f));
                }
                self.request_next_batch().await
            }
            FetchStatus::Failed => {
                for f in waiting {
                    self.awaited.remove(&(identity, f));
                }
                log::warn!("fetch failed for {identity}/{family:?}");
                self.emit(MessengerEvent::FetchFailed { identity, family })
                    .await
            }
        }
    }

    /// Only changes which columns later batches are tagged with
    pub fn reorder_columns(&mut self, from: usize, to: usize) {
        if !self.columns.reorder(from, to) {
            log::warn!(
                "ignoring reorder {from} -> {to} over {} columns",
                self.columns.columns().len()
            );
        }
    }

    pub fn set_columns(&mut self, identities: Vec<Identity>) {
        self.columns = ColumnMap::new(identities);
    }

    pub fn untrack(&mut self, identity: Identity) -> Result<(), MessengerError> {
        self.stream
            .lock()
            .map_err(|_| MessengerError::Poisoned)?
            .untrack(identity);
        self.awaited.retain(|(i, _)| *i != identity);
        Ok(())
    }

    pub async fn handle_command(&mut self, command: MessengerCommand) -> Result<(), MessengerError> {
        match command {
            MessengerCommand::RequestNextBatch => self.request_next_batch().await,
            MessengerCommand::ReorderColumns { from, to } => {
                self.reorder_columns(from, to);
                Ok(())
            }
            MessengerCommand::SetColumns { identities } => {
                self.set_columns(identities);
                Ok(())
            }
            MessengerCommand::Untrack { identity } => self.untrack(identity),
        }
    }

    /// Serve commands and notifications until the command side hangs up
    pub async fn run(
        mut self,
        mut commands: Receiver<MessengerCommand>,
        mut notifications: Receiver<FetchNotification>,
    ) -> Result<(), MessengerError> {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await?,
                    None => {
                        log::info!("command channel closed, messenger stopping");
                        return Ok(());
                    }
                },
                notification = notifications.recv() => match notification {
                    Some(notification) => self.handle_notification(notification).await?,
                    None => return Err(MessengerError::ChannelClosed("fetch notification")),
                },
            }
        }
    }

    async fn emit(&self, event: MessengerEvent) -> Result<(), MessengerError> {
        self.events
            .send(event)
            .await
            .map_err(|_| MessengerError::ChannelClosed("event"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{StorageWhatever, StoreWriter};
    use crate::storage_mem::{MemConfig, MemReader, MemStorage, MemWriter};
    use crate::stream::StreamConfig;
    use crate::test_support::{item, page};
    use crate::{FetchedPage, Timestamp};
    use tokio::sync::mpsc::channel;

    struct Harness {
        messenger: StreamMessenger<MemReader>,
        requests: Receiver<FetchRequest>,
        events: Receiver<MessengerEvent>,
        writer: MemWriter,
    }

    fn harness(identities: &[Identity], columns: Vec<Identity>) -> anyhow::Result<Harness> {
        let (reader, writer) = MemStorage::init("", MemConfig::default())?;
        let stream = MultiplexedStream::new(reader, identities, StreamConfig::default())?;
        let (request_sender, requests) = channel(16);
        let (event_sender, events) = channel(16);
        Ok(Harness {
            messenger: StreamMessenger::new(
                stream,
                ColumnMap::new(columns),
                request_sender,
                event_sender,
            ),
            requests,
            events,
            writer,
        })
    }

    fn cache(
        writer: &mut MemWriter,
        request: &FetchRequest,
        fetched: FetchedPage,
    ) -> anyhow::Result<()> {
        let FetchRequest::Scan {
            family, identity, ..
        } = request;
        let now = Timestamp::from_raw_u64(10_000);
        writer.begin_scan(*identity, *family, now)?;
        writer.insert_page(*identity, *family, &fetched, now)?;
        Ok(())
    }

    fn ready(request: &FetchRequest) -> FetchNotification {
        FetchNotification::about(request, FetchStatus::Ready)
    }

    #[test]
    fn wire_format() -> anyhow::Result<()> {
        let request: FetchRequest = FetchDemand {
            identity: Identity(3),
            family: Family::B,
            start: true,
        }
        .into();
        assert_eq!(
            serde_json::to_value(&request)?,
            serde_json::json!({"action": "scan", "family": "b", "identity": 3, "start": true})
        );
        let note: FetchNotification =
            serde_json::from_str(r#"{"identity": 3, "status": "ready"}"#)?;
        assert_eq!(note.family, None);
        assert_eq!(note.status, FetchStatus::Ready);
        Ok(())
    }

    #[test]
    fn column_reorder() {
        let mut columns = ColumnMap::new(vec![Identity(1), Identity(2), Identity(1)]);
        assert_eq!(columns.indices_of(Identity(1)), vec![0, 2]);
        assert!(columns.reorder(0, 1));
        assert_eq!(columns.columns(), &[Identity(2), Identity(1), Identity(1)]);
        assert_eq!(columns.indices_of(Identity(2)), vec![0]);
        assert!(!columns.reorder(0, 3));
        assert!(columns.indices_of(Identity(9)).is_empty());
    }

    #[tokio::test]
    async fn ready_notification_continues() -> anyhow::Result<()> {
        let mut h = harness(&[Identity(1)], vec![Identity(1)])?;

        h.messenger.request_next_batch().await?;
        let request = h.requests.recv().await.expect("a fetch request");
        assert_eq!(
            request,
            FetchRequest::Scan {
                family: Family::A,
                identity: Identity(1),
                start: true
            }
        );
        assert!(h.messenger.is_awaiting(Identity(1), Family::A));

        // asking again while waiting does not resend
        h.messenger.request_next_batch().await?;
        assert!(h.requests.try_recv().is_err());

        cache(
            &mut h.writer,
            &request,
            page(Identity(1), Family::A, vec![item(5, 500)], true),
        )?;
        h.messenger.handle_notification(ready(&request)).await?;
        assert!(!h.messenger.is_awaiting(Identity(1), Family::A));

        let request = h.requests.recv().await.expect("fetch for family b");
        cache(&mut h.writer, &request, FetchedPage { items: vec![], reached_end: true })?;
        h.messenger.handle_notification(ready(&request)).await?;

        match h.events.recv().await {
            Some(MessengerEvent::Batch { items, .. }) => {
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].columns, vec![0]);
            }
            other => panic!("expected a batch, got {other:?}"),
        }
        h.messenger.request_next_batch().await?;
        assert_eq!(h.events.recv().await, Some(MessengerEvent::EndOfStream));
        Ok(())
    }

    #[tokio::test]
    async fn stray_notifications_are_ignored() -> anyhow::Result<()> {
        let mut h = harness(&[Identity(1)], vec![Identity(1)])?;
        h.messenger
            .handle_notification(FetchNotification {
                family: Some(Family::B),
                identity: Identity(1),
                status: FetchStatus::Ready,
            })
            .await?;
        h.messenger
            .handle_notification(FetchNotification {
                family: None,
                identity: Identity(2),
                status: FetchStatus::Failed,
            })
            .await?;
        assert!(h.requests.try_recv().is_err());
        assert!(h.events.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn failed_fetch_is_reported_and_redemanded() -> anyhow::Result<()> {
        let mut h = harness(&[Identity(1)], vec![])?;
        h.messenger.request_next_batch().await?;
        let request = h.requests.recv().await.expect("a fetch request");

        h.messenger
            .handle_notification(FetchNotification {
                family: None,
                identity: Identity(1),
                status: FetchStatus::Failed,
            })
            .await?;
        assert_eq!(
            h.events.recv().await,
            Some(MessengerEvent::FetchFailed {
                identity: Identity(1),
                family: None
            })
        );
        assert!(!h.messenger.is_awaiting(Identity(1), Family::A));

        h.messenger.request_next_batch().await?;
        assert_eq!(h.requests.recv().await, Some(request));
        Ok(())
    }

    #[tokio::test]
    async fn reordering_only_moves_columns() -> anyhow::Result<()> {
        let mut h = harness(&[Identity(1), Identity(2)], vec![Identity(1), Identity(2)])?;
        for who in [Identity(1), Identity(2)] {
            for family in Family::ALL {
                let request = FetchRequest::Scan {
                    family,
                    identity: who,
                    start: true,
                };
                let items = if family == Family::A {
                    vec![item(who.0 * 10, 100 * who.0)]
                } else {
                    vec![]
                };
                cache(&mut h.writer, &request, page(who, family, items, true))?;
            }
        }

        h.messenger.request_next_batch().await?;
        let Some(MessengerEvent::Batch { items: first, .. }) = h.events.recv().await else {
            panic!("expected a batch");
        };
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].item.identity(), Identity(2));
        assert_eq!(first[0].columns, vec![1]);

        h.messenger.reorder_columns(1, 0);
        h.messenger.request_next_batch().await?;
        let Some(MessengerEvent::Batch { items: second, .. }) = h.events.recv().await else {
            panic!("expected a batch");
        };
        assert_eq!(second[0].item.identity(), Identity(1));
        assert_eq!(second[0].columns, vec![1]);
        Ok(())
    }

    #[tokio::test]
    async fn run_loop_serves_commands() -> anyhow::Result<()> {
        let h = harness(&[Identity(1)], vec![Identity(1)])?;
        let Harness {
            messenger,
            mut requests,
            mut events,
            mut writer,
        } = h;
        let (command_sender, commands) = channel(4);
        let (notification_sender, notifications) = channel(4);
        let running = tokio::spawn(messenger.run(commands, notifications));

        command_sender.send(MessengerCommand::RequestNextBatch).await?;
        for _ in 0..2 {
            let request = requests.recv().await.expect("a fetch request");
            cache(&mut writer, &request, FetchedPage { items: vec![], reached_end: true })?;
            notification_sender
                .send(FetchNotification::about(&request, FetchStatus::Running))
                .await?;
            notification_sender.send(ready(&request)).await?;
        }
        assert_eq!(events.recv().await, Some(MessengerEvent::EndOfStream));

        drop(command_sender);
        running.await??;
        Ok(())
    }
}
