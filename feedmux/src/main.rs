use clap::Parser;
use feedmux::fixture::FixtureFetcher;
use feedmux::messenger::{ColumnMap, MessengerCommand, MessengerEvent, StreamMessenger};
use feedmux::storage::StorageWhatever;
use feedmux::storage_fjall::{FjallConfig, FjallStorage};
use feedmux::stream::{MultiplexedStream, StreamConfig};
use feedmux::Identity;
use std::path::PathBuf;
use tokio::sync::mpsc::channel;

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// Merge the cached histories of several users into one time-ordered feed
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Location to store persist data to disk
    #[arg(long)]
    data: PathBuf,
    /// jsonl file of recorded remote pages and profiles to fetch from
    #[arg(long)]
    fixture: PathBuf,
    /// identity to track, one column each. repeatable
    #[arg(long = "identity", required = true)]
    identities: Vec<u64>,
    /// items to read from the cache per cursor pull
    #[arg(long, default_value_t = 50)]
    page_size: usize,
    /// pick up from the oldest item already cached instead of the newest
    #[arg(long, action)]
    resume: bool,
    /// stop after this many batches
    #[arg(long)]
    max_batches: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();
    let identities: Vec<Identity> = args.identities.iter().copied().map(Identity).collect();

    let (reader, writer) = FjallStorage::init(&args.data, FjallConfig::default())?;
    let fetcher = FixtureFetcher::load(writer, &args.fixture).await?;

    let config = StreamConfig {
        page_size: args.page_size,
        ..Default::default()
    };
    let stream = if args.resume {
        MultiplexedStream::resume(reader, &identities, config)?
    } else {
        MultiplexedStream::new(reader, &identities, config)?
    };

    let (request_sender, requests) = channel(16);
    let (notification_sender, notifications) = channel(16);
    let (command_sender, commands) = channel(16);
    let (event_sender, mut events) = channel(16);

    let fetching = fetcher.spawn(requests, notification_sender);
    let messenger = StreamMessenger::new(
        stream,
        ColumnMap::new(identities.clone()),
        request_sender,
        event_sender,
    );
    let messaging = tokio::task::spawn(messenger.run(commands, notifications));

    command_sender
        .send(MessengerCommand::RequestNextBatch)
        .await?;
    let mut batches = 0;
    while let Some(event) = events.recv().await {
        println!("{}", serde_json::to_string(&event)?);
        match event {
            MessengerEvent::Batch { .. } => {
                batches += 1;
                if args.max_batches.is_some_and(|max| batches >= max) {
                    log::info!("stopping after {batches} batches");
                    break;
                }
                command_sender
                    .send(MessengerCommand::RequestNextBatch)
                    .await?;
            }
            MessengerEvent::EndOfStream => {
                log::info!("end of stream after {batches} batches");
                break;
            }
            MessengerEvent::FetchFailed { identity, family } => {
                anyhow::bail!("fetch failed for {identity} ({family:?})");
            }
        }
    }

    drop(command_sender);
    messaging.await??;
    log::trace!("messenger ended.");
    fetching.await?;
    log::trace!("fetcher ended.");

    Ok(())
}
