use log::{error, info, warn};

use super::apply_creation;
use crate::chain::{ChainEvent, EventKind, EventSource, SourceError};
use crate::config::Config;
use crate::db::{Database, StoreError};

// One-shot historical sync, run before any live traffic is applied.
// Returns the position the live subscriber should resume from.
pub async fn run(
    db: &Database,
    source: &dyn EventSource,
    config: &Config,
) -> Result<u64, SourceError> {
    let latest = source.latest_position().await?;
    info!(
        "Starting historical sync over blocks [{}, {latest}]...",
        config.start_block
    );

    let (polls, votes) = replay_range(db, source, config, config.start_block, latest).await?;

    info!("History sync complete: {polls} poll(s) and {votes} vote(s) applied");
    Ok(latest)
}

// Replay [from, to] in two phases: every creation event first, then every
// vote event. Votes commute, so their order within the window is
// irrelevant; applying creations first removes the only real ordering
// dependency. Also used by the live subscriber to close gap windows.
pub async fn replay_range(
    db: &Database,
    source: &dyn EventSource,
    config: &Config,
    from: u64,
    to: u64,
) -> Result<(u64, u64), SourceError> {
    let mut polls = 0u64;
    for (start, end) in chunked(from, to, config.log_chunk_size) {
        for event in source
            .fetch_events_in_range(EventKind::PollCreated, start, end)
            .await?
        {
            if let ChainEvent::PollCreated(created) = event {
                match apply_creation(db, config, &created).await {
                    Ok(true) => polls += 1,
                    Ok(false) => {}
                    Err(e) => error!(
                        "Failed to restore poll #{} during backfill: {e}",
                        created.poll_id
                    ),
                }
            }
        }
    }

    let mut votes = 0u64;
    for (start, end) in chunked(from, to, config.log_chunk_size) {
        for event in source
            .fetch_events_in_range(EventKind::VoteCast, start, end)
            .await?
        {
            if let ChainEvent::VoteCast(vote) = event {
                match db
                    .increment_vote(vote.poll_id, vote.option_index as usize)
                    .await
                {
                    Ok(()) => votes += 1,
                    // The poll was never mirrored (its creation event was
                    // malformed or outside the window); reconciliation
                    // cannot help a poll it does not know, so just log.
                    Err(StoreError::PollNotFound(id)) => {
                        warn!("Dropping historical vote for unknown poll #{id}");
                    }
                    Err(StoreError::IndexOutOfRange { poll_id, index }) => {
                        warn!("Dropping historical vote for poll #{poll_id}: bad option index {index}");
                    }
                    Err(e) => error!(
                        "Failed to apply historical vote for poll #{}: {e}",
                        vote.poll_id
                    ),
                }
            }
        }
    }

    Ok((polls, votes))
}

// Inclusive [from, to] split into windows of at most `size` blocks.
fn chunked(from: u64, to: u64, size: u64) -> Vec<(u64, u64)> {
    let size = size.max(1);
    let mut windows = Vec::new();
    let mut start = from;
    while start <= to {
        let end = to.min(start.saturating_add(size - 1));
        windows.push((start, end));
        if end == u64::MAX {
            break;
        }
        start = end + 1;
    }
    windows
}
