use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};

use super::{apply_creation, backfill};
use crate::chain::{ChainEvent, EventKind, EventSource, VoteCastEvent};
use crate::config::Config;
use crate::db::{Database, StoreError};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

// Hard cap on buffered votes across all polls.
const MAX_PENDING: usize = 1024;

// Votes that arrived before their poll's creation event, kept per poll id.
// Every buffered vote is retried after each newly applied creation event;
// an entry that keeps missing is dropped after `limit` attempts and left
// for reconciliation to repair.
pub struct PendingVotes {
    buckets: HashMap<u64, Vec<(VoteCastEvent, u32)>>,
    limit: u32,
    len: usize,
}

impl PendingVotes {
    pub fn new(limit: u32) -> Self {
        Self {
            buckets: HashMap::new(),
            limit,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    fn push(&mut self, event: VoteCastEvent) {
        if self.len >= MAX_PENDING {
            warn!(
                "Pending vote buffer full; dropping vote for poll #{} (reconciliation will repair the count)",
                event.poll_id
            );
            return;
        }
        self.buckets.entry(event.poll_id).or_default().push((event, 0));
        self.len += 1;
    }

    async fn retry(&mut self, db: &Database) {
        let buckets = std::mem::take(&mut self.buckets);
        self.len = 0;

        for (_, entries) in buckets {
            for (event, attempts) in entries {
                match db
                    .increment_vote(event.poll_id, event.option_index as usize)
                    .await
                {
                    Ok(()) => {
                        debug!("Applied buffered vote for poll #{}", event.poll_id);
                    }
                    Err(StoreError::PollNotFound(_)) => {
                        let attempts = attempts + 1;
                        if attempts >= self.limit {
                            warn!(
                                "Dropping buffered vote for still-unknown poll #{} after {attempts} attempt(s)",
                                event.poll_id
                            );
                        } else {
                            let poll_id = event.poll_id;
                            self.buckets.entry(poll_id).or_default().push((event, attempts));
                            self.len += 1;
                        }
                    }
                    Err(e) => {
                        warn!("Dropping buffered vote for poll #{}: {e}", event.poll_id);
                    }
                }
            }
        }
    }
}

// Apply one live event through the same primitives backfill uses.
pub(crate) async fn handle_event(
    db: &Database,
    config: &Config,
    pending: &mut PendingVotes,
    event: ChainEvent,
) {
    match event {
        ChainEvent::PollCreated(created) => match apply_creation(db, config, &created).await {
            Ok(true) => pending.retry(db).await,
            Ok(false) => {}
            Err(e) => error!("Failed to apply creation event for poll #{}: {e}", created.poll_id),
        },
        ChainEvent::VoteCast(vote) => {
            match db
                .increment_vote(vote.poll_id, vote.option_index as usize)
                .await
            {
                Ok(()) => debug!(
                    "Vote by {} applied to poll #{} option {}",
                    vote.voter, vote.poll_id, vote.option_index
                ),
                Err(StoreError::PollNotFound(id)) => {
                    debug!("Buffering vote for not-yet-mirrored poll #{id}");
                    pending.push(vote);
                }
                Err(StoreError::IndexOutOfRange { poll_id, index }) => {
                    warn!("Dropping vote for poll #{poll_id}: bad option index {index}");
                }
                Err(e) => error!("Failed to apply vote for poll #{}: {e}", vote.poll_id),
            }
        }
    }
}

// Long-lived subscription loop. `cursor` is the next position live
// delivery should cover; every (re)connect first replays the gap window
// [cursor, latest] through the backfill path, so events emitted while the
// subscription was down are never silently lost.
pub async fn run(db: Arc<Database>, source: Arc<dyn EventSource>, config: Config, mut cursor: u64) {
    info!("Starting live event subscription from block {cursor}...");
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let latest = match source.latest_position().await {
            Ok(latest) => latest,
            Err(e) => {
                warn!("Event source unreachable: {e}; retrying in {backoff:?}");
                tokio::time::sleep(backoff).await;
                backoff = grow(backoff);
                continue;
            }
        };

        if latest >= cursor {
            match backfill::replay_range(&db, source.as_ref(), &config, cursor, latest).await {
                Ok((polls, votes)) => {
                    if polls + votes > 0 {
                        info!("Gap replay [{cursor}, {latest}]: {polls} poll(s), {votes} vote(s)");
                    }
                    cursor = latest + 1;
                }
                Err(e) => {
                    warn!("Gap replay failed: {e}; retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff = grow(backoff);
                    continue;
                }
            }
        }

        let created_rx = source.subscribe(EventKind::PollCreated, cursor).await;
        let vote_rx = source.subscribe(EventKind::VoteCast, cursor).await;
        let (mut created_rx, mut vote_rx) = match (created_rx, vote_rx) {
            (Ok(created), Ok(votes)) => (created, votes),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Subscription failed: {e}; retrying in {backoff:?}");
                tokio::time::sleep(backoff).await;
                backoff = grow(backoff);
                continue;
            }
        };

        info!("Live subscription established at block {cursor}");
        backoff = INITIAL_BACKOFF;
        let mut pending = PendingVotes::new(config.gap_retry_limit);

        loop {
            let event = tokio::select! {
                event = created_rx.recv() => event,
                event = vote_rx.recv() => event,
            };
            let Some(event) = event else { break };

            // Track the last seen block, not the next one: if the stream
            // dies mid-block, the gap replay revisits it. Replaying a block
            // is recoverable, skipping one is not.
            cursor = cursor.max(event.position());
            handle_event(&db, &config, &mut pending, event).await;
        }

        warn!("Event subscription lost; reconnecting in {backoff:?}...");
        tokio::time::sleep(backoff).await;
        backoff = grow(backoff);
    }
}

fn grow(backoff: Duration) -> Duration {
    (backoff * 2).min(MAX_BACKOFF)
}
