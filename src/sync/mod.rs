pub mod backfill;
pub mod subscriber;

use log::{debug, info, warn};

use crate::chain::PollCreatedEvent;
use crate::config::Config;
use crate::db::{Database, StoreError};
use crate::models::Poll;

// Apply one creation event idempotently. Backfill and the live subscriber
// both funnel through here, so redelivery is harmless on either path.
// Returns whether a new poll was mirrored.
pub async fn apply_creation(
    db: &Database,
    config: &Config,
    event: &PollCreatedEvent,
) -> Result<bool, StoreError> {
    if event.question.is_empty()
        || event.options.len() < 2
        || event.options.len() > config.max_poll_options
    {
        warn!(
            "Dropping malformed PollCreated for poll #{} ({} option(s), question len {})",
            event.poll_id,
            event.options.len(),
            event.question.len()
        );
        return Ok(false);
    }

    let poll = Poll::new(event.poll_id, event.question.clone(), event.options.clone());
    let inserted = db.upsert_poll_if_absent(&poll).await?;
    if inserted {
        info!("Mirrored new poll #{}: {}", poll.id, poll.question);
    } else {
        debug!("Poll #{} already mirrored", poll.id);
    }
    Ok(inserted)
}
