use std::sync::Arc;
use std::time::Duration as StdDuration;

use log::{error, info, warn};
use tokio::time::interval;

use crate::chain::EventSource;
use crate::db::Database;
use crate::models::Poll;

// Periodic backstop for everything the event pipeline can miss: re-fetch
// the authoritative aggregate for every mirrored poll and overwrite the
// cached counts when they disagree. Whatever live delivery drops, the
// cache converges to truth within one interval.
pub async fn run(db: Arc<Database>, source: Arc<dyn EventSource>, interval_secs: u64) {
    info!("Starting reconciliation task (every {interval_secs}s)...");
    let mut interval = interval(StdDuration::from_secs(interval_secs));

    loop {
        interval.tick().await;
        run_once(&db, source.as_ref()).await;
    }
}

// One reconciliation pass. Polls are fetched concurrently; one poll's
// failure is logged and skipped so it cannot hold up the others.
pub async fn run_once(db: &Database, source: &dyn EventSource) {
    let polls = match db.list_polls().await {
        Ok(polls) => polls,
        Err(e) => {
            error!("Reconciliation skipped: failed to list mirrored polls: {e}");
            return;
        }
    };

    let checks = polls.into_iter().map(|poll| async move {
        let poll_id = poll.id;
        if let Err(e) = reconcile_poll(db, source, poll).await {
            warn!("Reconciliation of poll #{poll_id} failed, will retry next interval: {e}");
        }
    });

    futures::future::join_all(checks).await;
}

async fn reconcile_poll(
    db: &Database,
    source: &dyn EventSource,
    poll: Poll,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let aggregate = source.fetch_aggregate(poll.id).await?;

    if aggregate.votes != poll.votes {
        info!(
            "Correcting drift on poll #{}: {:?} -> {:?}",
            poll.id, poll.votes, aggregate.votes
        );
        db.replace_votes(poll.id, &aggregate.votes).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::PollAggregate;
    use crate::chain::mock::MockSource;

    async fn mirrored_poll(db: &Database, id: u64, votes: &[u64]) {
        let poll = Poll::new(id, "Q".to_string(), vec!["a".into(), "b".into()]);
        db.upsert_poll_if_absent(&poll).await.unwrap();
        db.replace_votes(id, votes).await.unwrap();
    }

    fn aggregate(id: u64, votes: &[u64]) -> PollAggregate {
        PollAggregate {
            poll_id: id,
            question: "Q".to_string(),
            options: vec!["a".to_string(), "b".to_string()],
            votes: votes.to_vec(),
        }
    }

    #[tokio::test]
    async fn stale_counts_converge_to_the_aggregate() {
        let db = Database::in_memory().await.unwrap();
        // One live vote event was missed: cache holds [5, 8], truth is [5, 9].
        mirrored_poll(&db, 3, &[5, 8]).await;

        let source = MockSource::new();
        source.set_aggregate(aggregate(3, &[5, 9]));

        run_once(&db, &source).await;

        let poll = db.get_poll(3).await.unwrap().unwrap();
        assert_eq!(poll.votes, vec![5, 9]);
    }

    #[tokio::test]
    async fn matching_counts_are_left_alone() {
        let db = Database::in_memory().await.unwrap();
        mirrored_poll(&db, 1, &[2, 2]).await;

        let source = MockSource::new();
        source.set_aggregate(aggregate(1, &[2, 2]));

        run_once(&db, &source).await;

        let poll = db.get_poll(1).await.unwrap().unwrap();
        assert_eq!(poll.votes, vec![2, 2]);
    }

    #[tokio::test]
    async fn one_failing_fetch_does_not_block_the_others() {
        let db = Database::in_memory().await.unwrap();
        mirrored_poll(&db, 1, &[0, 0]).await;
        mirrored_poll(&db, 2, &[0, 0]).await;

        let source = MockSource::new();
        source.fail_aggregate(1);
        source.set_aggregate(aggregate(2, &[4, 4]));

        run_once(&db, &source).await;

        assert_eq!(db.get_poll(1).await.unwrap().unwrap().votes, vec![0, 0]);
        assert_eq!(db.get_poll(2).await.unwrap().unwrap().votes, vec![4, 4]);
    }

    #[tokio::test]
    async fn drifted_option_count_is_isolated() {
        let db = Database::in_memory().await.unwrap();
        mirrored_poll(&db, 1, &[1, 1]).await;
        mirrored_poll(&db, 2, &[0, 0]).await;

        let source = MockSource::new();
        // Aggregate disagrees on the option count itself; replace_votes
        // must refuse it and the other poll must still be corrected.
        source.set_aggregate(PollAggregate {
            poll_id: 1,
            question: "Q".to_string(),
            options: vec!["a".to_string()],
            votes: vec![7],
        });
        source.set_aggregate(aggregate(2, &[3, 0]));

        run_once(&db, &source).await;

        assert_eq!(db.get_poll(1).await.unwrap().unwrap().votes, vec![1, 1]);
        assert_eq!(db.get_poll(2).await.unwrap().unwrap().votes, vec![3, 0]);
    }
}
