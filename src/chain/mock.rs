//! Programmable in-memory event source for tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{
    ChainEvent, EventKind, EventSource, PollAggregate, PollCreatedEvent, SourceError,
    VoteCastEvent,
};

pub fn created(poll_id: u64, question: &str, options: &[&str], position: u64) -> ChainEvent {
    ChainEvent::PollCreated(PollCreatedEvent {
        poll_id,
        question: question.to_string(),
        options: options.iter().map(|s| s.to_string()).collect(),
        position,
    })
}

pub fn vote(poll_id: u64, option_index: u64, position: u64) -> ChainEvent {
    ChainEvent::VoteCast(VoteCastEvent {
        poll_id,
        option_index,
        voter: "0x00000000000000000000000000000000000000aa".to_string(),
        position,
    })
}

#[derive(Default)]
pub struct MockSource {
    latest: Mutex<u64>,
    events: Mutex<Vec<ChainEvent>>,
    aggregates: Mutex<HashMap<u64, PollAggregate>>,
    failing_aggregates: Mutex<HashSet<u64>>,
    // Held so subscription channels stay open for the life of the mock.
    senders: Mutex<Vec<mpsc::Sender<ChainEvent>>>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(events: Vec<ChainEvent>) -> Self {
        let latest = events.iter().map(ChainEvent::position).max().unwrap_or(0);
        let source = Self::new();
        *source.latest.lock().unwrap() = latest;
        *source.events.lock().unwrap() = events;
        source
    }

    pub fn set_aggregate(&self, aggregate: PollAggregate) {
        self.aggregates
            .lock()
            .unwrap()
            .insert(aggregate.poll_id, aggregate);
    }

    pub fn fail_aggregate(&self, poll_id: u64) {
        self.failing_aggregates.lock().unwrap().insert(poll_id);
    }
}

fn matches(kind: EventKind, ev: &ChainEvent) -> bool {
    matches!(
        (kind, ev),
        (EventKind::PollCreated, ChainEvent::PollCreated(_))
            | (EventKind::VoteCast, ChainEvent::VoteCast(_))
    )
}

#[async_trait]
impl EventSource for MockSource {
    async fn latest_position(&self) -> Result<u64, SourceError> {
        Ok(*self.latest.lock().unwrap())
    }

    async fn fetch_events_in_range(
        &self,
        kind: EventKind,
        from: u64,
        to: u64,
    ) -> Result<Vec<ChainEvent>, SourceError> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|ev| matches(kind, ev))
            .filter(|ev| (from..=to).contains(&ev.position()))
            .cloned()
            .collect())
    }

    async fn subscribe(
        &self,
        kind: EventKind,
        from: u64,
    ) -> Result<mpsc::Receiver<ChainEvent>, SourceError> {
        let (tx, rx) = mpsc::channel(64);
        for ev in self.events.lock().unwrap().iter() {
            if matches(kind, ev) && ev.position() >= from {
                tx.try_send(ev.clone()).expect("mock subscription overflow");
            }
        }
        self.senders.lock().unwrap().push(tx);
        Ok(rx)
    }

    async fn fetch_aggregate(&self, poll_id: u64) -> Result<PollAggregate, SourceError> {
        if self.failing_aggregates.lock().unwrap().contains(&poll_id) {
            return Err(SourceError::Rpc {
                code: -32000,
                message: format!("aggregate fetch for poll #{poll_id} unavailable"),
            });
        }
        self.aggregates
            .lock()
            .unwrap()
            .get(&poll_id)
            .cloned()
            .ok_or_else(|| SourceError::Malformed(format!("no aggregate for poll #{poll_id}")))
    }
}
