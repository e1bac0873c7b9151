pub mod abi;
#[cfg(test)]
pub mod mock;
pub mod rpc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    PollCreated,
    VoteCast,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollCreatedEvent {
    pub poll_id: u64,
    pub question: String,
    pub options: Vec<String>,
    // Block height the event was emitted at.
    pub position: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteCastEvent {
    pub poll_id: u64,
    pub option_index: u64,
    // Opaque to this engine; carried only for logging.
    pub voter: String,
    pub position: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    PollCreated(PollCreatedEvent),
    VoteCast(VoteCastEvent),
}

impl ChainEvent {
    pub fn position(&self) -> u64 {
        match self {
            Self::PollCreated(ev) => ev.position,
            Self::VoteCast(ev) => ev.position,
        }
    }
}

// Authoritative aggregate for one poll, read directly from the contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollAggregate {
    pub poll_id: u64,
    pub question: String,
    pub options: Vec<String>,
    pub votes: Vec<u64>,
}

// Boundary to the authoritative ledger. The engine only ever talks to the
// chain through this trait; everything behind it is replaceable.
#[async_trait]
pub trait EventSource: Send + Sync {
    // Highest position the source has sealed so far.
    async fn latest_position(&self) -> Result<u64, SourceError>;

    // Finite historical fetch over [from, to], both inclusive.
    async fn fetch_events_in_range(
        &self,
        kind: EventKind,
        from: u64,
        to: u64,
    ) -> Result<Vec<ChainEvent>, SourceError>;

    // Live feed of events from `from` onward. The channel closing means the
    // subscription was lost; the caller owns reconnection.
    async fn subscribe(
        &self,
        kind: EventKind,
        from: u64,
    ) -> Result<mpsc::Receiver<ChainEvent>, SourceError>;

    // Point read of the current authoritative aggregate, bypassing events.
    async fn fetch_aggregate(&self, poll_id: u64) -> Result<PollAggregate, SourceError>;
}
