use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use super::abi;
use super::{ChainEvent, EventKind, EventSource, PollAggregate, SourceError};
use crate::config::Config;

// Capacity of the channel feeding the live subscriber. The subscriber
// drains quickly; this only absorbs bursts within one block scan.
const SUBSCRIPTION_BUFFER: usize = 256;

// Event source over plain Ethereum JSON-RPC: eth_getLogs for history,
// a new-block scan loop for the live feed, eth_call for aggregates.
pub struct RpcEventSource {
    http: reqwest::Client,
    url: String,
    contract: String,
    scan_interval: Duration,
}

impl RpcEventSource {
    pub fn new(config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: config.rpc_url.clone(),
            contract: config.contract_address.clone(),
            scan_interval: Duration::from_secs(config.subscribe_poll_secs),
        }
    }

    async fn rpc_call(&self, method: &str, params: Value) -> Result<Value, SourceError> {
        #[derive(Deserialize)]
        struct RpcResponse {
            result: Option<Value>,
            error: Option<RpcErrorBody>,
        }

        #[derive(Deserialize)]
        struct RpcErrorBody {
            code: i64,
            message: String,
        }

        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response: RpcResponse = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(err) = response.error {
            return Err(SourceError::Rpc {
                code: err.code,
                message: err.message,
            });
        }

        response
            .result
            .ok_or_else(|| SourceError::Malformed(format!("{method}: response has no result")))
    }
}

#[derive(Debug, Deserialize)]
struct LogEntry {
    topics: Vec<String>,
    data: String,
    #[serde(rename = "blockNumber")]
    block_number: String,
}

fn topic_for(kind: EventKind) -> &'static str {
    match kind {
        EventKind::PollCreated => abi::POLL_CREATED_TOPIC,
        EventKind::VoteCast => abi::VOTE_CASTED_TOPIC,
    }
}

fn decode_log(kind: EventKind, log: &LogEntry) -> Result<ChainEvent, SourceError> {
    let position = abi::parse_hex_u64(&log.block_number)?;
    match kind {
        EventKind::PollCreated => Ok(ChainEvent::PollCreated(abi::decode_poll_created(
            &log.topics,
            &log.data,
            position,
        )?)),
        EventKind::VoteCast => Ok(ChainEvent::VoteCast(abi::decode_vote_casted(
            &log.topics,
            &log.data,
            position,
        )?)),
    }
}

#[async_trait]
impl EventSource for RpcEventSource {
    async fn latest_position(&self) -> Result<u64, SourceError> {
        let result = self.rpc_call("eth_blockNumber", json!([])).await?;
        let quantity = result
            .as_str()
            .ok_or_else(|| SourceError::Malformed("eth_blockNumber: non-string result".into()))?;
        abi::parse_hex_u64(quantity)
    }

    async fn fetch_events_in_range(
        &self,
        kind: EventKind,
        from: u64,
        to: u64,
    ) -> Result<Vec<ChainEvent>, SourceError> {
        let filter = json!([{
            "address": self.contract,
            "fromBlock": format!("0x{from:x}"),
            "toBlock": format!("0x{to:x}"),
            "topics": [topic_for(kind)],
        }]);

        let result = self.rpc_call("eth_getLogs", filter).await?;
        let logs: Vec<LogEntry> = serde_json::from_value(result)
            .map_err(|e| SourceError::Malformed(format!("eth_getLogs: {e}")))?;

        // A log the decoder rejects is dropped, never fatal: one corrupt
        // entry must not stall the whole range.
        let mut events = Vec::with_capacity(logs.len());
        for log in &logs {
            match decode_log(kind, log) {
                Ok(ev) => events.push(ev),
                Err(e) => warn!("Dropping undecodable {kind:?} log: {e}"),
            }
        }
        Ok(events)
    }

    async fn subscribe(
        &self,
        kind: EventKind,
        from: u64,
    ) -> Result<mpsc::Receiver<ChainEvent>, SourceError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);

        let scanner = Self {
            http: self.http.clone(),
            url: self.url.clone(),
            contract: self.contract.clone(),
            scan_interval: self.scan_interval,
        };

        // Scan for new blocks on a fixed cadence and forward their logs.
        // Any failure ends the task and closes the channel; the subscriber
        // treats that as subscription loss and reconnects with backoff.
        tokio::spawn(async move {
            let mut next = from;
            let mut interval = tokio::time::interval(scanner.scan_interval);
            loop {
                interval.tick().await;

                let latest = match scanner.latest_position().await {
                    Ok(latest) => latest,
                    Err(e) => {
                        warn!("{kind:?} subscription: latest position unavailable: {e}");
                        return;
                    }
                };
                if latest < next {
                    continue;
                }

                let events = match scanner.fetch_events_in_range(kind, next, latest).await {
                    Ok(events) => events,
                    Err(e) => {
                        warn!("{kind:?} subscription: log fetch failed: {e}");
                        return;
                    }
                };

                debug!(
                    "{kind:?} scan [{next}, {latest}]: {} event(s)",
                    events.len()
                );
                for ev in events {
                    if tx.send(ev).await.is_err() {
                        // Receiver gone, the subscriber has moved on.
                        return;
                    }
                }
                next = latest + 1;
            }
        });

        Ok(rx)
    }

    async fn fetch_aggregate(&self, poll_id: u64) -> Result<PollAggregate, SourceError> {
        let params = json!([
            {
                "to": self.contract,
                "data": abi::encode_get_poll_call(poll_id),
            },
            "latest",
        ]);

        let result = self.rpc_call("eth_call", params).await?;
        let data = result
            .as_str()
            .ok_or_else(|| SourceError::Malformed("eth_call: non-string result".into()))?;
        abi::decode_get_poll_return(data)
    }
}
