//! The chain client boundary — header and log fetch over EVM JSON-RPC.
//!
//! Implementations wrap `eth_getBlockByNumber` / `eth_getLogs`. Errors are
//! classified transient (timeout, connection reset — retried next cycle)
//! versus malformed (a response we cannot interpret).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use chainlogs_core::error::Error;
use chainlogs_core::filter::FilterSet;
use chainlogs_core::types::{
    normalize_address, normalize_data, normalize_hash, BlockHeader, Log,
};
use chrono::Utc;

/// A raw EVM log as returned by `eth_getLogs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(rename = "blockNumber")]
    pub block_number: String,
    #[serde(rename = "blockHash")]
    pub block_hash: String,
    #[serde(rename = "transactionHash")]
    pub tx_hash: String,
    #[serde(rename = "logIndex")]
    pub log_index: String,
    pub removed: Option<bool>,
}

impl RawLog {
    /// Returns the block number as u64.
    pub fn block_number_u64(&self) -> u64 {
        parse_hex_u64(&self.block_number)
    }

    /// Returns the log index as u32.
    pub fn log_index_u32(&self) -> u32 {
        parse_hex_u64(&self.log_index) as u32
    }

    /// Returns `true` if the node flagged this log as reorged out.
    pub fn is_removed(&self) -> bool {
        self.removed.unwrap_or(false)
    }

    /// Normalize into a storable [`Log`]. Fails with `RpcMalformed` if any
    /// field is not well-formed fixed-width hex or `topics` is empty.
    pub fn into_log(self) -> Result<Log, Error> {
        let topics = self
            .topics
            .iter()
            .map(|t| normalize_hash(t).map_err(|_| malformed_topic(t)))
            .collect::<Result<Vec<_>, _>>()?;
        let event_sig = topics
            .first()
            .cloned()
            .ok_or_else(|| Error::RpcMalformed("log without topic0".into()))?;

        Ok(Log {
            block_hash: normalize_hash(&self.block_hash)
                .map_err(|_| malformed_topic(&self.block_hash))?,
            block_number: self.block_number_u64(),
            log_index: self.log_index_u32(),
            tx_hash: normalize_hash(&self.tx_hash)
                .map_err(|_| malformed_topic(&self.tx_hash))?,
            address: normalize_address(&self.address)
                .map_err(|_| malformed_topic(&self.address))?,
            event_sig,
            topics,
            data: normalize_data(&self.data)?,
            created_at: Utc::now(),
        })
    }
}

fn malformed_topic(value: &str) -> Error {
    Error::RpcMalformed(format!("malformed hex value in log: {value:?}"))
}

/// Trait for fetching chain data from a JSON-RPC provider.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// The current remote tip header.
    async fn latest_header(&self) -> Result<BlockHeader, Error>;

    /// Header at `number`; `None` if the node does not (yet) have it.
    async fn header_by_number(&self, number: u64) -> Result<Option<BlockHeader>, Error>;

    /// Raw logs for the block with `block_hash`. The filter set lets the
    /// node prefilter; the poller re-checks every log against it anyway.
    async fn logs_for_block(
        &self,
        block_hash: &str,
        filters: &FilterSet,
    ) -> Result<Vec<RawLog>, Error>;
}

/// Parse a hex-encoded string (with or without `0x`) to u64.
pub fn parse_hex_u64(s: &str) -> u64 {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).unwrap_or(0)
}

/// Convert a JSON block response to a [`BlockHeader`].
pub fn header_from_json(v: &Value) -> Option<BlockHeader> {
    Some(BlockHeader {
        number: parse_hex_u64(v["number"].as_str()?),
        hash: v["hash"].as_str()?.to_string(),
        parent_hash: v["parentHash"].as_str()?.to_string(),
        timestamp: parse_hex_u64(v["timestamp"].as_str()?) as i64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainlogs_core::types::hash_from_u64;
    use serde_json::json;

    #[test]
    fn parse_hex_u64_basic() {
        assert_eq!(parse_hex_u64("0x1"), 1);
        assert_eq!(parse_hex_u64("0xff"), 255);
        assert_eq!(parse_hex_u64("1234"), 0x1234);
    }

    #[test]
    fn raw_log_from_rpc_json() {
        let raw: RawLog = serde_json::from_value(json!({
            "address": format!("0x{:040x}", 0xAAu64),
            "topics": [hash_from_u64(0x51), hash_from_u64(7)],
            "data": "0x",
            "blockNumber": "0x12a05f200",
            "blockHash": hash_from_u64(1),
            "transactionHash": hash_from_u64(2),
            "logIndex": "0x5",
            "removed": false
        }))
        .unwrap();

        assert_eq!(raw.block_number_u64(), 5_000_000_000);
        assert_eq!(raw.log_index_u32(), 5);
        assert!(!raw.is_removed());

        let log = raw.into_log().unwrap();
        assert_eq!(log.event_sig, hash_from_u64(0x51));
        assert_eq!(log.topics.len(), 2);
    }

    #[test]
    fn into_log_rejects_missing_topic0() {
        let raw = RawLog {
            address: format!("0x{:040x}", 0xAAu64),
            topics: vec![],
            data: "0x".into(),
            block_number: "0x1".into(),
            block_hash: hash_from_u64(1),
            tx_hash: hash_from_u64(2),
            log_index: "0x0".into(),
            removed: None,
        };
        assert!(matches!(raw.into_log(), Err(Error::RpcMalformed(_))));
    }

    #[test]
    fn into_log_rejects_ragged_data() {
        let raw = RawLog {
            address: format!("0x{:040x}", 0xAAu64),
            topics: vec![hash_from_u64(0x51)],
            data: "0x1234".into(), // not a whole number of words
            block_number: "0x1".into(),
            block_hash: hash_from_u64(1),
            tx_hash: hash_from_u64(2),
            log_index: "0x0".into(),
            removed: None,
        };
        assert!(matches!(raw.into_log(), Err(Error::RpcMalformed(_))));
    }

    #[test]
    fn header_from_json_roundtrip() {
        let header = header_from_json(&json!({
            "number": "0x64",
            "hash": "0xaaa",
            "parentHash": "0xbbb",
            "timestamp": "0x4b0"
        }))
        .unwrap();
        assert_eq!(header.number, 100);
        assert_eq!(header.timestamp, 1200);
        assert!(header_from_json(&json!({"number": "0x64"})).is_none());
    }
}
