//! Wire format for messages forwarded between cluster members
//!
//! ```text
//! byte 0      message tag (1 = metric write)
//! bytes 1..k  header, bincode varint encoding: { partition_key }
//! bytes k..N  metric families, same payload codec as agent uploads
//! ```
//!
//! All members must run the same codec; the gossip layer enforces this by
//! rejecting peers with a different [`PROTOCOL_VERSION`].

use crate::schema::{decode_families, encode_families};
use crate::store::PartitionedMetrics;
use crate::{Error, Result};

use bincode::Options;
use serde::{Deserialize, Serialize};

/// Version of the cluster protocol, exchanged by the gossip layer
pub const PROTOCOL_VERSION: u8 = 1;

/// Upper bound on an encoded header
const MAX_HEADER_BYTES: u64 = 64 * 1024;

/// Message tag
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Partition batch forwarded to its owning node
    MetricWrite = 1,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::MetricWrite),
            other => Err(other),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MetricMessageHeader {
    partition_key: String,
}

/// A decoded cluster message
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterMessage {
    MetricWrite(PartitionedMetrics),
}

fn header_options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_HEADER_BYTES)
}

/// Encode a partition batch as a metric-write message
pub fn encode_metric_message(metrics: &PartitionedMetrics) -> Result<Vec<u8>> {
    let mut buf = vec![MessageType::MetricWrite as u8];
    header_options().serialize_into(
        &mut buf,
        &MetricMessageHeader {
            partition_key: metrics.partition_key.clone(),
        },
    )?;
    encode_families(&mut buf, &metrics.families)?;
    Ok(buf)
}

/// Decode a message received from a peer
pub fn decode_message(data: &[u8]) -> Result<ClusterMessage> {
    let Some((&tag, mut rest)) = data.split_first() else {
        return Err(Error::Protocol("empty message".to_string()));
    };

    match MessageType::try_from(tag) {
        Ok(MessageType::MetricWrite) => {
            let header: MetricMessageHeader = header_options()
                .deserialize_from(&mut rest)
                .map_err(|e| Error::Protocol(format!("malformed metric message header: {}", e)))?;
            if header.partition_key.is_empty() {
                return Err(Error::Protocol(
                    "metric message must have a partition key".to_string(),
                ));
            }
            let families = decode_families(rest)?;
            Ok(ClusterMessage::MetricWrite(PartitionedMetrics::new(
                header.partition_key,
                families,
            )))
        }
        Err(tag) => Err(Error::Protocol(format!(
            "unrecognized message {:#04x}, len={}",
            tag,
            data.len()
        ))),
    }
}
