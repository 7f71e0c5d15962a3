//! Metric family payload codec
//!
//! Payloads are length-delimited protobuf `MetricFamily` records wrapped in a
//! snappy frame stream. The same encoding is used for agent uploads, the
//! federate endpoint and the payload section of forwarded cluster messages.

use super::MetricFamily;
use crate::Result;

use bytes::Buf;
use prost::Message;
use std::io::{Read, Write};

/// Encode `families` into `writer`
pub fn encode_families<W: Write>(writer: W, families: &[MetricFamily]) -> Result<()> {
    let mut encoder = snap::write::FrameEncoder::new(writer);
    let mut buf = Vec::new();
    for family in families {
        buf.clear();
        family.encode_length_delimited(&mut buf)?;
        encoder.write_all(&buf)?;
    }
    encoder.flush()?;
    Ok(())
}

/// Decode every family from `reader` until the stream ends
pub fn decode_families<R: Read>(reader: R) -> Result<Vec<MetricFamily>> {
    let mut raw = Vec::new();
    snap::read::FrameDecoder::new(reader).read_to_end(&mut raw)?;

    let mut buf = raw.as_slice();
    let mut families = Vec::new();
    while buf.has_remaining() {
        families.push(MetricFamily::decode_length_delimited(&mut buf)?);
    }
    Ok(families)
}
