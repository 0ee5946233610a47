use anyhow::{Context as _, Result};
use bytes::Buf;

use crate::kafka::api::ApiKey;
use crate::kafka::error::ErrorCode;
use crate::kafka::record::RecordSet;
use crate::kafka::response::Response;
use crate::kafka::types::{Array, Str, StrBytes};
use crate::kafka::Deserialize;

/// # Fetch Response
///
/// [Response schema][schema]
///
/// Version 7 adds incremental fetch request support.
///
/// Version 11 adds the preferred read replica.
///
/// [schema]: https://github.com/apache/kafka/blob/trunk/clients/src/main/resources/common/message/FetchResponse.json
#[derive(Debug, Default)]
pub struct Fetch {
    /// The duration in milliseconds for which the request was throttled due to a quota violation,
    /// or zero if the request did not violate any quota. (API v1+)
    pub throttle_time_ms: i32,

    /// The top-level error code. (API v7+)
    pub error_code: ErrorCode,

    /// The fetch session ID, or 0 if this is not part of a fetch session. (API v7+)
    pub session_id: i32,

    /// The response topics. (API v0+)
    pub responses: Vec<FetchableTopicResponse>,
}

impl Fetch {
    pub fn partition(&self, topic: &str, partition: i32) -> Option<&PartitionData> {
        self.responses
            .iter()
            .find(|t| t.topic == topic)?
            .partitions
            .iter()
            .find(|p| p.partition_index == partition)
    }
}

impl Deserialize for Fetch {
    fn decode<B: Buf>(buf: &mut B, version: i16) -> Result<(Self, usize)> {
        let (throttle_time_ms, mut size) =
            i32::decode(buf, version).context("throttle time ms")?;

        let (error_code, n) = ErrorCode::decode(buf, version).context("error code")?;
        size += n;

        let (session_id, n) = i32::decode(buf, version).context("session id")?;
        size += n;

        let (Array(responses), n) = Deserialize::decode(buf, version).context("responses")?;
        size += n;

        let body = Self {
            throttle_time_ms,
            error_code,
            session_id,
            responses,
        };

        Ok((body, size))
    }
}

impl Response for Fetch {
    const API_KEY: ApiKey = ApiKey::Fetch;
}

#[derive(Debug)]
pub struct FetchableTopicResponse {
    /// The topic name. (API v0-12)
    pub topic: StrBytes,
    /// The topic partitions. (API v0+)
    pub partitions: Vec<PartitionData>,
}

impl Deserialize for FetchableTopicResponse {
    fn decode<B: Buf>(buf: &mut B, version: i16) -> Result<(Self, usize)> {
        let (Str(topic), mut size) = Str::decode(buf, version).context("topic")?;

        let (Array(partitions), n) = Deserialize::decode(buf, version)
            .with_context(|| format!("topic {topic} partitions"))?;
        size += n;

        Ok((Self { topic, partitions }, size))
    }
}

#[derive(Debug)]
pub struct PartitionData {
    /// The partition index. (API v0+)
    pub partition_index: i32,

    /// The error code, or 0 if there was no fetch error. (API v0+)
    pub error_code: ErrorCode,

    /// The current high water mark. (API v0+)
    pub high_watermark: i64,

    /// The last stable offset (or LSO) of the partition. (API v4+)
    pub last_stable_offset: i64,

    /// The current log start offset. (API v5+)
    pub log_start_offset: i64,

    /// The aborted transactions. (API v4+)
    pub aborted_transactions: Option<Vec<AbortedTransaction>>,

    /// The preferred read replica for the consumer to use on its next fetch request. (API v11+)
    pub preferred_read_replica: i32,

    /// The record data. (API v0+)
    pub records: Option<RecordSet>,
}

impl Deserialize for PartitionData {
    fn decode<B: Buf>(buf: &mut B, version: i16) -> Result<(Self, usize)> {
        let (partition_index, mut size) = i32::decode(buf, version).context("partition index")?;

        let (error_code, n) = ErrorCode::decode(buf, version).context("error code")?;
        size += n;

        let (high_watermark, n) = i64::decode(buf, version).context("high watermark")?;
        size += n;

        let (last_stable_offset, n) = i64::decode(buf, version).context("last stable offset")?;
        size += n;

        let (log_start_offset, n) = i64::decode(buf, version).context("log start offset")?;
        size += n;

        let (Array(aborted_transactions), n) =
            Deserialize::decode(buf, version).context("aborted transactions")?;
        size += n;

        let (preferred_read_replica, n) =
            i32::decode(buf, version).context("preferred read replica")?;
        size += n;

        let (records, n) = Option::<RecordSet>::decode(buf, version)
            .with_context(|| format!("partition {partition_index} records"))?;
        size += n;

        let partition = Self {
            partition_index,
            error_code,
            high_watermark,
            last_stable_offset,
            log_start_offset,
            aborted_transactions,
            preferred_read_replica,
            records,
        };

        Ok((partition, size))
    }
}

#[derive(Debug)]
pub struct AbortedTransaction {
    /// The producer id associated with the aborted transaction. (API v4+)
    pub producer_id: i64,
    /// The first offset in the aborted transaction. (API v4+)
    pub first_offset: i64,
}

impl Deserialize for AbortedTransaction {
    fn decode<B: Buf>(buf: &mut B, version: i16) -> Result<(Self, usize)> {
        let (producer_id, a) = i64::decode(buf, version).context("producer id")?;
        let (first_offset, b) = i64::decode(buf, version).context("first offset")?;
        Ok((
            Self {
                producer_id,
                first_offset,
            },
            a + b,
        ))
    }
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};

    use super::*;
    use crate::kafka::error::BatchError;
    use crate::kafka::record::{Record, RecordBatch};
    use crate::kafka::Serialize as _;

    fn response_bytes(records: Option<RecordSet>) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"\x00\x00\x00\x00"); // throttle_time_ms
        buf.extend_from_slice(b"\x00\x00"); // error_code
        buf.extend_from_slice(b"\x00\x00\x00\x00"); // session_id
        buf.extend_from_slice(b"\x00\x00\x00\x01\x00\x01t"); // responses[0].topic
        buf.extend_from_slice(b"\x00\x00\x00\x01"); // partitions length
        buf.extend_from_slice(b"\x00\x00\x00\x00"); // partition_index
        buf.extend_from_slice(b"\x00\x00"); // error_code
        buf.extend_from_slice(b"\x00\x00\x00\x00\x00\x00\x00\x01"); // high_watermark
        buf.extend_from_slice(b"\x00\x00\x00\x00\x00\x00\x00\x01"); // last_stable_offset
        buf.extend_from_slice(b"\x00\x00\x00\x00\x00\x00\x00\x00"); // log_start_offset
        buf.extend_from_slice(b"\xff\xff\xff\xff"); // aborted_transactions
        buf.extend_from_slice(b"\xff\xff\xff\xff"); // preferred_read_replica

        let mut tail = BytesMut::new();
        records.encode(&mut tail, 11).expect("encode records");
        buf.extend_from_slice(&tail);
        buf
    }

    fn batch() -> RecordBatch {
        RecordBatch::new(
            1_700_000_000_000,
            vec![Record {
                value: Some(Bytes::from_static(b"v")),
                ..Record::default()
            }],
        )
    }

    #[test]
    fn decode_v11_with_records() {
        let buf = response_bytes(Some(RecordSet::from(batch())));

        let mut input = &buf[..];
        let (body, n) = Fetch::decode(&mut input, 11).expect("valid response");
        assert_eq!(n, buf.len());
        assert!(input.is_empty());

        let partition = body.partition("t", 0).expect("partition t-0");
        assert_eq!(partition.high_watermark, 1);
        assert!(partition.aborted_transactions.is_none());
        assert_eq!(partition.preferred_read_replica, -1);

        let records = partition.records.as_ref().expect("records");
        assert_eq!(records.batches, vec![batch()]);
        assert!(body.partition("t", 1).is_none());
    }

    #[test]
    fn decode_v11_null_records() {
        let buf = response_bytes(None);

        let mut input = &buf[..];
        let (body, _) = Fetch::decode(&mut input, 11).expect("valid response");
        assert!(body.partition("t", 0).expect("partition").records.is_none());
    }

    #[test]
    fn corrupt_batch_is_an_integrity_error() {
        let mut buf = response_bytes(Some(RecordSet::from(batch())));
        let last = buf.len() - 1;
        buf[last] ^= 0xff;

        let err = Fetch::decode(&mut &buf[..], 11).expect_err("crc mismatch");
        assert!(err.chain().any(|cause| cause.is::<BatchError>()));
    }
}
