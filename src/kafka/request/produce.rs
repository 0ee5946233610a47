use std::ops::RangeInclusive;

use anyhow::{Context as _, Result};
use bytes::BytesMut;

use crate::kafka::api::ApiKey;
use crate::kafka::record::RecordSet;
use crate::kafka::request::Request;
use crate::kafka::types::{Array, Str, StrBytes};
use crate::kafka::{response, Serialize};

/// Number of acknowledgments the leader must receive before answering a produce request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(i16)]
pub enum Acks {
    /// No response is sent at all. [`Connection::send`](crate::Connection::send) returns an
    /// empty response as soon as the request is queued.
    None = 0,
    /// The leader acknowledges once the records are written to its local log.
    Leader = 1,
    /// The leader waits for the full set of in-sync replicas.
    #[default]
    All = -1,
}

/// # Produce Request
///
/// [Request schema][schema]
///
/// Version 3 adds the transactional ID, which is used for authorization when attempting to write
/// transactional data. Version 3 also adds support for Kafka Message Format v2.
///
/// Versions 4 through 8 share the request layout of version 3.
///
/// [schema]: https://github.com/apache/kafka/blob/trunk/clients/src/main/resources/common/message/ProduceRequest.json
#[derive(Clone, Debug)]
pub struct Produce {
    version: i16,

    /// The transactional ID, or null if the producer is not transactional. (API v3+)
    pub transactional_id: Option<StrBytes>,

    /// The number of acknowledgments the producer requires the leader to have received before
    /// considering a request complete. (API v0+)
    pub acks: Acks,

    /// The timeout to await a response in milliseconds. (API v0+)
    pub timeout_ms: i32,

    /// Each topic to produce to. (API v0+)
    pub topic_data: Vec<TopicProduceData>,
}

impl Produce {
    #[inline]
    pub fn new(acks: Acks, timeout_ms: i32, topic_data: Vec<TopicProduceData>) -> Self {
        Self {
            version: *<Self as Request>::VERSIONS.end(),
            transactional_id: None,
            acks,
            timeout_ms,
            topic_data,
        }
    }

    #[inline]
    pub fn with_version(mut self, version: i16) -> Self {
        self.version = version;
        self
    }
}

impl Serialize for Produce {
    fn encode_size(&self, version: i16) -> usize {
        self.transactional_id
            .as_ref()
            .map(Str::from)
            .encode_size(version)
            + 2
            + 4
            + Array(self.topic_data.as_slice()).encode_size(version)
    }

    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        self.transactional_id
            .as_ref()
            .map(Str::from)
            .encode(buf, version)
            .context("transactional id")?;

        (self.acks as i16).encode(buf, version)?;
        self.timeout_ms.encode(buf, version)?;

        Array(self.topic_data.as_slice())
            .encode(buf, version)
            .context("topic data")
    }
}

impl Request for Produce {
    const API_KEY: ApiKey = ApiKey::Produce;
    const VERSIONS: RangeInclusive<i16> = 3..=8;

    type Response = response::Produce;

    #[inline]
    fn api_version(&self) -> i16 {
        self.version
    }

    /// Brokers don't respond to produce requests with `acks=0`.
    #[inline]
    fn expects_response(&self) -> bool {
        self.acks != Acks::None
    }
}

#[derive(Clone, Debug)]
pub struct TopicProduceData {
    /// The topic name. (API v0+)
    pub name: StrBytes,
    /// Each partition to produce to. (API v0+)
    pub partition_data: Vec<PartitionProduceData>,
}

impl Serialize for TopicProduceData {
    #[inline]
    fn encode_size(&self, version: i16) -> usize {
        Str::from(&self.name).encode_size(version)
            + Array(self.partition_data.as_slice()).encode_size(version)
    }

    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        Str::from(&self.name)
            .encode(buf, version)
            .context("topic name")?;

        Array(self.partition_data.as_slice())
            .encode(buf, version)
            .with_context(|| format!("topic {} partition data", self.name))
    }
}

#[derive(Clone, Debug)]
pub struct PartitionProduceData {
    /// The partition index. (API v0+)
    pub index: i32,
    /// The record data to be produced. (API v0+)
    pub records: Option<RecordSet>,
}

impl Serialize for PartitionProduceData {
    #[inline]
    fn encode_size(&self, version: i16) -> usize {
        4 + self.records.encode_size(version)
    }

    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        self.index.encode(buf, version)?;
        self.records
            .encode(buf, version)
            .with_context(|| format!("partition {} records", self.index))
    }
}
