use std::ops::RangeInclusive;

use anyhow::{Context as _, Result};
use bytes::BytesMut;

use crate::kafka::api::ApiKey;
use crate::kafka::request::Request;
use crate::kafka::types::{Array, Str, StrBytes};
use crate::kafka::{response, Serialize};

/// Controls visibility of transactional records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(i8)]
pub enum IsolationLevel {
    #[default]
    ReadUncommitted = 0,
    ReadCommitted = 1,
}

/// # Fetch Request
///
/// [Request schema][schema]
///
/// Version 11 adds RackId to the request so that the broker may pick a preferred read replica.
/// It is the last version before the protocol switched to flexible encoding, and the only one
/// this client speaks.
///
/// [schema]: https://github.com/apache/kafka/blob/trunk/clients/src/main/resources/common/message/FetchRequest.json
#[derive(Clone, Debug)]
pub struct Fetch {
    /// The broker ID of the follower, of -1 if this request is from a consumer. (API v0-14)
    pub replica_id: i32,

    /// The maximum time in milliseconds to wait for the response. (API v0+)
    pub max_wait_ms: i32,

    /// The minimum bytes to accumulate in the response. (API v0+)
    pub min_bytes: i32,

    /// The maximum bytes to fetch. (API v3+)
    pub max_bytes: i32,

    /// This setting controls the visibility of transactional records. (API v4+)
    pub isolation_level: IsolationLevel,

    /// The fetch session ID. (API v7+)
    pub session_id: i32,

    /// The fetch session epoch, which is used for ordering requests in a session. (API v7+)
    pub session_epoch: i32,

    /// The topics to fetch. (API v0+)
    pub topics: Vec<FetchTopic>,

    /// In an incremental fetch request, the partitions to remove. (API v7+)
    pub forgotten_topics_data: Vec<ForgottenTopic>,

    /// Rack ID of the consumer making this request. (API v11+)
    pub rack_id: StrBytes,
}

impl Fetch {
    pub fn new(max_wait_ms: i32, topics: Vec<FetchTopic>) -> Self {
        Self {
            topics,
            max_wait_ms,
            ..Default::default()
        }
    }
}

impl Default for Fetch {
    fn default() -> Self {
        Self {
            replica_id: -1,
            max_wait_ms: 500,
            min_bytes: 1,
            max_bytes: 52_428_800,
            isolation_level: IsolationLevel::default(),
            session_id: 0,
            session_epoch: -1,
            topics: Vec::new(),
            forgotten_topics_data: Vec::new(),
            rack_id: StrBytes::default(),
        }
    }
}

impl Serialize for Fetch {
    fn encode_size(&self, version: i16) -> usize {
        // replica_id, max_wait_ms, min_bytes, max_bytes, isolation_level, session_id, session_epoch
        4 + 4 + 4 + 4 + 1 + 4 + 4
            + Array(self.topics.as_slice()).encode_size(version)
            + Array(self.forgotten_topics_data.as_slice()).encode_size(version)
            + Str::from(&self.rack_id).encode_size(version)
    }

    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        self.replica_id.encode(buf, version)?;
        self.max_wait_ms.encode(buf, version)?;
        self.min_bytes.encode(buf, version)?;
        self.max_bytes.encode(buf, version)?;
        (self.isolation_level as i8).encode(buf, version)?;
        self.session_id.encode(buf, version)?;
        self.session_epoch.encode(buf, version)?;

        Array(self.topics.as_slice())
            .encode(buf, version)
            .context("topics")?;

        Array(self.forgotten_topics_data.as_slice())
            .encode(buf, version)
            .context("forgotten topics data")?;

        Str::from(&self.rack_id)
            .encode(buf, version)
            .context("rack id")
    }
}

impl Request for Fetch {
    const API_KEY: ApiKey = ApiKey::Fetch;
    const VERSIONS: RangeInclusive<i16> = 11..=11;

    type Response = response::Fetch;

    #[inline]
    fn api_version(&self) -> i16 {
        11
    }
}

#[derive(Clone, Debug)]
pub struct FetchTopic {
    /// The name of the topic to fetch. (API v0-12)
    pub topic: StrBytes,
    /// The partitions to fetch. (API v0+)
    pub partitions: Vec<FetchPartition>,
}

impl Serialize for FetchTopic {
    #[inline]
    fn encode_size(&self, version: i16) -> usize {
        Str::from(&self.topic).encode_size(version)
            + Array(self.partitions.as_slice()).encode_size(version)
    }

    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        Str::from(&self.topic)
            .encode(buf, version)
            .context("topic")?;

        Array(self.partitions.as_slice())
            .encode(buf, version)
            .with_context(|| format!("topic {} partitions", self.topic))
    }
}

#[derive(Clone, Debug)]
pub struct FetchPartition {
    /// The partition index. (API v0+)
    pub partition: i32,
    /// The current leader epoch of the partition. (API v9+)
    pub current_leader_epoch: i32,
    /// The message offset. (API v0+)
    pub fetch_offset: i64,
    /// The earliest available offset of the follower replica. (API v5+)
    pub log_start_offset: i64,
    /// The maximum bytes to fetch from this partition. (API v0+)
    pub partition_max_bytes: i32,
}

impl FetchPartition {
    #[inline]
    pub fn new(partition: i32, fetch_offset: i64) -> Self {
        Self {
            partition,
            current_leader_epoch: -1,
            fetch_offset,
            log_start_offset: -1,
            partition_max_bytes: 1_048_576,
        }
    }
}

impl Serialize for FetchPartition {
    const SIZE: usize = 4 + 4 + 8 + 8 + 4;

    #[inline]
    fn encode_size(&self, _version: i16) -> usize {
        Self::SIZE
    }

    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        self.partition.encode(buf, version)?;
        self.current_leader_epoch.encode(buf, version)?;
        self.fetch_offset.encode(buf, version)?;
        self.log_start_offset.encode(buf, version)?;
        self.partition_max_bytes.encode(buf, version)
    }
}

#[derive(Clone, Debug)]
pub struct ForgottenTopic {
    /// The topic name. (API v7-12)
    pub topic: StrBytes,
    /// The partitions indexes to forget. (API v7+)
    pub partitions: Vec<i32>,
}

impl Serialize for ForgottenTopic {
    #[inline]
    fn encode_size(&self, version: i16) -> usize {
        Str::from(&self.topic).encode_size(version)
            + Array(self.partitions.as_slice()).encode_size(version)
    }

    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        Str::from(&self.topic)
            .encode(buf, version)
            .context("topic")?;

        Array(self.partitions.as_slice())
            .encode(buf, version)
            .context("partitions")
    }
}
