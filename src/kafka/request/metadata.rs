use std::ops::RangeInclusive;

use anyhow::{Context as _, Result};
use bytes::BytesMut;

use crate::kafka::api::ApiKey;
use crate::kafka::request::Request;
use crate::kafka::types::{Array, Str, StrBytes};
use crate::kafka::{response, Serialize};

/// # Metadata Request
///
/// [Request schema][schema]
///
/// In version 0, an empty array indicates "request metadata for all topics." In version 1 and
/// higher, an empty array indicates "request metadata for no topics," and a null array is used
/// to indicate "request metadata for all topics."
///
/// [schema]: https://github.com/apache/kafka/blob/trunk/clients/src/main/resources/common/message/MetadataRequest.json
#[derive(Clone, Debug)]
pub struct Metadata {
    version: i16,

    /// The topics to fetch metadata for, `None` for all topics. (API v0+)
    pub topics: Option<Vec<StrBytes>>,
}

impl Metadata {
    #[inline]
    pub fn new(version: i16, topics: Option<Vec<StrBytes>>) -> Self {
        Self { version, topics }
    }

    /// Metadata of all topics in the cluster.
    #[inline]
    pub fn all_topics() -> Self {
        Self::new(1, None)
    }

    /// Topic list in wire form for given `version`.
    fn wire_topics(&self, version: i16) -> Option<Vec<Str>> {
        match &self.topics {
            Some(topics) => Some(topics.iter().map(Str::from).collect()),
            None if version == 0 => Some(Vec::new()),
            None => None,
        }
    }
}

impl Serialize for Metadata {
    fn encode_size(&self, version: i16) -> usize {
        Array(self.wire_topics(version).as_deref()).encode_size(version)
    }

    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        Array(self.wire_topics(version).as_deref())
            .encode(buf, version)
            .context("topics")
    }
}

impl Request for Metadata {
    const API_KEY: ApiKey = ApiKey::Metadata;
    const VERSIONS: RangeInclusive<i16> = 0..=1;

    type Response = response::Metadata;

    #[inline]
    fn api_version(&self) -> i16 {
        self.version
    }
}
