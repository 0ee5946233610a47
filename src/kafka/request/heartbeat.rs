use std::ops::RangeInclusive;

use anyhow::{Context as _, Result};
use bytes::BytesMut;

use crate::kafka::api::ApiKey;
use crate::kafka::request::Request;
use crate::kafka::types::{CompactStr, Str, StrBytes, TagBuffer};
use crate::kafka::{response, Serialize};

/// # Heartbeat Request
///
/// [Request schema][schema]
///
/// Version 1 and version 2 are the same as version 0.
///
/// Starting from version 3, we add a new field called groupInstanceId to indicate member identity
/// across restarts.
///
/// Version 4 is the first flexible version.
///
/// [schema]: https://github.com/apache/kafka/blob/trunk/clients/src/main/resources/common/message/HeartbeatRequest.json
#[derive(Clone, Debug)]
pub struct Heartbeat {
    version: i16,

    /// The group id. (API v0+)
    pub group_id: StrBytes,

    /// The generation of the group. (API v0+)
    pub generation_id: i32,

    /// The member ID. (API v0+)
    pub member_id: StrBytes,

    /// The unique identifier of the consumer instance provided by end user. (API v3+)
    pub group_instance_id: Option<StrBytes>,

    /// Other tagged fields. (API v4+)
    pub tagged_fields: TagBuffer,
}

impl Heartbeat {
    pub fn new(
        version: i16,
        group_id: impl Into<StrBytes>,
        generation_id: i32,
        member_id: impl Into<StrBytes>,
    ) -> Self {
        Self {
            version,
            group_id: group_id.into(),
            generation_id,
            member_id: member_id.into(),
            group_instance_id: None,
            tagged_fields: TagBuffer::default(),
        }
    }

    #[inline]
    pub fn with_group_instance_id(mut self, group_instance_id: impl Into<StrBytes>) -> Self {
        self.group_instance_id = Some(group_instance_id.into());
        self
    }

    #[inline]
    fn is_flexible(version: i16) -> bool {
        version >= 4
    }
}

impl Serialize for Heartbeat {
    fn encode_size(&self, version: i16) -> usize {
        if Self::is_flexible(version) {
            CompactStr::from(&self.group_id).encode_size(version)
                + 4
                + CompactStr::from(&self.member_id).encode_size(version)
                + self
                    .group_instance_id
                    .as_ref()
                    .map(CompactStr::from)
                    .encode_size(version)
                + self.tagged_fields.encode_size(version)
        } else {
            let mut size = Str::from(&self.group_id).encode_size(version)
                + 4
                + Str::from(&self.member_id).encode_size(version);

            if version >= 3 {
                size += self
                    .group_instance_id
                    .as_ref()
                    .map(Str::from)
                    .encode_size(version);
            }

            size
        }
    }

    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        if Self::is_flexible(version) {
            CompactStr::from(&self.group_id)
                .encode(buf, version)
                .context("group id")?;

            self.generation_id.encode(buf, version)?;

            CompactStr::from(&self.member_id)
                .encode(buf, version)
                .context("member id")?;

            self.group_instance_id
                .as_ref()
                .map(CompactStr::from)
                .encode(buf, version)
                .context("group instance id")?;

            self.tagged_fields
                .encode(buf, version)
                .context("tagged fields")
        } else {
            Str::from(&self.group_id)
                .encode(buf, version)
                .context("group id")?;

            self.generation_id.encode(buf, version)?;

            Str::from(&self.member_id)
                .encode(buf, version)
                .context("member id")?;

            if version >= 3 {
                self.group_instance_id
                    .as_ref()
                    .map(Str::from)
                    .encode(buf, version)
                    .context("group instance id")?;
            }

            Ok(())
        }
    }
}

impl Request for Heartbeat {
    const API_KEY: ApiKey = ApiKey::Heartbeat;
    const VERSIONS: RangeInclusive<i16> = 0..=4;

    type Response = response::Heartbeat;

    #[inline]
    fn api_version(&self) -> i16 {
        self.version
    }
}
