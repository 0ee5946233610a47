use anyhow::{Context as _, Result};
use bytes::Buf;

use crate::kafka::api::ApiKey;
use crate::kafka::error::ErrorCode;
use crate::kafka::response::Response;
use crate::kafka::types::TagBuffer;
use crate::kafka::Deserialize;

/// # Heartbeat Response
///
/// [Response schema][schema]
///
/// Version 1 adds throttle time.
///
/// Starting in version 2, on quota violation, brokers send out responses before throttling.
///
/// Version 4 is the first flexible version.
///
/// [schema]: https://github.com/apache/kafka/blob/trunk/clients/src/main/resources/common/message/HeartbeatResponse.json
#[derive(Debug, Default)]
pub struct Heartbeat {
    /// The duration in milliseconds for which the request was throttled due to a quota violation,
    /// or zero if the request did not violate any quota. (API v1+)
    pub throttle_time_ms: i32,

    /// The error code, or 0 if there was no error. (API v0+)
    pub error_code: ErrorCode,

    /// Other tagged fields. (API v4+)
    pub tagged_fields: TagBuffer,
}

impl Deserialize for Heartbeat {
    fn decode<B: Buf>(buf: &mut B, version: i16) -> Result<(Self, usize)> {
        let mut size = 0;

        let mut throttle_time_ms = 0;
        if version >= 1 {
            let (ms, n) = i32::decode(buf, version).context("throttle time ms")?;
            throttle_time_ms = ms;
            size += n;
        }

        let (error_code, n) = ErrorCode::decode(buf, version).context("error code")?;
        size += n;

        let mut tagged_fields = TagBuffer::default();
        if version >= 4 {
            let (fields, n) = TagBuffer::decode(buf, version).context("tagged fields")?;
            tagged_fields = fields;
            size += n;
        }

        let body = Self {
            throttle_time_ms,
            error_code,
            tagged_fields,
        };

        Ok((body, size))
    }
}

impl Response for Heartbeat {
    const API_KEY: ApiKey = ApiKey::Heartbeat;

    #[inline]
    fn tagged_fields(&self) -> Option<&TagBuffer> {
        Some(&self.tagged_fields)
    }
}
