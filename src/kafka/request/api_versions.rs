use std::ops::RangeInclusive;

use anyhow::Result;
use bytes::BytesMut;

use crate::kafka::api::ApiKey;
use crate::kafka::request::Request;
use crate::kafka::{response, Serialize};

/// # ApiVersions Request
///
/// [Request schema][schema]
///
/// Versions 0 through 2 of ApiVersionsRequest are the same and carry no fields.
///
/// [schema]: https://github.com/apache/kafka/blob/trunk/clients/src/main/resources/common/message/ApiVersionsRequest.json
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ApiVersions {
    version: i16,
}

impl ApiVersions {
    #[inline]
    pub fn new(version: i16) -> Self {
        Self { version }
    }
}

impl Default for ApiVersions {
    #[inline]
    fn default() -> Self {
        Self::new(*<Self as Request>::VERSIONS.end())
    }
}

impl Serialize for ApiVersions {
    #[inline]
    fn encode_size(&self, _version: i16) -> usize {
        0
    }

    #[inline]
    fn encode(&self, _buf: &mut BytesMut, _version: i16) -> Result<()> {
        Ok(())
    }
}

impl Request for ApiVersions {
    const API_KEY: ApiKey = ApiKey::ApiVersions;
    const VERSIONS: RangeInclusive<i16> = 0..=2;

    type Response = response::ApiVersions;

    #[inline]
    fn api_version(&self) -> i16 {
        self.version
    }
}
