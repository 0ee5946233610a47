use anyhow::{Context as _, Result};
use bytes::Buf;

use crate::kafka::api::ApiKey;
use crate::kafka::error::ErrorCode;
use crate::kafka::response::Response;
use crate::kafka::types::Array;
use crate::kafka::Deserialize;

/// # ApiVersions Response
///
/// [Response schema][schema]
///
/// Version 1 adds throttle time to the response.
///
/// Starting in version 2, on quota violation, brokers send out responses before throttling.
///
/// Starting from Apache Kafka 2.4 (KIP-511), ApiKeys field is populated with the supported
/// versions of the ApiVersionsRequest when an UNSUPPORTED_VERSION error is returned.
///
/// [schema]: https://github.com/apache/kafka/blob/trunk/clients/src/main/resources/common/message/ApiVersionsResponse.json
#[derive(Debug, Default)]
pub struct ApiVersions {
    /// The top-level error code. (API v0+)
    pub error_code: ErrorCode,

    /// The APIs supported by the broker. (API v0+)
    pub api_keys: Vec<ApiVersion>,

    /// The duration in milliseconds for which the request was throttled due to a quota violation,
    /// or zero if the request did not violate any quota. (API v1+)
    pub throttle_time_ms: i32,
}

impl ApiVersions {
    /// Supported version range of given API, if the broker listed it.
    pub fn versions_of(&self, api_key: ApiKey) -> Option<(i16, i16)> {
        self.api_keys
            .iter()
            .find(|api| api.api_key == api_key as i16)
            .map(|api| (api.min_version, api.max_version))
    }
}

impl Deserialize for ApiVersions {
    fn decode<B: Buf>(buf: &mut B, version: i16) -> Result<(Self, usize)> {
        let (error_code, mut size) = ErrorCode::decode(buf, version).context("error code")?;

        let (Array(api_keys), n) = Deserialize::decode(buf, version).context("API keys")?;
        size += n;

        let mut throttle_time_ms = 0;
        if version >= 1 {
            let (ms, n) = i32::decode(buf, version).context("throttle time ms")?;
            throttle_time_ms = ms;
            size += n;
        }

        let body = Self {
            error_code,
            api_keys,
            throttle_time_ms,
        };

        Ok((body, size))
    }
}

impl Response for ApiVersions {
    const API_KEY: ApiKey = ApiKey::ApiVersions;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiVersion {
    /// The API index, kept raw so that APIs unknown to this client are still listed. (API v0+)
    pub api_key: i16,
    /// The minimum supported version, inclusive. (API v0+)
    pub min_version: i16,
    /// The maximum supported version, inclusive. (API v0+)
    pub max_version: i16,
}

impl Deserialize for ApiVersion {
    fn decode<B: Buf>(buf: &mut B, version: i16) -> Result<(Self, usize)> {
        let (api_key, _) = i16::decode(buf, version).context("api key")?;
        let (min_version, _) = i16::decode(buf, version).context("min version")?;
        let (max_version, _) = i16::decode(buf, version).context("max version")?;

        let api = Self {
            api_key,
            min_version,
            max_version,
        };

        Ok((api, 6))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_v2() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"\x00\x00"); // error_code
        buf.extend_from_slice(b"\x00\x00\x00\x02"); // api_keys length
        buf.extend_from_slice(b"\x00\x12\x00\x00\x00\x04"); // ApiVersions 0-4
        buf.extend_from_slice(b"\x00\x4b\x00\x00\x00\x00"); // DescribeTopicPartitions 0-0
        buf.extend_from_slice(b"\x00\x00\x00\x0a"); // throttle_time_ms

        let mut input = &buf[..];
        let (body, n) = ApiVersions::decode(&mut input, 2).expect("valid response");

        assert_eq!(n, buf.len());
        assert!(input.is_empty());
        assert_eq!(body.error_code, ErrorCode::NONE);
        assert_eq!(body.throttle_time_ms, 10);
        assert_eq!(body.versions_of(ApiKey::ApiVersions), Some((0, 4)));
        assert_eq!(body.api_keys[1].api_key, 75);
        assert_eq!(body.versions_of(ApiKey::Fetch), None);
    }

    #[test]
    fn v0_has_no_throttle_time() {
        let buf = b"\x00\x23\x00\x00\x00\x00";
        let mut input = &buf[..];
        let (body, n) = ApiVersions::decode(&mut input, 0).expect("valid response");

        assert_eq!(n, buf.len());
        assert_eq!(body.error_code, ErrorCode::UNSUPPORTED_VERSION);
        assert!(body.api_keys.is_empty());
    }
}
