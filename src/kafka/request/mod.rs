use std::ops::RangeInclusive;

use anyhow::{ensure, Context as _, Result};
use bytes::{BufMut as _, BytesMut};

use crate::kafka::api::ApiKey;
use crate::kafka::response::Response;
use crate::kafka::types::{Str, StrBytes, TagBuffer};
use crate::kafka::{HeaderVersion, Serialize};

pub use api_versions::ApiVersions;
pub use fetch::Fetch;
pub use heartbeat::Heartbeat;
pub use metadata::Metadata;
pub use produce::Produce;

pub mod api_versions;
pub mod fetch;
pub mod heartbeat;
pub mod metadata;
pub mod produce;

/// A request body that can be sent over a [`Connection`](crate::Connection).
pub trait Request: Serialize {
    const API_KEY: ApiKey;

    /// API versions this type knows how to encode.
    const VERSIONS: RangeInclusive<i16>;

    /// Response body the broker answers this request with.
    type Response: Response;

    /// The API version this request is encoded with.
    fn api_version(&self) -> i16;

    /// Whether the broker answers this request at all.
    #[inline]
    fn expects_response(&self) -> bool {
        true
    }
}

#[derive(Clone, Debug)]
pub struct RequestHeader {
    /// An integer identifying the request type. (API v0+)
    pub request_api_key: ApiKey,

    /// The version of the API to use for the request. (API v0+)
    pub request_api_version: i16,

    /// A unique identifier for the request. (API v0+)
    pub correlation_id: i32,

    /// A string identifying the client that sent the request. (API v1+)
    pub client_id: Option<StrBytes>,

    /// Optional tagged fields. (API v2+)
    pub tagged_fields: TagBuffer,
}

impl RequestHeader {
    #[inline]
    pub fn new(
        request_api_key: ApiKey,
        request_api_version: i16,
        correlation_id: i32,
        client_id: Option<StrBytes>,
    ) -> Self {
        Self {
            request_api_key,
            request_api_version,
            correlation_id,
            client_id,
            tagged_fields: TagBuffer::default(),
        }
    }

    #[inline]
    pub fn header_version(&self) -> i16 {
        self.request_api_key
            .header_version(self.request_api_version)
    }

    #[inline]
    fn client_id(&self) -> Option<Str> {
        self.client_id.as_ref().map(Str::from)
    }
}

/// Encoded with the header `version`, not the API version.
impl Serialize for RequestHeader {
    const SIZE: usize = 2 + 2 + 4;

    fn encode_size(&self, version: i16) -> usize {
        let mut size = Self::SIZE;

        if version >= 1 {
            size += self.client_id().encode_size(version);
        }

        if version >= 2 {
            size += self.tagged_fields.encode_size(version);
        }

        size
    }

    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        self.request_api_key.encode(buf, version)?;
        buf.put_i16(self.request_api_version);
        buf.put_i32(self.correlation_id);

        // NOTE: client id stays a legacy NULLABLE_STRING even in flexible headers
        if version >= 1 {
            self.client_id().encode(buf, version).context("client id")?;
        }

        if version >= 2 {
            self.tagged_fields
                .encode(buf, version)
                .context("tagged fields")?;
        }

        Ok(())
    }
}

/// Complete request envelope: header and body of a single frame.
#[derive(Debug)]
pub struct RequestMessage<'a, R> {
    pub header: RequestHeader,
    pub body: &'a R,
}

impl<R: Request> RequestMessage<'_, R> {
    /// Size of the frame without the INT32 size prefix.
    pub fn size(&self) -> usize {
        self.header.encode_size(self.header.header_version())
            + self.body.encode_size(self.header.request_api_version)
    }

    /// Append the size-prefixed frame to `buf`.
    ///
    /// On error `buf` is left with its original contents.
    pub fn encode_frame(&self, buf: &mut BytesMut) -> Result<()> {
        let api_key = self.header.request_api_key;
        let api_version = self.header.request_api_version;

        ensure!(
            R::VERSIONS.contains(&api_version),
            "{api_key:?} v{api_version} is not supported (versions {:?})",
            R::VERSIONS,
        );

        let start = buf.len();
        buf.reserve(4 + self.size());

        let result = self.encode_parts(buf);

        if result.is_err() {
            buf.truncate(start);
        }

        result.with_context(|| format!("{api_key:?} v{api_version} request"))
    }

    fn encode_parts(&self, buf: &mut BytesMut) -> Result<()> {
        let start = buf.len();
        buf.put_i32(0); // size, patched below

        self.header
            .encode(buf, self.header.header_version())
            .context("message header")?;

        self.body
            .encode(buf, self.header.request_api_version)
            .context("message body")?;

        let size = i32::try_from(buf.len() - start - 4).context("frame size exceeds INT32")?;
        buf[start..start + 4].copy_from_slice(&size.to_be_bytes());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_versions_v0_envelope() {
        let header = RequestHeader::new(ApiKey::ApiVersions, 0, 7, Some(StrBytes::from("c")));
        let body = ApiVersions::new(0);
        let msg = RequestMessage {
            header,
            body: &body,
        };

        let mut buf = BytesMut::new();
        msg.encode_frame(&mut buf).expect("encode frame");

        assert_eq!(
            &buf[..],
            b"\x00\x00\x00\x0b\x00\x12\x00\x00\x00\x00\x00\x07\x00\x01\x63"
        );
        assert_eq!(buf.len(), 4 + msg.size());
    }

    #[test]
    fn flexible_header_has_tag_buffer() {
        let header = RequestHeader::new(ApiKey::Heartbeat, 4, 1, None);
        assert_eq!(header.header_version(), 2);

        let mut buf = BytesMut::new();
        header.encode(&mut buf, 2).expect("encode header");

        assert_eq!(
            &buf[..],
            &[0x00, 0x0c, 0x00, 0x04, 0x00, 0x00, 0x00, 0x01, 0xff, 0xff, 0x00]
        );
        assert_eq!(buf.len(), header.encode_size(2));
    }

    #[test]
    fn unsupported_version_leaves_buffer_untouched() {
        let header = RequestHeader::new(ApiKey::ApiVersions, 3, 1, None);
        let body = ApiVersions::new(3);

        let mut buf = BytesMut::from(&b"prefix"[..]);
        let msg = RequestMessage {
            header,
            body: &body,
        };

        assert!(msg.encode_frame(&mut buf).is_err());
        assert_eq!(&buf[..], b"prefix");
    }

    #[test]
    fn oversized_client_id_fails_encoding() {
        let client_id = StrBytes::from("c".repeat(i16::MAX as usize + 1));
        let header = RequestHeader::new(ApiKey::ApiVersions, 0, 1, Some(client_id));
        let body = ApiVersions::new(0);

        let mut buf = BytesMut::new();
        let msg = RequestMessage {
            header,
            body: &body,
        };

        assert!(msg.encode_frame(&mut buf).is_err());
        assert!(buf.is_empty());
    }
}
