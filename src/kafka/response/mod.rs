use anyhow::{Context as _, Result};
use bytes::Buf;

use crate::kafka::api::ApiKey;
use crate::kafka::types::TagBuffer;
use crate::kafka::Deserialize;

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

/// A response body that can be routed back to the caller of a matching
/// [`Request`](crate::kafka::Request).
pub trait Response:
    Deserialize + Default + Into<ResponseBody> + TryFrom<ResponseBody, Error = ResponseBody>
{
    const API_KEY: ApiKey;

    /// Unknown tagged fields of a flexible response body.
    #[inline]
    fn tagged_fields(&self) -> Option<&TagBuffer> {
        None
    }
}

/// Decodes a response payload of a particular API given its API version.
pub type Decoder = fn(&mut &[u8], i16) -> Result<ResponseBody>;

/// [`Decoder`] for responses of type `R`.
pub fn decode_response<R: Response>(buf: &mut &[u8], version: i16) -> Result<ResponseBody> {
    let (body, _) = R::decode(buf, version)
        .with_context(|| format!("{:?} v{version} response body", R::API_KEY))?;
    Ok(body.into())
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseHeader {
    /// An integer that uniquely identifies the request (API v0+)
    pub correlation_id: i32,
    /// Other tagged fields (API v1+)
    pub tagged_fields: TagBuffer,
}

impl ResponseHeader {
    /// Size of the smallest (v0) header.
    pub const SIZE: usize = 4;
}

/// Decoded with the header `version`, not the API version.
impl Deserialize for ResponseHeader {
    fn decode<B: Buf>(buf: &mut B, version: i16) -> Result<(Self, usize)> {
        let (correlation_id, mut size) = i32::decode(buf, version).context("correlation id")?;

        let mut tagged_fields = TagBuffer::default();

        if version >= 1 {
            let (fields, n) = TagBuffer::decode(buf, version).context("tagged fields")?;
            tagged_fields = fields;
            size += n;
        }

        let header = Self {
            correlation_id,
            tagged_fields,
        };

        Ok((header, size))
    }
}

/// Complete response: header and body of a single frame.
#[derive(Debug)]
pub struct ResponseMessage {
    pub header: ResponseHeader,
    pub body: ResponseBody,
}

macro_rules! response_body {
    ($($variant:ident($ty:ty),)*) => {
        /// Closed set of response bodies this client can decode.
        #[derive(Debug)]
        pub enum ResponseBody {
            $($variant($ty),)*
        }

        impl ResponseBody {
            #[inline]
            pub fn api_key(&self) -> ApiKey {
                match self {
                    $(Self::$variant(_) => <$ty as Response>::API_KEY,)*
                }
            }
        }

        $(
            impl From<$ty> for ResponseBody {
                #[inline]
                fn from(body: $ty) -> Self {
                    Self::$variant(body)
                }
            }

            impl TryFrom<ResponseBody> for $ty {
                type Error = ResponseBody;

                #[inline]
                fn try_from(body: ResponseBody) -> Result<Self, ResponseBody> {
                    match body {
                        ResponseBody::$variant(body) => Ok(body),
                        other => Err(other),
                    }
                }
            }
        )*
    };
}

response_body! {
    ApiVersions(ApiVersions),
    Metadata(Metadata),
    Heartbeat(Heartbeat),
    Produce(Produce),
    Fetch(Fetch),
}
