use anyhow::Result;
use bytes::BytesMut;

use crate::kafka::{HeaderVersion, Serialize};

#[derive(Debug, thiserror::Error)]
#[error("unknown API key: {0}")]
pub struct UnknownApiKey(pub i16);

macro_rules! api_keys {
    (
        $vis:vis enum $name:ident {
            $($v:ident = $i:literal => $flexible:expr,)*
        }
    ) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[repr(i16)]
        $vis enum $name {
            $($v = $i,)*
        }

        impl $name {
            /// First API version that uses flexible (compact + tagged field) encoding.
            #[inline]
            pub fn first_flexible_version(self) -> Option<i16> {
                match self {
                    $(Self::$v => $flexible,)*
                }
            }
        }

        impl TryFrom<i16> for $name {
            type Error = UnknownApiKey;

            fn try_from(value: i16) -> Result<Self, Self::Error> {
                match value {
                    $($i => Ok(Self::$v),)*
                    _ => Err(UnknownApiKey(value)),
                }
            }
        }
    };
}

api_keys! {
    pub enum ApiKey {
        Produce = 0 => Some(9),
        Fetch = 1 => Some(12),
        ListOffsets = 2 => Some(6),
        Metadata = 3 => Some(9),
        OffsetCommit = 8 => Some(8),
        OffsetFetch = 9 => Some(6),
        FindCoordinator = 10 => Some(3),
        JoinGroup = 11 => Some(6),
        Heartbeat = 12 => Some(4),
        LeaveGroup = 13 => Some(4),
        SyncGroup = 14 => Some(4),
        DescribeGroups = 15 => Some(5),
        ListGroups = 16 => Some(3),
        SaslHandshake = 17 => None,
        ApiVersions = 18 => Some(3),
        CreateTopics = 19 => Some(5),
        DeleteTopics = 20 => Some(4),
        InitProducerId = 22 => Some(2),
        SaslAuthenticate = 36 => Some(2),
    }
}

impl ApiKey {
    #[inline]
    pub fn is_flexible(self, api_version: i16) -> bool {
        self.first_flexible_version()
            .is_some_and(|flexible| api_version >= flexible)
    }

    /// Response header version matching given request `api_version`.
    pub fn response_header_version(self, api_version: i16) -> i16 {
        match self {
            // NOTE: ApiVersions responses always use header v0 so that clients can parse them
            // before knowing which versions the broker supports
            Self::ApiVersions => 0,
            _ if self.is_flexible(api_version) => 1,
            _ => 0,
        }
    }
}

/// Request header version matching given request `api_version`.
impl HeaderVersion for ApiKey {
    fn header_version(&self, api_version: i16) -> i16 {
        if self.is_flexible(api_version) {
            2
        } else {
            1
        }
    }
}

impl Serialize for ApiKey {
    // INT16 repr
    const SIZE: usize = 2;

    #[inline]
    fn encode_size(&self, _version: i16) -> usize {
        Self::SIZE
    }

    #[inline]
    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        (*self as i16).encode(buf, version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_versions() {
        assert_eq!(ApiKey::ApiVersions.header_version(2), 1);
        assert_eq!(ApiKey::ApiVersions.header_version(3), 2);
        assert_eq!(ApiKey::ApiVersions.response_header_version(3), 0);

        assert_eq!(ApiKey::Heartbeat.header_version(3), 1);
        assert_eq!(ApiKey::Heartbeat.header_version(4), 2);
        assert_eq!(ApiKey::Heartbeat.response_header_version(3), 0);
        assert_eq!(ApiKey::Heartbeat.response_header_version(4), 1);

        assert_eq!(ApiKey::Produce.response_header_version(8), 0);
        assert_eq!(ApiKey::Fetch.response_header_version(12), 1);
        assert_eq!(ApiKey::SaslHandshake.header_version(1), 1);
    }

    #[test]
    fn api_key_from_repr() {
        assert_eq!(ApiKey::try_from(18).ok(), Some(ApiKey::ApiVersions));
        assert!(ApiKey::try_from(-1).is_err());
        assert!(ApiKey::try_from(1000).is_err());
    }
}
