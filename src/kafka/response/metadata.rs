use anyhow::{Context as _, Result};
use bytes::Buf;

use crate::kafka::api::ApiKey;
use crate::kafka::error::ErrorCode;
use crate::kafka::response::Response;
use crate::kafka::types::{Array, Str, StrBytes};
use crate::kafka::Deserialize;

/// # Metadata Response
///
/// [Response schema][schema]
///
/// Version 1 adds fields for the rack of each broker, the controller id, and whether or not the
/// topic is internal.
///
/// [schema]: https://github.com/apache/kafka/blob/trunk/clients/src/main/resources/common/message/MetadataResponse.json
#[derive(Debug, Default)]
pub struct Metadata {
    /// A list of brokers present in the cluster. (API v0+)
    pub brokers: Vec<Broker>,

    /// The ID of the controller broker. (API v1+)
    pub controller_id: i32,

    /// Each topic in the response. (API v0+)
    pub topics: Vec<Topic>,
}

impl Metadata {
    #[inline]
    pub fn broker(&self, node_id: i32) -> Option<&Broker> {
        self.brokers.iter().find(|b| b.node_id == node_id)
    }

    #[inline]
    pub fn topic(&self, name: &str) -> Option<&Topic> {
        self.topics.iter().find(|t| t.name == name)
    }
}

impl Deserialize for Metadata {
    fn decode<B: Buf>(buf: &mut B, version: i16) -> Result<(Self, usize)> {
        let (Array(brokers), mut size) = Deserialize::decode(buf, version).context("brokers")?;

        let mut controller_id = -1;
        if version >= 1 {
            let (id, n) = i32::decode(buf, version).context("controller id")?;
            controller_id = id;
            size += n;
        }

        let (Array(topics), n) = Deserialize::decode(buf, version).context("topics")?;
        size += n;

        let body = Self {
            brokers,
            controller_id,
            topics,
        };

        Ok((body, size))
    }
}

impl Response for Metadata {
    const API_KEY: ApiKey = ApiKey::Metadata;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Broker {
    /// The broker ID. (API v0+)
    pub node_id: i32,
    /// The broker hostname. (API v0+)
    pub host: StrBytes,
    /// The broker port. (API v0+)
    pub port: i32,
    /// The rack of the broker, or null if it has not been assigned to a rack. (API v1+)
    pub rack: Option<StrBytes>,
}

impl Deserialize for Broker {
    fn decode<B: Buf>(buf: &mut B, version: i16) -> Result<(Self, usize)> {
        let (node_id, mut size) = i32::decode(buf, version).context("node id")?;

        let (Str(host), n) = Str::decode(buf, version).context("host")?;
        size += n;

        let (port, n) = i32::decode(buf, version).context("port")?;
        size += n;

        let mut rack = None;
        if version >= 1 {
            let (r, n) = Option::<Str>::decode(buf, version).context("rack")?;
            rack = r.map(|Str(rack)| rack);
            size += n;
        }

        let broker = Self {
            node_id,
            host,
            port,
            rack,
        };

        Ok((broker, size))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topic {
    /// The topic error, or 0 if there was no error. (API v0+)
    pub error_code: ErrorCode,
    /// The topic name. (API v0+)
    pub name: StrBytes,
    /// True if the topic is internal. (API v1+)
    pub is_internal: bool,
    /// Each partition in the topic. (API v0+)
    pub partitions: Vec<Partition>,
}

impl Deserialize for Topic {
    fn decode<B: Buf>(buf: &mut B, version: i16) -> Result<(Self, usize)> {
        let (error_code, mut size) = ErrorCode::decode(buf, version).context("error code")?;

        let (Str(name), n) = Str::decode(buf, version).context("name")?;
        size += n;

        let mut is_internal = false;
        if version >= 1 {
            let (internal, n) = bool::decode(buf, version).context("is internal")?;
            is_internal = internal;
            size += n;
        }

        let (Array(partitions), n) = Deserialize::decode(buf, version)
            .with_context(|| format!("topic {name} partitions"))?;
        size += n;

        let topic = Self {
            error_code,
            name,
            is_internal,
            partitions,
        };

        Ok((topic, size))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    /// The partition error, or 0 if there was no error. (API v0+)
    pub error_code: ErrorCode,
    /// The partition index. (API v0+)
    pub partition_index: i32,
    /// The ID of the leader broker. (API v0+)
    pub leader_id: i32,
    /// The set of all nodes that host this partition. (API v0+)
    pub replica_nodes: Vec<i32>,
    /// The set of nodes that are in sync with the leader for this partition. (API v0+)
    pub isr_nodes: Vec<i32>,
}

impl Deserialize for Partition {
    fn decode<B: Buf>(buf: &mut B, version: i16) -> Result<(Self, usize)> {
        let (error_code, mut size) = ErrorCode::decode(buf, version).context("error code")?;

        let (partition_index, n) = i32::decode(buf, version).context("partition index")?;
        size += n;

        let (leader_id, n) = i32::decode(buf, version).context("leader id")?;
        size += n;

        let (Array(replica_nodes), n) =
            Deserialize::decode(buf, version).context("replica nodes")?;
        size += n;

        let (Array(isr_nodes), n) = Deserialize::decode(buf, version).context("ISR nodes")?;
        size += n;

        let partition = Self {
            error_code,
            partition_index,
            leader_id,
            replica_nodes,
            isr_nodes,
        };

        Ok((partition, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_v1() {
        let mut buf = Vec::new();

        buf.extend_from_slice(b"\x00\x00\x00\x01"); // brokers length
        buf.extend_from_slice(b"\x00\x00\x00\x01"); // node_id
        buf.extend_from_slice(b"\x00\x09localhost"); // host
        buf.extend_from_slice(b"\x00\x00\x23\x84"); // port
        buf.extend_from_slice(b"\xff\xff"); // rack
        buf.extend_from_slice(b"\x00\x00\x00\x01"); // controller_id
        buf.extend_from_slice(b"\x00\x00\x00\x01"); // topics length
        buf.extend_from_slice(b"\x00\x00"); // error_code
        buf.extend_from_slice(b"\x00\x03foo"); // name
        buf.extend_from_slice(b"\x00"); // is_internal
        buf.extend_from_slice(b"\x00\x00\x00\x01"); // partitions length
        buf.extend_from_slice(b"\x00\x00"); // error_code
        buf.extend_from_slice(b"\x00\x00\x00\x00"); // partition_index
        buf.extend_from_slice(b"\x00\x00\x00\x01"); // leader_id
        buf.extend_from_slice(b"\x00\x00\x00\x01\x00\x00\x00\x01"); // replica_nodes
        buf.extend_from_slice(b"\x00\x00\x00\x01\x00\x00\x00\x01"); // isr_nodes

        let mut input = &buf[..];
        let (body, n) = Metadata::decode(&mut input, 1).expect("valid response");

        assert_eq!(n, buf.len());
        assert!(input.is_empty());
        assert_eq!(body.controller_id, 1);

        let broker = body.broker(1).expect("broker 1");
        assert_eq!(broker.host, "localhost");
        assert_eq!(broker.port, 9092);
        assert_eq!(broker.rack, None);

        let topic = body.topic("foo").expect("topic foo");
        assert!(!topic.is_internal);
        assert_eq!(topic.partitions[0].leader_id, 1);
        assert_eq!(topic.partitions[0].isr_nodes, vec![1]);
    }

    #[test]
    fn truncated_partition_fails() {
        let buf = b"\x00\x00\x00\x00\x00\x00\x00\x01\x00\x00\x00\x03foo\x00\x00\x00\x01\x00";
        let mut input = &buf[..];
        assert!(Metadata::decode(&mut input, 0).is_err());
    }
}
