use anyhow::{Context as _, Result};
use bytes::Buf;

use crate::kafka::api::ApiKey;
use crate::kafka::error::ErrorCode;
use crate::kafka::response::Response;
use crate::kafka::types::{Array, Str, StrBytes};
use crate::kafka::Deserialize;

/// # Produce Response
///
/// [Response schema][schema]
///
/// Version 2 added the log append time.
///
/// Version 5 added LogStartOffset to filter out spurious OutOfOrderSequenceExceptions on the
/// client.
///
/// Version 8 added RecordErrors and ErrorMessage to include information about records that cause
/// the whole batch to be dropped.
///
/// [schema]: https://github.com/apache/kafka/blob/trunk/clients/src/main/resources/common/message/ProduceResponse.json
#[derive(Debug, Default)]
pub struct Produce {
    /// Each produce response. (API v0+)
    pub responses: Vec<TopicProduceResponse>,

    /// The duration in milliseconds for which the request was throttled due to a quota violation,
    /// or zero if the request did not violate any quota. (API v1+)
    pub throttle_time_ms: i32,
}

impl Deserialize for Produce {
    fn decode<B: Buf>(buf: &mut B, version: i16) -> Result<(Self, usize)> {
        let (Array(responses), mut size) =
            Deserialize::decode(buf, version).context("responses")?;

        let (throttle_time_ms, n) = i32::decode(buf, version).context("throttle time ms")?;
        size += n;

        let body = Self {
            responses,
            throttle_time_ms,
        };

        Ok((body, size))
    }
}

impl Response for Produce {
    const API_KEY: ApiKey = ApiKey::Produce;
}

#[derive(Debug)]
pub struct TopicProduceResponse {
    /// The topic name. (API v0+)
    pub name: StrBytes,
    /// Each partition that we produced to within the topic. (API v0+)
    pub partition_responses: Vec<PartitionProduceResponse>,
}

impl Deserialize for TopicProduceResponse {
    fn decode<B: Buf>(buf: &mut B, version: i16) -> Result<(Self, usize)> {
        let (Str(name), mut size) = Str::decode(buf, version).context("topic name")?;

        let (Array(partition_responses), n) = Deserialize::decode(buf, version)
            .with_context(|| format!("topic {name} partition responses"))?;
        size += n;

        Ok((
            Self {
                name,
                partition_responses,
            },
            size,
        ))
    }
}

#[derive(Debug)]
pub struct PartitionProduceResponse {
    /// The partition index. (API v0+)
    pub index: i32,
    /// The error code, or 0 if there was no error. (API v0+)
    pub error_code: ErrorCode,
    /// The base offset. (API v0+)
    pub base_offset: i64,
    /// The timestamp returned by broker after appending the messages, or -1 if CreateTime is
    /// used for the topic. (API v2+)
    pub log_append_time_ms: i64,
    /// The log start offset. (API v5+)
    pub log_start_offset: i64,
    /// The batch indices of records that caused the batch to be dropped. (API v8+)
    pub record_errors: Vec<BatchIndexAndErrorMessage>,
    /// The global error message summarizing the common root cause of the records that caused
    /// the batch to be dropped. (API v8+)
    pub error_message: Option<StrBytes>,
}

impl Deserialize for PartitionProduceResponse {
    fn decode<B: Buf>(buf: &mut B, version: i16) -> Result<(Self, usize)> {
        let (index, mut size) = i32::decode(buf, version).context("partition index")?;

        let (error_code, n) = ErrorCode::decode(buf, version).context("error code")?;
        size += n;

        let (base_offset, n) = i64::decode(buf, version).context("base offset")?;
        size += n;

        let mut log_append_time_ms = -1;
        if version >= 2 {
            let (ms, n) = i64::decode(buf, version).context("log append time ms")?;
            log_append_time_ms = ms;
            size += n;
        }

        let mut log_start_offset = -1;
        if version >= 5 {
            let (offset, n) = i64::decode(buf, version).context("log start offset")?;
            log_start_offset = offset;
            size += n;
        }

        let mut record_errors = Vec::new();
        let mut error_message = None;
        if version >= 8 {
            let (Array(errors), n) = Deserialize::decode(buf, version).context("record errors")?;
            record_errors = errors;
            size += n;

            let (message, n) = Option::<Str>::decode(buf, version).context("error message")?;
            error_message = message.map(|Str(message)| message);
            size += n;
        }

        let partition = Self {
            index,
            error_code,
            base_offset,
            log_append_time_ms,
            log_start_offset,
            record_errors,
            error_message,
        };

        Ok((partition, size))
    }
}

#[derive(Debug)]
pub struct BatchIndexAndErrorMessage {
    /// The batch index of the record that caused the batch to be dropped. (API v8+)
    pub batch_index: i32,
    /// The error message of the record that caused the batch to be dropped. (API v8+)
    pub batch_index_error_message: Option<StrBytes>,
}

impl Deserialize for BatchIndexAndErrorMessage {
    fn decode<B: Buf>(buf: &mut B, version: i16) -> Result<(Self, usize)> {
        let (batch_index, mut size) = i32::decode(buf, version).context("batch index")?;

        let (message, n) = Option::<Str>::decode(buf, version).context("batch index error")?;
        size += n;

        Ok((
            Self {
                batch_index,
                batch_index_error_message: message.map(|Str(message)| message),
            },
            size,
        ))
    }
}
