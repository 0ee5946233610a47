use anyhow::{bail, Context as _, Result};
use bytes::{Buf, BufMut as _, Bytes, BytesMut};
use tracing::debug;

use crate::kafka::error::{BatchError, DecodeError};
use crate::kafka::types::{ensure_remaining, nullable_len, Array, StrBytes, VarInt, VarLong};
use crate::kafka::{Deserialize, Serialize};

/// Current record batch format version.
pub const MAGIC: i8 = 2;

/// Fields between `batch_length` and the CRC-covered part of the batch.
const BATCH_LENGTH_OVERHEAD: usize = 4 + 1 + 4;

/// Fields preceding the CRC-covered part (`base_offset` through `crc`).
const BATCH_PREFIX_SIZE: usize = 8 + 4 + BATCH_LENGTH_OVERHEAD;

/// CRC-covered fields before the records (`attributes` through the records count).
const BATCH_HEADER_SIZE: usize = 2 + 4 + 8 + 8 + 8 + 2 + 4 + 4;

/// Whether to verify the CRC-32C checksum when decoding a [`RecordBatch`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CrcCheck {
    #[default]
    Verify,
    /// Accept a batch regardless of its stored checksum. Meant for compatibility testing only.
    Skip,
}

/// See official docs for [Record Batch](https://kafka.apache.org/documentation/#recordbatch).
///
/// `batch_length` and `crc` are not stored. Both are derived from the other fields whenever the
/// batch is encoded, so a decoded and re-encoded batch is byte-identical to the input.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordBatch {
    pub base_offset: i64,
    pub partition_leader_epoch: i32,
    pub attributes: RecordBatchAttrs,
    pub last_offset_delta: i32,
    pub base_timestamp: i64,
    pub max_timestamp: i64,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub base_sequence: i32,

    pub records: Vec<Record>,
}

impl Default for RecordBatch {
    fn default() -> Self {
        Self {
            base_offset: 0,
            partition_leader_epoch: -1,
            attributes: RecordBatchAttrs::default(),
            last_offset_delta: 0,
            base_timestamp: 0,
            max_timestamp: 0,
            producer_id: -1,
            producer_epoch: -1,
            base_sequence: -1,
            records: Vec::new(),
        }
    }
}

impl RecordBatch {
    /// Create an idempotence-free batch of `records` with offset and timestamp bounds derived
    /// from the records' deltas.
    pub fn new(base_timestamp: i64, records: Vec<Record>) -> Self {
        let last_offset_delta = records.iter().map(|r| r.offset_delta).max().unwrap_or(0);
        let max_timestamp_delta = records.iter().map(|r| r.timestamp_delta).max().unwrap_or(0);

        Self {
            last_offset_delta,
            base_timestamp,
            max_timestamp: base_timestamp + max_timestamp_delta,
            records,
            ..Self::default()
        }
    }

    /// Value of the `batch_length` field: size of the batch after that field.
    #[inline]
    pub fn batch_length(&self) -> usize {
        BATCH_LENGTH_OVERHEAD + BATCH_HEADER_SIZE + self.records_size()
    }

    #[inline]
    pub fn last_offset(&self) -> i64 {
        self.base_offset + i64::from(self.last_offset_delta)
    }

    #[inline]
    pub fn contains(&self, offset: i64) -> bool {
        (self.base_offset..=self.last_offset()).contains(&offset)
    }

    fn records_size(&self) -> usize {
        self.records.iter().map(|r| r.encode_size(MAGIC.into())).sum()
    }

    /// Decode a batch, verifying its checksum according to `crc`.
    ///
    /// The whole batch is delimited by `batch_length` before any of its content is interpreted,
    /// so on error `buf` is still positioned at a batch boundary unless the length itself was
    /// invalid.
    pub fn decode_with<B: Buf>(buf: &mut B, crc: CrcCheck) -> Result<(Self, usize)> {
        let version = MAGIC.into();

        let (base_offset, _) = i64::decode(buf, version).context("base_offset")?;

        let (batch_length, _) = i32::decode(buf, version).context("batch_length")?;
        let length = usize::try_from(batch_length)
            .ok()
            .filter(|&len| len >= BATCH_LENGTH_OVERHEAD + BATCH_HEADER_SIZE)
            .ok_or(DecodeError::InvalidLength(batch_length.into()))?;

        ensure_remaining(buf, length).context("record batch")?;
        let mut batch = buf.copy_to_bytes(length);

        let partition_leader_epoch = batch.get_i32();

        let magic = batch.get_i8();
        if magic != MAGIC {
            bail!(BatchError::UnsupportedMagic(magic));
        }

        let stored = batch.get_u32();

        if crc == CrcCheck::Verify {
            let computed = crc32c::crc32c(&batch);
            if computed != stored {
                bail!(BatchError::CrcMismatch { stored, computed });
            }
        }

        let attributes = batch.get_i16();
        let attributes = RecordBatchAttrs::try_from(attributes)?;

        // TODO: decompress the records (based on `attributes.compression`)
        if attributes.compression != Compression::None {
            bail!(BatchError::UnsupportedCompression(attributes.compression));
        }

        let last_offset_delta = batch.get_i32();
        let base_timestamp = batch.get_i64();
        let max_timestamp = batch.get_i64();
        let producer_id = batch.get_i64();
        let producer_epoch = batch.get_i16();
        let base_sequence = batch.get_i32();

        let (Array(records), _) =
            Array::<Vec<Record>>::decode(&mut batch, version).context("records")?;

        if batch.has_remaining() {
            bail!(DecodeError::Leftover(batch.remaining()));
        }

        let batch = Self {
            base_offset,
            partition_leader_epoch,
            attributes,
            last_offset_delta,
            base_timestamp,
            max_timestamp,
            producer_id,
            producer_epoch,
            base_sequence,
            records,
        };

        Ok((batch, 8 + 4 + length))
    }
}

impl Serialize for RecordBatch {
    #[inline]
    fn encode_size(&self, _version: i16) -> usize {
        8 + 4 + self.batch_length()
    }

    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        let start = buf.len();

        buf.put_i64(self.base_offset);
        buf.put_i32(0); // batch_length, patched below
        buf.put_i32(self.partition_leader_epoch);
        buf.put_i8(MAGIC);
        buf.put_u32(0); // crc, patched below

        let crc_start = buf.len();

        buf.put_i16(self.attributes.into());
        buf.put_i32(self.last_offset_delta);
        buf.put_i64(self.base_timestamp);
        buf.put_i64(self.max_timestamp);
        buf.put_i64(self.producer_id);
        buf.put_i16(self.producer_epoch);
        buf.put_i32(self.base_sequence);

        Array(self.records.as_slice())
            .encode(buf, version)
            .context("records")?;

        let batch_length = i32::try_from(buf.len() - crc_start + BATCH_LENGTH_OVERHEAD)
            .context("record batch length exceeds INT32")?;
        let crc = crc32c::crc32c(&buf[crc_start..]);

        buf[start + 8..start + 12].copy_from_slice(&batch_length.to_be_bytes());
        buf[crc_start - 4..crc_start].copy_from_slice(&crc.to_be_bytes());

        Ok(())
    }
}

impl Deserialize for RecordBatch {
    const DEFAULT_VERSION: i16 = MAGIC as i16;

    #[inline]
    fn decode<B: Buf>(buf: &mut B, _version: i16) -> Result<(Self, usize)> {
        Self::decode_with(buf, CrcCheck::Verify)
    }
}

/// Sequence of record batches stored in the `records` field of produce and fetch payloads.
///
/// On the wire this is a NULLABLE_BYTES field: an INT32 size (-1 for null) followed by
/// back-to-back batches.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecordSet {
    pub batches: Vec<RecordBatch>,
}

impl RecordSet {
    #[inline]
    pub fn new(batches: Vec<RecordBatch>) -> Self {
        Self { batches }
    }

    fn batches_size(&self) -> usize {
        self.batches.iter().map(|b| b.encode_size(MAGIC.into())).sum()
    }
}

impl From<RecordBatch> for RecordSet {
    #[inline]
    fn from(batch: RecordBatch) -> Self {
        Self::new(vec![batch])
    }
}

impl Serialize for RecordSet {
    const SIZE: usize = 4;

    #[inline]
    fn encode_size(&self, _version: i16) -> usize {
        Self::SIZE + self.batches_size()
    }

    fn encode(&self, buf: &mut BytesMut, _version: i16) -> Result<()> {
        let size = i32::try_from(self.batches_size()).context("record set size exceeds INT32")?;
        buf.put_i32(size);

        for (i, batch) in self.batches.iter().enumerate() {
            batch
                .encode(buf, MAGIC.into())
                .with_context(|| format!("record batch {i}"))?;
        }

        Ok(())
    }
}

impl Serialize for Option<RecordSet> {
    #[inline]
    fn encode_size(&self, version: i16) -> usize {
        self.as_ref()
            .map_or(RecordSet::SIZE, |set| set.encode_size(version))
    }

    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        match self {
            Some(set) => set.encode(buf, version),
            None => (-1i32).encode(buf, version),
        }
    }
}

impl Deserialize for Option<RecordSet> {
    fn decode<B: Buf>(buf: &mut B, version: i16) -> Result<(Self, usize)> {
        let (size, n) = i32::decode(buf, version).context("record set size")?;

        let Some(size) = nullable_len(size.into())? else {
            return Ok((None, n));
        };

        ensure_remaining(buf, size).context("record set")?;
        let mut data = buf.copy_to_bytes(size);
        let mut batches = Vec::new();

        while data.has_remaining() {
            // brokers may cut the last batch short when it doesn't fit the fetch size limit
            let declared = (data.remaining() >= BATCH_PREFIX_SIZE)
                .then(|| (&data[8..12]).get_i32())
                .and_then(|len| usize::try_from(len).ok());

            match declared {
                Some(len) if data.remaining() >= 8 + 4 + len => {}
                _ => {
                    debug!(bytes = data.remaining(), "skipping truncated trailing record batch");
                    break;
                }
            }

            let (batch, _) = RecordBatch::decode(&mut data, MAGIC.into())
                .with_context(|| format!("record batch {}", batches.len()))?;

            batches.push(batch);
        }

        Ok((Some(RecordSet { batches }), n + size))
    }
}

impl Deserialize for RecordSet {
    fn decode<B: Buf>(buf: &mut B, version: i16) -> Result<(Self, usize)> {
        match Option::<RecordSet>::decode(buf, version)? {
            (Some(set), n) => Ok((set, n)),
            (None, _) => bail!(DecodeError::UnexpectedNull),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecordBatchAttrs {
    /// bit 0~2
    pub compression: Compression,

    /// bit 3
    pub timestamp_type: TimestampType,

    /// bit 4
    pub is_transactional: bool,

    /// bit 5
    pub is_control: bool,

    /// bit 6
    ///
    /// `false` means [`base_timestamp`](RecordBatch::base_timestamp) is not set as the delete
    /// horizon for compaction.
    pub has_delete_horizon_ms: bool,
    // bit 7~15: unused
}

impl TryFrom<i16> for RecordBatchAttrs {
    type Error = BatchError;

    fn try_from(attributes: i16) -> Result<Self, BatchError> {
        let compression = match attributes & 0x7 {
            0 => Compression::None,
            1 => Compression::Gzip,
            2 => Compression::Snappy,
            3 => Compression::Lz4,
            4 => Compression::Zstd,
            _ => return Err(BatchError::InvalidAttributes(attributes)),
        };

        let timestamp_type = if (attributes & (1 << 3)) != 0 {
            TimestampType::LogAppend
        } else {
            TimestampType::Create
        };

        Ok(Self {
            compression,
            timestamp_type,
            is_transactional: (attributes & (1 << 4)) != 0,
            is_control: (attributes & (1 << 5)) != 0,
            has_delete_horizon_ms: (attributes & (1 << 6)) != 0,
        })
    }
}

impl From<RecordBatchAttrs> for i16 {
    fn from(attrs: RecordBatchAttrs) -> Self {
        let mut attributes = attrs.compression as i16;

        attributes |= (attrs.timestamp_type as i16) << 3;

        if attrs.is_transactional {
            attributes |= 1 << 4;
        }

        if attrs.is_control {
            attributes |= 1 << 5;
        }

        if attrs.has_delete_horizon_ms {
            attributes |= 1 << 6;
        }

        attributes
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Compression {
    #[default]
    None = 0,
    Gzip = 1,
    Snappy = 2,
    Lz4 = 3,
    Zstd = 4,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TimestampType {
    #[default]
    Create = 0,
    LogAppend = 1,
}

fn varint_bytes_size(bytes: Option<&[u8]>) -> usize {
    match bytes {
        Some(bytes) => VarInt(bytes.len() as i32).encode_size(0) + bytes.len(),
        None => VarInt(-1).encode_size(0),
    }
}

fn put_varint_bytes(buf: &mut BytesMut, bytes: Option<&[u8]>) -> Result<()> {
    match bytes {
        Some(bytes) => {
            let len = i32::try_from(bytes.len()).context("length exceeds VARINT")?;
            VarInt(len).encode(buf, 0)?;
            buf.put_slice(bytes);
            Ok(())
        }
        None => VarInt(-1).encode(buf, 0),
    }
}

fn get_varint_bytes<B: Buf>(buf: &mut B) -> Result<(Option<Bytes>, usize)> {
    let (VarInt(len), n) = VarInt::deserialize(buf).context("length")?;

    let Some(len) = nullable_len(len.into())? else {
        return Ok((None, n));
    };

    ensure_remaining(buf, len)?;
    Ok((Some(buf.copy_to_bytes(len)), n + len))
}

/// See official docs for [Record](https://kafka.apache.org/documentation/#record).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Record {
    /// bit 0~7: unused
    pub attributes: i8,
    pub timestamp_delta: i64,
    pub offset_delta: i32,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<Header>,
}

impl Record {
    /// The length of the record calculated from the attributes field to the end of the record.
    pub fn length(&self) -> usize {
        1 + VarLong(self.timestamp_delta).encode_size(0)
            + VarInt(self.offset_delta).encode_size(0)
            + varint_bytes_size(self.key.as_deref())
            + varint_bytes_size(self.value.as_deref())
            + VarInt(self.headers.len() as i32).encode_size(0)
            + self.headers.iter().map(|h| h.encode_size(0)).sum::<usize>()
    }
}

impl Serialize for Record {
    #[inline]
    fn encode_size(&self, version: i16) -> usize {
        let length = self.length();
        VarInt(length as i32).encode_size(version) + length
    }

    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        let length = i32::try_from(self.length()).context("record length exceeds VARINT")?;
        VarInt(length).encode(buf, version)?;

        buf.put_i8(self.attributes);
        VarLong(self.timestamp_delta).encode(buf, version)?;
        VarInt(self.offset_delta).encode(buf, version)?;
        put_varint_bytes(buf, self.key.as_deref()).context("key")?;
        put_varint_bytes(buf, self.value.as_deref()).context("value")?;

        let count = i32::try_from(self.headers.len()).context("header count exceeds VARINT")?;
        VarInt(count).encode(buf, version)?;

        for (i, header) in self.headers.iter().enumerate() {
            header
                .encode(buf, version)
                .with_context(|| format!("header {i}"))?;
        }

        Ok(())
    }
}

impl Deserialize for Record {
    fn decode<B: Buf>(buf: &mut B, version: i16) -> Result<(Self, usize)> {
        let (VarInt(length), n) = VarInt::decode(buf, version).context("record length")?;
        let length =
            usize::try_from(length).map_err(|_| DecodeError::InvalidLength(length.into()))?;

        ensure_remaining(buf, length).context("record")?;
        let mut record = Buf::take(&mut *buf, length);

        let (attributes, _) = i8::decode(&mut record, version).context("attributes")?;

        let (VarLong(timestamp_delta), _) =
            VarLong::decode(&mut record, version).context("timestamp_delta")?;

        let (VarInt(offset_delta), _) =
            VarInt::decode(&mut record, version).context("offset_delta")?;

        let (key, _) = get_varint_bytes(&mut record).context("key")?;
        let (value, _) = get_varint_bytes(&mut record).context("value")?;

        // NOTE: headers have VarInt array length, so cannot use `Array<Vec<Header>>` instance
        let (VarInt(count), _) = VarInt::decode(&mut record, version).context("header count")?;
        let count = usize::try_from(count).map_err(|_| DecodeError::InvalidLength(count.into()))?;

        let mut headers = Vec::with_capacity(count.min(record.remaining()));
        for i in 0..count {
            let (header, _) =
                Header::decode(&mut record, version).with_context(|| format!("header {i}"))?;
            headers.push(header);
        }

        if record.has_remaining() {
            bail!(DecodeError::Leftover(record.remaining()));
        }

        let record = Self {
            attributes,
            timestamp_delta,
            offset_delta,
            key,
            value,
            headers,
        };

        Ok((record, n + length))
    }
}

/// See official docs for [Record Header](https://kafka.apache.org/documentation/#recordheader).
#[derive(Clone, Debug, PartialEq)]
pub struct Header {
    pub key: StrBytes,
    pub value: Option<Bytes>,
}

impl Serialize for Header {
    #[inline]
    fn encode_size(&self, version: i16) -> usize {
        VarInt(self.key.len() as i32).encode_size(version)
            + self.key.len()
            + varint_bytes_size(self.value.as_deref())
    }

    fn encode(&self, buf: &mut BytesMut, _version: i16) -> Result<()> {
        put_varint_bytes(buf, Some(self.key.as_str().as_bytes())).context("header key")?;
        put_varint_bytes(buf, self.value.as_deref()).context("header value")
    }
}

impl Deserialize for Header {
    fn decode<B: Buf>(buf: &mut B, _version: i16) -> Result<(Self, usize)> {
        let (key, mut size) = get_varint_bytes(buf).context("header key")?;
        let Some(key) = key else {
            bail!(DecodeError::UnexpectedNull);
        };
        let key = StrBytes::try_from(key).context("header key")?;

        let (value, n) = get_varint_bytes(buf).context("header value")?;
        size += n;

        Ok((Self { key, value }, size))
    }
}
