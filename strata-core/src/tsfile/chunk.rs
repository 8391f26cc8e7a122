//! Chunk codec
//!
//! A chunk is the unit of storage for one series inside a file:
//!
//! ```text
//! +--------------+-------------------+---------+
//! | ChunkHeader  | payload           | crc32   |
//! +--------------+-------------------+---------+
//! ```
//!
//! The payload is opaque to the rest of the engine; only the header is
//! interpreted when building the file index.

use crate::{DataType, Result, SeriesKey, StrataError, TimeValuePair, Timestamp, TsValue};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Value encoding of a chunk payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Encoding {
    /// Columnar times/values serialized with bincode
    Plain = 0,
}

impl TryFrom<u8> for Encoding {
    type Error = StrataError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Encoding::Plain),
            _ => Err(StrataError::InvalidFormat(format!(
                "Invalid chunk encoding: {}",
                value
            ))),
        }
    }
}

/// Compression applied on top of the encoded payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Compression {
    Uncompressed = 0,
    Lz4 = 1,
}

impl TryFrom<u8> for Compression {
    type Error = StrataError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Compression::Uncompressed),
            1 => Ok(Compression::Lz4),
            _ => Err(StrataError::InvalidFormat(format!(
                "Invalid chunk compression: {}",
                value
            ))),
        }
    }
}

/// Self-describing chunk header
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkHeader {
    pub series: SeriesKey,
    pub data_type: DataType,
    pub encoding: Encoding,
    pub compression: Compression,
    pub point_count: u32,
    /// Byte length of the payload that follows the header
    pub payload_len: u32,
}

impl ChunkHeader {
    fn encode(&self, buf: &mut BytesMut) {
        put_str(buf, &self.series.device);
        put_str(buf, &self.series.measurement);
        buf.put_u8(self.data_type as u8);
        buf.put_u8(self.encoding as u8);
        buf.put_u8(self.compression as u8);
        buf.put_u32_le(self.point_count);
        buf.put_u32_le(self.payload_len);
    }

    fn decode(cursor: &mut &[u8]) -> Result<Self> {
        let device = get_str(cursor)?;
        let measurement = get_str(cursor)?;
        if cursor.remaining() < 11 {
            return Err(StrataError::InvalidFormat("Chunk header too short".into()));
        }
        Ok(Self {
            series: SeriesKey::new(device, measurement),
            data_type: DataType::try_from(cursor.get_u8())?,
            encoding: Encoding::try_from(cursor.get_u8())?,
            compression: Compression::try_from(cursor.get_u8())?,
            point_count: cursor.get_u32_le(),
            payload_len: cursor.get_u32_le(),
        })
    }
}

#[derive(Serialize, Deserialize)]
struct PlainPayload {
    times: Vec<Timestamp>,
    values: Vec<TsValue>,
}

/// An encoded chunk
#[derive(Debug, Clone)]
pub struct Chunk {
    pub header: ChunkHeader,
    pub payload: Bytes,
}

impl Chunk {
    /// Encode time-ordered points of one series
    pub fn encode(
        series: &SeriesKey,
        data_type: DataType,
        points: &[TimeValuePair],
        compression: Compression,
    ) -> Result<Self> {
        let plain = PlainPayload {
            times: points.iter().map(|p| p.timestamp).collect(),
            values: points.iter().map(|p| p.value.clone()).collect(),
        };
        let encoded = bincode::serialize(&plain)?;

        let payload = match compression {
            Compression::Lz4 => lz4_flex::compress_prepend_size(&encoded),
            Compression::Uncompressed => encoded,
        };

        Ok(Self {
            header: ChunkHeader {
                series: series.clone(),
                data_type,
                encoding: Encoding::Plain,
                compression,
                point_count: points.len() as u32,
                payload_len: payload.len() as u32,
            },
            payload: Bytes::from(payload),
        })
    }

    /// Decode the payload back into points
    pub fn decode_points(&self) -> Result<Vec<TimeValuePair>> {
        let raw = match self.header.compression {
            Compression::Lz4 => lz4_flex::decompress_size_prepended(&self.payload)
                .map_err(|e| StrataError::Compression(e.to_string()))?,
            Compression::Uncompressed => self.payload.to_vec(),
        };

        let plain: PlainPayload = match self.header.encoding {
            Encoding::Plain => bincode::deserialize(&raw)?,
        };
        if plain.times.len() != plain.values.len()
            || plain.times.len() != self.header.point_count as usize
        {
            return Err(StrataError::Corruption(format!(
                "Chunk of {} declares {} points, payload holds {}",
                self.header.series,
                self.header.point_count,
                plain.times.len()
            )));
        }

        Ok(plain
            .times
            .into_iter()
            .zip(plain.values)
            .map(|(timestamp, value)| TimeValuePair { timestamp, value })
            .collect())
    }

    /// Serialize header, payload and trailing checksum
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.payload.len() + 64);
        self.header.encode(&mut buf);
        buf.put_slice(&self.payload);

        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);
        buf.freeze()
    }

    /// Deserialize and verify a chunk
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(StrataError::InvalidFormat("Chunk too short".into()));
        }

        let body = &data[..data.len() - 4];
        let expected = (&data[data.len() - 4..]).get_u32_le();
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(StrataError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = body;
        let header = ChunkHeader::decode(&mut cursor)?;
        if cursor.remaining() != header.payload_len as usize {
            return Err(StrataError::InvalidFormat(format!(
                "Chunk payload length mismatch: header says {}, found {}",
                header.payload_len,
                cursor.remaining()
            )));
        }

        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(cursor),
        })
    }
}

pub(crate) fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

pub(crate) fn get_str(cursor: &mut &[u8]) -> Result<String> {
    if cursor.remaining() < 2 {
        return Err(StrataError::InvalidFormat("String length missing".into()));
    }
    let len = cursor.get_u16_le() as usize;
    if cursor.remaining() < len {
        return Err(StrataError::InvalidFormat("String truncated".into()));
    }
    let s = String::from_utf8(cursor[..len].to_vec())
        .map_err(|e| StrataError::InvalidFormat(e.to_string()))?;
    cursor.advance(len);
    Ok(s)
}
