//! Commit-log frame codec.
//!
//! One frame is a big-endian `u32` length followed by the payload:
//!
//! ```text
//! payload := magic(0xC5) version(u8) op(u8: 'I'|'U'|'D')
//!            keyspace(lpstr) table(lpstr)
//!            partition_key(cells) clustering_key(cells) columns(cells)
//!            timestamp_micros(i64 BE) ttl_flag(u8) [ttl_seconds(u32 BE)]
//! cells   := count(u16 BE) cell*
//! cell    := name(lpstr) type_tag(u8) present(u8) [typed value]
//! lpstr   := len(u16 BE) utf8 bytes
//! ```
//!
//! Decoding is deterministic: the same bytes produce the same events with
//! the same ids. Malformed frames are reported as [`FrameError`] and handled
//! by the reader as skip markers, never as fatal failures.

use bytes::{BufMut, BytesMut};
use cassflow_core::{
    deterministic_event_id, ChangeEvent, Column, CqlType, CqlValue, EventKind, Row,
};
use thiserror::Error;

/// First payload byte of every well-formed frame.
pub const FRAME_MAGIC: u8 = 0xC5;
/// Current frame format version.
pub const FRAME_VERSION: u8 = 1;
/// Upper bound on a single frame; larger lengths are treated as corruption.
pub const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// Frame decode failures.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("truncated frame: needed {needed} more byte(s) at offset {offset}")]
    Truncated { offset: usize, needed: usize },

    #[error("bad magic byte {0:#04x}")]
    BadMagic(u8),

    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown operation byte {0:#04x}")]
    UnknownOp(u8),

    #[error("unknown type tag {0:#04x}")]
    UnknownTypeTag(u8),

    #[error("invalid utf-8 in string field")]
    BadUtf8,

    #[error("invalid frame length {0}")]
    BadLength(u32),

    #[error("decoded mutation failed validation: {0}")]
    InvalidEvent(#[from] cassflow_core::ModelError),
}

fn type_tag(t: CqlType) -> u8 {
    match t {
        CqlType::Text => 0x01,
        CqlType::Int => 0x02,
        CqlType::BigInt => 0x03,
        CqlType::Float => 0x04,
        CqlType::Double => 0x05,
        CqlType::Decimal => 0x06,
        CqlType::Boolean => 0x07,
        CqlType::Uuid => 0x08,
        CqlType::Timestamp => 0x09,
        CqlType::Blob => 0x0a,
        CqlType::List => 0x0b,
        CqlType::Set => 0x0c,
        CqlType::Map => 0x0d,
        CqlType::Tuple => 0x0e,
        CqlType::Counter => 0x0f,
    }
}

fn tag_type(tag: u8) -> Result<CqlType, FrameError> {
    Ok(match tag {
        0x01 => CqlType::Text,
        0x02 => CqlType::Int,
        0x03 => CqlType::BigInt,
        0x04 => CqlType::Float,
        0x05 => CqlType::Double,
        0x06 => CqlType::Decimal,
        0x07 => CqlType::Boolean,
        0x08 => CqlType::Uuid,
        0x09 => CqlType::Timestamp,
        0x0a => CqlType::Blob,
        0x0b => CqlType::List,
        0x0c => CqlType::Set,
        0x0d => CqlType::Map,
        0x0e => CqlType::Tuple,
        0x0f => CqlType::Counter,
        other => return Err(FrameError::UnknownTypeTag(other)),
    })
}

/// A decoded mutation, not yet promoted to a [`ChangeEvent`].
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMutation {
    pub kind: EventKind,
    pub keyspace: String,
    pub table: String,
    pub partition_key: Row,
    pub clustering_key: Row,
    pub columns: Row,
    pub timestamp_micros: i64,
    pub ttl_seconds: Option<u32>,
}

impl DecodedMutation {
    /// Promote to an event with the deterministic id derived from the
    /// decode context.
    pub fn into_event(self, commitlog_file: &str) -> Result<ChangeEvent, FrameError> {
        let id = deterministic_event_id(
            commitlog_file,
            &self.partition_key,
            &self.clustering_key,
            self.timestamp_micros,
        );
        Ok(ChangeEvent::with_event_id(
            id,
            self.kind,
            self.keyspace,
            self.table,
            self.partition_key,
            self.clustering_key,
            self.columns,
            self.timestamp_micros,
            self.ttl_seconds,
        )?)
    }
}

// ── Encoding ────────────────────────────────────────────────────────

fn put_lpstr(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn put_value(buf: &mut BytesMut, value: &CqlValue) {
    match value {
        CqlValue::Null => unreachable!("null encoded via present flag"),
        CqlValue::Text(s) | CqlValue::Decimal(s) => {
            buf.put_u32(s.len() as u32);
            buf.put_slice(s.as_bytes());
        }
        CqlValue::Int(v) => buf.put_i32(*v),
        CqlValue::BigInt(v) | CqlValue::Timestamp(v) | CqlValue::Counter(v) => buf.put_i64(*v),
        CqlValue::Float(v) => buf.put_f32(*v),
        CqlValue::Double(v) => buf.put_f64(*v),
        CqlValue::Boolean(v) => buf.put_u8(u8::from(*v)),
        CqlValue::Uuid(u) => buf.put_slice(u.as_bytes()),
        CqlValue::Blob(b) => {
            buf.put_u32(b.len() as u32);
            buf.put_slice(b);
        }
        CqlValue::List(items) | CqlValue::Set(items) | CqlValue::Tuple(items) => {
            buf.put_u16(items.len() as u16);
            for item in items {
                put_element(buf, item);
            }
        }
        CqlValue::Map(entries) => {
            buf.put_u16(entries.len() as u16);
            for (k, v) in entries {
                put_element(buf, k);
                put_element(buf, v);
            }
        }
    }
}

fn put_element(buf: &mut BytesMut, value: &CqlValue) {
    match value.tag() {
        Some(t) => {
            buf.put_u8(type_tag(t));
            buf.put_u8(1);
            put_value(buf, value);
        }
        None => {
            // Nulls inside collections carry a text tag with the present
            // flag cleared.
            buf.put_u8(type_tag(CqlType::Text));
            buf.put_u8(0);
        }
    }
}

fn put_cells(buf: &mut BytesMut, row: &Row) {
    buf.put_u16(row.len() as u16);
    for cell in row {
        put_lpstr(buf, &cell.name);
        buf.put_u8(type_tag(cell.cql_type));
        if cell.value.is_null() {
            buf.put_u8(0);
        } else {
            buf.put_u8(1);
            put_value(buf, &cell.value);
        }
    }
}

/// Encode a full frame (length prefix included) for the given event.
pub fn encode_frame(event: &ChangeEvent) -> Vec<u8> {
    let mut payload = BytesMut::new();
    payload.put_u8(FRAME_MAGIC);
    payload.put_u8(FRAME_VERSION);
    payload.put_u8(match event.kind() {
        EventKind::Insert => b'I',
        EventKind::Update => b'U',
        EventKind::Delete => b'D',
    });
    put_lpstr(&mut payload, event.keyspace());
    put_lpstr(&mut payload, event.table());
    put_cells(&mut payload, event.partition_key());
    put_cells(&mut payload, event.clustering_key());
    put_cells(&mut payload, event.columns());
    payload.put_i64(event.timestamp_micros());
    match event.ttl_seconds() {
        Some(ttl) => {
            payload.put_u8(1);
            payload.put_u32(ttl);
        }
        None => payload.put_u8(0),
    }

    let mut frame = BytesMut::with_capacity(4 + payload.len());
    frame.put_u32(payload.len() as u32);
    frame.put_slice(&payload);
    frame.to_vec()
}

// ── Decoding ────────────────────────────────────────────────────────

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FrameError> {
        if self.pos + n > self.buf.len() {
            return Err(FrameError::Truncated {
                offset: self.pos,
                needed: self.pos + n - self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, FrameError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, FrameError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32, FrameError> {
        Ok(i32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64, FrameError> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn lpstr(&mut self) -> Result<String, FrameError> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| FrameError::BadUtf8)
    }

    fn value(&mut self, t: CqlType) -> Result<CqlValue, FrameError> {
        Ok(match t {
            CqlType::Text => {
                let len = self.u32()? as usize;
                CqlValue::Text(
                    String::from_utf8(self.take(len)?.to_vec()).map_err(|_| FrameError::BadUtf8)?,
                )
            }
            CqlType::Decimal => {
                let len = self.u32()? as usize;
                CqlValue::Decimal(
                    String::from_utf8(self.take(len)?.to_vec()).map_err(|_| FrameError::BadUtf8)?,
                )
            }
            CqlType::Int => CqlValue::Int(self.i32()?),
            CqlType::BigInt => CqlValue::BigInt(self.i64()?),
            CqlType::Float => CqlValue::Float(f32::from_be_bytes(
                self.take(4)?.try_into().unwrap(),
            )),
            CqlType::Double => CqlValue::Double(f64::from_be_bytes(
                self.take(8)?.try_into().unwrap(),
            )),
            CqlType::Boolean => CqlValue::Boolean(self.u8()? != 0),
            CqlType::Uuid => {
                let bytes: [u8; 16] = self.take(16)?.try_into().unwrap();
                CqlValue::Uuid(uuid::Uuid::from_bytes(bytes))
            }
            CqlType::Timestamp => CqlValue::Timestamp(self.i64()?),
            CqlType::Blob => {
                let len = self.u32()? as usize;
                CqlValue::Blob(self.take(len)?.to_vec())
            }
            CqlType::List => CqlValue::List(self.elements()?),
            CqlType::Set => CqlValue::Set(self.elements()?),
            CqlType::Tuple => CqlValue::Tuple(self.elements()?),
            CqlType::Map => {
                let count = self.u16()? as usize;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let k = self.element()?;
                    let v = self.element()?;
                    entries.push((k, v));
                }
                CqlValue::Map(entries)
            }
            CqlType::Counter => CqlValue::Counter(self.i64()?),
        })
    }

    fn element(&mut self) -> Result<CqlValue, FrameError> {
        let t = tag_type(self.u8()?)?;
        if self.u8()? == 0 {
            return Ok(CqlValue::Null);
        }
        self.value(t)
    }

    fn elements(&mut self) -> Result<Vec<CqlValue>, FrameError> {
        let count = self.u16()? as usize;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(self.element()?);
        }
        Ok(items)
    }

    fn cells(&mut self) -> Result<Row, FrameError> {
        let count = self.u16()? as usize;
        let mut row = Row::new();
        for _ in 0..count {
            let name = self.lpstr()?;
            let t = tag_type(self.u8()?)?;
            let value = if self.u8()? == 0 {
                CqlValue::Null
            } else {
                self.value(t)?
            };
            row.set(Column::new(name, t, value));
        }
        Ok(row)
    }
}

/// Decode one frame payload (length prefix already stripped).
pub fn decode_payload(payload: &[u8]) -> Result<DecodedMutation, FrameError> {
    let mut cur = Cursor::new(payload);

    let magic = cur.u8()?;
    if magic != FRAME_MAGIC {
        return Err(FrameError::BadMagic(magic));
    }
    let version = cur.u8()?;
    if version != FRAME_VERSION {
        return Err(FrameError::UnsupportedVersion(version));
    }
    let kind = match cur.u8()? {
        b'I' => EventKind::Insert,
        b'U' => EventKind::Update,
        b'D' => EventKind::Delete,
        other => return Err(FrameError::UnknownOp(other)),
    };

    let keyspace = cur.lpstr()?;
    let table = cur.lpstr()?;
    let partition_key = cur.cells()?;
    let clustering_key = cur.cells()?;
    let columns = cur.cells()?;
    let timestamp_micros = cur.i64()?;
    let ttl_seconds = if cur.u8()? != 0 {
        Some(cur.u32()?)
    } else {
        None
    };

    Ok(DecodedMutation {
        kind,
        keyspace,
        table,
        partition_key,
        clustering_key,
        columns,
        timestamp_micros,
        ttl_seconds,
    })
}
