//! MAPI property typing: wire type codes, decoded value representation,
//! and the tag constants the archive accessors rely on.

use byteorder::{LittleEndian, ReadBytesExt};
use chrono::{DateTime, Utc};
use std::io::Cursor;

use crate::error::{PstError, Result};

// ── Property tags ────────────────────────────────────────────────────────────

/// Well-known property ids, named after their MAPI canonical names.
pub mod tags {
    pub const MESSAGE_CLASS: u16 = 0x001A;
    pub const SUBJECT: u16 = 0x0037;
    pub const CLIENT_SUBMIT_TIME: u16 = 0x0039;
    pub const SENDER_NAME: u16 = 0x0C1A;
    pub const SENDER_EMAIL_ADDRESS: u16 = 0x0C1F;
    pub const DISPLAY_TO: u16 = 0x0E04;
    pub const MESSAGE_SIZE: u16 = 0x0E08;
    pub const ATTACH_SIZE: u16 = 0x0E20;
    pub const BODY: u16 = 0x1000;
    pub const HTML_BODY: u16 = 0x1013;
    pub const DISPLAY_NAME: u16 = 0x3001;
    pub const CONTENT_COUNT: u16 = 0x3602;
    pub const SUBFOLDERS: u16 = 0x360A;
    pub const ATTACH_DATA: u16 = 0x3701;
    pub const ATTACH_FILENAME: u16 = 0x3704;
    pub const ATTACH_METHOD: u16 = 0x3705;
    pub const ATTACH_LONG_FILENAME: u16 = 0x3707;
    pub const LTP_ROW_ID: u16 = 0x67F2;
    pub const LTP_ROW_VER: u16 = 0x67F3;
}

// ── Types ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropType {
    Null,
    Int16,
    Int32,
    Float,
    Double,
    Currency,
    AppTime,
    ErrorCode,
    Bool,
    Int64,
    String8,
    Unicode,
    Time,
    Guid,
    Binary,
    Object,
    Multi(u16),
    Unknown(u16),
}

impl PropType {
    pub fn from_raw(raw: u16) -> Self {
        if raw & 0x1000 != 0 {
            return PropType::Multi(raw);
        }
        match raw {
            0x0001 => PropType::Null,
            0x0002 => PropType::Int16,
            0x0003 => PropType::Int32,
            0x0004 => PropType::Float,
            0x0005 => PropType::Double,
            0x0006 => PropType::Currency,
            0x0007 => PropType::AppTime,
            0x000A => PropType::ErrorCode,
            0x000B => PropType::Bool,
            0x0014 => PropType::Int64,
            0x001E => PropType::String8,
            0x001F => PropType::Unicode,
            0x0040 => PropType::Time,
            0x0048 => PropType::Guid,
            0x0102 => PropType::Binary,
            0x000D => PropType::Object,
            other => PropType::Unknown(other),
        }
    }

    /// Width of values stored directly in the PC entry, if the type fits
    /// in the four inline bytes.
    pub fn inline_size(self) -> Option<usize> {
        match self {
            PropType::Null => Some(0),
            PropType::Int16 => Some(2),
            PropType::Int32 | PropType::Float | PropType::ErrorCode => Some(4),
            PropType::Bool => Some(1),
            _ => None,
        }
    }

    /// Fixed width of the value payload when stored out of line (eight
    /// byte scalars referenced through an HNID).
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            PropType::Double | PropType::Currency | PropType::AppTime => Some(8),
            PropType::Int64 | PropType::Time => Some(8),
            PropType::Guid => Some(16),
            _ => self.inline_size(),
        }
    }
}

// ── Values ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Null,
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    Currency(i64),
    Bool(bool),
    /// Unicode text, or 8-bit text read as Latin-1. Code pages declared
    /// by the store are not applied.
    String(String),
    Time(DateTime<Utc>),
    Guid([u8; 16]),
    Binary(Vec<u8>),
    /// Embedded object reference: a sub-node id plus the object's size.
    Object { nid: u32, size: u32 },
    /// Multi-valued property, each element decoded at the scalar type.
    Multiple(Vec<PropertyValue>),
    /// Raw bytes of a type this crate does not interpret.
    Unsupported(u16, Vec<u8>),
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            PropertyValue::Int16(v) => Some(i32::from(*v)),
            PropertyValue::Int32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

/// Ticks between the FILETIME epoch (1601-01-01) and the Unix epoch.
const FILETIME_UNIX_OFFSET_SECS: i64 = 11_644_473_600;

/// Converts 100-nanosecond ticks since 1601 into a UTC timestamp.
pub fn filetime_to_datetime(ticks: u64) -> Result<DateTime<Utc>> {
    let secs = (ticks / 10_000_000) as i64 - FILETIME_UNIX_OFFSET_SECS;
    let nanos = ((ticks % 10_000_000) * 100) as u32;
    DateTime::from_timestamp(secs, nanos)
        .ok_or_else(|| PstError::InvalidFormat(format!("timestamp out of range ({ticks} ticks)")))
}

fn need(bytes: &[u8], len: usize) -> Result<()> {
    if bytes.len() < len {
        return Err(PstError::CorruptBlock(format!(
            "value payload truncated ({} < {len})",
            bytes.len()
        )));
    }
    Ok(())
}

fn decode_utf16(bytes: &[u8]) -> Result<String> {
    if bytes.len() % 2 != 0 {
        return Err(PstError::CorruptBlock("odd-length UTF-16 string".into()));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    Ok(String::from_utf16_lossy(&units))
}

/// Decodes a property payload at the given wire type. The caller has
/// already resolved any HNID indirection, so `bytes` is the complete value.
pub fn decode_value(raw_type: u16, bytes: &[u8]) -> Result<PropertyValue> {
    let mut cur = Cursor::new(bytes);
    let value = match PropType::from_raw(raw_type) {
        PropType::Null => PropertyValue::Null,
        PropType::Int16 => {
            need(bytes, 2)?;
            PropertyValue::Int16(cur.read_i16::<LittleEndian>()?)
        }
        PropType::Int32 | PropType::ErrorCode => {
            need(bytes, 4)?;
            PropertyValue::Int32(cur.read_i32::<LittleEndian>()?)
        }
        PropType::Float => {
            need(bytes, 4)?;
            PropertyValue::Float(cur.read_f32::<LittleEndian>()?)
        }
        PropType::Double | PropType::AppTime => {
            need(bytes, 8)?;
            PropertyValue::Double(cur.read_f64::<LittleEndian>()?)
        }
        PropType::Currency => {
            need(bytes, 8)?;
            PropertyValue::Currency(cur.read_i64::<LittleEndian>()?)
        }
        PropType::Bool => {
            need(bytes, 1)?;
            PropertyValue::Bool(bytes[0] != 0)
        }
        PropType::Int64 => {
            need(bytes, 8)?;
            PropertyValue::Int64(cur.read_i64::<LittleEndian>()?)
        }
        PropType::Unicode => PropertyValue::String(decode_utf16(bytes)?),
        PropType::String8 => {
            // Treated as Latin-1; real code pages are out of scope.
            PropertyValue::String(bytes.iter().map(|&b| b as char).collect())
        }
        PropType::Time => {
            need(bytes, 8)?;
            PropertyValue::Time(filetime_to_datetime(cur.read_u64::<LittleEndian>()?)?)
        }
        PropType::Guid => {
            need(bytes, 16)?;
            let mut guid = [0u8; 16];
            guid.copy_from_slice(&bytes[..16]);
            PropertyValue::Guid(guid)
        }
        PropType::Binary => PropertyValue::Binary(bytes.to_vec()),
        PropType::Object => {
            need(bytes, 8)?;
            let nid = cur.read_u32::<LittleEndian>()?;
            let size = cur.read_u32::<LittleEndian>()?;
            PropertyValue::Object { nid, size }
        }
        PropType::Multi(raw) => decode_multi(raw, bytes)?,
        PropType::Unknown(raw) => PropertyValue::Unsupported(raw, bytes.to_vec()),
    };
    Ok(value)
}

/// Multi-valued payloads: fixed-width types are a packed array, variable
/// width types carry a count and an offset table.
fn decode_multi(raw_type: u16, bytes: &[u8]) -> Result<PropertyValue> {
    let scalar = raw_type & !0x1000;
    if let Some(width) = PropType::from_raw(scalar).fixed_size() {
        if width == 0 || bytes.len() % width != 0 {
            return Err(PstError::CorruptBlock("ragged multi-value array".into()));
        }
        let values = bytes
            .chunks_exact(width)
            .map(|c| decode_value(scalar, c))
            .collect::<Result<Vec<_>>>()?;
        return Ok(PropertyValue::Multiple(values));
    }
    let mut cur = Cursor::new(bytes);
    need(bytes, 4)?;
    let count = cur.read_u32::<LittleEndian>()? as usize;
    if count > 0xFFFF {
        return Err(PstError::CorruptBlock("oversized multi-value count".into()));
    }
    let mut offsets = Vec::with_capacity(count + 1);
    for _ in 0..count {
        offsets.push(cur.read_u32::<LittleEndian>()? as usize);
    }
    offsets.push(bytes.len());
    let mut values = Vec::with_capacity(count);
    for pair in offsets.windows(2) {
        let (start, end) = (pair[0], pair[1]);
        if start > end || end > bytes.len() {
            return Err(PstError::CorruptBlock("bad multi-value extent".into()));
        }
        values.push(decode_value(scalar, &bytes[start..end])?);
    }
    Ok(PropertyValue::Multiple(values))
}
