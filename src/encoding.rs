//! Binary codecs.
//!
//! Two codecs live here. The order-preserving key codec maps values to byte
//! strings whose memcmp order matches the logical value order; it backs
//! primary keys, index entries and sort spills. The tagged value codec is a
//! compact `tag || body` form used for row bodies, where order does not
//! matter but heterogeneous values and lazy field skipping do.

use crate::error::{Error, Result};
use crate::types::{FieldBuffer, Value};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn is_desc(self) -> bool {
        matches!(self, SortOrder::Desc)
    }

    pub fn reversed(self) -> SortOrder {
        match self {
            SortOrder::Asc => SortOrder::Desc,
            SortOrder::Desc => SortOrder::Asc,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EncodedKey {
    bytes: SmallVec<[u8; 64]>,
}

impl EncodedKey {
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.bytes.into_vec()
    }

    pub fn from_values(values: &[Value]) -> Result<Self> {
        let mut out = SmallVec::<[u8; 64]>::new();
        for value in values {
            encode_key_value(value, SortOrder::Asc, &mut out)?;
        }
        Ok(Self { bytes: out })
    }

    /// Encodes a composite key with a per-column sort direction. Descending
    /// columns are bitwise-inverted so memcmp order reverses for that column
    /// only.
    pub fn from_values_ordered(values: &[Value], orders: &[SortOrder]) -> Result<Self> {
        let mut out = SmallVec::<[u8; 64]>::new();
        for (i, value) in values.iter().enumerate() {
            let order = orders.get(i).copied().unwrap_or_default();
            encode_key_value(value, order, &mut out)?;
        }
        Ok(Self { bytes: out })
    }
}

impl AsRef<[u8]> for EncodedKey {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

// Key-codec tags. Ranks must match the storage order of Value: Null sorts
// before every non-null, booleans before numbers, integers before doubles.
const KEY_TAG_NULL: u8 = 0x02;
const KEY_TAG_BOOL: u8 = 0x03;
const KEY_TAG_INT: u8 = 0x05;
const KEY_TAG_DOUBLE: u8 = 0x06;
const KEY_TAG_TIMESTAMP: u8 = 0x07;
const KEY_TAG_TEXT: u8 = 0x08;
const KEY_TAG_BLOB: u8 = 0x09;

fn encode_key_value(v: &Value, order: SortOrder, out: &mut SmallVec<[u8; 64]>) -> Result<()> {
    let start = out.len();
    match v {
        Value::Null => out.push(KEY_TAG_NULL),
        Value::Boolean(b) => {
            out.push(KEY_TAG_BOOL);
            out.push(u8::from(*b));
        }
        Value::Integer(i) => {
            out.push(KEY_TAG_INT);
            let shifted = (*i as u64) ^ 0x8000_0000_0000_0000;
            out.extend_from_slice(&shifted.to_be_bytes());
        }
        Value::Double(f) => {
            out.push(KEY_TAG_DOUBLE);
            // Total-order preserving float mapping: flip all bits of
            // negatives, flip only the sign bit of positives.
            let bits = f.to_bits();
            let mapped = if (bits >> 63) == 1 {
                !bits
            } else {
                bits ^ 0x8000_0000_0000_0000
            };
            out.extend_from_slice(&mapped.to_be_bytes());
        }
        Value::Timestamp(ts) => {
            out.push(KEY_TAG_TIMESTAMP);
            let shifted = (*ts as u64) ^ 0x8000_0000_0000_0000;
            out.extend_from_slice(&shifted.to_be_bytes());
        }
        Value::Text(s) => {
            out.push(KEY_TAG_TEXT);
            append_escaped(s.as_bytes(), out);
        }
        Value::Blob(b) => {
            out.push(KEY_TAG_BLOB);
            append_escaped(b, out);
        }
        Value::Object(_) | Value::Array(_) => {
            return Err(Error::Encode(format!(
                "{} values are not key-encodable",
                v.value_type()
            )));
        }
    }
    if order.is_desc() {
        for byte in &mut out[start..] {
            *byte = !*byte;
        }
    }
    Ok(())
}

/// Interior 0x00 bytes become 0x00 0xFF so the 0x00 0x00 terminator stays
/// unambiguous and prefixes sort before their extensions.
fn append_escaped(data: &[u8], out: &mut SmallVec<[u8; 64]>) {
    for byte in data {
        if *byte == 0 {
            out.extend_from_slice(&[0x00, 0xFF]);
        } else {
            out.push(*byte);
        }
    }
    out.extend_from_slice(&[0x00, 0x00]);
}

/// Smallest byte string strictly greater than every key carrying `prefix`.
/// Returns None when the prefix is all 0xFF (no successor exists).
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut next = prefix.to_vec();
    for i in (0..next.len()).rev() {
        if next[i] != 0xFF {
            next[i] += 1;
            next.truncate(i + 1);
            return Some(next);
        }
    }
    None
}

// Value-codec tags.
const VAL_TAG_NULL: u8 = 1;
const VAL_TAG_FALSE: u8 = 2;
const VAL_TAG_TRUE: u8 = 3;
const VAL_TAG_INT: u8 = 4;
const VAL_TAG_DOUBLE: u8 = 5;
const VAL_TAG_TEXT: u8 = 6;
const VAL_TAG_BLOB: u8 = 7;
const VAL_TAG_TIMESTAMP: u8 = 8;
const VAL_TAG_OBJECT: u8 = 9;
const VAL_TAG_ARRAY: u8 = 10;

pub fn write_uvarint(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub fn read_uvarint(buf: &[u8]) -> Result<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, byte) in buf.iter().enumerate() {
        if shift >= 64 {
            return Err(Error::Decode("varint overflows u64".into()));
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
    }
    Err(Error::Decode("truncated varint".into()))
}

fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

pub fn encode_typed(out: &mut Vec<u8>, v: &Value) {
    match v {
        Value::Null => out.push(VAL_TAG_NULL),
        Value::Boolean(false) => out.push(VAL_TAG_FALSE),
        Value::Boolean(true) => out.push(VAL_TAG_TRUE),
        Value::Integer(i) => {
            out.push(VAL_TAG_INT);
            write_uvarint(out, zigzag(*i));
        }
        Value::Double(f) => {
            out.push(VAL_TAG_DOUBLE);
            out.extend_from_slice(&f.to_le_bytes());
        }
        Value::Text(s) => {
            out.push(VAL_TAG_TEXT);
            write_uvarint(out, s.len() as u64);
            out.extend_from_slice(s.as_bytes());
        }
        Value::Blob(b) => {
            out.push(VAL_TAG_BLOB);
            write_uvarint(out, b.len() as u64);
            out.extend_from_slice(b);
        }
        Value::Timestamp(ts) => {
            out.push(VAL_TAG_TIMESTAMP);
            write_uvarint(out, zigzag(*ts));
        }
        Value::Object(fields) => {
            out.push(VAL_TAG_OBJECT);
            write_uvarint(out, fields.len() as u64);
            for (name, value) in fields.iter() {
                write_uvarint(out, name.len() as u64);
                out.extend_from_slice(name.as_bytes());
                encode_typed(out, value);
            }
        }
        Value::Array(items) => {
            out.push(VAL_TAG_ARRAY);
            write_uvarint(out, items.len() as u64);
            for item in items {
                encode_typed(out, item);
            }
        }
    }
}

fn read_bytes(buf: &[u8], at: usize) -> Result<(&[u8], usize)> {
    let (len, n) = read_uvarint(&buf[at..])?;
    let start = at + n;
    let end = start + len as usize;
    if end > buf.len() {
        return Err(Error::Decode("truncated length-prefixed bytes".into()));
    }
    Ok((&buf[start..end], end))
}

/// Decodes one value from the front of `buf`, returning it with the number of
/// bytes consumed.
pub fn decode_typed(buf: &[u8]) -> Result<(Value, usize)> {
    let Some(&tag) = buf.first() else {
        return Err(Error::Decode("empty value buffer".into()));
    };
    match tag {
        VAL_TAG_NULL => Ok((Value::Null, 1)),
        VAL_TAG_FALSE => Ok((Value::Boolean(false), 1)),
        VAL_TAG_TRUE => Ok((Value::Boolean(true), 1)),
        VAL_TAG_INT => {
            let (raw, n) = read_uvarint(&buf[1..])?;
            Ok((Value::Integer(unzigzag(raw)), 1 + n))
        }
        VAL_TAG_DOUBLE => {
            if buf.len() < 9 {
                return Err(Error::Decode("truncated double".into()));
            }
            let mut bits = [0u8; 8];
            bits.copy_from_slice(&buf[1..9]);
            Ok((Value::Double(f64::from_le_bytes(bits)), 9))
        }
        VAL_TAG_TEXT => {
            let (bytes, end) = read_bytes(buf, 1)?;
            let text = std::str::from_utf8(bytes)
                .map_err(|_| Error::Decode("text value is not valid UTF-8".into()))?;
            Ok((Value::Text(CompactString::from(text)), end))
        }
        VAL_TAG_BLOB => {
            let (bytes, end) = read_bytes(buf, 1)?;
            Ok((Value::Blob(bytes.to_vec()), end))
        }
        VAL_TAG_TIMESTAMP => {
            let (raw, n) = read_uvarint(&buf[1..])?;
            Ok((Value::Timestamp(unzigzag(raw)), 1 + n))
        }
        VAL_TAG_OBJECT => {
            let (count, mut at) = read_uvarint(&buf[1..]).map(|(c, n)| (c, 1 + n))?;
            let mut fields = FieldBuffer::with_capacity(count as usize);
            for _ in 0..count {
                let (name_bytes, next) = read_bytes(buf, at)?;
                let name = std::str::from_utf8(name_bytes)
                    .map_err(|_| Error::Decode("field name is not valid UTF-8".into()))?;
                let (value, used) = decode_typed(&buf[next..])?;
                fields.add(CompactString::from(name), value);
                at = next + used;
            }
            Ok((Value::Object(fields), at))
        }
        VAL_TAG_ARRAY => {
            let (count, mut at) = read_uvarint(&buf[1..]).map(|(c, n)| (c, 1 + n))?;
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let (value, used) = decode_typed(&buf[at..])?;
                items.push(value);
                at += used;
            }
            Ok((Value::Array(items), at))
        }
        other => Err(Error::Decode(format!("unknown value tag {other:#x}"))),
    }
}

/// Size of the encoded value at the front of `buf`, without materializing it.
/// Used by lazy row views to seek to a field position.
pub fn skip_typed(buf: &[u8]) -> Result<usize> {
    let Some(&tag) = buf.first() else {
        return Err(Error::Decode("empty value buffer".into()));
    };
    match tag {
        VAL_TAG_NULL | VAL_TAG_FALSE | VAL_TAG_TRUE => Ok(1),
        VAL_TAG_INT | VAL_TAG_TIMESTAMP => {
            let (_, n) = read_uvarint(&buf[1..])?;
            Ok(1 + n)
        }
        VAL_TAG_DOUBLE => {
            if buf.len() < 9 {
                return Err(Error::Decode("truncated double".into()));
            }
            Ok(9)
        }
        VAL_TAG_TEXT | VAL_TAG_BLOB => {
            let (_, end) = read_bytes(buf, 1)?;
            Ok(end)
        }
        VAL_TAG_OBJECT => {
            let (count, mut at) = read_uvarint(&buf[1..]).map(|(c, n)| (c, 1 + n))?;
            for _ in 0..count {
                let (_, next) = read_bytes(buf, at)?;
                at = next + skip_typed(&buf[next..])?;
            }
            Ok(at)
        }
        VAL_TAG_ARRAY => {
            let (count, mut at) = read_uvarint(&buf[1..]).map(|(c, n)| (c, 1 + n))?;
            for _ in 0..count {
                at += skip_typed(&buf[at..])?;
            }
            Ok(at)
        }
        other => Err(Error::Decode(format!("unknown value tag {other:#x}"))),
    }
}
