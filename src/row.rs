//! Rows and the schema-guided row codec.
//!
//! A row body is the concatenation of the declared fields' typed-codec
//! encodings in constraint position order, followed by `(name, value)` pairs
//! for extra fields (sorted by name) when the schema allows them. Field names
//! for the declared prefix are not stored; the schema supplies them, which is
//! also what makes [`EncodedObject`] reads lazy: `get` skips sibling values
//! without materializing them.

use crate::catalog::schema::{FieldConstraint, FieldConstraints, TableInfo};
use crate::encoding::{decode_typed, encode_typed, read_uvarint, skip_typed, write_uvarint};
use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::expr::eval::eval;
use crate::kv::Session;
use crate::types::{FieldBuffer, Value, cast};
use compact_str::CompactString;
use once_cell::sync::OnceCell;
use std::sync::Arc;

#[derive(Clone)]
pub struct Row {
    pub table: CompactString,
    /// Encoded primary-key bytes (empty for synthesized rows).
    pub key: Vec<u8>,
    pub object: RowObject,
}

impl Row {
    pub fn synthesized(object: FieldBuffer) -> Self {
        Self {
            table: CompactString::default(),
            key: Vec::new(),
            object: RowObject::Buffer(object),
        }
    }
}

impl std::fmt::Debug for Row {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Row")
            .field("table", &self.table)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub enum RowObject {
    /// Lazy view over an encoded buffer plus the schema that produced it.
    Encoded(EncodedObject),
    /// Materialized object (synthesized rows, projections).
    Buffer(FieldBuffer),
    /// Key-only pointer that fetches the table row on first access.
    Lazy(LazyRow),
}

impl RowObject {
    pub fn get(&self, name: &str) -> Result<Option<Value>> {
        match self {
            RowObject::Encoded(eo) => eo.get(name),
            RowObject::Buffer(fb) => Ok(fb.get(name).cloned()),
            RowObject::Lazy(lazy) => lazy.load()?.get(name),
        }
    }

    pub fn iterate(&self, f: &mut dyn FnMut(&str, Value) -> Result<()>) -> Result<()> {
        match self {
            RowObject::Encoded(eo) => eo.iterate(f),
            RowObject::Buffer(fb) => {
                for (name, value) in fb.iter() {
                    f(name, value.clone())?;
                }
                Ok(())
            }
            RowObject::Lazy(lazy) => lazy.load()?.iterate(f),
        }
    }

    /// Decodes every field into an owned buffer. Rows escaping the operator
    /// pipeline (results, sort spills) go through this.
    pub fn materialize(&self) -> Result<FieldBuffer> {
        match self {
            RowObject::Buffer(fb) => Ok(fb.clone()),
            other => {
                let mut fb = FieldBuffer::new();
                other.iterate(&mut |name, value| {
                    fb.add(CompactString::from(name), value);
                    Ok(())
                })?;
                Ok(fb)
            }
        }
    }
}

impl From<FieldBuffer> for RowObject {
    fn from(fb: FieldBuffer) -> Self {
        RowObject::Buffer(fb)
    }
}

#[derive(Clone)]
pub struct EncodedObject {
    constraints: Arc<FieldConstraints>,
    bytes: Arc<[u8]>,
}

impl EncodedObject {
    pub fn new(constraints: Arc<FieldConstraints>, bytes: Vec<u8>) -> Self {
        Self {
            constraints,
            bytes: bytes.into(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Byte offset where the extra-field pairs begin.
    fn extras_offset(&self) -> Result<usize> {
        let mut offset = 0;
        for _ in 0..self.constraints.len() {
            offset += skip_typed(&self.bytes[offset..])?;
        }
        Ok(offset)
    }

    pub fn get(&self, name: &str) -> Result<Option<Value>> {
        if let Some(pos) = self.constraints.position(name) {
            let mut offset = 0;
            for _ in 0..pos {
                offset += skip_typed(&self.bytes[offset..])?;
            }
            let (value, _) = decode_typed(&self.bytes[offset..])?;
            return Ok(Some(value));
        }
        let mut offset = self.extras_offset()?;
        while offset < self.bytes.len() {
            let (len, n) = read_uvarint(&self.bytes[offset..])?;
            let name_start = offset + n;
            let name_end = name_start + len as usize;
            if name_end > self.bytes.len() {
                return Err(Error::Decode("truncated extra field name".into()));
            }
            let field = std::str::from_utf8(&self.bytes[name_start..name_end])
                .map_err(|_| Error::Decode("extra field name is not valid UTF-8".into()))?;
            if field == name {
                let (value, _) = decode_typed(&self.bytes[name_end..])?;
                return Ok(Some(value));
            }
            offset = name_end + skip_typed(&self.bytes[name_end..])?;
        }
        Ok(None)
    }

    /// Walks declared fields in position order, then extras.
    pub fn iterate(&self, f: &mut dyn FnMut(&str, Value) -> Result<()>) -> Result<()> {
        let mut offset = 0;
        for fc in &self.constraints.fields {
            let (value, used) = decode_typed(&self.bytes[offset..])?;
            offset += used;
            f(&fc.field, value)?;
        }
        while offset < self.bytes.len() {
            let (len, n) = read_uvarint(&self.bytes[offset..])?;
            let name_start = offset + n;
            let name_end = name_start + len as usize;
            if name_end > self.bytes.len() {
                return Err(Error::Decode("truncated extra field name".into()));
            }
            let name = std::str::from_utf8(&self.bytes[name_start..name_end])
                .map_err(|_| Error::Decode("extra field name is not valid UTF-8".into()))?
                .to_owned();
            let (value, used) = decode_typed(&self.bytes[name_end..])?;
            offset = name_end + used;
            f(&name, value)?;
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct LazyRow {
    inner: Arc<LazyRowInner>,
}

struct LazyRowInner {
    session: Arc<dyn Session>,
    constraints: Arc<FieldConstraints>,
    row_key: Vec<u8>,
    cell: OnceCell<EncodedObject>,
}

impl LazyRow {
    pub fn new(
        session: Arc<dyn Session>,
        constraints: Arc<FieldConstraints>,
        row_key: Vec<u8>,
    ) -> Self {
        Self {
            inner: Arc::new(LazyRowInner {
                session,
                constraints,
                row_key,
                cell: OnceCell::new(),
            }),
        }
    }

    fn load(&self) -> Result<&EncodedObject> {
        self.inner.cell.get_or_try_init(|| {
            let bytes = self.inner.session.get(&self.inner.row_key)?;
            Ok(EncodedObject::new(
                Arc::clone(&self.inner.constraints),
                bytes,
            ))
        })
    }
}

/// Validates and encodes a source object against a table's constraints:
/// declared fields in position order with defaults materialized, NOT NULL
/// enforced and declared types applied by casting, then extra fields sorted
/// by name when the schema allows them, dropped otherwise.
pub fn encode_object(info: &TableInfo, env: &Environment, src: &RowObject) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    encode_constrained(
        &info.field_constraints,
        &info.name,
        env,
        src,
        &mut out,
    )?;
    Ok(out)
}

fn encode_constrained(
    constraints: &FieldConstraints,
    table: &str,
    env: &Environment,
    src: &RowObject,
    out: &mut Vec<u8>,
) -> Result<()> {
    for fc in &constraints.fields {
        let value = resolve_field(fc, table, env, src)?;
        encode_typed(out, &value);
    }
    if !constraints.allow_extra_fields {
        return Ok(());
    }
    let mut extras: Vec<(CompactString, Value)> = Vec::new();
    src.iterate(&mut |name, value| {
        if constraints.get(name).is_none() {
            extras.push((CompactString::from(name), value));
        }
        Ok(())
    })?;
    extras.sort_by(|(a, _), (b, _)| a.cmp(b));
    for (name, value) in extras {
        write_uvarint(out, name.len() as u64);
        out.extend_from_slice(name.as_bytes());
        encode_typed(out, &value);
    }
    Ok(())
}

fn resolve_field(
    fc: &FieldConstraint,
    table: &str,
    env: &Environment,
    src: &RowObject,
) -> Result<Value> {
    let mut value = match src.get(&fc.field)? {
        Some(v) => v,
        None => match &fc.default_value {
            Some(default) => eval(default, env)?,
            None => Value::Null,
        },
    };
    if value.is_null() {
        if fc.is_not_null {
            return Err(Error::NotNullViolation {
                table: table.to_string(),
                column: fc.field.to_string(),
            });
        }
        return Ok(Value::Null);
    }
    value = cast(value, fc.ty)?;
    if let (Value::Object(fields), Some(nested)) = (&value, &fc.anonymous_type) {
        let nested_src = RowObject::Buffer(fields.clone());
        let mut nested_bytes = Vec::new();
        encode_constrained(nested, table, env, &nested_src, &mut nested_bytes)?;
        let view = EncodedObject::new(Arc::new((**nested).clone()), nested_bytes);
        value = Value::Object(view.materialize_buffer()?);
    }
    Ok(value)
}

impl EncodedObject {
    fn materialize_buffer(&self) -> Result<FieldBuffer> {
        let mut fb = FieldBuffer::new();
        self.iterate(&mut |name, value| {
            fb.add(CompactString::from(name), value);
            Ok(())
        })?;
        Ok(fb)
    }
}

/// Canonical JSON for result rows: sorted field order, canonical number
/// formatting (doubles keep a trailing `.0` when integral), RFC 3339
/// timestamps, hex-encoded blobs.
pub fn marshal_json(fields: &FieldBuffer) -> String {
    let mut sorted: Vec<(&str, &Value)> = fields.iter().collect();
    sorted.sort_by(|(a, _), (b, _)| a.cmp(b));
    let mut out = String::new();
    out.push('{');
    for (i, (name, value)) in sorted.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        push_json_string(&mut out, name);
        out.push_str(": ");
        push_json_value(&mut out, value);
    }
    out.push('}');
    out
}

fn push_json_string(out: &mut String, s: &str) {
    let escaped = serde_json::to_string(s).expect("string serialization is infallible");
    out.push_str(&escaped);
}

fn push_json_value(out: &mut String, v: &Value) {
    match v {
        Value::Null => out.push_str("null"),
        Value::Boolean(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Integer(i) => out.push_str(&i.to_string()),
        Value::Double(d) => out.push_str(&cast::format_double(*d)),
        Value::Text(s) => push_json_string(out, s),
        Value::Blob(b) => {
            out.push('"');
            for byte in b {
                out.push_str(&format!("{byte:02x}"));
            }
            out.push('"');
        }
        Value::Timestamp(ns) => push_json_string(out, &cast::format_timestamp(*ns)),
        Value::Object(fields) => out.push_str(&marshal_json(fields)),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                push_json_value(out, item);
            }
            out.push(']');
        }
    }
}
