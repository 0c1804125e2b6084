//! Source operators: table scans, index scans, and expression emission.

use super::{Emit, ScanRange};
use crate::catalog::schema::TableInfo;
use crate::catalog::{index_prefix, table_prefix};
use crate::encoding::{EncodedKey, SortOrder, prefix_successor};
use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::expr::Expr;
use crate::expr::eval::eval;
use crate::kv::{IterOptions, Session};
use crate::row::{EncodedObject, LazyRow, Row, RowObject};
use crate::types::{Value, ValueType, cast};
use compact_str::CompactString;
use std::cmp::Ordering;
use std::sync::Arc;

pub(super) fn seq_scan(table: &str, reverse: bool, env: &Environment, f: Emit<'_>) -> Result<()> {
    let tx = env.transaction()?;
    let info = tx.catalog().get_table(table)?;
    let constraints = Arc::new(info.field_constraints.clone());

    let prefix = table_prefix(table);
    let upper = namespace_upper(&prefix)?;
    let mut cursor = tx.session().cursor(IterOptions {
        lower: Some(prefix.clone()),
        upper: Some(upper),
    })?;
    if reverse {
        cursor.seek_last();
    } else {
        cursor.seek_first();
    }
    while cursor.valid() {
        let key = cursor.key().expect("valid cursor has a key");
        let value = cursor.value().expect("valid cursor has a value");
        let row = Row {
            table: CompactString::from(table),
            key: key[prefix.len()..].to_vec(),
            object: RowObject::Encoded(EncodedObject::new(
                Arc::clone(&constraints),
                value.to_vec(),
            )),
        };
        let row_env = env.with_row(row);
        f(&row_env)?;
        if reverse {
            cursor.prev();
        } else {
            cursor.next();
        }
    }
    Ok(())
}

pub(super) fn pk_scan(
    table: &str,
    ranges: &[ScanRange],
    reverse: bool,
    env: &Environment,
    f: Emit<'_>,
) -> Result<()> {
    // Without ranges this is a plain sequential scan.
    if ranges.is_empty() {
        return seq_scan(table, reverse, env, f);
    }
    let tx = env.transaction()?;
    let info = tx.catalog().get_table(table)?;
    let constraints = Arc::new(info.field_constraints.clone());
    let (types, orders) = pk_layout(&info);

    let prefix = table_prefix(table);
    let encoded = encode_ranges(ranges, &types, &orders)?;
    let session = Arc::clone(tx.session());
    scan_encoded_ranges(&session, &prefix, &encoded, reverse, &mut |suffix, value| {
        let row = Row {
            table: CompactString::from(table),
            key: suffix.to_vec(),
            object: RowObject::Encoded(EncodedObject::new(
                Arc::clone(&constraints),
                value.to_vec(),
            )),
        };
        let row_env = env.with_row(row);
        f(&row_env)
    })
}

pub(super) fn index_scan(
    index: &str,
    ranges: &[ScanRange],
    reverse: bool,
    env: &Environment,
    f: Emit<'_>,
) -> Result<()> {
    let tx = env.transaction()?;
    let catalog = tx.catalog();
    let index_info = catalog.get_index(index)?;
    let table_info = catalog.get_table(&index_info.table)?;
    let constraints = Arc::new(table_info.field_constraints.clone());

    let types: Vec<ValueType> = index_info
        .paths
        .iter()
        .map(|path| {
            path.root()
                .and_then(|root| table_info.field_constraints.get(root))
                .map(|fc| fc.ty)
                .unwrap_or(ValueType::Any)
        })
        .collect();
    let orders = index_info.sort_order.clone();

    let prefix = index_prefix(index);
    // No ranges means the whole index, in key order.
    let encoded = if ranges.is_empty() {
        vec![EncodedRange::unbounded()]
    } else {
        encode_ranges(ranges, &types, &orders)?
    };
    let session = Arc::clone(tx.session());
    let table_name = CompactString::from(index_info.table.as_str());
    scan_encoded_ranges(&session, &prefix, &encoded, reverse, &mut |_suffix, value| {
        // The entry value is the primary key; the row itself loads lazily.
        let row_key = crate::catalog::row_key(table_name.as_str(), value);
        let row = Row {
            table: table_name.clone(),
            key: value.to_vec(),
            object: RowObject::Lazy(LazyRow::new(
                Arc::clone(&session),
                Arc::clone(&constraints),
                row_key,
            )),
        };
        let row_env = env.with_row(row);
        f(&row_env)
    })
}

pub(super) fn emit(exprs: &[Expr], env: &Environment, f: Emit<'_>) -> Result<()> {
    for expr in exprs {
        match eval(expr, env)? {
            Value::Object(fields) => {
                let row_env = env.with_row(Row::synthesized(fields));
                f(&row_env)?;
            }
            other => {
                return Err(Error::Validation(format!(
                    "emit expression must evaluate to an object, got {}",
                    other.value_type()
                )));
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Range plumbing shared by pk and index scans.

pub(super) struct EncodedRange {
    min: Option<Vec<u8>>,
    max: Option<Vec<u8>>,
    inclusive_min: bool,
    inclusive_max: bool,
}

impl EncodedRange {
    fn unbounded() -> Self {
        Self {
            min: None,
            max: None,
            inclusive_min: true,
            inclusive_max: true,
        }
    }
}

/// The primary key layout: declared column types and sort orders, or the
/// implicit integer rowid when no key was declared.
fn pk_layout(info: &TableInfo) -> (Vec<ValueType>, Vec<SortOrder>) {
    match info.primary_key() {
        Some(pk) => (pk.types, pk.sort_order),
        None => (vec![ValueType::Integer], vec![SortOrder::Asc]),
    }
}

fn encode_ranges(
    ranges: &[ScanRange],
    types: &[ValueType],
    orders: &[SortOrder],
) -> Result<Vec<EncodedRange>> {
    ranges
        .iter()
        .map(|range| {
            Ok(EncodedRange {
                min: encode_bound(&range.min, types, orders)?,
                max: encode_bound(&range.max, types, orders)?,
                inclusive_min: range.inclusive_min,
                inclusive_max: range.inclusive_max,
            })
        })
        .collect()
}

fn encode_bound(
    values: &[Value],
    types: &[ValueType],
    orders: &[SortOrder],
) -> Result<Option<Vec<u8>>> {
    if values.is_empty() {
        return Ok(None);
    }
    let mut typed = Vec::with_capacity(values.len());
    for (i, value) in values.iter().enumerate() {
        let target = types.get(i).copied().unwrap_or(ValueType::Any);
        typed.push(cast(value.clone(), target)?);
    }
    Ok(Some(
        EncodedKey::from_values_ordered(&typed, orders)?.into_vec(),
    ))
}

fn namespace_upper(prefix: &[u8]) -> Result<Vec<u8>> {
    prefix_successor(prefix).ok_or_else(|| Error::Encode("key prefix has no successor".into()))
}

/// Compares a stored key suffix against an encoded range endpoint. A suffix
/// that extends the endpoint (composite entries under a prefix bound) counts
/// as equal.
fn cmp_bound(suffix: &[u8], bound: &[u8]) -> Ordering {
    if suffix.len() >= bound.len() && &suffix[..bound.len()] == bound {
        return Ordering::Equal;
    }
    suffix.cmp(bound)
}

pub(super) fn scan_encoded_ranges(
    session: &Arc<dyn Session>,
    prefix: &[u8],
    ranges: &[EncodedRange],
    reverse: bool,
    visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
) -> Result<()> {
    for range in ranges {
        // The sentinel raised when a range end is crossed stops this range
        // only; later ranges still run.
        match scan_one_range(session, prefix, range, reverse, visit) {
            Err(Error::StreamClosed) => continue,
            other => other?,
        }
    }
    Ok(())
}

fn scan_one_range(
    session: &Arc<dyn Session>,
    prefix: &[u8],
    range: &EncodedRange,
    reverse: bool,
    visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
) -> Result<()> {
    let namespace_upper = namespace_upper(prefix)?;

    let concat = |bound: &[u8]| {
        let mut key = prefix.to_vec();
        key.extend_from_slice(bound);
        key
    };

    // The seek-side bound folds inclusivity into the cursor bounds; the
    // far side is detected per key by memcmp and raises the sentinel.
    let lower = match (&range.min, range.inclusive_min) {
        (None, _) => prefix.to_vec(),
        (Some(min), true) => concat(min),
        (Some(min), false) => match prefix_successor(&concat(min)) {
            Some(next) => next,
            None => return Ok(()),
        },
    };
    let upper = match (&range.max, range.inclusive_max) {
        (None, _) => namespace_upper,
        (Some(max), true) => prefix_successor(&concat(max)).unwrap_or(namespace_upper),
        (Some(max), false) => concat(max),
    };

    let mut cursor = session.cursor(IterOptions {
        lower: Some(lower),
        upper: Some(upper),
    })?;
    if reverse {
        cursor.seek_last();
    } else {
        cursor.seek_first();
    }
    while cursor.valid() {
        let key = cursor.key().expect("valid cursor has a key");
        let suffix = &key[prefix.len()..];
        if !reverse {
            if let Some(max) = &range.max {
                match cmp_bound(suffix, max) {
                    Ordering::Greater => return Err(Error::StreamClosed),
                    Ordering::Equal if !range.inclusive_max => return Err(Error::StreamClosed),
                    _ => {}
                }
            }
        } else if let Some(min) = &range.min {
            match cmp_bound(suffix, min) {
                Ordering::Less => return Err(Error::StreamClosed),
                Ordering::Equal if !range.inclusive_min => return Err(Error::StreamClosed),
                _ => {}
            }
        }
        let value = cursor.value().expect("valid cursor has a value");
        visit(suffix, value)?;
        if reverse {
            cursor.prev();
        } else {
            cursor.next();
        }
    }
    Ok(())
}
