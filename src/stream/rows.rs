//! Row transform operators.

use super::{Emit, ProjectExpr, iterate_ops};
use crate::encoding::{
    EncodedKey, SortOrder, decode_typed, encode_typed, read_uvarint, write_uvarint,
};
use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::expr::eval::eval;
use crate::expr::functions::{AggregateSpec, Aggregator};
use crate::expr::{Expr, Path, PathSegment};
use crate::row::{Row, RowObject};
use crate::stream::Operator;
use crate::types::{FieldBuffer, Value};
use compact_str::CompactString;

pub(super) fn filter(prev: &[Operator], expr: &Expr, env: &Environment, f: Emit<'_>) -> Result<()> {
    iterate_ops(prev, env, &mut |out| {
        if eval(expr, out)?.is_truthy() {
            f(out)?;
        }
        Ok(())
    })
}

pub(super) fn project(
    prev: &[Operator],
    exprs: &[ProjectExpr],
    env: &Environment,
    f: Emit<'_>,
) -> Result<()> {
    iterate_ops(prev, env, &mut |out| {
        let mut fb = FieldBuffer::new();
        for pe in exprs {
            match pe {
                ProjectExpr::Wildcard => {
                    if let Some(row) = out.row() {
                        row.object.iterate(&mut |name, value| {
                            fb.add(CompactString::from(name), value);
                            Ok(())
                        })?;
                    }
                }
                ProjectExpr::Named { expr, alias } => {
                    let name = match alias {
                        Some(alias) => alias.clone(),
                        None => CompactString::from(expr.to_string()),
                    };
                    fb.add(name, eval(expr, out)?);
                }
            }
        }
        let mut row = Row::synthesized(fb);
        if let Some(current) = out.row() {
            row.table = current.table.clone();
            row.key = current.key.clone();
        }
        let projected = out.with_row(row);
        f(&projected)
    })
}

pub(super) fn set(
    prev: &[Operator],
    path: &Path,
    expr: &Expr,
    env: &Environment,
    f: Emit<'_>,
) -> Result<()> {
    iterate_ops(prev, env, &mut |out| {
        let Some(row) = out.row() else {
            return Err(Error::Validation("missing row".into()));
        };
        let value = eval(expr, out)?;
        let mut fb = row.object.materialize()?;
        // Rows where the path cannot be resolved are dropped.
        if !set_path(&mut fb, path, value) {
            return Ok(());
        }
        let updated = Row {
            table: row.table.clone(),
            key: row.key.clone(),
            object: RowObject::Buffer(fb),
        };
        let set_env = out.with_row(updated);
        f(&set_env)
    })
}

pub(super) fn unset(prev: &[Operator], path: &Path, env: &Environment, f: Emit<'_>) -> Result<()> {
    iterate_ops(prev, env, &mut |out| {
        let Some(row) = out.row() else {
            return Err(Error::Validation("missing row".into()));
        };
        let mut fb = row.object.materialize()?;
        if !unset_path(&mut fb, path) {
            // Nothing to remove; the row passes through unchanged.
            return f(out);
        }
        let updated = Row {
            table: row.table.clone(),
            key: row.key.clone(),
            object: RowObject::Buffer(fb),
        };
        let unset_env = out.with_row(updated);
        f(&unset_env)
    })
}

fn set_path(fb: &mut FieldBuffer, path: &Path, value: Value) -> bool {
    let Some(PathSegment::Field(root)) = path.0.first() else {
        return false;
    };
    let rest = &path.0[1..];
    if rest.is_empty() {
        fb.add(root.clone(), value);
        return true;
    }
    match fb.get_mut(root.as_str()) {
        Some(container) => set_in_value(container, rest, value),
        None => false,
    }
}

fn set_in_value(container: &mut Value, segments: &[PathSegment], value: Value) -> bool {
    let (segment, rest) = match segments.split_first() {
        Some(split) => split,
        None => return false,
    };
    match (segment, container) {
        (PathSegment::Field(name), Value::Object(fields)) => {
            if rest.is_empty() {
                fields.add(name.clone(), value);
                return true;
            }
            match fields.get_mut(name.as_str()) {
                Some(inner) => set_in_value(inner, rest, value),
                None => false,
            }
        }
        (PathSegment::Index(idx), Value::Array(items)) => match items.get_mut(*idx) {
            Some(slot) => {
                if rest.is_empty() {
                    *slot = value;
                    return true;
                }
                set_in_value(slot, rest, value)
            }
            None => false,
        },
        _ => false,
    }
}

fn unset_path(fb: &mut FieldBuffer, path: &Path) -> bool {
    let Some(PathSegment::Field(root)) = path.0.first() else {
        return false;
    };
    let rest = &path.0[1..];
    if rest.is_empty() {
        return fb.remove(root.as_str()).is_some();
    }
    let Some(container) = fb.get_mut(root.as_str()) else {
        return false;
    };
    unset_in_value(container, rest)
}

fn unset_in_value(container: &mut Value, segments: &[PathSegment]) -> bool {
    let (segment, rest) = match segments.split_first() {
        Some(split) => split,
        None => return false,
    };
    match (segment, container) {
        (PathSegment::Field(name), Value::Object(fields)) => {
            if rest.is_empty() {
                return fields.remove(name.as_str()).is_some();
            }
            match fields.get_mut(name.as_str()) {
                Some(inner) => unset_in_value(inner, rest),
                None => false,
            }
        }
        (PathSegment::Index(idx), Value::Array(items)) => {
            if rest.is_empty() {
                return false;
            }
            match items.get_mut(*idx) {
                Some(inner) => unset_in_value(inner, rest),
                None => false,
            }
        }
        _ => false,
    }
}

pub(super) fn take(prev: &[Operator], n: u64, env: &Environment, f: Emit<'_>) -> Result<()> {
    let mut remaining = n;
    iterate_ops(prev, env, &mut |out| {
        if remaining == 0 {
            return Err(Error::StreamClosed);
        }
        remaining -= 1;
        f(out)?;
        if remaining == 0 {
            return Err(Error::StreamClosed);
        }
        Ok(())
    })
}

pub(super) fn skip(prev: &[Operator], n: u64, env: &Environment, f: Emit<'_>) -> Result<()> {
    let mut seen = 0u64;
    iterate_ops(prev, env, &mut |out| {
        if seen < n {
            seen += 1;
            return Ok(());
        }
        f(out)
    })
}

pub(super) fn distinct(prev: &[Operator], env: &Environment, f: Emit<'_>) -> Result<()> {
    let tx = env.transaction()?;
    let seen = tx.transient_session();
    let result = iterate_ops(prev, env, &mut |out| {
        let Some(row) = out.row() else {
            return Err(Error::Validation("missing row".into()));
        };
        let fb = row.object.materialize()?;
        let mut key = Vec::new();
        encode_typed(&mut key, &Value::Object(fb));
        if seen.exists(&key)? {
            return Ok(());
        }
        seen.put(&key, &[1])?;
        f(out)
    });
    seen.close()?;
    result
}

pub(super) fn sort(
    prev: &[Operator],
    expr: &Expr,
    order: SortOrder,
    env: &Environment,
    f: Emit<'_>,
) -> Result<()> {
    let tx = env.transaction()?;
    let spill = tx.transient_session();
    let mut rank = 0u64;
    let fill = iterate_ops(prev, env, &mut |out| {
        let Some(row) = out.row() else {
            return Err(Error::Validation("missing row".into()));
        };
        let sort_value = eval(expr, out)?;
        // Descending order inverts the encoded sort key instead of walking
        // the spill backwards, so ties keep arrival order either way.
        let mut key =
            EncodedKey::from_values_ordered(std::slice::from_ref(&sort_value), &[order])?
                .into_vec();
        key.extend_from_slice(&rank.to_be_bytes());
        rank += 1;
        spill.put(&key, &encode_spilled_row(row)?)?;
        Ok(())
    });
    if let Err(err) = fill {
        spill.close()?;
        return Err(err);
    }

    let mut cursor = spill.cursor(Default::default())?;
    cursor.seek_first();
    let mut result = Ok(());
    while cursor.valid() {
        let value = cursor.value().expect("valid cursor has a value");
        let row = decode_spilled_row(value)?;
        let sorted_env = env.with_row(row);
        if let Err(err) = f(&sorted_env) {
            result = Err(err);
            break;
        }
        cursor.next();
    }
    cursor.close();
    spill.close()?;
    result
}

fn encode_spilled_row(row: &Row) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_uvarint(&mut out, row.table.len() as u64);
    out.extend_from_slice(row.table.as_bytes());
    write_uvarint(&mut out, row.key.len() as u64);
    out.extend_from_slice(&row.key);
    encode_typed(&mut out, &Value::Object(row.object.materialize()?));
    Ok(out)
}

fn decode_spilled_row(buf: &[u8]) -> Result<Row> {
    let (table_len, mut at) = read_uvarint(buf)?;
    let table_end = at + table_len as usize;
    let table = std::str::from_utf8(
        buf.get(at..table_end)
            .ok_or_else(|| Error::Decode("truncated spilled row".into()))?,
    )
    .map_err(|_| Error::Decode("spilled table name is not valid UTF-8".into()))?;
    at = table_end;
    let (key_len, used) = read_uvarint(&buf[at..])?;
    at += used;
    let key_end = at + key_len as usize;
    let key = buf
        .get(at..key_end)
        .ok_or_else(|| Error::Decode("truncated spilled row".into()))?
        .to_vec();
    let (object, _) = decode_typed(&buf[key_end..])?;
    let Value::Object(fields) = object else {
        return Err(Error::Decode("spilled row body is not an object".into()));
    };
    Ok(Row {
        table: CompactString::from(table),
        key,
        object: RowObject::Buffer(fields),
    })
}

pub(super) fn group_aggregate(
    prev: &[Operator],
    group_by: Option<&Expr>,
    aggregates: &[AggregateSpec],
    env: &Environment,
    f: Emit<'_>,
) -> Result<()> {
    let mut last_group: Option<Value> = None;
    let mut current: Option<Vec<Box<dyn Aggregator>>> = None;

    let build = |specs: &[AggregateSpec]| -> Result<Vec<Box<dyn Aggregator>>> {
        specs.iter().map(AggregateSpec::build).collect()
    };

    iterate_ops(prev, env, &mut |out| {
        let group = match group_by {
            Some(expr) => Some(eval(expr, out)?),
            None => None,
        };
        let boundary = match (&last_group, &group) {
            (Some(last), Some(next)) => last != next,
            _ => false,
        };
        if boundary {
            let aggs = current.take().expect("a live group precedes a boundary");
            flush_group(group_by, last_group.take(), aggregates, &aggs, env, f)?;
        }
        if current.is_none() {
            current = Some(build(aggregates)?);
            last_group = group;
        }
        let aggs = current.as_mut().expect("group initialized above");
        for agg in aggs.iter_mut() {
            agg.aggregate(out)?;
        }
        Ok(())
    })?;

    // An empty input still emits one row carrying the aggregators' initial
    // values, so COUNT(*) over an empty table returns 0. That default group
    // carries no group-by field, matching the one-row shape of a global
    // aggregate.
    match current.take() {
        Some(aggs) => flush_group(group_by, last_group.take(), aggregates, &aggs, env, f),
        None => {
            let aggs = build(aggregates)?;
            flush_group(None, None, aggregates, &aggs, env, f)
        }
    }
}

fn flush_group(
    group_by: Option<&Expr>,
    group: Option<Value>,
    specs: &[AggregateSpec],
    aggs: &[Box<dyn Aggregator>],
    env: &Environment,
    f: Emit<'_>,
) -> Result<()> {
    let mut fb = FieldBuffer::new();
    if let (Some(expr), Some(value)) = (group_by, group) {
        fb.add(CompactString::from(expr.to_string()), value);
    }
    for (spec, agg) in specs.iter().zip(aggs.iter()) {
        fb.add(CompactString::from(spec.display.as_str()), agg.finalize()?);
    }
    let out = env.with_row(Row::synthesized(fb));
    f(&out)
}

pub(super) fn rename(
    prev: &[Operator],
    from: &str,
    to: &str,
    env: &Environment,
    f: Emit<'_>,
) -> Result<()> {
    iterate_ops(prev, env, &mut |out| {
        let Some(row) = out.row() else {
            return Err(Error::Validation("missing row".into()));
        };
        let mut fb = row.object.materialize()?;
        fb.rename(from, to);
        let renamed = Row {
            table: row.table.clone(),
            key: row.key.clone(),
            object: RowObject::Buffer(fb),
        };
        let renamed_env = out.with_row(renamed);
        f(&renamed_env)
    })
}
