//! Sink operators: table and index mutation, plus schema validation.

use super::{Emit, iterate_ops};
use crate::catalog::schema::{TableConstraintKind, TableInfo};
use crate::catalog::{index_prefix, row_key};
use crate::encoding::EncodedKey;
use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::expr::eval::eval;
use crate::expr::{Path, PathSegment};
use crate::row::{EncodedObject, Row, RowObject, encode_object};
use crate::stream::Operator;
use crate::types::{Value, cast};
use std::sync::Arc;

/// Reads the value at `path` inside a row object. Missing segments resolve
/// to Null.
fn value_at_path(object: &RowObject, path: &Path) -> Result<Value> {
    let Some(root) = path.root() else {
        return Ok(Value::Null);
    };
    let Some(mut value) = object.get(root)? else {
        return Ok(Value::Null);
    };
    for segment in &path.0[1..] {
        value = match (segment, value) {
            (PathSegment::Field(name), Value::Object(fields)) => {
                match fields.get(name.as_str()) {
                    Some(v) => v.clone(),
                    None => return Ok(Value::Null),
                }
            }
            (PathSegment::Index(idx), Value::Array(items)) => match items.get(*idx) {
                Some(v) => v.clone(),
                None => return Ok(Value::Null),
            },
            _ => return Ok(Value::Null),
        };
    }
    Ok(value)
}

/// Re-encodes each row through the table schema (defaults, casts, NOT NULL),
/// then checks CHECK constraints against the encoded result.
pub(super) fn validate(
    prev: &[Operator],
    table: &str,
    env: &Environment,
    f: Emit<'_>,
) -> Result<()> {
    let tx = env.transaction()?;
    let info = tx.catalog().get_table(table)?;
    if info.read_only {
        return Err(Error::Validation(format!(
            "cannot write to read-only table '{table}'"
        )));
    }
    let constraints = Arc::new(info.field_constraints.clone());

    iterate_ops(prev, env, &mut |out| {
        let Some(row) = out.row() else {
            return Err(Error::Validation("missing row".into()));
        };
        let buf = encode_object(&info, out, &row.object)?;
        let validated = Row {
            table: compact_str::CompactString::from(table),
            key: row.key.clone(),
            object: RowObject::Encoded(EncodedObject::new(Arc::clone(&constraints), buf)),
        };
        let validated_env = out.with_row(validated);
        check_table_constraints(&info, &validated_env)?;
        f(&validated_env)
    })
}

/// CHECK constraints pass when the expression is truthy or unknown; only an
/// explicit false fails the row.
fn check_table_constraints(info: &TableInfo, env: &Environment) -> Result<()> {
    for tc in &info.table_constraints {
        if let TableConstraintKind::Check(expr) = &tc.kind {
            let verdict = eval(expr, env)?;
            if !verdict.is_null() && !verdict.is_truthy() {
                return Err(Error::CheckViolation {
                    table: info.name.clone(),
                    constraint: tc.name.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Computes the row's storage key: the encoded declared primary key, or the
/// next rowid from the table's owner sequence.
fn build_row_key(info: &TableInfo, env: &Environment, object: &RowObject) -> Result<Vec<u8>> {
    match info.primary_key() {
        Some(pk) => {
            let mut values = Vec::with_capacity(pk.paths.len());
            for (i, path) in pk.paths.iter().enumerate() {
                let value = value_at_path(object, path)?;
                if value.is_null() {
                    // Primary key columns are implicitly NOT NULL.
                    return Err(Error::NotNullViolation {
                        table: info.name.clone(),
                        column: path.to_string(),
                    });
                }
                values.push(cast(value, pk.types[i])?);
            }
            Ok(EncodedKey::from_values_ordered(&values, &pk.sort_order)?.into_vec())
        }
        None => {
            let sequence = info.rowid_sequence.as_deref().ok_or_else(|| {
                Error::Validation(format!("table '{}' has no rowid sequence", info.name))
            })?;
            let rowid = env.transaction()?.sequence_next(sequence)?;
            Ok(EncodedKey::from_values(&[Value::Integer(rowid)])?.into_vec())
        }
    }
}

pub(super) fn table_insert(
    prev: &[Operator],
    table: &str,
    env: &Environment,
    f: Emit<'_>,
) -> Result<()> {
    let tx = env.transaction()?;
    let catalog = tx.catalog();
    let info = catalog.get_table(table)?;
    let unique_indexes: Vec<_> = catalog
        .table_indexes(table)
        .into_iter()
        .filter(|idx| idx.unique)
        .collect();
    let session = Arc::clone(tx.session());

    iterate_ops(prev, env, &mut |out| {
        let Some(row) = out.row() else {
            return Err(Error::Validation("missing row".into()));
        };
        let pk = build_row_key(&info, out, &row.object)?;
        // Constraints are checked before anything is written, so a caught
        // conflict (ON CONFLICT) leaves no partial row behind.
        let storage_key = row_key(table, &pk);
        if session.exists(&storage_key)? {
            return Err(Error::UniqueViolation {
                constraint: format!("{table}.PRIMARY KEY"),
                key: pk,
            });
        }
        for index in &unique_indexes {
            let values = index_values(&index.paths, &row.object)?;
            let encoded = EncodedKey::from_values_ordered(&values, &index.sort_order)?;
            let mut entry_key = index_prefix(&index.name);
            entry_key.extend_from_slice(encoded.as_slice());
            if session.exists(&entry_key)? {
                return Err(Error::UniqueViolation {
                    constraint: index.name.clone(),
                    key: encoded.into_vec(),
                });
            }
        }
        let body = row_body_bytes(&info, out, row)?;
        session.insert(&storage_key, &body)?;
        let inserted = Row {
            table: row.table.clone(),
            key: pk,
            object: row.object.clone(),
        };
        let inserted_env = out.with_row(inserted);
        f(&inserted_env)
    })
}

pub(super) fn table_replace(
    prev: &[Operator],
    table: &str,
    env: &Environment,
    f: Emit<'_>,
) -> Result<()> {
    let tx = env.transaction()?;
    let info = tx.catalog().get_table(table)?;
    let session = Arc::clone(tx.session());

    iterate_ops(prev, env, &mut |out| {
        let Some(row) = out.row() else {
            return Err(Error::Validation("missing row".into()));
        };
        if row.key.is_empty() {
            return Err(Error::Validation("replace requires a keyed row".into()));
        }
        let body = row_body_bytes(&info, out, row)?;
        session.put(&row_key(table, &row.key), &body)?;
        f(out)
    })
}

pub(super) fn table_delete(
    prev: &[Operator],
    table: &str,
    env: &Environment,
    f: Emit<'_>,
) -> Result<()> {
    let tx = env.transaction()?;
    let info = tx.catalog().get_table(table)?;
    if info.read_only {
        return Err(Error::Validation(format!(
            "cannot write to read-only table '{table}'"
        )));
    }
    let session = Arc::clone(tx.session());

    iterate_ops(prev, env, &mut |out| {
        let Some(row) = out.row() else {
            return Err(Error::Validation("missing row".into()));
        };
        session.delete(&row_key(table, &row.key))?;
        f(out)
    })
}

/// The stored body of a row: its object re-encoded against the schema when
/// it is not already an encoded view over this table's constraints.
fn row_body_bytes(info: &TableInfo, env: &Environment, row: &Row) -> Result<Vec<u8>> {
    match &row.object {
        RowObject::Encoded(eo) => Ok(eo.bytes().to_vec()),
        other => encode_object(info, env, other),
    }
}

pub(super) fn index_insert(
    prev: &[Operator],
    index: &str,
    env: &Environment,
    f: Emit<'_>,
) -> Result<()> {
    let tx = env.transaction()?;
    let info = tx.catalog().get_index(index)?;
    let session = Arc::clone(tx.session());
    let prefix = index_prefix(index);

    iterate_ops(prev, env, &mut |out| {
        let Some(row) = out.row() else {
            return Err(Error::Validation("missing row".into()));
        };
        let values = index_values(&info.paths, &row.object)?;
        let encoded = EncodedKey::from_values_ordered(&values, &info.sort_order)?;
        let mut entry_key = prefix.clone();
        entry_key.extend_from_slice(encoded.as_slice());
        if info.unique {
            match session.insert(&entry_key, &row.key) {
                Ok(()) => {}
                Err(Error::UniqueViolation { .. }) => {
                    return Err(Error::UniqueViolation {
                        constraint: index.to_string(),
                        key: encoded.into_vec(),
                    });
                }
                Err(err) => return Err(err),
            }
        } else {
            // Non-unique entries append the primary key to stay distinct.
            entry_key.extend_from_slice(&row.key);
            session.put(&entry_key, &row.key)?;
        }
        f(out)
    })
}

/// Deletes the index entry of the *stored* row under the current row's key.
/// Reading the stored row (rather than the in-flight object) means the entry
/// removed is the one built from the old values, even when the pipeline has
/// already rewritten the row object.
pub(super) fn index_delete(
    prev: &[Operator],
    index: &str,
    env: &Environment,
    f: Emit<'_>,
) -> Result<()> {
    let tx = env.transaction()?;
    let catalog = tx.catalog();
    let info = catalog.get_index(index)?;
    let table_info = catalog.get_table(&info.table)?;
    let constraints = Arc::new(table_info.field_constraints.clone());
    let session = Arc::clone(tx.session());
    let prefix = index_prefix(index);

    iterate_ops(prev, env, &mut |out| {
        let Some(row) = out.row() else {
            return Err(Error::Validation("missing row".into()));
        };
        let stored = match session.get(&row_key(&info.table, &row.key)) {
            Ok(bytes) => {
                RowObject::Encoded(EncodedObject::new(Arc::clone(&constraints), bytes))
            }
            // No stored row means no entry to remove.
            Err(Error::KeyNotFound) => return f(out),
            Err(err) => return Err(err),
        };
        let values = index_values(&info.paths, &stored)?;
        let encoded = EncodedKey::from_values_ordered(&values, &info.sort_order)?;
        let mut entry_key = prefix.clone();
        entry_key.extend_from_slice(encoded.as_slice());
        if !info.unique {
            entry_key.extend_from_slice(&row.key);
        }
        match session.delete(&entry_key) {
            // Entries can legitimately be absent (rows inserted before the
            // index existed are handled by the backfill stream).
            Ok(()) | Err(Error::KeyNotFound) => {}
            Err(err) => return Err(err),
        }
        f(out)
    })
}

fn index_values(paths: &[Path], object: &RowObject) -> Result<Vec<Value>> {
    paths
        .iter()
        .map(|path| value_at_path(object, path))
        .collect()
}
