//! Transaction handles.
//!
//! A transaction wraps one KV session with the catalog snapshot it operates
//! on. Read-only transactions hold a snapshot session; writers hold the
//! engine's single batch session. DDL inside a writer mutates the
//! transaction's own catalog snapshot (copy-on-write); the database installs
//! it only when the batch commits.

use crate::catalog::{Catalog, CatalogWriter, sequence_value_key};
use crate::config::Config;
use crate::encoding::{decode_typed, encode_typed};
use crate::error::{Error, Result};
use crate::kv::{Engine, Session};
use crate::types::Value;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Values handed out but not yet consumed from a sequence's cached block.
struct SequenceCache {
    next: i64,
    remaining: u64,
}

pub struct Transaction {
    session: Arc<dyn Session>,
    engine: Arc<dyn Engine>,
    config: Config,
    catalog: Mutex<Catalog>,
    sequence_caches: Mutex<HashMap<String, SequenceCache>>,
    writable: bool,
}

impl Transaction {
    pub fn new(
        session: Arc<dyn Session>,
        engine: Arc<dyn Engine>,
        config: Config,
        catalog: Catalog,
        writable: bool,
    ) -> Self {
        Self {
            session,
            engine,
            config,
            catalog: Mutex::new(catalog),
            sequence_caches: Mutex::new(HashMap::new()),
            writable,
        }
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    /// Scratch session backing sort spills and distinct sets. Never
    /// committable.
    pub fn transient_session(&self) -> Box<dyn Session> {
        self.engine
            .transient_session(self.config.max_transient_batch_size)
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// The transaction's catalog snapshot. Cheap to clone; reflects this
    /// transaction's own DDL.
    pub fn catalog(&self) -> Catalog {
        self.catalog.lock().clone()
    }

    pub fn catalog_writer(&self) -> Result<CatalogWriter<'_>> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        Ok(CatalogWriter::new(self.session.as_ref(), &self.catalog))
    }

    /// Takes the catalog snapshot out for installation after commit.
    pub(crate) fn final_catalog(&self) -> Catalog {
        self.catalog.lock().clone()
    }

    /// Atomically bumps a sequence, serving from the cached block when one is
    /// live. The persisted current value moves in blocks of `cache` values
    /// under this transaction's batch, so a rollback discards both the bump
    /// and the cached values.
    pub fn sequence_next(&self, name: &str) -> Result<i64> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        let info = self.catalog.lock().get_sequence(name)?;
        let mut caches = self.sequence_caches.lock();
        if let Some(cache) = caches.get_mut(name)
            && cache.remaining > 0
        {
            let value = cache.next;
            cache.remaining -= 1;
            if cache.remaining > 0 {
                cache.next = cache.next.wrapping_add(info.increment_by);
            }
            return Ok(value);
        }

        // Allocate a fresh block and persist its far edge.
        let key = sequence_value_key(name);
        let next = match self.session.get(&key) {
            Ok(bytes) => {
                let (value, _) = decode_typed(&bytes)?;
                match value {
                    Value::Integer(last) => last.checked_add(info.increment_by).ok_or_else(|| {
                        Error::OutOfRange(format!("sequence '{name}' exhausted at {last}"))
                    })?,
                    other => {
                        return Err(Error::Decode(format!(
                            "sequence '{name}' stores a non-integer value: {other}"
                        )));
                    }
                }
            }
            Err(Error::KeyNotFound) => info.start,
            Err(err) => return Err(err),
        };
        if next > info.max || next < info.min {
            return Err(Error::OutOfRange(format!(
                "sequence '{name}' exhausted at {next}"
            )));
        }
        let span = info.increment_by.saturating_mul(info.cache.max(1) as i64 - 1);
        let ceiling = next.saturating_add(span).clamp(info.min, info.max);
        let mut buf = Vec::with_capacity(10);
        encode_typed(&mut buf, &Value::Integer(ceiling));
        self.session.put(&key, &buf)?;
        debug!(sequence = %name, next, ceiling, "sequence block allocated");

        // How many values the clamped block actually holds, beyond the one
        // returned now.
        let increment = i128::from(if info.increment_by == 0 {
            1
        } else {
            info.increment_by
        });
        let block = ((i128::from(ceiling) - i128::from(next)) / increment) as u64;
        caches.insert(
            name.to_string(),
            SequenceCache {
                next: next.wrapping_add(info.increment_by),
                remaining: block,
            },
        );
        Ok(next)
    }
}
