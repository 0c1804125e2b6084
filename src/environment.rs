//! Evaluation environments.
//!
//! An environment is one frame of the scope stack an operator pipeline runs
//! in: the current row, the statement's parameter bindings, the transaction
//! handle, and a link to the enclosing frame. Lookup walks outward, so a
//! child frame created for an emitted row still resolves parameters and the
//! transaction from the root frame, and an `OnConflict` handler sees the
//! conflicting row while outer scopes keep their own.

use crate::error::{Error, Result};
use crate::row::Row;
use crate::transaction::Transaction;
use crate::types::Value;
use compact_str::CompactString;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Param {
    pub name: Option<CompactString>,
    pub value: Value,
}

impl Param {
    pub fn positional(value: Value) -> Self {
        Self { name: None, value }
    }

    pub fn named(name: impl Into<CompactString>, value: Value) -> Self {
        Self {
            name: Some(name.into()),
            value,
        }
    }
}

#[derive(Clone)]
pub struct Environment {
    inner: Arc<EnvInner>,
}

struct EnvInner {
    row: Option<Row>,
    params: Arc<Vec<Param>>,
    tx: Option<Arc<Transaction>>,
    outer: Option<Environment>,
}

impl Environment {
    pub fn root(tx: Arc<Transaction>, params: Vec<Param>) -> Self {
        Self {
            inner: Arc::new(EnvInner {
                row: None,
                params: Arc::new(params),
                tx: Some(tx),
                outer: None,
            }),
        }
    }

    /// Environment with no transaction or parameters; enough to evaluate
    /// constant expressions.
    pub fn empty() -> Self {
        Self {
            inner: Arc::new(EnvInner {
                row: None,
                params: Arc::new(Vec::new()),
                tx: None,
                outer: None,
            }),
        }
    }

    /// Child frame binding `row` as the current row.
    pub fn with_row(&self, row: Row) -> Self {
        Self {
            inner: Arc::new(EnvInner {
                row: Some(row),
                params: Arc::new(Vec::new()),
                tx: None,
                outer: Some(self.clone()),
            }),
        }
    }

    pub fn row(&self) -> Option<&Row> {
        let mut env = self;
        loop {
            if let Some(row) = &env.inner.row {
                return Some(row);
            }
            env = env.inner.outer.as_ref()?;
        }
    }

    pub fn transaction(&self) -> Result<&Arc<Transaction>> {
        let mut env = self;
        loop {
            if let Some(tx) = &env.inner.tx {
                return Ok(tx);
            }
            env = env
                .inner
                .outer
                .as_ref()
                .ok_or_else(|| Error::Validation("no transaction in scope".into()))?;
        }
    }

    pub fn positional_param(&self, idx: usize) -> Result<Value> {
        let params = self.find_params();
        params
            .and_then(|p| p.get(idx))
            .map(|p| p.value.clone())
            .ok_or_else(|| Error::Validation(format!("missing positional parameter ${}", idx + 1)))
    }

    pub fn named_param(&self, name: &str) -> Result<Value> {
        let params = self.find_params();
        params
            .and_then(|p| {
                p.iter()
                    .find(|param| param.name.as_deref() == Some(name))
            })
            .map(|p| p.value.clone())
            .ok_or_else(|| Error::Validation(format!("missing named parameter ${name}")))
    }

    fn find_params(&self) -> Option<&Vec<Param>> {
        let mut env = self;
        loop {
            if !env.inner.params.is_empty() {
                return Some(&env.inner.params);
            }
            env = env.inner.outer.as_ref()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Environment, Param};
    use crate::row::Row;
    use crate::types::{FieldBuffer, Value};

    #[test]
    fn row_lookup_walks_outward() {
        let root = Environment::empty();
        assert!(root.row().is_none());

        let mut fb = FieldBuffer::new();
        fb.add("a", Value::Integer(1));
        let child = root.with_row(Row::synthesized(fb));
        let grandchild = child.with_row(Row::synthesized(FieldBuffer::new()));

        assert!(child.row().is_some());
        // The innermost frame wins.
        assert_eq!(grandchild.row().unwrap().object.get("a").unwrap(), None);
    }

    #[test]
    fn params_resolve_from_the_root_frame() {
        let root = Environment {
            inner: std::sync::Arc::new(super::EnvInner {
                row: None,
                params: std::sync::Arc::new(vec![
                    Param::positional(Value::Integer(7)),
                    Param::named("name", Value::text("x")),
                ]),
                tx: None,
                outer: None,
            }),
        };
        let child = root.with_row(Row::synthesized(FieldBuffer::new()));
        assert_eq!(child.positional_param(0).unwrap(), Value::Integer(7));
        assert_eq!(child.named_param("name").unwrap(), Value::text("x"));
        assert!(child.positional_param(5).is_err());
    }
}
