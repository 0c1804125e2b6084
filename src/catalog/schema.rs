use crate::encoding::SortOrder;
use crate::error::{Error, Result};
use crate::expr::{Expr, Path};
use crate::types::ValueType;
use compact_str::CompactString;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConstraint {
    pub position: usize,
    pub field: CompactString,
    pub ty: ValueType,
    #[serde(default)]
    pub is_primary_key: bool,
    #[serde(default)]
    pub is_not_null: bool,
    #[serde(default)]
    pub default_value: Option<Expr>,
    /// For object-typed columns, the nested constraints the object must obey.
    #[serde(default)]
    pub anonymous_type: Option<Box<FieldConstraints>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldConstraints {
    pub fields: Vec<FieldConstraint>,
    #[serde(default)]
    pub allow_extra_fields: bool,
}

impl FieldConstraints {
    /// Appends a constraint, enforcing unique names, contiguous positions and
    /// a single primary-key column.
    pub fn add(&mut self, fc: FieldConstraint) -> Result<()> {
        if self.fields.iter().any(|f| f.field == fc.field) {
            return Err(Error::Validation(format!(
                "duplicate field constraint for '{}'",
                fc.field
            )));
        }
        if fc.position != self.fields.len() {
            return Err(Error::Validation(format!(
                "field constraint '{}' out of position: got {}, want {}",
                fc.field,
                fc.position,
                self.fields.len()
            )));
        }
        if fc.is_primary_key && self.fields.iter().any(|f| f.is_primary_key) {
            return Err(Error::Validation(
                "only one field constraint may be the primary key".into(),
            ));
        }
        self.fields.push(fc);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&FieldConstraint> {
        self.fields.iter().find(|f| f.field == name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.field == name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TableConstraintKind {
    Check(Expr),
    Unique {
        paths: Vec<Path>,
        sort_order: Vec<SortOrder>,
    },
    PrimaryKey {
        paths: Vec<Path>,
        sort_order: Vec<SortOrder>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableConstraint {
    pub name: String,
    pub kind: TableConstraintKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    pub field_constraints: FieldConstraints,
    #[serde(default)]
    pub table_constraints: Vec<TableConstraint>,
    #[serde(default)]
    pub read_only: bool,
    /// Name of the sequence generating rowids when no primary key was
    /// declared. Set by the driver at CREATE TABLE time.
    #[serde(default)]
    pub rowid_sequence: Option<String>,
}

/// Resolved primary key of a table: the declaring paths, their declared
/// types, and the per-column sort direction used by the key codec.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryKey {
    pub paths: Vec<Path>,
    pub types: Vec<ValueType>,
    pub sort_order: Vec<SortOrder>,
}

impl TableInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// The user-declared primary key: either a single flagged field
    /// constraint or a composite PRIMARY KEY table constraint. None means
    /// rows are keyed by the implicit rowid sequence.
    pub fn primary_key(&self) -> Option<PrimaryKey> {
        for tc in &self.table_constraints {
            if let TableConstraintKind::PrimaryKey { paths, sort_order } = &tc.kind {
                let types = paths
                    .iter()
                    .map(|p| {
                        p.root()
                            .and_then(|root| self.field_constraints.get(root))
                            .map(|fc| fc.ty)
                            .unwrap_or(ValueType::Any)
                    })
                    .collect();
                return Some(PrimaryKey {
                    paths: paths.clone(),
                    types,
                    sort_order: sort_order.clone(),
                });
            }
        }
        let fc = self.field_constraints.fields.iter().find(|f| f.is_primary_key)?;
        Some(PrimaryKey {
            paths: vec![Path::field(fc.field.clone())],
            types: vec![fc.ty],
            sort_order: vec![SortOrder::Asc],
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub table: String,
    pub paths: Vec<Path>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub sort_order: Vec<SortOrder>,
}

impl IndexInfo {
    pub fn column_order(&self, i: usize) -> SortOrder {
        self.sort_order.get(i).copied().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceInfo {
    pub name: String,
    #[serde(default)]
    pub owner_table: Option<String>,
    pub increment_by: i64,
    pub min: i64,
    pub max: i64,
    pub start: i64,
    pub cache: u64,
}

impl SequenceInfo {
    /// The implicit rowid sequence created for tables without a declared
    /// primary key.
    pub fn rowid_for(table: &str) -> Self {
        Self {
            name: format!("{table}_seq"),
            owner_table: Some(table.to_string()),
            increment_by: 1,
            min: 1,
            max: i64::MAX,
            start: 1,
            cache: 64,
        }
    }
}
