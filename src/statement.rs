//! Statement ASTs and their compilation into operator streams.
//!
//! The external parser produces these trees; the driver in `lib.rs` binds
//! parameters, resolves the catalog, runs DDL through the catalog writer and
//! hands compiled streams to the planner.

use crate::catalog::Catalog;
use crate::catalog::schema::{IndexInfo, SequenceInfo, TableInfo};
use crate::encoding::SortOrder;
use crate::error::{Error, Result};
use crate::expr::functions::AggregateSpec;
use crate::expr::{Expr, Path};
use crate::stream::{Operator, ProjectExpr, Stream};

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    CreateTable {
        info: TableInfo,
        if_not_exists: bool,
    },
    CreateIndex {
        info: IndexInfo,
        if_not_exists: bool,
    },
    CreateSequence {
        info: SequenceInfo,
        if_not_exists: bool,
    },
    DropTable {
        name: String,
        if_exists: bool,
    },
    DropIndex {
        name: String,
        if_exists: bool,
    },
    DropSequence {
        name: String,
        if_exists: bool,
    },
    AlterTableRename {
        table: String,
        new_name: String,
    },
    Begin {
        writable: bool,
    },
    Commit,
    Rollback,
    Insert(InsertStmt),
    Update(UpdateStmt),
    Delete(DeleteStmt),
    Select(SelectStmt),
    Explain(Box<Statement>),
}

impl Statement {
    pub fn is_read_only(&self) -> bool {
        matches!(self, Statement::Select(_) | Statement::Explain(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertStmt {
    pub table: String,
    /// Column targets for `VALUES` tuples; empty means declared order.
    pub columns: Vec<String>,
    pub source: InsertSource,
    pub on_conflict: Option<OnConflictAction>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InsertSource {
    /// `VALUES (…), (…)` tuples.
    Values(Vec<Vec<Expr>>),
    /// Full object expressions, one row each.
    Objects(Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnConflictAction {
    DoNothing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStmt {
    pub table: String,
    pub actions: Vec<UpdateAction>,
    pub predicate: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateAction {
    Set { path: Path, expr: Expr },
    Unset { path: Path },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStmt {
    pub table: String,
    pub predicate: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectStmt {
    /// None compiles to a one-row emit: `SELECT 1 + 1` works without FROM.
    pub table: Option<String>,
    /// Empty means `*`.
    pub columns: Vec<ProjectExpr>,
    pub predicate: Option<Expr>,
    pub group_by: Option<Expr>,
    pub order_by: Option<(Expr, SortOrder)>,
    pub distinct: bool,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
}

pub(crate) fn compile_insert(stmt: &InsertStmt, catalog: &Catalog) -> Result<Stream> {
    let info = catalog.get_table(&stmt.table)?;

    let object_exprs: Vec<Expr> = match &stmt.source {
        InsertSource::Objects(exprs) => exprs.clone(),
        InsertSource::Values(rows) => {
            let targets: Vec<String> = if stmt.columns.is_empty() {
                info.field_constraints
                    .fields
                    .iter()
                    .map(|fc| fc.field.to_string())
                    .collect()
            } else {
                stmt.columns.clone()
            };
            let mut exprs = Vec::with_capacity(rows.len());
            for row in rows {
                if row.len() != targets.len() {
                    return Err(Error::Validation(format!(
                        "INSERT expects {} values per row, got {}",
                        targets.len(),
                        row.len()
                    )));
                }
                exprs.push(Expr::Object(
                    targets
                        .iter()
                        .map(|t| t.as_str().into())
                        .zip(row.iter().cloned())
                        .collect(),
                ));
            }
            exprs
        }
    };

    let mut stream = Stream::new(Operator::Emit { exprs: object_exprs }).pipe(Operator::Validate {
        table: stmt.table.clone(),
    });
    if stmt.on_conflict.is_some() {
        // DO NOTHING: an empty alternate stream swallows the conflict.
        stream = stream.pipe(Operator::OnConflict { alt: None });
    }
    stream = stream.pipe(Operator::TableInsert {
        table: stmt.table.clone(),
    });
    for index in catalog.table_indexes(&stmt.table) {
        stream = stream.pipe(Operator::IndexInsert {
            index: index.name.clone(),
        });
    }
    Ok(stream.pipe(Operator::Discard))
}

pub(crate) fn compile_update(stmt: &UpdateStmt, catalog: &Catalog) -> Result<Stream> {
    catalog.get_table(&stmt.table)?;
    let mut stream = Stream::new(Operator::SeqScan {
        table: stmt.table.clone(),
        reverse: false,
    });
    if let Some(predicate) = &stmt.predicate {
        stream = stream.pipe(Operator::Filter {
            expr: predicate.clone(),
        });
    }
    for action in &stmt.actions {
        stream = match action {
            UpdateAction::Set { path, expr } => stream.pipe(Operator::Set {
                path: path.clone(),
                expr: expr.clone(),
            }),
            UpdateAction::Unset { path } => stream.pipe(Operator::Unset { path: path.clone() }),
        };
    }
    stream = stream.pipe(Operator::Validate {
        table: stmt.table.clone(),
    });
    // Old entries (IndexDelete reads the stored row) go right before the
    // replace; new entries follow it.
    let indexes = catalog.table_indexes(&stmt.table);
    for index in &indexes {
        stream = stream.pipe(Operator::IndexDelete {
            index: index.name.clone(),
        });
    }
    stream = stream.pipe(Operator::TableReplace {
        table: stmt.table.clone(),
    });
    for index in &indexes {
        stream = stream.pipe(Operator::IndexInsert {
            index: index.name.clone(),
        });
    }
    Ok(stream.pipe(Operator::Discard))
}

pub(crate) fn compile_delete(stmt: &DeleteStmt, catalog: &Catalog) -> Result<Stream> {
    catalog.get_table(&stmt.table)?;
    let mut stream = Stream::new(Operator::SeqScan {
        table: stmt.table.clone(),
        reverse: false,
    });
    if let Some(predicate) = &stmt.predicate {
        stream = stream.pipe(Operator::Filter {
            expr: predicate.clone(),
        });
    }
    for index in catalog.table_indexes(&stmt.table) {
        stream = stream.pipe(Operator::IndexDelete {
            index: index.name.clone(),
        });
    }
    stream = stream.pipe(Operator::TableDelete {
        table: stmt.table.clone(),
    });
    Ok(stream.pipe(Operator::Discard))
}

pub(crate) fn compile_select(stmt: &SelectStmt, catalog: &Catalog) -> Result<Stream> {
    let mut stream = match &stmt.table {
        Some(table) => {
            catalog.get_table(table)?;
            Stream::new(Operator::SeqScan {
                table: table.clone(),
                reverse: false,
            })
        }
        None => Stream::new(Operator::Emit {
            exprs: vec![Expr::Object(Vec::new())],
        }),
    };
    if let Some(predicate) = &stmt.predicate {
        stream = stream.pipe(Operator::Filter {
            expr: predicate.clone(),
        });
    }

    let aggregates: Vec<AggregateSpec> = stmt
        .columns
        .iter()
        .filter_map(|pe| match pe {
            ProjectExpr::Named { expr, .. } => AggregateSpec::from_expr(expr),
            ProjectExpr::Wildcard => None,
        })
        .collect();

    if !aggregates.is_empty() || stmt.group_by.is_some() {
        stream = compile_aggregate_tail(stmt, aggregates, stream)?;
    } else if !is_plain_wildcard(&stmt.columns) {
        stream = stream.pipe(Operator::Project {
            exprs: stmt.columns.clone(),
        });
    }

    if stmt.distinct {
        stream = stream.pipe(Operator::Distinct);
    }
    if let Some((expr, order)) = &stmt.order_by {
        stream = stream.pipe(Operator::Sort {
            expr: expr.clone(),
            order: *order,
        });
    }
    if let Some(offset) = stmt.offset {
        stream = stream.pipe(Operator::Skip { n: offset });
    }
    if let Some(limit) = stmt.limit {
        stream = stream.pipe(Operator::Take { n: limit });
    }
    Ok(stream)
}

fn is_plain_wildcard(columns: &[ProjectExpr]) -> bool {
    columns.is_empty() || (columns.len() == 1 && matches!(columns[0], ProjectExpr::Wildcard))
}

/// Grouped aggregation: sort by the group key (the planner may elide it),
/// fold with GroupAggregate, then project the requested output columns out
/// of the aggregate row.
fn compile_aggregate_tail(
    stmt: &SelectStmt,
    aggregates: Vec<AggregateSpec>,
    mut stream: Stream,
) -> Result<Stream> {
    if let Some(group) = &stmt.group_by {
        stream = stream.pipe(Operator::Sort {
            expr: group.clone(),
            order: SortOrder::Asc,
        });
    }

    let mut projected = Vec::with_capacity(stmt.columns.len());
    for pe in &stmt.columns {
        let ProjectExpr::Named { expr, alias } = pe else {
            return Err(Error::Validation(
                "wildcard projection is not valid with aggregates".into(),
            ));
        };
        let source_field = if AggregateSpec::from_expr(expr).is_some() {
            expr.to_string()
        } else if stmt.group_by.as_ref() == Some(expr) {
            expr.to_string()
        } else {
            return Err(Error::Validation(format!(
                "column '{expr}' must appear in GROUP BY or inside an aggregate"
            )));
        };
        // The projected column's own display already matches the aggregate's
        // output key, so no alias is needed unless the user gave one.
        projected.push(ProjectExpr::Named {
            expr: Expr::Column(Path::field(source_field)),
            alias: alias.clone(),
        });
    }

    stream = stream.pipe(Operator::GroupAggregate {
        group_by: stmt.group_by.clone(),
        aggregates,
    });
    Ok(stream.pipe(Operator::Project { exprs: projected }))
}

#[cfg(test)]
mod tests {
    use super::{InsertSource, InsertStmt, SelectStmt, compile_insert, compile_select};
    use crate::catalog::schema::{FieldConstraint, TableInfo};
    use crate::catalog::{Catalog, CatalogWriter};
    use crate::expr::Expr;
    use crate::kv::{Engine, MemoryEngine};
    use crate::stream::ProjectExpr;
    use crate::types::ValueType;
    use parking_lot::Mutex;

    fn catalog_with_table() -> Catalog {
        let engine = MemoryEngine::new();
        let batch = engine.batch_session();
        let catalog = Mutex::new(Catalog::default());
        let writer = CatalogWriter::new(batch.as_ref(), &catalog);
        let mut info = TableInfo::new("t");
        for (i, name) in ["a", "b"].iter().enumerate() {
            info.field_constraints
                .add(FieldConstraint {
                    position: i,
                    field: (*name).into(),
                    ty: ValueType::Any,
                    is_primary_key: false,
                    is_not_null: false,
                    default_value: None,
                    anonymous_type: None,
                })
                .unwrap();
        }
        writer.create_table(info, false).unwrap();
        batch.rollback().unwrap();
        catalog.into_inner()
    }

    #[test]
    fn insert_values_map_to_declared_columns() {
        let catalog = catalog_with_table();
        let stmt = InsertStmt {
            table: "t".into(),
            columns: vec![],
            source: InsertSource::Values(vec![vec![Expr::integer(1), Expr::text("x")]]),
            on_conflict: None,
        };
        let stream = compile_insert(&stmt, &catalog).unwrap();
        assert_eq!(
            stream.to_string(),
            "rows.Emit({a: 1, b: \"x\"}) | table.Validate(\"t\") | table.Insert(\"t\") | discard()"
        );
    }

    #[test]
    fn insert_arity_mismatch_is_rejected() {
        let catalog = catalog_with_table();
        let stmt = InsertStmt {
            table: "t".into(),
            columns: vec![],
            source: InsertSource::Values(vec![vec![Expr::integer(1)]]),
            on_conflict: None,
        };
        assert!(compile_insert(&stmt, &catalog).is_err());
    }

    #[test]
    fn count_star_compiles_to_group_aggregate() {
        let catalog = catalog_with_table();
        let stmt = SelectStmt {
            table: Some("t".into()),
            columns: vec![ProjectExpr::expr(Expr::call("COUNT", vec![Expr::Wildcard]))],
            ..Default::default()
        };
        let stream = compile_select(&stmt, &catalog).unwrap();
        assert_eq!(
            stream.to_string(),
            "table.Scan(\"t\") | rows.GroupAggregate(NULL, COUNT(*)) | rows.Project(COUNT(*))"
        );
    }
}
