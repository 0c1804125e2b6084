//! Streaming operator pipeline.
//!
//! A [`Stream`] is a linear chain of operators executed by pull-based
//! callbacks: downstream pulls by returning from its emit callback, upstream
//! drives by invoking it. The chain is plain data (an enum per operator), so
//! the planner can pattern-match and rewrite it, and `Display` renders the
//! plan for EXPLAIN.
//!
//! The [`Error::StreamClosed`] sentinel short-circuits an upstream source; it
//! is swallowed by the scan loop that raised it or at the top of the stream,
//! and never escapes to the caller.

mod rows;
mod scan;
mod table;

use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::expr::functions::AggregateSpec;
use crate::expr::{Expr, Path};
use crate::encoding::SortOrder;
use crate::types::Value;
use compact_str::CompactString;

pub type Emit<'a> = &'a mut dyn FnMut(&Environment) -> Result<()>;

/// Bounds over one scan dimension, expressed as decoded values. Both sides
/// optional; a point lookup sets `min == max` with both bounds inclusive.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScanRange {
    pub min: Vec<Value>,
    pub max: Vec<Value>,
    pub inclusive_min: bool,
    pub inclusive_max: bool,
}

impl ScanRange {
    pub fn point(values: Vec<Value>) -> Self {
        Self {
            min: values.clone(),
            max: values,
            inclusive_min: true,
            inclusive_max: true,
        }
    }
}

impl std::fmt::Display for ScanRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.min.is_empty() && self.min == self.max && self.inclusive_min && self.inclusive_max
        {
            for (i, v) in self.min.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{v}")?;
            }
            return Ok(());
        }
        let open = if !self.min.is_empty() && self.inclusive_min {
            '['
        } else {
            '('
        };
        let close = if !self.max.is_empty() && self.inclusive_max {
            ']'
        } else {
            ')'
        };
        write!(f, "{open}")?;
        if self.min.is_empty() {
            write!(f, "-inf")?;
        } else {
            for (i, v) in self.min.iter().enumerate() {
                if i > 0 {
                    write!(f, " ")?;
                }
                write!(f, "{v}")?;
            }
        }
        write!(f, ", ")?;
        if self.max.is_empty() {
            write!(f, "+inf")?;
        } else {
            for (i, v) in self.max.iter().enumerate() {
                if i > 0 {
                    write!(f, " ")?;
                }
                write!(f, "{v}")?;
            }
        }
        write!(f, "{close}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProjectExpr {
    /// `*`: every field of the current row, in stored order.
    Wildcard,
    Named { expr: Expr, alias: Option<CompactString> },
}

impl ProjectExpr {
    pub fn expr(expr: Expr) -> Self {
        ProjectExpr::Named { expr, alias: None }
    }

    pub fn aliased(expr: Expr, alias: impl Into<CompactString>) -> Self {
        ProjectExpr::Named {
            expr,
            alias: Some(alias.into()),
        }
    }

    pub fn output_name(&self) -> Option<CompactString> {
        match self {
            ProjectExpr::Wildcard => None,
            ProjectExpr::Named { expr, alias } => Some(match alias {
                Some(alias) => alias.clone(),
                None => CompactString::from(expr.to_string()),
            }),
        }
    }
}

impl std::fmt::Display for ProjectExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProjectExpr::Wildcard => write!(f, "*"),
            ProjectExpr::Named { expr, alias: None } => write!(f, "{expr}"),
            ProjectExpr::Named {
                expr,
                alias: Some(alias),
            } => write!(f, "{expr} AS {alias}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operator {
    SeqScan {
        table: String,
        reverse: bool,
    },
    PkScan {
        table: String,
        ranges: Vec<ScanRange>,
        reverse: bool,
    },
    IndexScan {
        index: String,
        ranges: Vec<ScanRange>,
        reverse: bool,
    },
    /// Synthesizes one row per object-valued expression.
    Emit {
        exprs: Vec<Expr>,
    },
    Filter {
        expr: Expr,
    },
    Project {
        exprs: Vec<ProjectExpr>,
    },
    Set {
        path: Path,
        expr: Expr,
    },
    Unset {
        path: Path,
    },
    Take {
        n: u64,
    },
    Skip {
        n: u64,
    },
    Distinct,
    /// Spills to a transient session keyed by encoded sort key plus arrival
    /// rank, then re-emits in order. Stable within ties.
    Sort {
        expr: Expr,
        order: SortOrder,
    },
    /// Assumes input pre-sorted by the group expression.
    GroupAggregate {
        group_by: Option<Expr>,
        aggregates: Vec<AggregateSpec>,
    },
    Rename {
        from: CompactString,
        to: CompactString,
    },
    /// Re-encodes the row through the table schema, enforcing constraints
    /// and materializing defaults.
    Validate {
        table: String,
    },
    TableInsert {
        table: String,
    },
    TableReplace {
        table: String,
    },
    TableDelete {
        table: String,
    },
    IndexInsert {
        index: String,
    },
    IndexDelete {
        index: String,
    },
    Discard,
    /// Catches constraint violations raised downstream and runs the
    /// alternate stream with the conflicting row bound; `None` means
    /// "do nothing".
    OnConflict {
        alt: Option<Box<Stream>>,
    },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Stream {
    pub ops: Vec<Operator>,
}

impl Stream {
    pub fn new(op: Operator) -> Self {
        Self { ops: vec![op] }
    }

    pub fn pipe(mut self, op: Operator) -> Self {
        self.ops.push(op);
        self
    }

    /// Drives the pipeline, passing each emitted environment to `f`. The
    /// `StreamClosed` sentinel is swallowed here.
    pub fn iterate(&self, env: &Environment, f: Emit<'_>) -> Result<()> {
        match iterate_ops(&self.ops, env, f) {
            Err(Error::StreamClosed) => Ok(()),
            other => other,
        }
    }
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, op) in self.ops.iter().enumerate() {
            if i > 0 {
                write!(f, " | ")?;
            }
            write!(f, "{op}")?;
        }
        Ok(())
    }
}

pub(crate) fn iterate_ops(ops: &[Operator], env: &Environment, f: Emit<'_>) -> Result<()> {
    let Some((op, prev)) = ops.split_last() else {
        return f(env);
    };
    op.iterate(prev, env, f)
}

impl Operator {
    fn iterate(&self, prev: &[Operator], env: &Environment, f: Emit<'_>) -> Result<()> {
        match self {
            Operator::SeqScan { table, reverse } => scan::seq_scan(table, *reverse, env, f),
            Operator::PkScan {
                table,
                ranges,
                reverse,
            } => scan::pk_scan(table, ranges, *reverse, env, f),
            Operator::IndexScan {
                index,
                ranges,
                reverse,
            } => scan::index_scan(index, ranges, *reverse, env, f),
            Operator::Emit { exprs } => scan::emit(exprs, env, f),
            Operator::Filter { expr } => rows::filter(prev, expr, env, f),
            Operator::Project { exprs } => rows::project(prev, exprs, env, f),
            Operator::Set { path, expr } => rows::set(prev, path, expr, env, f),
            Operator::Unset { path } => rows::unset(prev, path, env, f),
            Operator::Take { n } => rows::take(prev, *n, env, f),
            Operator::Skip { n } => rows::skip(prev, *n, env, f),
            Operator::Distinct => rows::distinct(prev, env, f),
            Operator::Sort { expr, order } => rows::sort(prev, expr, *order, env, f),
            Operator::GroupAggregate {
                group_by,
                aggregates,
            } => rows::group_aggregate(prev, group_by.as_ref(), aggregates, env, f),
            Operator::Rename { from, to } => rows::rename(prev, from, to, env, f),
            Operator::Validate { table } => table::validate(prev, table, env, f),
            Operator::TableInsert { table } => table::table_insert(prev, table, env, f),
            Operator::TableReplace { table } => table::table_replace(prev, table, env, f),
            Operator::TableDelete { table } => table::table_delete(prev, table, env, f),
            Operator::IndexInsert { index } => table::index_insert(prev, index, env, f),
            Operator::IndexDelete { index } => table::index_delete(prev, index, env, f),
            Operator::Discard => iterate_ops(prev, env, &mut |_| Ok(())),
            Operator::OnConflict { alt } => on_conflict(prev, alt.as_deref(), env, f),
        }
    }
}

/// Catches constraint violations from downstream emission. The alternate
/// stream runs in a child environment whose current row is the conflicting
/// one; its own output is discarded.
fn on_conflict(
    prev: &[Operator],
    alt: Option<&Stream>,
    env: &Environment,
    f: Emit<'_>,
) -> Result<()> {
    iterate_ops(prev, env, &mut |out| match f(out) {
        Err(err) if err.is_constraint_violation() => {
            let Some(alt) = alt else {
                return Ok(());
            };
            let row = out
                .row()
                .cloned()
                .ok_or_else(|| Error::Validation("missing row in conflict handler".into()))?;
            let mut conflict_row = row;
            if let Error::UniqueViolation { key, .. } = &err {
                conflict_row.key = key.clone();
            }
            let handler_env = out.with_row(conflict_row);
            alt.iterate(&handler_env, &mut |_| Ok(()))
        }
        other => other,
    })
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn ranges(f: &mut std::fmt::Formatter<'_>, ranges: &[ScanRange]) -> std::fmt::Result {
            for range in ranges {
                write!(f, ", {range}")?;
            }
            Ok(())
        }
        match self {
            Operator::SeqScan {
                table,
                reverse: false,
            } => write!(f, "table.Scan({table:?})"),
            Operator::SeqScan {
                table,
                reverse: true,
            } => write!(f, "table.ScanReverse({table:?})"),
            Operator::PkScan {
                table,
                ranges: r,
                reverse,
            } => {
                if *reverse {
                    write!(f, "table.PkScanReverse({table:?}")?;
                } else {
                    write!(f, "table.PkScan({table:?}")?;
                }
                ranges(f, r)?;
                write!(f, ")")
            }
            Operator::IndexScan {
                index,
                ranges: r,
                reverse,
            } => {
                if *reverse {
                    write!(f, "index.ScanReverse({index:?}")?;
                } else {
                    write!(f, "index.Scan({index:?}")?;
                }
                ranges(f, r)?;
                write!(f, ")")
            }
            Operator::Emit { exprs } => {
                write!(f, "rows.Emit(")?;
                for (i, e) in exprs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{e}")?;
                }
                write!(f, ")")
            }
            Operator::Filter { expr } => write!(f, "rows.Filter({expr})"),
            Operator::Project { exprs } => {
                write!(f, "rows.Project(")?;
                for (i, e) in exprs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{e}")?;
                }
                write!(f, ")")
            }
            Operator::Set { path, expr } => write!(f, "paths.Set({path}, {expr})"),
            Operator::Unset { path } => write!(f, "paths.Unset({path})"),
            Operator::Take { n } => write!(f, "rows.Take({n})"),
            Operator::Skip { n } => write!(f, "rows.Skip({n})"),
            Operator::Distinct => write!(f, "rows.Distinct()"),
            Operator::Sort {
                expr,
                order: SortOrder::Asc,
            } => write!(f, "rows.Sort({expr})"),
            Operator::Sort {
                expr,
                order: SortOrder::Desc,
            } => write!(f, "rows.SortReverse({expr})"),
            Operator::GroupAggregate {
                group_by,
                aggregates,
            } => {
                write!(f, "rows.GroupAggregate(")?;
                match group_by {
                    Some(expr) => write!(f, "{expr}")?,
                    None => write!(f, "NULL")?,
                }
                for agg in aggregates {
                    write!(f, ", {}", agg.display)?;
                }
                write!(f, ")")
            }
            Operator::Rename { from, to } => write!(f, "rows.Rename({from}, {to})"),
            Operator::Validate { table } => write!(f, "table.Validate({table:?})"),
            Operator::TableInsert { table } => write!(f, "table.Insert({table:?})"),
            Operator::TableReplace { table } => write!(f, "table.Replace({table:?})"),
            Operator::TableDelete { table } => write!(f, "table.Delete({table:?})"),
            Operator::IndexInsert { index } => write!(f, "index.Insert({index:?})"),
            Operator::IndexDelete { index } => write!(f, "index.Delete({index:?})"),
            Operator::Discard => write!(f, "discard()"),
            Operator::OnConflict { alt: None } => write!(f, "stream.OnConflict(NULL)"),
            Operator::OnConflict { alt: Some(alt) } => write!(f, "stream.OnConflict({alt})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Operator, ProjectExpr, ScanRange, Stream};
    use crate::environment::Environment;
    use crate::expr::{Expr, Path};
    use crate::types::{FieldBuffer, Value};

    fn collect(stream: &Stream) -> Vec<FieldBuffer> {
        let mut rows = Vec::new();
        stream
            .iterate(&Environment::empty(), &mut |out| {
                let row = out.row().expect("emitted env carries a row");
                rows.push(row.object.materialize()?);
                Ok(())
            })
            .expect("stream runs");
        rows
    }

    fn emit_object(fields: Vec<(&str, Expr)>) -> Operator {
        Operator::Emit {
            exprs: vec![Expr::Object(
                fields.into_iter().map(|(n, e)| (n.into(), e)).collect(),
            )],
        }
    }

    #[test]
    fn emit_of_a_non_object_fails() {
        let stream = Stream::new(Operator::Emit {
            exprs: vec![Expr::integer(3).add(Expr::integer(4))],
        });
        let err = stream
            .iterate(&Environment::empty(), &mut |_| Ok(()))
            .unwrap_err();
        assert!(err.to_string().contains("object"));
    }

    #[test]
    fn set_writes_nested_paths_and_drops_unresolvable_rows() {
        // a[0].b = 10 resolves inside the nested object.
        let stream = Stream::new(emit_object(vec![(
            "a",
            Expr::Array(vec![Expr::Object(vec![])]),
        )]))
        .pipe(Operator::Set {
            path: Path::field("a").then_index(0).then_field("b"),
            expr: Expr::integer(10),
        });
        let rows = collect(&stream);
        assert_eq!(rows.len(), 1);
        let Some(Value::Array(items)) = rows[0].get("a").cloned() else {
            panic!("expected array field");
        };
        let Value::Object(inner) = &items[0] else {
            panic!("expected nested object");
        };
        assert_eq!(inner.get("b"), Some(&Value::Integer(10)));

        // a[2] = 10 resolves for a three-element array and drops the
        // one-element row.
        let stream = Stream::new(Operator::Emit {
            exprs: vec![
                Expr::Object(vec![("a".into(), Expr::Array(vec![Expr::integer(1)]))]),
                Expr::Object(vec![(
                    "a".into(),
                    Expr::Array(vec![Expr::integer(1), Expr::integer(2), Expr::integer(3)]),
                )]),
            ],
        })
        .pipe(Operator::Set {
            path: Path::field("a").then_index(2),
            expr: Expr::integer(10),
        });
        let rows = collect(&stream);
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0].get("a"),
            Some(&Value::Array(vec![
                Value::Integer(1),
                Value::Integer(2),
                Value::Integer(10),
            ]))
        );
    }

    #[test]
    fn unset_and_rename_reshape_rows() {
        let stream = Stream::new(emit_object(vec![
            ("a", Expr::integer(1)),
            ("b", Expr::integer(2)),
        ]))
        .pipe(Operator::Unset {
            path: Path::field("b"),
        })
        .pipe(Operator::Rename {
            from: "a".into(),
            to: "renamed".into(),
        })
        .pipe(Operator::Project {
            exprs: vec![ProjectExpr::expr(Expr::column("renamed"))],
        });
        let rows = collect(&stream);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("renamed"), Some(&Value::Integer(1)));
        assert_eq!(rows[0].get("b"), None);
    }

    #[test]
    fn take_short_circuits_without_surfacing_the_sentinel() {
        let stream = Stream::new(Operator::Emit {
            exprs: (0..5)
                .map(|i| Expr::Object(vec![("n".into(), Expr::integer(i))]))
                .collect(),
        })
        .pipe(Operator::Take { n: 2 });
        let rows = collect(&stream);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get("n"), Some(&Value::Integer(1)));
    }

    #[test]
    fn stream_display_joins_operators() {
        let stream = Stream::new(Operator::SeqScan {
            table: "users".into(),
            reverse: false,
        })
        .pipe(Operator::Filter {
            expr: Expr::column("a").gt(Expr::integer(1)),
        })
        .pipe(Operator::Take { n: 10 });
        assert_eq!(
            stream.to_string(),
            "table.Scan(\"users\") | rows.Filter(a > 1) | rows.Take(10)"
        );
    }

    #[test]
    fn range_display_uses_interval_notation() {
        let point = ScanRange::point(vec![Value::Integer(3)]);
        assert_eq!(point.to_string(), "3");
        let range = ScanRange {
            min: vec![Value::Integer(1)],
            max: vec![],
            inclusive_min: false,
            inclusive_max: false,
        };
        assert_eq!(range.to_string(), "(1, +inf)");
    }
}
