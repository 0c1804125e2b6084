//! Rule-based stream rewrites.
//!
//! The planner is cost-agnostic: a fixed, ordered pipeline of syntactic
//! rules. Conjunctions split into per-predicate filters, filters move toward
//! the source, range-shaped predicates turn sequential scans into primary-key
//! or index scans, and sorts already satisfied by the chosen scan's key order
//! disappear (reversing the scan when they ask for the opposite direction).

use crate::catalog::Catalog;
use crate::catalog::schema::TableInfo;
use crate::environment::Environment;
use crate::error::Result;
use crate::expr::eval::eval;
use crate::expr::{BinaryOp, Expr, Path};
use crate::stream::{Operator, ProjectExpr, ScanRange, Stream};
use crate::types::Value;
use tracing::debug;

pub fn optimize(stream: Stream, catalog: &Catalog) -> Result<Stream> {
    let before = stream.to_string();
    let ops = split_and_filters(stream.ops);
    let ops = push_filters_down(ops);
    let ops = filters_to_ranges(ops, catalog)?;
    let ops = eliminate_sorts(ops, catalog)?;
    let optimized = Stream { ops };
    let after = optimized.to_string();
    if before != after {
        debug!(%before, %after, "stream rewritten");
    }
    Ok(optimized)
}

/// Rule 1: split logical conjunctions into consecutive filters.
fn split_and_filters(ops: Vec<Operator>) -> Vec<Operator> {
    let mut out = Vec::with_capacity(ops.len());
    for op in ops {
        match op {
            Operator::Filter { expr } => {
                let mut predicates = Vec::new();
                split_conjunction(expr, &mut predicates);
                for predicate in predicates {
                    out.push(Operator::Filter { expr: predicate });
                }
            }
            other => out.push(other),
        }
    }
    out
}

fn split_conjunction(expr: Expr, out: &mut Vec<Expr>) {
    match expr {
        Expr::Binary {
            op: BinaryOp::And,
            left,
            right,
        } => {
            split_conjunction(*left, out);
            split_conjunction(*right, out);
        }
        other => out.push(other),
    }
}

/// Rule 2: move filters toward the source, past sorts unconditionally and
/// past projections that preserve every column the predicate reads.
fn push_filters_down(mut ops: Vec<Operator>) -> Vec<Operator> {
    let mut changed = true;
    while changed {
        changed = false;
        for i in 1..ops.len() {
            let Operator::Filter { expr } = &ops[i] else {
                continue;
            };
            let movable = match &ops[i - 1] {
                Operator::Sort { .. } => true,
                Operator::Project { exprs } => projection_preserves(expr, exprs),
                _ => false,
            };
            if movable {
                ops.swap(i - 1, i);
                changed = true;
            }
        }
    }
    ops
}

fn projection_preserves(predicate: &Expr, exprs: &[ProjectExpr]) -> bool {
    let mut referenced = Vec::new();
    predicate.referenced_columns(&mut referenced);
    referenced.iter().all(|col| {
        exprs.iter().any(|pe| match pe {
            ProjectExpr::Wildcard => true,
            ProjectExpr::Named {
                expr: Expr::Column(path),
                alias: None,
            } => path.is_single_field() && path.root() == Some(col.as_str()),
            _ => false,
        })
    })
}

// ---------------------------------------------------------------------------
// Rule 3: predicate-to-range.

/// One filter parsed into a column-vs-constant shape usable for ranges.
#[derive(Debug, Clone)]
struct Candidate {
    filter_index: usize,
    column: String,
    kind: CandidateKind,
}

#[derive(Debug, Clone)]
enum CandidateKind {
    Eq(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Between(Value, Value),
}

fn parse_candidate(filter_index: usize, expr: &Expr) -> Option<Candidate> {
    let env = Environment::empty();
    let constant = |e: &Expr| -> Option<Value> {
        if !e.is_constant() {
            return None;
        }
        eval(e, &env).ok()
    };
    let column_of = |e: &Expr| -> Option<String> {
        match e {
            Expr::Column(path) if path.is_single_field() => path.root().map(str::to_string),
            _ => None,
        }
    };

    match expr {
        Expr::Binary { op, left, right } if op.is_comparison() && *op != BinaryOp::Neq => {
            let (column, value, op) = match (column_of(left), column_of(right)) {
                (Some(column), None) => (column, constant(right)?, *op),
                // Constant on the left: flip the comparison around.
                (None, Some(column)) => {
                    let flipped = match op {
                        BinaryOp::Gt => BinaryOp::Lt,
                        BinaryOp::Gte => BinaryOp::Lte,
                        BinaryOp::Lt => BinaryOp::Gt,
                        BinaryOp::Lte => BinaryOp::Gte,
                        other => *other,
                    };
                    (column, constant(left)?, flipped)
                }
                _ => return None,
            };
            if value.is_null() {
                return None;
            }
            let kind = match op {
                BinaryOp::Eq => CandidateKind::Eq(value),
                BinaryOp::Gt => CandidateKind::Gt(value),
                BinaryOp::Gte => CandidateKind::Gte(value),
                BinaryOp::Lt => CandidateKind::Lt(value),
                BinaryOp::Lte => CandidateKind::Lte(value),
                _ => return None,
            };
            Some(Candidate {
                filter_index,
                column,
                kind,
            })
        }
        Expr::In { expr, list } => {
            let column = column_of(expr)?;
            let values = list
                .iter()
                .map(|item| constant(item).filter(|v| !v.is_null()))
                .collect::<Option<Vec<_>>>()?;
            Some(Candidate {
                filter_index,
                column,
                kind: CandidateKind::In(values),
            })
        }
        Expr::Between { expr, low, high } => {
            let column = column_of(expr)?;
            let lo = constant(low).filter(|v| !v.is_null())?;
            let hi = constant(high).filter(|v| !v.is_null())?;
            Some(Candidate {
                filter_index,
                column,
                kind: CandidateKind::Between(lo, hi),
            })
        }
        _ => None,
    }
}

/// Key columns of a rewrite target, in key order.
struct Target {
    kind: TargetKind,
    columns: Vec<String>,
}

enum TargetKind {
    PrimaryKey,
    Index(String),
}

fn targets_for(info: &TableInfo, catalog: &Catalog) -> Vec<Target> {
    let mut targets = Vec::new();
    if let Some(pk) = info.primary_key() {
        let columns: Vec<String> = pk
            .paths
            .iter()
            .filter_map(|p| single_field(p))
            .collect();
        if columns.len() == pk.paths.len() {
            targets.push(Target {
                kind: TargetKind::PrimaryKey,
                columns,
            });
        }
    }
    for index in catalog.table_indexes(&info.name) {
        let columns: Vec<String> = index
            .paths
            .iter()
            .filter_map(|p| single_field(p))
            .collect();
        if columns.len() == index.paths.len() {
            targets.push(Target {
                kind: TargetKind::Index(index.name.clone()),
                columns,
            });
        }
    }
    targets
}

fn single_field(path: &Path) -> Option<String> {
    if path.is_single_field() {
        path.root().map(str::to_string)
    } else {
        None
    }
}

/// A chain of candidates usable against one target: an equality prefix plus
/// at most one trailing range step.
struct Chain {
    consumed: Vec<usize>,
    ranges: Vec<ScanRange>,
    prefix_len: usize,
}

fn build_chain(target: &Target, candidates: &[Candidate]) -> Option<Chain> {
    let mut prefix: Vec<Value> = Vec::new();
    let mut consumed: Vec<usize> = Vec::new();

    for column in &target.columns {
        let on_column: Vec<&Candidate> =
            candidates.iter().filter(|c| &c.column == column).collect();
        if on_column.is_empty() {
            break;
        }
        // An equality extends the prefix and the chain continues.
        if let Some(eq) = on_column
            .iter()
            .find(|c| matches!(c.kind, CandidateKind::Eq(_)))
        {
            let CandidateKind::Eq(value) = &eq.kind else {
                unreachable!()
            };
            prefix.push(value.clone());
            consumed.push(eq.filter_index);
            continue;
        }
        // IN fans out into one point range per value and ends the chain.
        if let Some(in_candidate) = on_column
            .iter()
            .find(|c| matches!(c.kind, CandidateKind::In(_)))
        {
            let CandidateKind::In(values) = &in_candidate.kind else {
                unreachable!()
            };
            consumed.push(in_candidate.filter_index);
            let ranges = values
                .iter()
                .map(|v| {
                    let mut point = prefix.clone();
                    point.push(v.clone());
                    ScanRange::point(point)
                })
                .collect();
            return Some(Chain {
                consumed,
                ranges,
                prefix_len: prefix.len() + 1,
            });
        }
        // Otherwise merge every bound on this column into one range. A
        // candidate is consumed (its filter removed) only when its bounds
        // merged completely; anything else stays behind as a residual filter.
        let mut range = ScanRange {
            min: prefix.clone(),
            max: prefix.clone(),
            inclusive_min: true,
            inclusive_max: true,
        };
        let mut bounded = false;
        for candidate in &on_column {
            let saved = range.clone();
            let merged = match &candidate.kind {
                CandidateKind::Gt(v) => tighten_min(&mut range, prefix.len(), v.clone(), false),
                CandidateKind::Gte(v) => tighten_min(&mut range, prefix.len(), v.clone(), true),
                CandidateKind::Lt(v) => tighten_max(&mut range, prefix.len(), v.clone(), false),
                CandidateKind::Lte(v) => tighten_max(&mut range, prefix.len(), v.clone(), true),
                CandidateKind::Between(lo, hi) => {
                    tighten_min(&mut range, prefix.len(), lo.clone(), true)
                        && tighten_max(&mut range, prefix.len(), hi.clone(), true)
                }
                CandidateKind::Eq(_) | CandidateKind::In(_) => false,
            };
            if merged {
                bounded = true;
                consumed.push(candidate.filter_index);
            } else {
                range = saved;
            }
        }
        if !bounded {
            break;
        }
        // An unbounded side of a bare range (no equality prefix) scans from
        // or to the namespace edge.
        if range.min.len() == prefix.len() && prefix.is_empty() {
            range.min.clear();
        }
        if range.max.len() == prefix.len() && prefix.is_empty() {
            range.max.clear();
        }
        return Some(Chain {
            consumed,
            ranges: vec![range],
            prefix_len: prefix.len() + 1,
        });
    }

    if prefix.is_empty() {
        return None;
    }
    Some(Chain {
        prefix_len: prefix.len(),
        ranges: vec![ScanRange::point(prefix)],
        consumed,
    })
}

/// Narrows the lower bound. Returns false (leaving the range untouched) when
/// the bounds are not semantically comparable, so the caller keeps the
/// original filter instead of merging it away.
fn tighten_min(range: &mut ScanRange, prefix_len: usize, value: Value, inclusive: bool) -> bool {
    if range.min.len() == prefix_len {
        range.min.push(value);
        range.inclusive_min = inclusive;
        return true;
    }
    let current = &range.min[prefix_len];
    let Some(ord) = crate::types::compare(&value, current) else {
        return false;
    };
    if ord.is_gt() || (ord.is_eq() && !inclusive) {
        range.min[prefix_len] = value;
        range.inclusive_min = inclusive;
    }
    true
}

fn tighten_max(range: &mut ScanRange, prefix_len: usize, value: Value, inclusive: bool) -> bool {
    if range.max.len() == prefix_len {
        range.max.push(value);
        range.inclusive_max = inclusive;
        return true;
    }
    let current = &range.max[prefix_len];
    let Some(ord) = crate::types::compare(&value, current) else {
        return false;
    };
    if ord.is_lt() || (ord.is_eq() && !inclusive) {
        range.max[prefix_len] = value;
        range.inclusive_max = inclusive;
    }
    true
}

fn filters_to_ranges(mut ops: Vec<Operator>, catalog: &Catalog) -> Result<Vec<Operator>> {
    let Some(Operator::SeqScan { table, reverse }) = ops.first().cloned() else {
        return Ok(ops);
    };
    let Ok(info) = catalog.get_table(&table) else {
        return Ok(ops);
    };

    let mut candidates = Vec::new();
    for (i, op) in ops.iter().enumerate().skip(1) {
        let Operator::Filter { expr } = op else {
            break;
        };
        if let Some(candidate) = parse_candidate(i, expr) {
            candidates.push(candidate);
        }
    }
    if candidates.is_empty() {
        return Ok(ops);
    }

    // Tie-break: the primary key wins over secondary indexes; among indexes,
    // the longest useful prefix wins. `targets_for` lists the pk first, and
    // the strict > keeps that preference on equal length.
    let mut best: Option<(Chain, TargetKind)> = None;
    for target in targets_for(&info, catalog) {
        if let Some(chain) = build_chain(&target, &candidates) {
            let better = match &best {
                None => true,
                Some((current, _)) => chain.prefix_len > current.prefix_len,
            };
            if better {
                best = Some((chain, target.kind));
            }
        }
    }
    let Some((chain, kind)) = best else {
        return Ok(ops);
    };

    ops[0] = match kind {
        TargetKind::PrimaryKey => Operator::PkScan {
            table,
            ranges: chain.ranges,
            reverse,
        },
        TargetKind::Index(index) => Operator::IndexScan {
            index,
            ranges: chain.ranges,
            reverse,
        },
    };
    let mut doomed = chain.consumed;
    doomed.sort_unstable();
    for index in doomed.into_iter().rev() {
        ops.remove(index);
    }
    Ok(ops)
}

// ---------------------------------------------------------------------------
// Rules 4 and 5: sort elimination and direction reversal.

fn eliminate_sorts(mut ops: Vec<Operator>, catalog: &Catalog) -> Result<Vec<Operator>> {
    // Find the first sort separated from the scan only by filters.
    let mut sort_at = None;
    for (i, op) in ops.iter().enumerate() {
        match op {
            _ if i == 0 => {}
            Operator::Filter { .. } => {}
            Operator::Sort { .. } => {
                sort_at = Some(i);
                break;
            }
            _ => break,
        }
    }
    let Some(sort_at) = sort_at else {
        return Ok(ops);
    };
    let Operator::Sort { expr, order } = ops[sort_at].clone() else {
        return Ok(ops);
    };
    let Expr::Column(sort_path) = &expr else {
        return Ok(ops);
    };
    let Some(sort_column) = single_field(sort_path) else {
        return Ok(ops);
    };

    enum Decision {
        Keep,
        Drop { flip: bool },
        UseIndex { index: String, reverse: bool },
    }

    let decision = match &ops[0] {
        Operator::SeqScan { table, reverse } | Operator::PkScan { table, reverse, .. } => {
            let Ok(info) = catalog.get_table(table) else {
                return Ok(ops);
            };
            let pk_first = info.primary_key().and_then(|pk| {
                pk.paths
                    .first()
                    .and_then(single_field)
                    .map(|col| (col, pk.sort_order.first().copied().unwrap_or_default()))
            });
            match pk_first {
                Some((col, natural)) if col == sort_column => {
                    let effective = if *reverse { natural.reversed() } else { natural };
                    Decision::Drop {
                        flip: effective != order,
                    }
                }
                _ => {
                    // A sequential scan with no ranges can switch to an index
                    // that provides the requested order.
                    let plain_seq = matches!(&ops[0], Operator::SeqScan { .. });
                    let index = catalog
                        .table_indexes(table)
                        .into_iter()
                        .find(|idx| {
                            idx.paths.first().and_then(single_field).as_deref()
                                == Some(sort_column.as_str())
                        });
                    match (plain_seq, index) {
                        (true, Some(idx)) => Decision::UseIndex {
                            reverse: idx.column_order(0) != order,
                            index: idx.name.clone(),
                        },
                        _ => Decision::Keep,
                    }
                }
            }
        }
        Operator::IndexScan { index, reverse, .. } => {
            let Ok(info) = catalog.get_index(index) else {
                return Ok(ops);
            };
            match info.paths.first().and_then(single_field) {
                Some(col) if col == sort_column => {
                    let natural = info.column_order(0);
                    let effective = if *reverse { natural.reversed() } else { natural };
                    Decision::Drop {
                        flip: effective != order,
                    }
                }
                _ => Decision::Keep,
            }
        }
        _ => Decision::Keep,
    };

    match decision {
        Decision::Keep => Ok(ops),
        Decision::Drop { flip } => {
            if flip {
                flip_scan(&mut ops[0]);
            }
            ops.remove(sort_at);
            Ok(ops)
        }
        Decision::UseIndex { index, reverse } => {
            ops[0] = Operator::IndexScan {
                index,
                ranges: Vec::new(),
                reverse,
            };
            ops.remove(sort_at);
            Ok(ops)
        }
    }
}

fn flip_scan(op: &mut Operator) {
    match op {
        Operator::SeqScan { reverse, .. }
        | Operator::PkScan { reverse, .. }
        | Operator::IndexScan { reverse, .. } => *reverse = !*reverse,
        _ => {}
    }
}
