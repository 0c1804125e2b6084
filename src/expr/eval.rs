//! Expression evaluation.
//!
//! `eval` is a pure function of the environment. Comparison operators fold
//! Null per SQL three-valued logic; AND/OR use Kleene truth tables and
//! short-circuit only when the left operand already decides the result.

use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::expr::{BinaryOp, Expr, Path, PathSegment, UnaryOp, functions};
use crate::types::{FieldBuffer, Value, arith, cast, compare};
use std::cmp::Ordering;

pub fn eval(expr: &Expr, env: &Environment) -> Result<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Column(path) => eval_path(path, env),
        Expr::PositionalParam(idx) => env.positional_param(*idx),
        Expr::NamedParam(name) => env.named_param(name),
        Expr::Binary { op, left, right } => eval_binary(*op, left, right, env),
        Expr::Unary { op, expr } => {
            let v = eval(expr, env)?;
            match op {
                UnaryOp::Not => match v {
                    Value::Null => Ok(Value::Null),
                    other => Ok(Value::Boolean(!other.is_truthy())),
                },
                UnaryOp::Neg => Ok(arith::neg(&v)),
            }
        }
        Expr::Cast { expr, target } => cast(eval(expr, env)?, *target),
        Expr::Function { name, args } => {
            let def = functions::lookup(name)
                .ok_or_else(|| Error::Validation(format!("unknown function '{name}'")))?;
            if def.kind == functions::FunctionKind::Aggregate {
                return Err(Error::Validation(format!(
                    "aggregate function '{name}' used outside GROUP BY context"
                )));
            }
            let values = args
                .iter()
                .map(|arg| eval(arg, env))
                .collect::<Result<Vec<_>>>()?;
            functions::call_scalar(def, &values)
        }
        Expr::In { expr, list } => eval_in(expr, list, env),
        Expr::Between { expr, low, high } => {
            let v = eval(expr, env)?;
            let lo = eval(low, env)?;
            let hi = eval(high, env)?;
            if v.is_null() || lo.is_null() || hi.is_null() {
                return Ok(Value::Null);
            }
            let ge_low = compare(&v, &lo).map(Ordering::is_ge).unwrap_or(false);
            let le_high = compare(&v, &hi).map(Ordering::is_le).unwrap_or(false);
            Ok(Value::Boolean(ge_low && le_high))
        }
        Expr::Like { expr, pattern } => {
            let v = eval(expr, env)?;
            let p = eval(pattern, env)?;
            match (v, p) {
                (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
                (Value::Text(s), Value::Text(p)) => Ok(Value::Boolean(like_match(&s, &p))),
                _ => Ok(Value::Boolean(false)),
            }
        }
        Expr::IsNull { expr, negated } => {
            let v = eval(expr, env)?;
            Ok(Value::Boolean(v.is_null() != *negated))
        }
        Expr::Object(fields) => {
            let mut fb = FieldBuffer::with_capacity(fields.len());
            for (name, field_expr) in fields {
                fb.add(name.clone(), eval(field_expr, env)?);
            }
            Ok(Value::Object(fb))
        }
        Expr::Array(items) => {
            let values = items
                .iter()
                .map(|item| eval(item, env))
                .collect::<Result<Vec<_>>>()?;
            Ok(Value::Array(values))
        }
        Expr::NextValueFor(name) => {
            let tx = env.transaction()?;
            tx.sequence_next(name).map(Value::Integer)
        }
        Expr::Wildcard => Err(Error::Validation(
            "wildcard is only valid inside count()".into(),
        )),
    }
}

fn eval_path(path: &Path, env: &Environment) -> Result<Value> {
    let Some(row) = env.row() else {
        return Ok(Value::Null);
    };
    let Some(root) = path.root() else {
        return Ok(Value::Null);
    };
    let Some(mut value) = row.object.get(root)? else {
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

fn eval_binary(op: BinaryOp, left: &Expr, right: &Expr, env: &Environment) -> Result<Value> {
    match op {
        BinaryOp::And => {
            let a = to_3vl(eval(left, env)?);
            if a == Some(false) {
                return Ok(Value::Boolean(false));
            }
            let b = to_3vl(eval(right, env)?);
            Ok(match (a, b) {
                (_, Some(false)) => Value::Boolean(false),
                (Some(true), Some(true)) => Value::Boolean(true),
                _ => Value::Null,
            })
        }
        BinaryOp::Or => {
            let a = to_3vl(eval(left, env)?);
            if a == Some(true) {
                return Ok(Value::Boolean(true));
            }
            let b = to_3vl(eval(right, env)?);
            Ok(match (a, b) {
                (_, Some(true)) => Value::Boolean(true),
                (Some(false), Some(false)) => Value::Boolean(false),
                _ => Value::Null,
            })
        }
        _ => {
            let a = eval(left, env)?;
            let b = eval(right, env)?;
            Ok(apply_binary(op, &a, &b))
        }
    }
}

fn to_3vl(v: Value) -> Option<bool> {
    match v {
        Value::Null => None,
        other => Some(other.is_truthy()),
    }
}

fn apply_binary(op: BinaryOp, a: &Value, b: &Value) -> Value {
    match op {
        BinaryOp::Add => arith::add(a, b),
        BinaryOp::Sub => arith::sub(a, b),
        BinaryOp::Mul => arith::mul(a, b),
        BinaryOp::Div => arith::div(a, b),
        BinaryOp::Mod => arith::rem(a, b),
        BinaryOp::BitAnd => arith::bitand(a, b),
        BinaryOp::BitOr => arith::bitor(a, b),
        BinaryOp::BitXor => arith::bitxor(a, b),
        BinaryOp::Concat => match (a, b) {
            (Value::Text(x), Value::Text(y)) => {
                let mut out = String::with_capacity(x.len() + y.len());
                out.push_str(x);
                out.push_str(y);
                Value::text(out)
            }
            _ => Value::Null,
        },
        BinaryOp::Eq
        | BinaryOp::Neq
        | BinaryOp::Gt
        | BinaryOp::Gte
        | BinaryOp::Lt
        | BinaryOp::Lte => {
            if a.is_null() || b.is_null() {
                return Value::Null;
            }
            match compare(a, b) {
                Some(ord) => Value::Boolean(match op {
                    BinaryOp::Eq => ord.is_eq(),
                    BinaryOp::Neq => !ord.is_eq(),
                    BinaryOp::Gt => ord.is_gt(),
                    BinaryOp::Gte => ord.is_ge(),
                    BinaryOp::Lt => ord.is_lt(),
                    BinaryOp::Lte => ord.is_le(),
                    _ => unreachable!(),
                }),
                // Incomparable cross-type pair: equality is false, Neq is
                // its negation, ordering is false.
                None => Value::Boolean(matches!(op, BinaryOp::Neq)),
            }
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("handled in eval_binary"),
    }
}

fn eval_in(expr: &Expr, list: &[Expr], env: &Environment) -> Result<Value> {
    let needle = eval(expr, env)?;
    if needle.is_null() {
        return Ok(Value::Null);
    }
    let mut saw_unknown = false;
    for item in list {
        let candidate = eval(item, env)?;
        if candidate.is_null() {
            saw_unknown = true;
            continue;
        }
        if compare(&needle, &candidate).is_some_and(|ord| ord.is_eq()) {
            return Ok(Value::Boolean(true));
        }
    }
    if saw_unknown {
        return Ok(Value::Null);
    }
    Ok(Value::Boolean(false))
}

/// SQL LIKE with `%` (any run) and `_` (any single byte).
fn like_match(value: &str, pattern: &str) -> bool {
    let text = value.as_bytes();
    let pat = pattern.as_bytes();
    let mut ti = 0usize;
    let mut pi = 0usize;
    let mut star_pi: Option<usize> = None;
    let mut star_ti = 0usize;

    while ti < text.len() {
        if pi < pat.len() && (pat[pi] == b'_' || pat[pi] == text[ti]) {
            ti += 1;
            pi += 1;
            continue;
        }
        if pi < pat.len() && pat[pi] == b'%' {
            star_pi = Some(pi);
            pi += 1;
            star_ti = ti;
            continue;
        }
        if let Some(saved_pi) = star_pi {
            pi = saved_pi + 1;
            star_ti += 1;
            ti = star_ti;
            continue;
        }
        return false;
    }

    while pi < pat.len() && pat[pi] == b'%' {
        pi += 1;
    }

    pi == pat.len()
}

#[cfg(test)]
mod tests {
    use super::{eval, like_match};
    use crate::environment::Environment;
    use crate::expr::Expr;
    use crate::row::Row;
    use crate::types::{FieldBuffer, Value, ValueType};

    fn env_with(fields: &[(&str, Value)]) -> Environment {
        let mut fb = FieldBuffer::new();
        for (name, value) in fields {
            fb.add(*name, value.clone());
        }
        Environment::empty().with_row(Row::synthesized(fb))
    }

    #[test]
    fn comparisons_with_null_are_null() {
        let env = Environment::empty();
        let e = Expr::Literal(Value::Null).eq(Expr::integer(1));
        assert_eq!(eval(&e, &env).unwrap(), Value::Null);
        let e = Expr::Literal(Value::Null).eq(Expr::Literal(Value::Null));
        assert_eq!(eval(&e, &env).unwrap(), Value::Null);
    }

    #[test]
    fn is_null_pierces_three_valued_logic() {
        let env = Environment::empty();
        let e = Expr::Literal(Value::Null).is_null();
        assert_eq!(eval(&e, &env).unwrap(), Value::Boolean(true));
        let e = Expr::integer(1).is_not_null();
        assert_eq!(eval(&e, &env).unwrap(), Value::Boolean(true));
    }

    #[test]
    fn kleene_and_or() {
        let env = Environment::empty();
        let null = || Expr::Literal(Value::Null);
        let t = || Expr::Literal(Value::Boolean(true));
        let f = || Expr::Literal(Value::Boolean(false));

        assert_eq!(eval(&null().and(f()), &env).unwrap(), Value::Boolean(false));
        assert_eq!(eval(&null().and(t()), &env).unwrap(), Value::Null);
        assert_eq!(eval(&null().or(t()), &env).unwrap(), Value::Boolean(true));
        assert_eq!(eval(&null().or(f()), &env).unwrap(), Value::Null);
    }

    #[test]
    fn concat_requires_text_on_both_sides() {
        let env = Environment::empty();
        let e = Expr::text("a").concat(Expr::text("b"));
        assert_eq!(eval(&e, &env).unwrap(), Value::text("ab"));
        let e = Expr::text("a").concat(Expr::integer(1));
        assert_eq!(eval(&e, &env).unwrap(), Value::Null);
    }

    #[test]
    fn in_list_has_three_valued_semantics() {
        let env = Environment::empty();
        let e = Expr::integer(2).in_list(vec![Expr::integer(1), Expr::integer(2)]);
        assert_eq!(eval(&e, &env).unwrap(), Value::Boolean(true));
        let e = Expr::integer(3).in_list(vec![Expr::integer(1), Expr::Literal(Value::Null)]);
        assert_eq!(eval(&e, &env).unwrap(), Value::Null);
        let e = Expr::integer(3).in_list(vec![Expr::integer(1), Expr::integer(2)]);
        assert_eq!(eval(&e, &env).unwrap(), Value::Boolean(false));
    }

    #[test]
    fn paths_navigate_objects_and_arrays() {
        let mut inner = FieldBuffer::new();
        inner.add("c", Value::Integer(7));
        let env = env_with(&[(
            "a",
            Value::Array(vec![Value::Object(inner), Value::Integer(9)]),
        )]);
        let path = crate::expr::Path::field("a").then_index(0).then_field("c");
        assert_eq!(
            eval(&Expr::Column(path), &env).unwrap(),
            Value::Integer(7)
        );
        let missing = crate::expr::Path::field("a").then_index(5);
        assert_eq!(eval(&Expr::Column(missing), &env).unwrap(), Value::Null);
    }

    #[test]
    fn cast_expression_propagates_errors() {
        let env = Environment::empty();
        let e = Expr::text("abc").cast_as(ValueType::Integer);
        assert!(eval(&e, &env).is_err());
        let e = Expr::text("12").cast_as(ValueType::Integer);
        assert_eq!(eval(&e, &env).unwrap(), Value::Integer(12));
    }

    #[test]
    fn like_wildcards() {
        assert!(like_match("hello", "h%"));
        assert!(like_match("hello", "h_llo"));
        assert!(like_match("hello", "%llo"));
        assert!(!like_match("hello", "h"));
        assert!(like_match("", "%"));
    }

    #[test]
    fn missing_columns_evaluate_to_null() {
        let env = env_with(&[("a", Value::Integer(1))]);
        assert_eq!(
            eval(&Expr::column("missing"), &env).unwrap(),
            Value::Null
        );
    }
}
