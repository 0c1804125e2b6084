//! Process-wide function registry.
//!
//! Initialized once, read-only afterwards. Scalar functions are stateless
//! value → value maps; aggregate functions are builders producing one
//! stateful [`Aggregator`] per query per group.

use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::expr::Expr;
use crate::expr::eval::eval;
use crate::types::{Value, ValueType, cast, compare};
use compact_str::CompactString;
use once_cell::sync::Lazy;
use rand::Rng;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Scalar,
    Aggregate,
}

pub struct FunctionDef {
    pub name: &'static str,
    pub arity: usize,
    pub kind: FunctionKind,
    scalar: Option<fn(&[Value]) -> Result<Value>>,
}

static REGISTRY: Lazy<HashMap<&'static str, FunctionDef>> = Lazy::new(|| {
    let mut map = HashMap::new();
    let scalars: [(&'static str, usize, fn(&[Value]) -> Result<Value>); 10] = [
        ("floor", 1, scalar_floor),
        ("abs", 1, scalar_abs),
        ("acos", 1, scalar_acos),
        ("acosh", 1, scalar_acosh),
        ("asin", 1, scalar_asin),
        ("asinh", 1, scalar_asinh),
        ("atan", 1, scalar_atan),
        ("atan2", 2, scalar_atan2),
        ("random", 0, scalar_random),
        ("sqrt", 1, scalar_sqrt),
    ];
    for (name, arity, f) in scalars {
        map.insert(
            name,
            FunctionDef {
                name,
                arity,
                kind: FunctionKind::Scalar,
                scalar: Some(f),
            },
        );
    }
    for (name, arity) in [("count", 1), ("sum", 1), ("avg", 1), ("min", 1), ("max", 1)] {
        map.insert(
            name,
            FunctionDef {
                name,
                arity,
                kind: FunctionKind::Aggregate,
                scalar: None,
            },
        );
    }
    map
});

pub fn lookup(name: &str) -> Option<&'static FunctionDef> {
    REGISTRY.get(name.to_ascii_lowercase().as_str())
}

pub fn is_aggregate(name: &str) -> bool {
    lookup(name).is_some_and(|def| def.kind == FunctionKind::Aggregate)
}

pub fn call_scalar(def: &FunctionDef, args: &[Value]) -> Result<Value> {
    if args.len() != def.arity {
        return Err(Error::Validation(format!(
            "{}() expects {} argument(s), got {}",
            def.name,
            def.arity,
            args.len()
        )));
    }
    let f = def.scalar.ok_or_else(|| {
        Error::Validation(format!("{}() is an aggregate function", def.name))
    })?;
    f(args)
}

fn number_as_double(v: &Value) -> Result<Option<f64>> {
    match v {
        Value::Null => Ok(None),
        Value::Integer(i) => Ok(Some(*i as f64)),
        Value::Double(d) => Ok(Some(*d)),
        other => Err(Error::TypeMismatch {
            expected: "number".into(),
            got: other.value_type().as_str().into(),
        }),
    }
}

fn scalar_floor(args: &[Value]) -> Result<Value> {
    match &args[0] {
        Value::Double(d) => Ok(Value::Double(d.floor())),
        Value::Integer(i) => Ok(Value::Integer(*i)),
        other => Err(Error::TypeMismatch {
            expected: "number".into(),
            got: other.value_type().as_str().into(),
        }),
    }
}

fn scalar_abs(args: &[Value]) -> Result<Value> {
    let Some(x) = number_as_double(&args[0])? else {
        return Ok(Value::Null);
    };
    let res = x.abs();
    if matches!(args[0], Value::Integer(_)) {
        return cast(Value::Double(res), ValueType::Integer);
    }
    Ok(Value::Double(res))
}

fn scalar_acos(args: &[Value]) -> Result<Value> {
    let Some(x) = number_as_double(&args[0])? else {
        return Ok(Value::Null);
    };
    if !(-1.0..=1.0).contains(&x) {
        return Err(Error::OutOfRange(
            "acos(arg1) expects arg1 to be within [-1, 1]".into(),
        ));
    }
    Ok(Value::Double(x.acos()))
}

fn scalar_acosh(args: &[Value]) -> Result<Value> {
    let Some(x) = number_as_double(&args[0])? else {
        return Ok(Value::Null);
    };
    if x < 1.0 {
        return Err(Error::OutOfRange("acosh(arg1) expects arg1 >= 1".into()));
    }
    Ok(Value::Double(x.acosh()))
}

fn scalar_asin(args: &[Value]) -> Result<Value> {
    let Some(x) = number_as_double(&args[0])? else {
        return Ok(Value::Null);
    };
    if !(-1.0..=1.0).contains(&x) {
        return Err(Error::OutOfRange(
            "asin(arg1) expects arg1 to be within [-1, 1]".into(),
        ));
    }
    Ok(Value::Double(x.asin()))
}

fn scalar_asinh(args: &[Value]) -> Result<Value> {
    match number_as_double(&args[0])? {
        Some(x) => Ok(Value::Double(x.asinh())),
        None => Ok(Value::Null),
    }
}

fn scalar_atan(args: &[Value]) -> Result<Value> {
    match number_as_double(&args[0])? {
        Some(x) => Ok(Value::Double(x.atan())),
        None => Ok(Value::Null),
    }
}

fn scalar_atan2(args: &[Value]) -> Result<Value> {
    let Some(y) = number_as_double(&args[0])? else {
        return Ok(Value::Null);
    };
    let Some(x) = number_as_double(&args[1])? else {
        return Ok(Value::Null);
    };
    Ok(Value::Double(y.atan2(x)))
}

fn scalar_random(_args: &[Value]) -> Result<Value> {
    Ok(Value::Integer(rand::thread_rng().gen_range(0..i64::MAX)))
}

fn scalar_sqrt(args: &[Value]) -> Result<Value> {
    let x = match &args[0] {
        Value::Integer(i) => *i as f64,
        Value::Double(d) => *d,
        _ => return Ok(Value::Null),
    };
    let res = x.sqrt();
    if res.is_nan() {
        return Ok(Value::Null);
    }
    Ok(Value::Double(res))
}

// ---------------------------------------------------------------------------
// Aggregates

/// One aggregate call as it appears in a statement. `display` is the result
/// column key (`COUNT(*)`), rendered from the original expression.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSpec {
    pub display: String,
    pub func: CompactString,
    pub arg: AggregateArg,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AggregateArg {
    Wildcard,
    Expr(Expr),
}

impl AggregateSpec {
    /// Recognizes `Expr::Function` calls that name an aggregate.
    pub fn from_expr(expr: &Expr) -> Option<Self> {
        let Expr::Function { name, args } = expr else {
            return None;
        };
        if !is_aggregate(name) {
            return None;
        }
        let arg = match args.as_slice() {
            [Expr::Wildcard] => AggregateArg::Wildcard,
            [single] => AggregateArg::Expr(single.clone()),
            _ => return None,
        };
        Some(Self {
            display: expr.to_string(),
            func: CompactString::from(name.to_ascii_lowercase()),
            arg,
        })
    }

    pub fn build(&self) -> Result<Box<dyn Aggregator>> {
        let arg = match &self.arg {
            AggregateArg::Wildcard => None,
            AggregateArg::Expr(e) => Some(e.clone()),
        };
        match self.func.as_str() {
            "count" => Ok(Box::new(CountAggregator { arg, count: 0 })),
            "sum" => Ok(Box::new(SumAggregator {
                arg: self.required_arg()?,
                acc: Value::Null,
            })),
            "avg" => Ok(Box::new(AvgAggregator {
                arg: self.required_arg()?,
                sum: 0.0,
                count: 0,
            })),
            "min" => Ok(Box::new(ExtremeAggregator {
                arg: self.required_arg()?,
                want_min: true,
                best: None,
            })),
            "max" => Ok(Box::new(ExtremeAggregator {
                arg: self.required_arg()?,
                want_min: false,
                best: None,
            })),
            other => Err(Error::Validation(format!(
                "unknown aggregate function '{other}'"
            ))),
        }
    }

    fn required_arg(&self) -> Result<Expr> {
        match &self.arg {
            AggregateArg::Expr(e) => Ok(e.clone()),
            AggregateArg::Wildcard => Err(Error::Validation(format!(
                "{}(*) is not supported; only count(*)",
                self.func
            ))),
        }
    }
}

/// Per-query, per-group aggregate state.
pub trait Aggregator: Send {
    fn aggregate(&mut self, env: &Environment) -> Result<()>;
    fn finalize(&self) -> Result<Value>;
}

struct CountAggregator {
    arg: Option<Expr>,
    count: i64,
}

impl Aggregator for CountAggregator {
    fn aggregate(&mut self, env: &Environment) -> Result<()> {
        match &self.arg {
            None => self.count += 1,
            Some(expr) => {
                if !eval(expr, env)?.is_null() {
                    self.count += 1;
                }
            }
        }
        Ok(())
    }

    fn finalize(&self) -> Result<Value> {
        Ok(Value::Integer(self.count))
    }
}

struct SumAggregator {
    arg: Expr,
    acc: Value,
}

impl Aggregator for SumAggregator {
    fn aggregate(&mut self, env: &Environment) -> Result<()> {
        let v = eval(&self.arg, env)?;
        if !v.value_type().is_number() {
            return Ok(());
        }
        self.acc = if self.acc.is_null() {
            v
        } else {
            crate::types::arith::add(&self.acc, &v)
        };
        Ok(())
    }

    fn finalize(&self) -> Result<Value> {
        Ok(self.acc.clone())
    }
}

struct AvgAggregator {
    arg: Expr,
    sum: f64,
    count: i64,
}

impl Aggregator for AvgAggregator {
    fn aggregate(&mut self, env: &Environment) -> Result<()> {
        match eval(&self.arg, env)? {
            Value::Integer(i) => {
                self.sum += i as f64;
                self.count += 1;
            }
            Value::Double(d) => {
                self.sum += d;
                self.count += 1;
            }
            _ => {}
        }
        Ok(())
    }

    fn finalize(&self) -> Result<Value> {
        if self.count == 0 {
            return Ok(Value::Null);
        }
        Ok(Value::Double(self.sum / self.count as f64))
    }
}

struct ExtremeAggregator {
    arg: Expr,
    want_min: bool,
    best: Option<Value>,
}

impl Aggregator for ExtremeAggregator {
    fn aggregate(&mut self, env: &Environment) -> Result<()> {
        let v = eval(&self.arg, env)?;
        if v.is_null() {
            return Ok(());
        }
        let replace = match &self.best {
            None => true,
            Some(best) => {
                // Numbers compare promoted; everything else falls back to the
                // storage total order.
                let ord = compare(&v, best).unwrap_or_else(|| v.cmp(best));
                if self.want_min {
                    ord.is_lt()
                } else {
                    ord.is_gt()
                }
            }
        };
        if replace {
            self.best = Some(v);
        }
        Ok(())
    }

    fn finalize(&self) -> Result<Value> {
        Ok(self.best.clone().unwrap_or(Value::Null))
    }
}
