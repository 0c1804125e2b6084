//! Expression trees.
//!
//! The external parser produces these; the core only evaluates them.
//! Rendering matters: `Display` output names aggregate result columns and
//! shows up in EXPLAIN, so it is part of the observable surface.

pub mod eval;
pub mod functions;

use crate::types::{Value, ValueType};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathSegment {
    Field(CompactString),
    Index(usize),
}

/// A dotted/indexed access path into a row: `a.b[0].c`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Path(pub Vec<PathSegment>);

impl Path {
    pub fn field(name: impl Into<CompactString>) -> Self {
        Path(vec![PathSegment::Field(name.into())])
    }

    pub fn then_field(mut self, name: impl Into<CompactString>) -> Self {
        self.0.push(PathSegment::Field(name.into()));
        self
    }

    pub fn then_index(mut self, idx: usize) -> Self {
        self.0.push(PathSegment::Index(idx));
        self
    }

    /// The root field name, when the path starts with a field segment.
    pub fn root(&self) -> Option<&str> {
        match self.0.first() {
            Some(PathSegment::Field(name)) => Some(name.as_str()),
            _ => None,
        }
    }

    pub fn is_single_field(&self) -> bool {
        self.0.len() == 1 && matches!(self.0[0], PathSegment::Field(_))
    }
}

impl std::fmt::Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            match segment {
                PathSegment::Field(name) => {
                    if i > 0 {
                        write!(f, ".")?;
                    }
                    write!(f, "{name}")?;
                }
                PathSegment::Index(idx) => write!(f, "[{idx}]")?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    And,
    Or,
    Concat,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Neq | BinaryOp::Gt | BinaryOp::Gte | BinaryOp::Lt | BinaryOp::Lte
        )
    }

    fn as_str(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::Eq => "=",
            BinaryOp::Neq => "!=",
            BinaryOp::Gt => ">",
            BinaryOp::Gte => ">=",
            BinaryOp::Lt => "<",
            BinaryOp::Lte => "<=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Concat => "||",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Literal(Value),
    Column(Path),
    /// Zero-based index into the statement's positional parameters.
    PositionalParam(usize),
    NamedParam(CompactString),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Cast {
        expr: Box<Expr>,
        target: ValueType,
    },
    Function {
        name: CompactString,
        args: Vec<Expr>,
    },
    In {
        expr: Box<Expr>,
        list: Vec<Expr>,
    },
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
    },
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    Object(Vec<(CompactString, Expr)>),
    Array(Vec<Expr>),
    NextValueFor(CompactString),
    /// `*`: valid only as the sole argument of `count`.
    Wildcard,
}

impl Expr {
    pub fn column(name: impl Into<CompactString>) -> Self {
        Expr::Column(Path::field(name))
    }

    pub fn literal(v: Value) -> Self {
        Expr::Literal(v)
    }

    pub fn integer(i: i64) -> Self {
        Expr::Literal(Value::Integer(i))
    }

    pub fn text(s: &str) -> Self {
        Expr::Literal(Value::text(s))
    }

    fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn add(self, rhs: Expr) -> Self {
        Expr::binary(BinaryOp::Add, self, rhs)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn sub(self, rhs: Expr) -> Self {
        Expr::binary(BinaryOp::Sub, self, rhs)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn mul(self, rhs: Expr) -> Self {
        Expr::binary(BinaryOp::Mul, self, rhs)
    }

    pub fn concat(self, rhs: Expr) -> Self {
        Expr::binary(BinaryOp::Concat, self, rhs)
    }

    pub fn eq(self, rhs: Expr) -> Self {
        Expr::binary(BinaryOp::Eq, self, rhs)
    }

    pub fn neq(self, rhs: Expr) -> Self {
        Expr::binary(BinaryOp::Neq, self, rhs)
    }

    pub fn gt(self, rhs: Expr) -> Self {
        Expr::binary(BinaryOp::Gt, self, rhs)
    }

    pub fn gte(self, rhs: Expr) -> Self {
        Expr::binary(BinaryOp::Gte, self, rhs)
    }

    pub fn lt(self, rhs: Expr) -> Self {
        Expr::binary(BinaryOp::Lt, self, rhs)
    }

    pub fn lte(self, rhs: Expr) -> Self {
        Expr::binary(BinaryOp::Lte, self, rhs)
    }

    pub fn and(self, rhs: Expr) -> Self {
        Expr::binary(BinaryOp::And, self, rhs)
    }

    pub fn or(self, rhs: Expr) -> Self {
        Expr::binary(BinaryOp::Or, self, rhs)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Expr::Unary {
            op: UnaryOp::Not,
            expr: Box::new(self),
        }
    }

    pub fn between(self, low: Expr, high: Expr) -> Self {
        Expr::Between {
            expr: Box::new(self),
            low: Box::new(low),
            high: Box::new(high),
        }
    }

    pub fn in_list(self, list: Vec<Expr>) -> Self {
        Expr::In {
            expr: Box::new(self),
            list,
        }
    }

    pub fn is_null(self) -> Self {
        Expr::IsNull {
            expr: Box::new(self),
            negated: false,
        }
    }

    pub fn is_not_null(self) -> Self {
        Expr::IsNull {
            expr: Box::new(self),
            negated: true,
        }
    }

    pub fn cast_as(self, target: ValueType) -> Self {
        Expr::Cast {
            expr: Box::new(self),
            target,
        }
    }

    pub fn call(name: impl Into<CompactString>, args: Vec<Expr>) -> Self {
        Expr::Function {
            name: name.into(),
            args,
        }
    }

    /// True when evaluation cannot depend on any row or parameter: safe to
    /// fold at plan time.
    pub fn is_constant(&self) -> bool {
        match self {
            Expr::Literal(_) => true,
            Expr::Column(_)
            | Expr::PositionalParam(_)
            | Expr::NamedParam(_)
            | Expr::NextValueFor(_)
            | Expr::Wildcard => false,
            Expr::Binary { left, right, .. } => left.is_constant() && right.is_constant(),
            Expr::Unary { expr, .. } => expr.is_constant(),
            Expr::Cast { expr, .. } => expr.is_constant(),
            Expr::Function { name, args } => {
                // random() is the one non-deterministic builtin.
                !name.eq_ignore_ascii_case("random") && args.iter().all(Expr::is_constant)
            }
            Expr::In { expr, list } => expr.is_constant() && list.iter().all(Expr::is_constant),
            Expr::Between { expr, low, high } => {
                expr.is_constant() && low.is_constant() && high.is_constant()
            }
            Expr::Like { expr, pattern } => expr.is_constant() && pattern.is_constant(),
            Expr::IsNull { expr, .. } => expr.is_constant(),
            Expr::Object(fields) => fields.iter().all(|(_, e)| e.is_constant()),
            Expr::Array(items) => items.iter().all(Expr::is_constant),
        }
    }

    /// Root field names of every column reference in this expression.
    pub fn referenced_columns(&self, out: &mut Vec<CompactString>) {
        match self {
            Expr::Column(path) => {
                if let Some(root) = path.root() {
                    let root = CompactString::from(root);
                    if !out.contains(&root) {
                        out.push(root);
                    }
                }
            }
            Expr::Literal(_)
            | Expr::PositionalParam(_)
            | Expr::NamedParam(_)
            | Expr::NextValueFor(_)
            | Expr::Wildcard => {}
            Expr::Binary { left, right, .. } => {
                left.referenced_columns(out);
                right.referenced_columns(out);
            }
            Expr::Unary { expr, .. } | Expr::Cast { expr, .. } | Expr::IsNull { expr, .. } => {
                expr.referenced_columns(out)
            }
            Expr::Function { args, .. } => {
                for arg in args {
                    arg.referenced_columns(out);
                }
            }
            Expr::In { expr, list } => {
                expr.referenced_columns(out);
                for item in list {
                    item.referenced_columns(out);
                }
            }
            Expr::Between { expr, low, high } => {
                expr.referenced_columns(out);
                low.referenced_columns(out);
                high.referenced_columns(out);
            }
            Expr::Like { expr, pattern } => {
                expr.referenced_columns(out);
                pattern.referenced_columns(out);
            }
            Expr::Object(fields) => {
                for (_, e) in fields {
                    e.referenced_columns(out);
                }
            }
            Expr::Array(items) => {
                for item in items {
                    item.referenced_columns(out);
                }
            }
        }
    }
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Literal(v) => write!(f, "{v}"),
            Expr::Column(path) => write!(f, "{path}"),
            Expr::PositionalParam(idx) => write!(f, "${}", idx + 1),
            Expr::NamedParam(name) => write!(f, "${name}"),
            Expr::Binary { op, left, right } => write!(f, "{left} {} {right}", op.as_str()),
            Expr::Unary {
                op: UnaryOp::Not,
                expr,
            } => write!(f, "NOT {expr}"),
            Expr::Unary {
                op: UnaryOp::Neg,
                expr,
            } => write!(f, "-{expr}"),
            Expr::Cast { expr, target } => write!(f, "CAST({expr} AS {target})"),
            Expr::Function { name, args } => {
                write!(f, "{name}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            Expr::In { expr, list } => {
                write!(f, "{expr} IN (")?;
                for (i, item) in list.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
            Expr::Between { expr, low, high } => write!(f, "{expr} BETWEEN {low} AND {high}"),
            Expr::Like { expr, pattern } => write!(f, "{expr} LIKE {pattern}"),
            Expr::IsNull {
                expr,
                negated: false,
            } => write!(f, "{expr} IS NULL"),
            Expr::IsNull {
                expr,
                negated: true,
            } => write!(f, "{expr} IS NOT NULL"),
            Expr::Object(fields) => {
                write!(f, "{{")?;
                for (i, (name, expr)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name}: {expr}")?;
                }
                write!(f, "}}")
            }
            Expr::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Expr::NextValueFor(name) => write!(f, "NEXT VALUE FOR {name}"),
            Expr::Wildcard => write!(f, "*"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Expr, Path};
    use crate::types::Value;

    #[test]
    fn display_renders_sql_shapes() {
        let e = Expr::column("a").gt(Expr::integer(1)).and(
            Expr::column("b")
                .eq(Expr::Literal(Value::text("x")))
                .or(Expr::column("c").is_null()),
        );
        assert_eq!(e.to_string(), "a > 1 AND b = \"x\" OR c IS NULL");
    }

    #[test]
    fn display_renders_paths_and_functions() {
        let path = Path::field("a").then_index(0).then_field("c");
        assert_eq!(path.to_string(), "a[0].c");
        let call = Expr::call("COUNT", vec![Expr::Wildcard]);
        assert_eq!(call.to_string(), "COUNT(*)");
    }

    #[test]
    fn constant_detection_excludes_columns_params_and_random() {
        assert!(Expr::integer(1).add(Expr::integer(2)).is_constant());
        assert!(!Expr::column("a").is_constant());
        assert!(!Expr::PositionalParam(0).is_constant());
        assert!(!Expr::call("random", vec![]).is_constant());
        assert!(Expr::call("floor", vec![Expr::integer(1)]).is_constant());
    }

    #[test]
    fn referenced_columns_are_deduplicated() {
        let e = Expr::column("a")
            .gt(Expr::integer(1))
            .and(Expr::column("a").lt(Expr::column("b")));
        let mut cols = Vec::new();
        e.referenced_columns(&mut cols);
        assert_eq!(cols, vec!["a", "b"]);
    }
}
