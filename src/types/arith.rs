//! Numeric arithmetic over [`Value`]s.
//!
//! Integer-only `+ - *` stay integer and wrap on overflow. Integer division
//! truncates toward zero; any zero divisor yields Null. A Double operand
//! promotes the whole operation to Double, and NaN results collapse to Null.
//! Bitwise operators on Doubles truncate to i64 first. Non-numeric operands
//! yield Null.

use crate::types::Value;

fn wrap_double(x: f64) -> Value {
    if x.is_nan() {
        Value::Null
    } else {
        Value::Double(x)
    }
}

fn as_pair(a: &Value, b: &Value) -> Option<NumericPair> {
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => Some(NumericPair::Ints(*x, *y)),
        (Value::Integer(x), Value::Double(y)) => Some(NumericPair::Doubles(*x as f64, *y)),
        (Value::Double(x), Value::Integer(y)) => Some(NumericPair::Doubles(*x, *y as f64)),
        (Value::Double(x), Value::Double(y)) => Some(NumericPair::Doubles(*x, *y)),
        _ => None,
    }
}

enum NumericPair {
    Ints(i64, i64),
    Doubles(f64, f64),
}

pub fn add(a: &Value, b: &Value) -> Value {
    match as_pair(a, b) {
        Some(NumericPair::Ints(x, y)) => Value::Integer(x.wrapping_add(y)),
        Some(NumericPair::Doubles(x, y)) => wrap_double(x + y),
        None => Value::Null,
    }
}

pub fn sub(a: &Value, b: &Value) -> Value {
    match as_pair(a, b) {
        Some(NumericPair::Ints(x, y)) => Value::Integer(x.wrapping_sub(y)),
        Some(NumericPair::Doubles(x, y)) => wrap_double(x - y),
        None => Value::Null,
    }
}

pub fn mul(a: &Value, b: &Value) -> Value {
    match as_pair(a, b) {
        Some(NumericPair::Ints(x, y)) => Value::Integer(x.wrapping_mul(y)),
        Some(NumericPair::Doubles(x, y)) => wrap_double(x * y),
        None => Value::Null,
    }
}

pub fn div(a: &Value, b: &Value) -> Value {
    match as_pair(a, b) {
        Some(NumericPair::Ints(_, 0)) => Value::Null,
        Some(NumericPair::Ints(x, y)) => Value::Integer(x.wrapping_div(y)),
        Some(NumericPair::Doubles(_, y)) if y == 0.0 => Value::Null,
        Some(NumericPair::Doubles(x, y)) => wrap_double(x / y),
        None => Value::Null,
    }
}

pub fn rem(a: &Value, b: &Value) -> Value {
    match as_pair(a, b) {
        Some(NumericPair::Ints(_, 0)) => Value::Null,
        Some(NumericPair::Ints(x, y)) => Value::Integer(x.wrapping_rem(y)),
        Some(NumericPair::Doubles(x, y)) => wrap_double(x % y),
        None => Value::Null,
    }
}

fn truncated(a: &Value, b: &Value) -> Option<(i64, i64)> {
    match as_pair(a, b) {
        Some(NumericPair::Ints(x, y)) => Some((x, y)),
        Some(NumericPair::Doubles(x, y)) => Some((x as i64, y as i64)),
        None => None,
    }
}

pub fn bitand(a: &Value, b: &Value) -> Value {
    match truncated(a, b) {
        Some((x, y)) => Value::Integer(x & y),
        None => Value::Null,
    }
}

pub fn bitor(a: &Value, b: &Value) -> Value {
    match truncated(a, b) {
        Some((x, y)) => Value::Integer(x | y),
        None => Value::Null,
    }
}

pub fn bitxor(a: &Value, b: &Value) -> Value {
    match truncated(a, b) {
        Some((x, y)) => Value::Integer(x ^ y),
        None => Value::Null,
    }
}

pub fn neg(v: &Value) -> Value {
    match v {
        Value::Integer(x) => Value::Integer(x.wrapping_neg()),
        Value::Double(x) => Value::Double(-x),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    #[test]
    fn int_ops_stay_integer_and_wrap() {
        assert_eq!(
            add(&Value::Integer(i64::MAX), &Value::Integer(1)),
            Value::Integer(i64::MIN)
        );
        assert_eq!(
            mul(&Value::Integer(2), &Value::Integer(3)),
            Value::Integer(6)
        );
    }

    #[test]
    fn int_division_truncates_toward_zero() {
        assert_eq!(
            div(&Value::Integer(-7), &Value::Integer(2)),
            Value::Integer(-3)
        );
        assert_eq!(
            div(&Value::Integer(7), &Value::Integer(2)),
            Value::Integer(3)
        );
    }

    #[test]
    fn zero_divisors_yield_null() {
        assert_eq!(div(&Value::Integer(1), &Value::Integer(0)), Value::Null);
        assert_eq!(div(&Value::Double(1.0), &Value::Double(0.0)), Value::Null);
        assert_eq!(rem(&Value::Integer(1), &Value::Integer(0)), Value::Null);
    }

    #[test]
    fn double_operand_promotes() {
        assert_eq!(
            add(&Value::Integer(1), &Value::Double(0.5)),
            Value::Double(1.5)
        );
    }

    #[test]
    fn nan_collapses_to_null() {
        assert_eq!(
            rem(&Value::Double(f64::INFINITY), &Value::Double(2.0)),
            Value::Null
        );
    }

    #[test]
    fn bitwise_on_doubles_truncates() {
        assert_eq!(
            bitand(&Value::Double(6.9), &Value::Integer(3)),
            Value::Integer(2)
        );
    }

    #[test]
    fn non_numeric_operands_yield_null() {
        assert_eq!(add(&Value::text("a"), &Value::Integer(1)), Value::Null);
        assert_eq!(neg(&Value::text("a")), Value::Null);
    }
}
