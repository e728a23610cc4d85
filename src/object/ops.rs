//! `BinaryOp`/`UnaryOp` (§4.1): arithmetic and comparison over the
//! `BinOp`/`UnOp` token set. Unsupported operand combinations raise a
//! typed `OperandTypeError` naming both operand types and the operator,
//! per §4.1.

use std::rc::Rc;

use super::{BinOp, Decimal, UnOp, Value};
use crate::error::RuntimeError;

/// Precision (in bits) new `Decimal` values are computed at, matching the
/// teacher's default `BigFloat` precision (see DESIGN.md).
const DECIMAL_PRECISION: usize = 256;

fn operand_error(op: BinOp, left: &Value, right: &Value) -> RuntimeError {
    RuntimeError::OperandTypeError {
        op: op.to_string(),
        left: left.type_name(),
        right: right.type_name(),
    }
}

/// Widens an `Int`/`Uint`/`Float`/`Decimal` operand to `Decimal`, the way
/// `as_numeric` widens to the `Int`/`Uint`/`Float` tower. Any other variant
/// isn't a `Decimal` operand.
fn as_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Decimal(d) => Some((**d).clone()),
        Value::Int(i) => Some(Decimal::from_f64(*i as f64, DECIMAL_PRECISION)),
        Value::Uint(u) => Some(Decimal::from_f64(*u as f64, DECIMAL_PRECISION)),
        Value::Float(f) => Some(Decimal::from_f64(*f, DECIMAL_PRECISION)),
        _ => None,
    }
}

fn decimal_binary_op(op: BinOp, l: &Decimal, r: &Decimal, orig_left: &Value, orig_right: &Value) -> Result<Value, RuntimeError> {
    use astro_float::RoundingMode;
    match op {
        BinOp::Add => Ok(Value::Decimal(Rc::new(l.add(r, DECIMAL_PRECISION, RoundingMode::ToEven)))),
        BinOp::Sub => Ok(Value::Decimal(Rc::new(l.sub(r, DECIMAL_PRECISION, RoundingMode::ToEven)))),
        BinOp::Mul => Ok(Value::Decimal(Rc::new(l.mul(r, DECIMAL_PRECISION, RoundingMode::ToEven)))),
        BinOp::Div => {
            if r.is_zero() {
                return Err(operand_error(op, orig_left, orig_right));
            }
            Ok(Value::Decimal(Rc::new(l.div(r, DECIMAL_PRECISION, RoundingMode::ToEven))))
        }
        BinOp::Mod => {
            if r.is_zero() {
                return Err(operand_error(op, orig_left, orig_right));
            }
            let quotient = l.div(r, DECIMAL_PRECISION, RoundingMode::ToZero);
            let truncated = quotient.mul(r, DECIMAL_PRECISION, RoundingMode::ToZero);
            Ok(Value::Decimal(Rc::new(l.sub(&truncated, DECIMAL_PRECISION, RoundingMode::ToEven))))
        }
        BinOp::Lt => Ok(Value::Bool(matches!(l.cmp(r), Some(x) if x < 0))),
        BinOp::Le => Ok(Value::Bool(matches!(l.cmp(r), Some(x) if x <= 0))),
        BinOp::Gt => Ok(Value::Bool(matches!(l.cmp(r), Some(x) if x > 0))),
        BinOp::Ge => Ok(Value::Bool(matches!(l.cmp(r), Some(x) if x >= 0))),
    }
}

/// Promotes a numeric pair to the widest representation present
/// (`Float` > `Int`/`Uint`), mirroring ordinary numeric-tower promotion.
enum Numeric {
    Int(i64),
    Uint(u64),
    Float(f64),
}

fn as_numeric(value: &Value) -> Option<Numeric> {
    match value {
        Value::Int(i) => Some(Numeric::Int(*i)),
        Value::Uint(u) => Some(Numeric::Uint(*u)),
        Value::Float(f) => Some(Numeric::Float(*f)),
        _ => None,
    }
}

impl Value {
    /// `BinaryOp(vm, tok, right)`.
    pub fn binary_op(&self, op: BinOp, right: &Value) -> Result<Value, RuntimeError> {
        if matches!(op, BinOp::Add) {
            if let (Value::Str(a), Value::Str(b)) = (self, right) {
                return Ok(Value::str(format!("{a}{b}")));
            }
            if let (Value::RawStr(a), Value::RawStr(b)) = (self, right) {
                return Ok(Value::RawStr(format!("{a}{b}").into()));
            }
            if let (Value::Array(a), Value::Array(b)) = (self, right) {
                let mut out = a.borrow().clone();
                out.extend(b.borrow().iter().cloned());
                return Ok(Value::array(out));
            }
        }

        if matches!(self, Value::Decimal(_)) || matches!(right, Value::Decimal(_)) {
            return match (as_decimal(self), as_decimal(right)) {
                (Some(l), Some(r)) => decimal_binary_op(op, &l, &r, self, right),
                _ => Err(operand_error(op, self, right)),
            };
        }

        let (l, r) = match (as_numeric(self), as_numeric(right)) {
            (Some(l), Some(r)) => (l, r),
            _ => return Err(operand_error(op, self, right)),
        };

        // Both int-like (Int/Uint) and neither float: stay in the
        // integer domain so e.g. `5 / 2 == 2`, matching ordinary
        // scripting-language integer arithmetic.
        let both_integral = !matches!(l, Numeric::Float) && !matches!(r, Numeric::Float);

        if both_integral {
            let (li, ri) = (numeric_as_i64(&l), numeric_as_i64(&r));
            return integer_binary_op(op, li, ri, self, right);
        }

        let (lf, rf) = (numeric_as_f64(&l), numeric_as_f64(&r));
        float_binary_op(op, lf, rf)
    }

    /// `UnaryOp(vm, tok)`.
    pub fn unary_op(&self, op: UnOp) -> Result<Value, RuntimeError> {
        match (op, self) {
            (UnOp::Neg, Value::Int(i)) => Ok(Value::Int(-i)),
            (UnOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
            (UnOp::Neg, Value::Uint(u)) => Ok(Value::Int(-(*u as i64))),
            (UnOp::Neg, Value::Decimal(d)) => Ok(Value::Decimal(Rc::new(d.neg()))),
            (UnOp::Not, other) => Ok(Value::Bool(other.is_falsy())),
            (UnOp::Neg, other) => Err(RuntimeError::OperandTypeError {
                op: "unary -".to_string(),
                left: other.type_name(),
                right: other.type_name(),
            }),
        }
    }
}

fn numeric_as_i64(n: &Numeric) -> i64 {
    match n {
        Numeric::Int(i) => *i,
        Numeric::Uint(u) => *u as i64,
        Numeric::Float(f) => *f as i64,
    }
}

fn numeric_as_f64(n: &Numeric) -> f64 {
    match n {
        Numeric::Int(i) => *i as f64,
        Numeric::Uint(u) => *u as f64,
        Numeric::Float(f) => *f,
    }
}

fn integer_binary_op(
    op: BinOp,
    l: i64,
    r: i64,
    orig_left: &Value,
    orig_right: &Value,
) -> Result<Value, RuntimeError> {
    match op {
        BinOp::Add => Ok(Value::Int(l.wrapping_add(r))),
        BinOp::Sub => Ok(Value::Int(l.wrapping_sub(r))),
        BinOp::Mul => Ok(Value::Int(l.wrapping_mul(r))),
        BinOp::Div => {
            if r == 0 {
                return Err(operand_error(op, orig_left, orig_right));
            }
            Ok(Value::Int(l.wrapping_div(r)))
        }
        BinOp::Mod => {
            if r == 0 {
                return Err(operand_error(op, orig_left, orig_right));
            }
            Ok(Value::Int(l.wrapping_rem(r)))
        }
        BinOp::Lt => Ok(Value::Bool(l < r)),
        BinOp::Le => Ok(Value::Bool(l <= r)),
        BinOp::Gt => Ok(Value::Bool(l > r)),
        BinOp::Ge => Ok(Value::Bool(l >= r)),
    }
}

fn float_binary_op(op: BinOp, l: f64, r: f64) -> Result<Value, RuntimeError> {
    match op {
        BinOp::Add => Ok(Value::Float(l + r)),
        BinOp::Sub => Ok(Value::Float(l - r)),
        BinOp::Mul => Ok(Value::Float(l * r)),
        BinOp::Div => Ok(Value::Float(l / r)),
        BinOp::Mod => Ok(Value::Float(l % r)),
        BinOp::Lt => Ok(Value::Bool(l < r)),
        BinOp::Le => Ok(Value::Bool(l <= r)),
        BinOp::Gt => Ok(Value::Bool(l > r)),
        BinOp::Ge => Ok(Value::Bool(l >= r)),
    }
}
