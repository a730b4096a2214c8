//! Scalar and vector runtime values.

use fresnel_ir::types::{floor_div, floor_mod};
use fresnel_ir::{BinaryOp, ConstValue, ScalarType, UnaryOp};
use smallvec::SmallVec;

use crate::error::{Error, Result};

/// Runtime value: a scalar, or one value per vector lane.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(ConstValue),
    Vector(SmallVec<[ConstValue; 8]>),
}

impl Value {
    pub fn lanes(&self) -> usize {
        match self {
            Value::Scalar(_) => 1,
            Value::Vector(v) => v.len(),
        }
    }

    pub fn lane(&self, i: usize) -> ConstValue {
        match self {
            Value::Scalar(c) => *c,
            Value::Vector(v) => v[i],
        }
    }

    pub fn as_scalar(&self) -> Result<ConstValue> {
        match self {
            Value::Scalar(c) => Ok(*c),
            Value::Vector(_) => Err(Error::TypeError { detail: "expected scalar, found vector".to_string() }),
        }
    }

    pub fn as_int(&self) -> Result<i64> {
        self.as_scalar()?
            .as_int()
            .ok_or_else(|| Error::TypeError { detail: "expected integer value".to_string() })
    }

    pub fn as_bool(&self) -> Result<bool> {
        self.as_scalar()?
            .as_bool()
            .ok_or_else(|| Error::TypeError { detail: "expected boolean value".to_string() })
    }
}

pub fn apply_binary(op: BinaryOp, a: ConstValue, b: ConstValue) -> Result<ConstValue> {
    use ConstValue::*;
    let out = match (op, a, b) {
        (BinaryOp::Add, Int(x), Int(y)) => Int(x + y),
        (BinaryOp::Sub, Int(x), Int(y)) => Int(x - y),
        (BinaryOp::Mul, Int(x), Int(y)) => Int(x * y),
        (BinaryOp::Div, Int(x), Int(y)) if y != 0 => Int(floor_div(x, y)),
        (BinaryOp::Mod, Int(x), Int(y)) if y != 0 => Int(floor_mod(x, y)),
        (BinaryOp::Div | BinaryOp::Mod, Int(_), Int(0)) => {
            return Err(Error::TypeError { detail: "integer division by zero".to_string() })
        }
        (BinaryOp::Min, Int(x), Int(y)) => Int(x.min(y)),
        (BinaryOp::Max, Int(x), Int(y)) => Int(x.max(y)),
        (BinaryOp::Eq, Int(x), Int(y)) => Bool(x == y),
        (BinaryOp::Ne, Int(x), Int(y)) => Bool(x != y),
        (BinaryOp::Lt, Int(x), Int(y)) => Bool(x < y),
        (BinaryOp::Le, Int(x), Int(y)) => Bool(x <= y),
        (BinaryOp::Add, Float(x), Float(y)) => Float(x + y),
        (BinaryOp::Sub, Float(x), Float(y)) => Float(x - y),
        (BinaryOp::Mul, Float(x), Float(y)) => Float(x * y),
        (BinaryOp::Div, Float(x), Float(y)) => Float(x / y),
        (BinaryOp::Min, Float(x), Float(y)) => Float(x.min(y)),
        (BinaryOp::Max, Float(x), Float(y)) => Float(x.max(y)),
        (BinaryOp::Eq, Float(x), Float(y)) => Bool(x == y),
        (BinaryOp::Ne, Float(x), Float(y)) => Bool(x != y),
        (BinaryOp::Lt, Float(x), Float(y)) => Bool(x < y),
        (BinaryOp::Le, Float(x), Float(y)) => Bool(x <= y),
        // Mixed int/float arithmetic promotes to float.
        (_, Int(x), Float(y)) => return apply_binary(op, Float(x as f64), Float(y)),
        (_, Float(x), Int(y)) => return apply_binary(op, Float(x), Float(y as f64)),
        (BinaryOp::And, Bool(x), Bool(y)) => Bool(x && y),
        (BinaryOp::Or, Bool(x), Bool(y)) => Bool(x || y),
        (BinaryOp::Eq, Bool(x), Bool(y)) => Bool(x == y),
        (BinaryOp::Ne, Bool(x), Bool(y)) => Bool(x != y),
        (op, a, b) => {
            return Err(Error::TypeError { detail: format!("cannot apply {op} to {a:?} and {b:?}") })
        }
    };
    Ok(out)
}

pub fn apply_unary(op: UnaryOp, a: ConstValue) -> Result<ConstValue> {
    use ConstValue::*;
    let out = match (op, a) {
        (UnaryOp::Neg, Int(x)) => Int(-x),
        (UnaryOp::Neg, Float(x)) => Float(-x),
        (UnaryOp::Not, Bool(x)) => Bool(!x),
        (UnaryOp::Abs, Int(x)) => Int(x.abs()),
        (UnaryOp::Abs, Float(x)) => Float(x.abs()),
        (UnaryOp::Sqrt, Float(x)) => Float(x.sqrt()),
        (UnaryOp::Sin, Float(x)) => Float(x.sin()),
        (UnaryOp::Cos, Float(x)) => Float(x.cos()),
        (UnaryOp::Exp, Float(x)) => Float(x.exp()),
        (UnaryOp::Sqrt, Int(x)) => Float((x as f64).sqrt()),
        (UnaryOp::Sin, Int(x)) => Float((x as f64).sin()),
        (UnaryOp::Cos, Int(x)) => Float((x as f64).cos()),
        (UnaryOp::Exp, Int(x)) => Float((x as f64).exp()),
        (op, a) => return Err(Error::TypeError { detail: format!("cannot apply {op} to {a:?}") }),
    };
    Ok(out)
}

pub fn apply_cast(ty: ScalarType, v: ConstValue) -> Result<ConstValue> {
    use ConstValue::*;
    let out = match (ty, v) {
        (t, Int(x)) if t.is_int() => Int(x),
        (t, Float(x)) if t.is_float() => Float(x),
        (t, Int(x)) if t.is_float() => Float(x as f64),
        (t, Float(x)) if t.is_int() => Int(x.floor() as i64),
        (ScalarType::Bool, Bool(b)) => Bool(b),
        (ty, v) => return Err(Error::TypeError { detail: format!("cannot cast {v:?} to {ty}") }),
    };
    Ok(out)
}

/// Lanewise lift of a binary operator over scalar/vector operands.
pub fn lift_binary(op: BinaryOp, a: &Value, b: &Value) -> Result<Value> {
    let lanes = a.lanes().max(b.lanes());
    if lanes == 1 {
        return Ok(Value::Scalar(apply_binary(op, a.lane(0), b.lane(0))?));
    }
    let mut out = SmallVec::with_capacity(lanes);
    for i in 0..lanes {
        out.push(apply_binary(op, a.lane(i.min(a.lanes() - 1)), b.lane(i.min(b.lanes() - 1)))?);
    }
    Ok(Value::Vector(out))
}
