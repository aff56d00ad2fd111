//! Built-in arithmetic and comparison on typed values
//!
//! Integer typed values compute in 64 bits and wrap; the result is
//! unsigned when either operand is `uint64_t`. Anything involving a
//! floating operand computes as a host number. Pointers support
//! `p + i`, `i + p`, `p - i` and `p - q`. Struct and union values only
//! compare for identity.

use std::sync::Arc;

use super::convert::{deref, load_float, load_int};
use super::{CData, Storage};
use crate::core::{CKind, CType};
use crate::engine::EngineState;
use crate::errors::{ErrorKind, FfiError, FfiResult};
use crate::host::Value;
use crate::metatype::MetaOp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
}

impl ArithOp {
    /// Metamethod consulted before the built-in
    pub const fn meta(self) -> MetaOp {
        match self {
            Self::Add => MetaOp::Add,
            Self::Sub => MetaOp::Sub,
            Self::Mul => MetaOp::Mul,
            Self::Div => MetaOp::Div,
            Self::Mod => MetaOp::Mod,
            Self::Pow => MetaOp::Pow,
            Self::IDiv => MetaOp::IDiv,
            Self::BAnd => MetaOp::BAnd,
            Self::BOr => MetaOp::BOr,
            Self::BXor => MetaOp::BXor,
            Self::Shl => MetaOp::Shl,
            Self::Shr => MetaOp::Shr,
        }
    }

    fn is_bitwise(self) -> bool {
        matches!(self, Self::BAnd | Self::BOr | Self::BXor | Self::Shl | Self::Shr)
    }
}

#[derive(Debug, Clone)]
enum Operand {
    /// Two's complement bits; `boxed` when it came from an 8-byte typed value
    Int { bits: u64, unsigned: bool, boxed: bool },
    Num(f64),
    Ptr { ty: CType, elem: CType, addr: usize },
    /// Struct or union value; only equality applies, by address
    Record { addr: usize },
}

fn classify(value: &Value) -> Option<Operand> {
    match value {
        Value::Integer(i) => Some(Operand::Int {
            bits: *i as u64,
            unsigned: false,
            boxed: false,
        }),
        Value::Number(n) => Some(Operand::Num(*n)),
        Value::CData(cd) if !cd.is_type_marker() => classify_cdata(cd),
        _ => None,
    }
}

fn classify_cdata(cd: &CData) -> Option<Operand> {
    let (ty, addr) = deref(cd);
    // SAFETY: scalar values are stored inline at `addr`
    unsafe {
        if ty.is_integer() || ty.is_bool() {
            let v = if ty.is_bool() { i128::from(*addr != 0) } else { load_int(&ty, addr) };
            return Some(Operand::Int {
                bits: v as i64 as u64,
                unsigned: ty.is_unsigned() && ty.alloc_size() == Some(8),
                boxed: ty.alloc_size() == Some(8),
            });
        }
        if ty.is_float() {
            return Some(Operand::Num(load_float(&ty, addr)));
        }
    }
    match ty.kind() {
        CKind::Pointer(elem) => Some(Operand::Ptr {
            ty: ty.clone(),
            elem: elem.clone(),
            addr: cd.pointer_value().unwrap_or(std::ptr::null_mut()) as usize,
        }),
        CKind::Array { elem, .. } => Some(Operand::Ptr {
            ty: elem.pointer_to(),
            elem: elem.clone(),
            addr: addr as usize,
        }),
        CKind::Function(_) => Some(Operand::Ptr {
            ty: ty.clone(),
            elem: ty.clone(),
            addr: cd.pointer_value().unwrap_or(std::ptr::null_mut()) as usize,
        }),
        CKind::Record(_) => Some(Operand::Record { addr: addr as usize }),
        _ => None,
    }
}

fn describe(value: &Value) -> String {
    super::convert::describe(value)
}

fn arith_error(a: &Value, b: &Value) -> FfiError {
    FfiError::type_mismatch(format!(
        "attempt to perform arithmetic on '{}' and '{}'",
        describe(a),
        describe(b)
    ))
}

fn int_result(state: &Arc<EngineState>, bits: u64, unsigned: bool, boxed: bool) -> FfiResult<Value> {
    if boxed && state.config.host.box_64bit_integers {
        let ty = if unsigned { CType::ullong() } else { CType::llong() };
        let storage = Storage::from_bytes(&bits.to_ne_bytes(), 8)?;
        return Ok(Value::CData(CData::inline(state, ty, storage)));
    }
    if unsigned && bits > i64::MAX as u64 {
        Ok(Value::Number(bits as f64))
    } else {
        Ok(Value::Integer(bits as i64))
    }
}

fn ipow(base: u64, mut exp: u64) -> u64 {
    let mut acc: u64 = 1;
    let mut b = base;
    while exp > 0 {
        if exp & 1 == 1 {
            acc = acc.wrapping_mul(b);
        }
        b = b.wrapping_mul(b);
        exp >>= 1;
    }
    acc
}

fn int_op(op: ArithOp, a: u64, b: u64, unsigned: bool) -> FfiResult<u64> {
    let (sa, sb) = (a as i64, b as i64);
    let divides = matches!(op, ArithOp::Div | ArithOp::Mod | ArithOp::IDiv);
    if divides && b == 0 {
        return Err(ErrorKind::DivisionByZero.into());
    }

    Ok(match op {
        ArithOp::Add => a.wrapping_add(b),
        ArithOp::Sub => a.wrapping_sub(b),
        ArithOp::Mul => a.wrapping_mul(b),
        ArithOp::Div if unsigned => a / b,
        ArithOp::Div => sa.wrapping_div(sb) as u64,
        ArithOp::Mod if unsigned => a % b,
        ArithOp::Mod => {
            let r = sa.wrapping_rem(sb);
            if r != 0 && (r ^ sb) < 0 {
                r.wrapping_add(sb) as u64
            } else {
                r as u64
            }
        }
        ArithOp::IDiv if unsigned => a / b,
        ArithOp::IDiv => {
            let q = sa.wrapping_div(sb);
            if sa.wrapping_rem(sb) != 0 && (sa ^ sb) < 0 {
                q.wrapping_sub(1) as u64
            } else {
                q as u64
            }
        }
        ArithOp::Pow if !unsigned && sb < 0 => match sa {
            1 => 1,
            -1 if sb % 2 == 0 => 1,
            -1 => u64::MAX,
            _ => 0,
        },
        ArithOp::Pow => ipow(a, b),
        ArithOp::BAnd => a & b,
        ArithOp::BOr => a | b,
        ArithOp::BXor => a ^ b,
        ArithOp::Shl => a << (b & 63),
        ArithOp::Shr => a >> (b & 63),
    })
}

fn float_op(op: ArithOp, a: f64, b: f64) -> f64 {
    match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::Mod => {
            let m = a % b;
            if m != 0.0 && (m < 0.0) != (b < 0.0) {
                m + b
            } else {
                m
            }
        }
        ArithOp::Pow => a.powf(b),
        ArithOp::IDiv => (a / b).floor(),
        // bitwise operands are integers by the time they get here
        ArithOp::BAnd | ArithOp::BOr | ArithOp::BXor | ArithOp::Shl | ArithOp::Shr => f64::NAN,
    }
}

/// Integral host numbers take part in bitwise operations
fn as_bitwise_int(operand: Operand) -> Option<Operand> {
    match operand {
        Operand::Num(n) if n.is_finite() && n.fract() == 0.0 => Some(Operand::Int {
            bits: n as i64 as u64,
            unsigned: false,
            boxed: false,
        }),
        Operand::Int { .. } => Some(operand),
        _ => None,
    }
}

fn pointer_at(state: &Arc<EngineState>, ty: &CType, addr: usize) -> FfiResult<Value> {
    Ok(Value::CData(CData::from_pointer(state, ty.clone(), addr as *mut u8)?))
}

fn elem_size(ty: &CType, elem: &CType) -> FfiResult<usize> {
    match elem.alloc_size() {
        Some(size) if size > 0 => Ok(size),
        _ => Err(FfiError::type_mismatch(format!(
            "pointer arithmetic on '{}' needs a sized element type",
            ty
        ))),
    }
}

/// Built-in binary arithmetic; at least one operand is a typed value
pub(crate) fn arith(state: &Arc<EngineState>, op: ArithOp, a: &Value, b: &Value) -> FfiResult<Value> {
    let (lhs, rhs) = match (classify(a), classify(b)) {
        (Some(lhs), Some(rhs)) => (lhs, rhs),
        _ => return Err(arith_error(a, b)),
    };

    let (lhs, rhs) = if op.is_bitwise() {
        match (as_bitwise_int(lhs), as_bitwise_int(rhs)) {
            (Some(lhs), Some(rhs)) => (lhs, rhs),
            _ => return Err(arith_error(a, b)),
        }
    } else {
        (lhs, rhs)
    };

    match (lhs, rhs) {
        (Operand::Record { .. }, _) | (_, Operand::Record { .. }) => Err(arith_error(a, b)),
        (Operand::Ptr { ty, elem, addr }, Operand::Int { bits, .. }) if matches!(op, ArithOp::Add | ArithOp::Sub) => {
            let size = elem_size(&ty, &elem)? as i64;
            let delta = (bits as i64).wrapping_mul(size);
            let delta = if op == ArithOp::Sub { delta.wrapping_neg() } else { delta };
            pointer_at(state, &ty, (addr as i64).wrapping_add(delta) as usize)
        }
        (Operand::Int { bits, .. }, Operand::Ptr { ty, elem, addr }) if op == ArithOp::Add => {
            let size = elem_size(&ty, &elem)? as i64;
            pointer_at(state, &ty, (addr as i64).wrapping_add((bits as i64).wrapping_mul(size)) as usize)
        }
        (Operand::Ptr { ty, elem, addr: pa }, Operand::Ptr { elem: elem_b, addr: pb, .. }) if op == ArithOp::Sub => {
            if !elem.is_same(&elem_b, true) {
                return Err(arith_error(a, b));
            }
            let size = elem_size(&ty, &elem)? as i64;
            Ok(Value::Integer((pa as i64).wrapping_sub(pb as i64) / size))
        }
        (Operand::Ptr { .. }, _) | (_, Operand::Ptr { .. }) => Err(arith_error(a, b)),
        // narrower integers follow host number rules, where `/` and `^` are float ops
        (lhs @ Operand::Int { boxed: false, .. }, rhs @ Operand::Int { boxed: false, .. })
            if matches!(op, ArithOp::Div | ArithOp::Pow) =>
        {
            Ok(Value::Number(float_op(op, as_f64(&lhs), as_f64(&rhs))))
        }
        (
            Operand::Int { bits: x, unsigned: ux, boxed: bx },
            Operand::Int { bits: y, unsigned: uy, boxed: by },
        ) => {
            let unsigned = ux || uy;
            let bits = int_op(op, x, y, unsigned)?;
            int_result(state, bits, unsigned, bx || by)
        }
        (lhs, rhs) => Ok(Value::Number(float_op(op, as_f64(&lhs), as_f64(&rhs)))),
    }
}

fn as_f64(operand: &Operand) -> f64 {
    match operand {
        Operand::Int { bits, unsigned: true, .. } => *bits as f64,
        Operand::Int { bits, .. } => *bits as i64 as f64,
        Operand::Num(n) => *n,
        Operand::Ptr { addr, .. } | Operand::Record { addr } => *addr as f64,
    }
}

pub(crate) fn unm(state: &Arc<EngineState>, a: &Value) -> FfiResult<Value> {
    match classify(a) {
        Some(Operand::Int { bits, unsigned, boxed }) => int_result(state, bits.wrapping_neg(), unsigned, boxed),
        Some(Operand::Num(n)) => Ok(Value::Number(-n)),
        _ => Err(FfiError::type_mismatch(format!(
            "attempt to perform arithmetic on '{}'",
            describe(a)
        ))),
    }
}

pub(crate) fn bnot(state: &Arc<EngineState>, a: &Value) -> FfiResult<Value> {
    match classify(a).and_then(as_bitwise_int) {
        Some(Operand::Int { bits, unsigned, boxed }) => int_result(state, !bits, unsigned, boxed),
        _ => Err(FfiError::type_mismatch(format!(
            "attempt to perform bitwise operation on '{}'",
            describe(a)
        ))),
    }
}

/// Built-in equality; a NULL pointer equals nil
pub(crate) fn eq(a: &Value, b: &Value) -> bool {
    match (classify(a), classify(b)) {
        (Some(Operand::Ptr { addr, .. }), None) if b.is_nil() => addr == 0,
        (None, Some(Operand::Ptr { addr, .. })) if a.is_nil() => addr == 0,
        (Some(Operand::Ptr { addr: x, .. }), Some(Operand::Ptr { addr: y, .. })) => x == y,
        (Some(Operand::Record { addr: x }), Some(Operand::Record { addr: y })) => x == y,
        (Some(Operand::Ptr { .. } | Operand::Record { .. }), _)
        | (_, Some(Operand::Ptr { .. } | Operand::Record { .. })) => false,
        (Some(Operand::Int { bits: x, .. }), Some(Operand::Int { bits: y, .. })) => x == y,
        (Some(lhs), Some(rhs)) => as_f64(&lhs) == as_f64(&rhs),
        _ => false,
    }
}

fn compare(a: &Value, b: &Value) -> FfiResult<std::cmp::Ordering> {
    use std::cmp::Ordering;

    let ordering = match (classify(a), classify(b)) {
        (Some(Operand::Ptr { addr: x, .. }), Some(Operand::Ptr { addr: y, .. })) => Some(x.cmp(&y)),
        (Some(Operand::Ptr { .. } | Operand::Record { .. }), _)
        | (_, Some(Operand::Ptr { .. } | Operand::Record { .. })) => None,
        (
            Some(Operand::Int { bits: x, unsigned: ux, .. }),
            Some(Operand::Int { bits: y, unsigned: uy, .. }),
        ) => Some(if ux || uy { x.cmp(&y) } else { (x as i64).cmp(&(y as i64)) }),
        (Some(lhs), Some(rhs)) => as_f64(&lhs).partial_cmp(&as_f64(&rhs)).or(Some(Ordering::Greater)),
        _ => None,
    };
    ordering.ok_or_else(|| {
        FfiError::type_mismatch(format!("attempt to compare '{}' with '{}'", describe(a), describe(b)))
    })
}

pub(crate) fn lt(a: &Value, b: &Value) -> FfiResult<bool> {
    Ok(compare(a, b)? == std::cmp::Ordering::Less)
}

pub(crate) fn le(a: &Value, b: &Value) -> FfiResult<bool> {
    Ok(compare(a, b)? != std::cmp::Ordering::Greater)
}
