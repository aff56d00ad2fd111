//! Marshaling between host values and native bytes
//!
//! Three rules drive every conversion:
//! - `Conv` is strict: numbers are range checked, fractions never truncate
//!   into integers, pointers must point at compatible types.
//! - `Cast` reinterprets: integers wrap, floats truncate, any pointer goes.
//! - `Ret` reads like `Conv` but copies aggregates into owned storage
//!   instead of aliasing the source buffer.

use std::os::raw::c_char;
use std::ptr;
use std::sync::Arc;

use super::{CData, Storage};
use crate::core::{CKind, CRecord, CType};
use crate::engine::EngineState;
use crate::errors::{ErrorKind, FfiError, FfiResult};
use crate::host::{Table, Value};
use crate::interop::new_closure;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    Conv,
    Cast,
    Ret,
}

/// Host values that written native bytes depend on
#[derive(Default)]
pub(crate) struct Keep {
    pub values: Vec<Value>,
    /// Closures created for the duration of one native call
    pub closures: Vec<CData>,
    call_scoped: bool,
}

impl Keep {
    pub fn persistent() -> Self {
        Self::default()
    }

    pub fn call_scoped() -> Self {
        Self {
            call_scoped: true,
            ..Self::default()
        }
    }

    fn add_closure(&mut self, state: &Arc<EngineState>, cd: CData) {
        if self.call_scoped {
            self.closures.push(cd);
        } else {
            state.retain_closure(cd.clone());
            self.values.push(Value::CData(cd));
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Num {
    Int(i128),
    Float(f64),
}

/// Name used in conversion errors
pub(crate) fn describe(value: &Value) -> String {
    match value {
        Value::CData(cd) if cd.is_type_marker() => "ctype".to_string(),
        Value::CData(cd) => cd.ctype().serialize(),
        other => other.type_name().to_string(),
    }
}

fn conversion(value: &Value, ty: &CType) -> FfiError {
    FfiError::conversion(&describe(value), &ty.serialize())
}

/// Type and address of the value behind a reference, or the value itself
pub(crate) fn deref(cd: &CData) -> (CType, *mut u8) {
    match cd.ctype().kind() {
        CKind::Reference(base) => (base.clone(), cd.pointer_value().unwrap_or(ptr::null_mut())),
        _ => (cd.ctype().clone(), cd.address()),
    }
}

/// Inclusive value range of an integer type
pub(crate) fn int_range(ty: &CType) -> (i128, i128) {
    let bits = ty.alloc_size().unwrap_or(0) as u32 * 8;
    if ty.is_unsigned() {
        (0, (1i128 << bits) - 1)
    } else {
        (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
    }
}

/// # Safety
/// `src` must be readable for the size of `ty`.
pub(crate) unsafe fn load_int(ty: &CType, src: *const u8) -> i128 {
    match (ty.alloc_size().unwrap_or(0), ty.is_unsigned()) {
        (1, false) => (src as *const i8).read_unaligned() as i128,
        (1, true) => src.read_unaligned() as i128,
        (2, false) => (src as *const i16).read_unaligned() as i128,
        (2, true) => (src as *const u16).read_unaligned() as i128,
        (4, false) => (src as *const i32).read_unaligned() as i128,
        (4, true) => (src as *const u32).read_unaligned() as i128,
        (8, false) => (src as *const i64).read_unaligned() as i128,
        (8, true) => (src as *const u64).read_unaligned() as i128,
        _ => 0,
    }
}

/// Store the low bytes of `value`; wraps like a C cast.
///
/// # Safety
/// `dest` must be writable for the size of `ty`.
pub(crate) unsafe fn store_int(ty: &CType, dest: *mut u8, value: i128) {
    match ty.alloc_size().unwrap_or(0) {
        1 => dest.write_unaligned(value as u8),
        2 => (dest as *mut u16).write_unaligned(value as u16),
        4 => (dest as *mut u32).write_unaligned(value as u32),
        8 => (dest as *mut u64).write_unaligned(value as u64),
        _ => {}
    }
}

/// # Safety
/// `src` must be readable for the size of `ty`.
pub(crate) unsafe fn load_float(ty: &CType, src: *const u8) -> f64 {
    match ty.kind() {
        CKind::Float => (src as *const f32).read_unaligned() as f64,
        _ => (src as *const f64).read_unaligned(),
    }
}

unsafe fn store_float(ty: &CType, dest: *mut u8, value: f64) {
    match ty.kind() {
        CKind::Float => (dest as *mut f32).write_unaligned(value as f32),
        _ => (dest as *mut f64).write_unaligned(value),
    }
}

#[inline]
pub(crate) unsafe fn load_ptr(src: *const u8) -> *mut u8 {
    (src as *const *mut u8).read_unaligned()
}

#[inline]
pub(crate) unsafe fn store_ptr(dest: *mut u8, value: *mut u8) {
    (dest as *mut *mut u8).write_unaligned(value)
}

/// Numeric reading of a value: host numbers and arithmetic typed values
pub(crate) fn numeric_of(value: &Value) -> Option<Num> {
    match value {
        Value::Integer(i) => Some(Num::Int(*i as i128)),
        Value::Number(n) => Some(Num::Float(*n)),
        Value::CData(cd) if !cd.is_type_marker() => {
            let (ty, addr) = deref(cd);
            // SAFETY: arithmetic values are stored inline at `addr`
            unsafe {
                if ty.is_integer() {
                    Some(Num::Int(load_int(&ty, addr)))
                } else if ty.is_bool() {
                    Some(Num::Int(i128::from(*addr != 0)))
                } else if ty.is_float() {
                    Some(Num::Float(load_float(&ty, addr)))
                } else {
                    None
                }
            }
        }
        _ => None,
    }
}

/// Address carried by a pointer-like typed value (pointers, arrays, functions)
fn address_of(cd: &CData) -> Option<*mut u8> {
    let (ty, addr) = deref(cd);
    match ty.kind() {
        CKind::Array { .. } | CKind::Record(_) => Some(addr),
        // SAFETY: pointer and function values store one pointer
        CKind::Pointer(_) | CKind::Function(_) => Some(unsafe { load_ptr(addr) }),
        _ => None,
    }
}

fn check_range(value: i128, ty: &CType) -> FfiResult<i128> {
    let (lo, hi) = int_range(ty);
    if value < lo || value > hi {
        return Err(FfiError::out_of_range(value, &ty.serialize()));
    }
    Ok(value)
}

fn to_int(value: &Value, ty: &CType, rule: Rule) -> FfiResult<i128> {
    let num = match numeric_of(value) {
        Some(num) => num,
        None if rule == Rule::Cast => match value {
            Value::Boolean(b) => Num::Int(i128::from(*b)),
            Value::Handle(h) => Num::Int(h.0 as i128),
            Value::Nil => Num::Int(0),
            Value::CData(cd) => match address_of(cd) {
                Some(p) => Num::Int(p as usize as i128),
                None => return Err(conversion(value, ty)),
            },
            _ => return Err(conversion(value, ty)),
        },
        None => return Err(conversion(value, ty)),
    };

    match (num, rule) {
        (Num::Int(i), Rule::Cast) => Ok(i),
        (Num::Int(i), _) => check_range(i, ty),
        (Num::Float(f), Rule::Cast) => Ok(if f.is_nan() { 0 } else { f.trunc() as i128 }),
        (Num::Float(f), _) => {
            if !f.is_finite() || f.fract() != 0.0 {
                return Err(FfiError::out_of_range(f, &ty.serialize()));
            }
            check_range(f as i128, ty)
        }
    }
}

fn to_bool(value: &Value, ty: &CType, rule: Rule) -> FfiResult<bool> {
    if let Value::Boolean(b) = value {
        return Ok(*b);
    }
    match (numeric_of(value), rule) {
        (Some(Num::Int(i)), Rule::Cast) => Ok(i != 0),
        (Some(Num::Float(f)), Rule::Cast) => Ok(f != 0.0),
        (Some(Num::Int(i)), _) if i == 0 || i == 1 => Ok(i == 1),
        (Some(Num::Float(f)), _) if f == 0.0 || f == 1.0 => Ok(f == 1.0),
        (Some(Num::Int(i)), _) => Err(FfiError::out_of_range(i, &ty.serialize())),
        (Some(Num::Float(f)), _) => Err(FfiError::out_of_range(f, &ty.serialize())),
        (None, Rule::Cast) if value.is_nil() => Ok(false),
        (None, _) => Err(conversion(value, ty)),
    }
}

fn to_float(value: &Value, ty: &CType, rule: Rule) -> FfiResult<f64> {
    match numeric_of(value) {
        Some(Num::Int(i)) => Ok(i as f64),
        Some(Num::Float(f)) => Ok(f),
        None => match (value, rule) {
            (Value::Boolean(b), Rule::Cast) => Ok(if *b { 1.0 } else { 0.0 }),
            _ => Err(conversion(value, ty)),
        },
    }
}

fn pointer_compatible(target: &CType, source: &CType) -> bool {
    target.is_void()
        || source.is_void()
        || target.is_same(source, true)
        || (target.is_char_like() && source.is_char_like())
}

fn to_pointer(
    state: &Arc<EngineState>,
    ty: &CType,
    pointee: &CType,
    value: &Value,
    rule: Rule,
    keep: &mut Keep,
) -> FfiResult<*mut u8> {
    match value {
        Value::Nil => Ok(ptr::null_mut()),
        Value::Handle(h) => Ok(h.as_ptr()),
        Value::String(s) => {
            if rule != Rule::Cast && !pointee.is_char_like() && !pointee.is_void() {
                return Err(conversion(value, ty));
            }
            keep.values.push(value.clone());
            Ok(s.as_ptr() as *mut c_char as *mut u8)
        }
        Value::Function(f) => {
            if !pointee.is_function() {
                return Err(conversion(value, ty));
            }
            let closure = new_closure(state, ty, Some(f.clone()))?;
            let code = closure.pointer_value().unwrap_or(ptr::null_mut());
            keep.add_closure(state, closure);
            Ok(code)
        }
        Value::Integer(_) | Value::Number(_) if rule == Rule::Cast => {
            let addr = to_int(value, &CType::ullong(), Rule::Cast)?;
            Ok(addr as usize as *mut u8)
        }
        Value::CData(cd) if !cd.is_type_marker() => {
            let (vty, addr) = deref(cd);
            let (source, pointer) = match vty.kind() {
                // SAFETY: pointer/function values store one pointer
                CKind::Pointer(base) => (Some(base.clone()), unsafe { load_ptr(addr) }),
                CKind::Function(_) => (Some(vty.clone()), unsafe { load_ptr(addr) }),
                CKind::Array { elem, .. } => (Some(elem.clone()), addr),
                CKind::Record(_) => (Some(vty.clone()), addr),
                _ if rule == Rule::Cast && vty.is_integer() => {
                    // SAFETY: integer value stored inline
                    (None, unsafe { load_int(&vty, addr) } as usize as *mut u8)
                }
                _ => return Err(conversion(value, ty)),
            };

            if rule != Rule::Cast {
                if let Some(source) = source {
                    if !pointer_compatible(pointee, &source) {
                        return Err(conversion(value, ty));
                    }
                }
            }
            keep.values.push(value.clone());
            Ok(pointer)
        }
        _ => Err(conversion(value, ty)),
    }
}

/// Marshal `value` into `dest` as a `ty`.
///
/// # Safety
/// `dest` must be writable for the size of `ty`.
pub(crate) unsafe fn from_host(
    state: &Arc<EngineState>,
    ty: &CType,
    value: &Value,
    rule: Rule,
    dest: *mut u8,
    keep: &mut Keep,
) -> FfiResult<()> {
    if ty.is_integer() {
        let v = to_int(value, ty, rule)?;
        store_int(ty, dest, v);
        return Ok(());
    }

    match ty.kind() {
        CKind::Bool => {
            dest.write(u8::from(to_bool(value, ty, rule)?));
            Ok(())
        }
        CKind::Float | CKind::Double => {
            store_float(ty, dest, to_float(value, ty, rule)?);
            Ok(())
        }
        CKind::Pointer(pointee) => {
            let p = to_pointer(state, ty, pointee, value, rule, keep)?;
            store_ptr(dest, p);
            Ok(())
        }
        CKind::Reference(base) => {
            let p = reference_target(state, base, value, rule, keep)?;
            store_ptr(dest, p);
            Ok(())
        }
        CKind::Array { elem, len } => match len {
            crate::core::ArrayLen::Fixed(n) => write_array(state, ty, elem, *n, value, rule, dest, keep),
            _ => Err(conversion(value, ty)),
        },
        CKind::Record(rec) => write_record(state, ty, rec, value, rule, dest, keep),
        _ => Err(conversion(value, ty)),
    }
}

fn reference_target(
    state: &Arc<EngineState>,
    base: &CType,
    value: &Value,
    rule: Rule,
    keep: &mut Keep,
) -> FfiResult<*mut u8> {
    if let Value::CData(cd) = value {
        if !cd.is_type_marker() {
            let cty = cd.ctype();
            let direct = match cty.kind() {
                CKind::Reference(inner) if rule == Rule::Cast || base.is_same(inner, true) => {
                    cd.pointer_value()
                }
                _ if rule == Rule::Cast || base.is_same(cty, true) => Some(cd.address()),
                _ => None,
            };
            if let Some(p) = direct {
                keep.values.push(value.clone());
                return Ok(p);
            }
        }
    }

    // bind a temporary of the referenced type
    let temp = make_value(state, base, rule, std::slice::from_ref(value))?;
    let p = temp.address();
    keep.values.push(Value::CData(temp));
    Ok(p)
}

#[allow(clippy::too_many_arguments)]
unsafe fn write_array(
    state: &Arc<EngineState>,
    ty: &CType,
    elem: &CType,
    count: usize,
    value: &Value,
    rule: Rule,
    dest: *mut u8,
    keep: &mut Keep,
) -> FfiResult<()> {
    let esize = elem.alloc_size().ok_or_else(|| conversion(value, ty))?;
    let total = esize * count;

    match value {
        Value::String(s) if elem.is_char_like() => {
            let bytes = s.as_bytes_with_nul();
            ptr::write_bytes(dest, 0, total);
            ptr::copy_nonoverlapping(bytes.as_ptr(), dest, bytes.len().min(total));
            Ok(())
        }
        Value::Table(t) => {
            ptr::write_bytes(dest, 0, total);
            for i in 0..t.len().min(count) {
                let item = t.get(i as i64 + 1);
                from_host(state, elem, &item, rule, dest.add(i * esize), keep)?;
            }
            Ok(())
        }
        Value::CData(cd) if !cd.is_type_marker() => {
            let (vty, addr) = deref(cd);
            let same_elem = vty
                .pointee()
                .map_or(false, |src| src.is_same(elem, true));
            if !vty.is_array() || (!same_elem && rule != Rule::Cast) {
                return Err(conversion(value, ty));
            }
            let len = cd.size().unwrap_or(total).min(total);
            ptr::copy(addr, dest, len);
            Ok(())
        }
        _ => Err(conversion(value, ty)),
    }
}

unsafe fn write_record(
    state: &Arc<EngineState>,
    ty: &CType,
    rec: &Arc<CRecord>,
    value: &Value,
    rule: Rule,
    dest: *mut u8,
    keep: &mut Keep,
) -> FfiResult<()> {
    let size = rec.size().ok_or_else(|| conversion(value, ty))?;

    match value {
        Value::CData(cd) if !cd.is_type_marker() => {
            let (vty, addr) = deref(cd);
            match vty.as_record() {
                Some(src) if Arc::ptr_eq(src, rec) => {
                    ptr::copy(addr, dest, size);
                    Ok(())
                }
                _ => Err(conversion(value, ty)),
            }
        }
        Value::Table(t) => {
            ptr::write_bytes(dest, 0, size);
            if t.contains(1i64) {
                let limit = if rec.is_union() { 1 } else { rec.fields().len() };
                for (i, field) in rec.fields().iter().take(limit).enumerate() {
                    let item = t.get(i as i64 + 1);
                    if item.is_nil() || field.ty.alloc_size().is_none() {
                        break;
                    }
                    from_host(state, &field.ty, &item, rule, dest.add(field.offset), keep)?;
                }
            } else {
                for (name, item) in t.string_entries() {
                    let (offset, fty) = rec.field_offset(&name).ok_or_else(|| {
                        FfiError::unknown_member(&ty.serialize(), &name, &rec.field_names())
                    })?;
                    from_host(state, &fty, &item, rule, dest.add(offset), keep)?;
                }
            }
            Ok(())
        }
        _ => Err(conversion(value, ty)),
    }
}

/// Read a `ty` stored at `addr` as a host value.
///
/// `anchor` is the value owning `addr`; views created by the read keep it alive.
///
/// # Safety
/// `addr` must be readable for the size of `ty`.
pub(crate) unsafe fn to_host(
    state: &Arc<EngineState>,
    ty: &CType,
    addr: *const u8,
    rule: Rule,
    anchor: Option<&CData>,
) -> FfiResult<Value> {
    read(state, ty, addr, rule, anchor, false)
}

/// Like `to_host`, but 8-byte integers become host numbers
///
/// # Safety
/// `addr` must be readable for the size of `ty`.
pub(crate) unsafe fn to_host_lossy(
    state: &Arc<EngineState>,
    ty: &CType,
    addr: *const u8,
) -> FfiResult<Value> {
    read(state, ty, addr, Rule::Conv, None, true)
}

unsafe fn read(
    state: &Arc<EngineState>,
    ty: &CType,
    addr: *const u8,
    rule: Rule,
    anchor: Option<&CData>,
    lossy: bool,
) -> FfiResult<Value> {
    if ty.is_integer() {
        let v = load_int(ty, addr);
        let boxed = ty.alloc_size() == Some(8) && !lossy && state.config.host.box_64bit_integers;
        if boxed {
            let storage = Storage::copy_from(addr, 8, 8)?;
            return Ok(Value::CData(CData::inline(state, ty.clone(), storage)));
        }
        return Ok(match i64::try_from(v) {
            Ok(i) => Value::Integer(i),
            Err(_) => Value::Number(v as f64),
        });
    }

    let anchor_with = |cd: CData| {
        if let Some(owner) = anchor {
            cd.retain(vec![Value::CData(owner.clone())]);
        }
        Value::CData(cd)
    };

    match ty.kind() {
        CKind::Void => Ok(Value::Nil),
        CKind::Bool => Ok(Value::Boolean(*addr != 0)),
        CKind::Float | CKind::Double => Ok(Value::Number(load_float(ty, addr))),
        CKind::Pointer(_) => Ok(Value::CData(CData::from_pointer(state, ty.clone(), load_ptr(addr))?)),
        CKind::Reference(base) => read(state, base, load_ptr(addr), rule, anchor, lossy),
        CKind::Function(_) => Ok(Value::CData(CData::from_pointer(state, ty.clone(), addr as *mut u8)?)),
        CKind::Array { .. } => match (rule, ty.alloc_size()) {
            (Rule::Ret, Some(size)) => {
                let storage = Storage::copy_from(addr, size, ty.align())?;
                Ok(Value::CData(CData::inline(state, ty.clone(), storage)))
            }
            _ => Ok(anchor_with(CData::weak_view(state, ty.clone(), addr as *mut u8))),
        },
        CKind::Record(_) => match rule {
            Rule::Ret => {
                let size = ty.alloc_size().ok_or_else(|| {
                    FfiError::type_mismatch(format!("cannot copy incomplete type '{}'", ty))
                })?;
                let storage = Storage::copy_from(addr, size, ty.align())?;
                Ok(Value::CData(CData::inline(state, ty.clone(), storage)))
            }
            Rule::Conv | Rule::Cast => {
                let view = CData::from_pointer(state, ty.reference_to(), addr as *mut u8)?;
                Ok(anchor_with(view))
            }
        },
        _ => Ok(Value::Nil),
    }
}

/// Construct a typed value: zero-filled, or initialised from `args` under `rule`.
///
/// Variable-length arrays take their element count as the first argument.
pub(crate) fn make_value(
    state: &Arc<EngineState>,
    ty: &CType,
    rule: Rule,
    args: &[Value],
) -> FfiResult<CData> {
    if let CKind::Pointer(base) = ty.kind() {
        if base.is_function() {
            if let [Value::Function(f)] = args {
                return new_closure(state, ty, Some(f.clone()));
            }
        }
    }

    if ty.is_void() || ty.is_function() {
        return Err(FfiError::type_mismatch(format!("cannot create a value of type '{}'", ty)));
    }

    let (size, vla_count, init) = if ty.is_variable_length() {
        let count = args
            .first()
            .and_then(Value::as_integer)
            .ok_or_else(|| FfiError::type_mismatch(format!("size of '{}' must be given", ty)))?;
        if count < 0 {
            return Err(FfiError::out_of_range(count, &ty.serialize()));
        }
        let size = ty
            .vla_size(count as usize)
            .ok_or_else(|| FfiError::type_mismatch(format!("cannot size '{}'", ty)))?;
        (size, Some(count as usize), &args[1..])
    } else {
        let size = ty.alloc_size().ok_or_else(|| {
            FfiError::type_mismatch(format!("cannot create a value of incomplete type '{}'", ty))
        })?;
        (size, None, args)
    };

    let aggregate = ty.is_array() || ty.is_record();
    let init_value = match init {
        [] => None,
        [single @ (Value::Integer(_) | Value::Number(_) | Value::Boolean(_))] if aggregate => {
            Some(Value::Table(Table::sequence(vec![single.clone()])))
        }
        [single] => Some(single.clone()),
        many if aggregate => Some(Value::Table(Table::sequence(many.to_vec()))),
        many => {
            return Err(ErrorKind::ArgumentCount {
                expected: 1,
                got: many.len(),
            }
            .into())
        }
    };

    let cd = CData::zeroed(state, ty.clone(), size)?;
    let mut keep = Keep::persistent();
    if let Some(value) = init_value {
        // SAFETY: cd owns `size` zeroed bytes
        unsafe {
            match (vla_count, ty.pointee()) {
                (Some(count), Some(elem)) => {
                    write_array(state, ty, elem, count, &value, rule, cd.address(), &mut keep)?
                }
                _ => from_host(state, ty, &value, rule, cd.address(), &mut keep)?,
            }
        }
    }
    cd.retain(keep.values);
    Ok(cd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_ranges() {
        assert_eq!(int_range(&CType::uchar()), (0, 255));
        assert_eq!(int_range(&CType::short()), (-32768, 32767));
        assert_eq!(int_range(&CType::ullong()), (0, u64::MAX as i128));
        assert_eq!(int_range(&CType::llong()), (i64::MIN as i128, i64::MAX as i128));
    }

    #[test]
    fn test_to_int_rules() {
        let u8t = CType::uchar();
        assert_eq!(to_int(&Value::Integer(200), &u8t, Rule::Conv).unwrap(), 200);
        assert!(to_int(&Value::Integer(300), &u8t, Rule::Conv).is_err());
        assert_eq!(to_int(&Value::Integer(300), &u8t, Rule::Cast).unwrap(), 300);
        assert!(to_int(&Value::Number(1.5), &CType::int(), Rule::Conv).is_err());
        assert_eq!(to_int(&Value::Number(-1.9), &CType::int(), Rule::Cast).unwrap(), -1);
        assert!(to_int(&Value::string("1"), &CType::int(), Rule::Cast).is_err());
    }

    #[test]
    fn test_store_wraps() {
        let mut buf = [0u8; 1];
        unsafe {
            store_int(&CType::uchar(), buf.as_mut_ptr(), 300);
            assert_eq!(load_int(&CType::uchar(), buf.as_ptr()), 44);
        }
        let mut buf = [0u8; 4];
        unsafe {
            store_int(&CType::int(), buf.as_mut_ptr(), -5);
            assert_eq!(load_int(&CType::int(), buf.as_ptr()), -5);
            assert_eq!(load_int(&CType::uint(), buf.as_ptr()), u32::MAX as i128 - 4);
        }
    }

    #[test]
    fn test_to_bool() {
        let b = CType::bool();
        assert!(to_bool(&Value::Integer(1), &b, Rule::Conv).unwrap());
        assert!(to_bool(&Value::Integer(2), &b, Rule::Conv).is_err());
        assert!(to_bool(&Value::Integer(2), &b, Rule::Cast).unwrap());
        assert!(!to_bool(&Value::Boolean(false), &b, Rule::Conv).unwrap());
    }

    #[test]
    fn test_pointer_compatibility() {
        assert!(pointer_compatible(&CType::void(), &CType::int()));
        assert!(pointer_compatible(&CType::char().as_const(), &CType::uchar()));
        assert!(!pointer_compatible(&CType::int(), &CType::double()));
    }
}
