//! Element and field resolution
//!
//! Pointer and array indices are not bounds checked: `p[i]` is plain
//! pointer arithmetic, exactly as in C.

use std::ptr;
use std::sync::Arc;

use super::convert::{from_host, numeric_of, to_host, Keep, Num, Rule};
use super::CData;
use crate::core::{CKind, CRecord, CType};
use crate::engine::EngineState;
use crate::errors::{FfiError, FfiResult};
use crate::host::Value;

/// Integer index from a host integer, an integral number or an integer typed value
pub fn integer_key(key: &Value) -> FfiResult<i64> {
    match numeric_of(key) {
        Some(Num::Int(i)) => Ok(i as i64),
        Some(Num::Float(f)) if f.is_finite() && f.fract() == 0.0 => Ok(f as i64),
        _ => Err(FfiError::type_mismatch(format!(
            "index must be an integer, got {}",
            super::convert::describe(key)
        ))),
    }
}

fn element(owner: &CType, elem: &CType, base: *mut u8, index: i64) -> FfiResult<(CType, *mut u8)> {
    let size = match elem.alloc_size() {
        Some(size) if !elem.is_void() => size,
        _ => return Err(FfiError::not_indexable(&owner.serialize())),
    };
    let offset = (index as isize).wrapping_mul(size as isize);
    Ok((elem.clone(), base.wrapping_offset(offset)))
}

fn field(owner: &CType, rec: &Arc<CRecord>, base: *mut u8, name: &str) -> FfiResult<(CType, *mut u8)> {
    let (offset, ty) = rec
        .field_offset(name)
        .ok_or_else(|| FfiError::unknown_member(&owner.serialize(), name, &rec.field_names()))?;
    Ok((ty, base.wrapping_add(offset)))
}

fn field_name(owner: &CType, key: &Value) -> FfiResult<String> {
    match key {
        Value::String(s) => Ok(s.to_string_lossy()),
        other => Err(FfiError::type_mismatch(format!(
            "'{}' field name must be a string, got {}",
            owner,
            other.type_name()
        ))),
    }
}

/// Resolve `(value, key)` to the type and address of the element it names.
///
/// References resolve to their referent whatever the key. A string key on
/// a pointer to a record selects a field of the pointee.
pub fn resolve(cd: &CData, key: &Value) -> FfiResult<(CType, *mut u8)> {
    if cd.is_type_marker() {
        return Err(FfiError::not_indexable("ctype"));
    }
    let ty = cd.ctype();
    match ty.kind() {
        CKind::Reference(base) => {
            let target = cd.pointer_value().unwrap_or(ptr::null_mut());
            Ok((base.clone(), target))
        }
        CKind::Pointer(base) => {
            let target = cd.pointer_value().unwrap_or(ptr::null_mut());
            match (base.as_record(), key) {
                (Some(rec), Value::String(_)) => field(base, rec, target, &field_name(base, key)?),
                _ => element(ty, base, target, integer_key(key)?),
            }
        }
        CKind::Array { elem, .. } => element(ty, elem, cd.address(), integer_key(key)?),
        CKind::Record(rec) => field(ty, rec, cd.address(), &field_name(ty, key)?),
        _ => Err(FfiError::not_indexable(&ty.serialize())),
    }
}

/// Read the element named by `key` under CONV
pub(crate) fn read(state: &Arc<EngineState>, cd: &CData, key: &Value) -> FfiResult<Value> {
    let (ty, addr) = resolve(cd, key)?;
    // SAFETY: indices are unchecked; the address is as valid as the caller's index
    unsafe { to_host(state, &ty, addr, Rule::Conv, Some(cd)) }
}

/// Store `value` into the element named by `key` under CONV
pub(crate) fn write(state: &Arc<EngineState>, cd: &CData, key: &Value, value: &Value) -> FfiResult<()> {
    let (ty, addr) = resolve(cd, key)?;
    if ty.is_const() {
        return Err(FfiError::type_mismatch(format!("cannot write to constant '{}'", ty)));
    }
    let mut keep = Keep::persistent();
    // SAFETY: as for `read`
    unsafe { from_host(state, &ty, value, Rule::Conv, addr, &mut keep)? };
    cd.retain(keep.values);
    Ok(())
}
