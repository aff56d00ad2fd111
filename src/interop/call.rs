//! Native call invocation
//!
//! A `CallInterface` is the prepared libffi description of one function
//! signature. Fixed-arity interfaces are prepared once and cached on the
//! callable value; variadic calls prepare a fresh interface per call from
//! the types of the trailing arguments.

use std::ffi::c_void;
use std::mem::size_of;
use std::sync::Arc;

use libffi::low;
use libffi::middle::{Cif, CodePtr, Type};
use libffi::raw;
use smallvec::SmallVec;

use super::abi::{decay, param_type, return_type};
use crate::cdata::convert::{from_host, load_int, store_int, to_host, Keep, Rule};
use crate::cdata::{CData, Storage};
use crate::core::{CFunction, CKind, CType};
use crate::engine::EngineState;
use crate::errors::{FfiError, FfiResult};
use crate::host::Value;

/// Cif for a variadic call, with the type descriptors it points into
struct VariadicCif {
    cif: Box<low::ffi_cif>,
    _atypes: Box<[*mut low::ffi_type]>,
    _args: Vec<Type>,
    _ret: Type,
}

impl VariadicCif {
    fn new(args: Vec<Type>, fixed: usize, ret: Type) -> FfiResult<Self> {
        let mut atypes: Box<[*mut low::ffi_type]> = args.iter().map(Type::as_raw_ptr).collect();
        let mut cif: Box<low::ffi_cif> = Box::default();
        // SAFETY: the descriptors outlive the cif, which owns them
        unsafe {
            low::prep_cif_var(
                &mut *cif,
                low::ffi_abi_FFI_DEFAULT_ABI,
                fixed,
                args.len(),
                ret.as_raw_ptr(),
                atypes.as_mut_ptr(),
            )
        }
        .map_err(|e| FfiError::type_mismatch(format!("cannot prepare variadic call: {:?}", e)))?;

        Ok(Self { cif, _atypes: atypes, _args: args, _ret: ret })
    }
}

enum Prepared {
    Fixed(Cif),
    Variadic(VariadicCif),
}

impl Prepared {
    fn as_raw_ptr(&self) -> *mut low::ffi_cif {
        match self {
            Self::Fixed(cif) => cif.as_raw_ptr(),
            Self::Variadic(v) => &*v.cif as *const low::ffi_cif as *mut low::ffi_cif,
        }
    }
}

/// Prepared call description for one signature
pub struct CallInterface {
    cif: Prepared,
    /// Parameter types after decay, variadic tail included
    params: Vec<CType>,
    ret: CType,
    fixed: usize,
}

// The cif is only read after preparation.
unsafe impl Send for CallInterface {}
unsafe impl Sync for CallInterface {}

/// Return slots are at least one `ffi_arg` wide
pub(crate) fn return_slot_size(ret: &CType) -> usize {
    ret.alloc_size().unwrap_or(0).max(size_of::<raw::ffi_arg>())
}

/// Integer and boolean returns narrower than a register come back widened
pub(crate) fn is_widened(ret: &CType) -> bool {
    (ret.is_integer() || ret.is_bool())
        && ret.alloc_size().map_or(false, |s| s < size_of::<raw::ffi_arg>())
}

impl CallInterface {
    /// Prepare a fixed-arity interface
    pub fn prepare(func: &CFunction) -> FfiResult<Self> {
        let params: Vec<CType> = func.params.iter().map(decay).collect();
        let arg_types = params.iter().map(param_type).collect::<FfiResult<Vec<_>>>()?;
        let ret_type = return_type(&func.ret)?;

        Ok(Self {
            cif: Prepared::Fixed(Cif::new(arg_types, ret_type)),
            fixed: params.len(),
            params,
            ret: func.ret.clone(),
        })
    }

    /// Prepare an interface for one variadic call with the given tail types
    pub fn prepare_variadic(func: &CFunction, tail: Vec<CType>) -> FfiResult<Self> {
        let fixed = func.params.len();
        let params: Vec<CType> = func.params.iter().map(decay).chain(tail).collect();
        let arg_types = params.iter().map(param_type).collect::<FfiResult<Vec<_>>>()?;
        let ret_type = return_type(&func.ret)?;

        Ok(Self {
            cif: Prepared::Variadic(VariadicCif::new(arg_types, fixed, ret_type)?),
            params,
            ret: func.ret.clone(),
            fixed,
        })
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// Marshal `args` under CONV, call `code` and read the result under RET.
    ///
    /// # Safety
    /// `code` must be a function with this interface's signature.
    pub(crate) unsafe fn invoke(
        &self,
        state: &Arc<EngineState>,
        code: *mut u8,
        args: &[Value],
        keep: &mut Keep,
    ) -> FfiResult<Value> {
        let mut slots: SmallVec<[Storage; 8]> = SmallVec::with_capacity(self.params.len());
        for (i, (param, arg)) in self.params.iter().zip(args).enumerate() {
            // booleans in the variadic tail pass as int
            let promoted;
            let arg = match arg {
                Value::Boolean(b) if i >= self.fixed => {
                    promoted = Value::Integer(i64::from(*b));
                    &promoted
                }
                _ => arg,
            };
            let size = param.alloc_size().unwrap_or(0);
            let slot = Storage::zeroed(size, param.align())?;
            from_host(state, param, arg, Rule::Conv, slot.as_ptr(), keep)?;
            slots.push(slot);
        }
        let mut arg_ptrs: SmallVec<[*mut c_void; 8]> =
            slots.iter().map(|s| s.as_ptr() as *mut c_void).collect();

        let ret_buf = Storage::zeroed(return_slot_size(&self.ret), self.ret.align())?;
        let code = CodePtr(code as *mut c_void);
        raw::ffi_call(
            self.cif.as_raw_ptr(),
            Some(*code.as_safe_fun()),
            ret_buf.as_ptr() as *mut c_void,
            arg_ptrs.as_mut_ptr(),
        );

        if self.ret.is_void() {
            return Ok(Value::Nil);
        }
        if is_widened(&self.ret) {
            let wide = (ret_buf.as_ptr() as *const raw::ffi_arg).read();
            let narrowed = Storage::zeroed(size_of::<u64>(), size_of::<u64>())?;
            store_int(&self.ret, narrowed.as_ptr(), wide as i128);
            return to_host(state, &self.ret, narrowed.as_ptr(), Rule::Ret, None);
        }
        to_host(state, &self.ret, ret_buf.as_ptr(), Rule::Ret, None)
    }
}

/// Native type a variadic argument is passed as
pub(crate) fn variadic_type(value: &Value) -> FfiResult<CType> {
    let ty = match value {
        Value::Integer(i) if i32::try_from(*i).is_ok() => CType::int(),
        Value::Integer(_) => CType::llong(),
        Value::Number(_) => CType::double(),
        Value::Boolean(_) => CType::int(),
        Value::String(_) => CType::char().as_const().pointer_to(),
        Value::Nil | Value::Handle(_) => CType::void().pointer_to(),
        Value::CData(cd) if !cd.is_type_marker() => promote(cd),
        other => {
            return Err(FfiError::type_mismatch(format!(
                "cannot pass '{}' as a variadic argument",
                crate::cdata::convert::describe(other)
            )))
        }
    };
    Ok(ty)
}

/// C default argument promotions
fn promote(cd: &CData) -> CType {
    let ty = match cd.ctype().kind() {
        CKind::Reference(base) => base.clone(),
        _ => cd.ctype().clone(),
    };
    match ty.kind() {
        CKind::Float => CType::double(),
        CKind::Bool | CKind::Char | CKind::SChar | CKind::UChar | CKind::Short | CKind::UShort => {
            CType::int()
        }
        _ => decay(&ty),
    }
}

/// Widen an integer result into a register-sized return slot
pub(crate) unsafe fn widen_into(ret: &CType, src: *const u8, dest: *mut u8) {
    let v = if ret.is_bool() {
        i128::from(*src != 0)
    } else {
        load_int(ret, src)
    };
    (dest as *mut raw::ffi_arg).write_unaligned(v as i64 as raw::ffi_arg);
}
