//! Callback trampolines
//!
//! A trampoline is a libffi closure whose code pointer native code can call
//! like any C function. Entering it marshals the native arguments to host
//! values, calls the bound host function and writes its result back.
//!
//! State machine: `Unbound -> Armed -> Freed`. Freeing releases the host
//! function at once, but the code block stays allocated until the owning
//! value is dropped, so a native caller still holding the pointer gets a
//! `BadCallbackState` error instead of jumping into freed memory.

use std::ffi::c_void;
use std::mem::{align_of, ManuallyDrop};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::{Arc, Weak};

use libffi::low;
use libffi::middle::Cif;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, warn};

use super::abi::{decay, param_type, return_type};
use super::call::{is_widened, return_slot_size, widen_into};
use crate::cdata::convert::{from_host, to_host, Keep, Rule};
use crate::cdata::{CData, Storage};
use crate::core::{CFunction, CType};
use crate::engine::EngineState;
use crate::errors::{FfiError, FfiResult};
use crate::host::{HostFunction, RegistryKey, Value};
use crate::logging::{log_callback_entry, log_callback_error};

enum BindState {
    Unbound,
    Armed(RegistryKey),
    Freed,
}

impl BindState {
    fn name(&self) -> &'static str {
        match self {
            Self::Unbound => "unbound",
            Self::Armed(_) => "armed",
            Self::Freed => "freed",
        }
    }
}

pub struct Trampoline {
    /// Boxed so the address handed to libffi never moves
    cif: ManuallyDrop<Box<Cif>>,
    closure: *mut low::ffi_closure,
    code: *mut c_void,
    func: Arc<CFunction>,
    params: Vec<CType>,
    signature: String,
    state: Mutex<BindState>,
    engine: Weak<EngineState>,
    me: Weak<Trampoline>,
    /// Values the last written result points into
    last_return: Mutex<Vec<Value>>,
}

// The closure and cif are immutable after preparation; the host side is
// driven from one thread at a time.
unsafe impl Send for Trampoline {}
unsafe impl Sync for Trampoline {}

impl Trampoline {
    /// Allocate and prepare a trampoline for the function pointer type `ty`
    pub(crate) fn new(state: &Arc<EngineState>, ty: &CType) -> FfiResult<Arc<Self>> {
        let func = ty
            .function_sig()
            .cloned()
            .ok_or_else(|| FfiError::type_mismatch(format!("'{}' is not a function pointer type", ty)))?;
        if func.variadic {
            return Err(FfiError::unsupported_abi(&ty.serialize()));
        }

        let params: Vec<CType> = func.params.iter().map(decay).collect();
        let arg_types = params.iter().map(param_type).collect::<FfiResult<Vec<_>>>()?;
        let cif = Box::new(Cif::new(arg_types, return_type(&func.ret)?));

        let (closure, code) = low::closure_alloc();
        if closure.is_null() {
            return Err(FfiError::unsupported_abi(&ty.serialize()));
        }

        let mut prepared = Ok(());
        let trampoline = Arc::new_cyclic(|me: &Weak<Trampoline>| {
            // SAFETY: the closure is freshly allocated; the cif is boxed and
            // the userdata points at the Arc's final location.
            prepared = unsafe {
                low::prep_closure(
                    closure,
                    cif.as_raw_ptr(),
                    trampoline_entry,
                    me.as_ptr(),
                    code,
                )
            };
            Trampoline {
                cif: ManuallyDrop::new(cif),
                closure,
                code: code.as_mut_ptr(),
                func,
                params,
                signature: ty.serialize(),
                state: Mutex::new(BindState::Unbound),
                engine: Arc::downgrade(state),
                me: me.clone(),
                last_return: Mutex::new(Vec::new()),
            }
        });
        prepared.map_err(|_| FfiError::unsupported_abi(&ty.serialize()))?;

        debug!(target: "cffi::callback", signature = %trampoline.signature, "trampoline created");
        Ok(trampoline)
    }

    /// Native entry point; stable for the trampoline's lifetime
    pub fn code_ptr(&self) -> *mut u8 {
        self.code as *mut u8
    }

    pub fn is_armed(&self) -> bool {
        matches!(*self.state.lock(), BindState::Armed(_))
    }

    pub fn state_name(&self) -> &'static str {
        self.state.lock().name()
    }

    /// Bind or rebind the host function; the code pointer is unchanged
    pub fn bind(&self, function: HostFunction) -> FfiResult<()> {
        let engine = self.engine()?;
        let key = engine.registry.insert(Value::Function(function));

        let previous = {
            let mut state = self.state.lock();
            if let BindState::Freed = *state {
                return Err(FfiError::bad_callback("freed"));
            }
            std::mem::replace(&mut *state, BindState::Armed(key))
        };
        // the old function is released outside the lock
        drop(previous);

        debug!(target: "cffi::callback", signature = %self.signature, "trampoline bound");
        Ok(())
    }

    /// Release the host function; the trampoline rejects every later use
    pub fn free(&self) -> FfiResult<()> {
        let previous = {
            let mut state = self.state.lock();
            match *state {
                BindState::Armed(_) => std::mem::replace(&mut *state, BindState::Freed),
                ref other => return Err(FfiError::bad_callback(other.name())),
            }
        };
        drop(previous);
        self.last_return.lock().clear();

        debug!(target: "cffi::callback", signature = %self.signature, "trampoline freed");
        Ok(())
    }

    fn engine(&self) -> FfiResult<Arc<EngineState>> {
        self.engine
            .upgrade()
            .ok_or_else(|| FfiError::bad_callback("engine destroyed"))
    }

    fn bound_function(&self) -> FfiResult<HostFunction> {
        match &*self.state.lock() {
            BindState::Armed(key) => match key.get() {
                Value::Function(f) => Ok(f),
                _ => Err(FfiError::bad_callback("unbound")),
            },
            other => Err(FfiError::bad_callback(other.name())),
        }
    }

    /// One activation, entered from native code
    ///
    /// # Safety
    /// `args` holds one pointer per parameter; `ret` is the return slot.
    unsafe fn dispatch(&self, ret: *mut u8, args: *const *const c_void) -> FfiResult<()> {
        let function = self.bound_function()?;
        let state = self.engine()?;

        let mut host_args: SmallVec<[Value; 4]> = SmallVec::with_capacity(self.params.len());
        for (i, param) in self.params.iter().enumerate() {
            let slot = *args.add(i) as *const u8;
            // aggregates are copied, never aliased
            let rule = if param.is_record() { Rule::Ret } else { Rule::Conv };
            host_args.push(to_host(&state, param, slot, rule, None)?);
        }

        log_callback_entry(&self.signature, host_args.len());
        state.stats.record_callback();
        let result = function.call1(&host_args)?;

        let ret_ty = &self.func.ret;
        if ret_ty.is_void() {
            return Ok(());
        }
        let mut keep = Keep::persistent();
        if is_widened(ret_ty) {
            let scratch = Storage::zeroed(8, align_of::<u64>())?;
            from_host(&state, ret_ty, &result, Rule::Ret, scratch.as_ptr(), &mut keep)?;
            widen_into(ret_ty, scratch.as_ptr(), ret);
        } else {
            from_host(&state, ret_ty, &result, Rule::Ret, ret, &mut keep)?;
        }
        *self.last_return.lock() = keep.values;
        Ok(())
    }

    fn report(&self, ret: *mut u8, error: FfiError) {
        let ret_ty = &self.func.ret;
        let len = if ret_ty.is_void() {
            0
        } else if is_widened(ret_ty) {
            return_slot_size(ret_ty)
        } else {
            ret_ty.alloc_size().unwrap_or(0)
        };
        // SAFETY: libffi sizes the return slot for the return type
        unsafe { ptr::write_bytes(ret, 0, len) };
        log_callback_error(&self.signature, &error.to_string());
        if let Some(state) = self.engine.upgrade() {
            state.report_callback_error(error);
        }
    }
}

/// Keeps the trampoline alive for one activation
struct Activation(Arc<Trampoline>);

impl Drop for Activation {
    fn drop(&mut self) {
        // Last owner went away mid-call: the code block is still on the
        // native stack, so it is released from the host and leaked.
        if Arc::strong_count(&self.0) == 1 {
            let previous = std::mem::replace(&mut *self.0.state.lock(), BindState::Freed);
            drop(previous);
            self.0.last_return.lock().clear();
            warn!(target: "cffi::callback", signature = %self.0.signature, "trampoline leaked while active");
            std::mem::forget(Arc::clone(&self.0));
        }
    }
}

impl Drop for Trampoline {
    fn drop(&mut self) {
        // SAFETY: allocated in `new`; no activation holds a reference
        unsafe {
            low::closure_free(self.closure);
            ManuallyDrop::drop(&mut self.cif);
        }
    }
}

unsafe extern "C" fn trampoline_entry(
    _cif: &low::ffi_cif,
    result: &mut c_void,
    args: *const *const c_void,
    userdata: &Trampoline,
) {
    let ret = result as *mut c_void as *mut u8;
    // live code implies a live owner
    let Some(this) = userdata.me.upgrade() else {
        return;
    };
    let activation = Activation(this);
    let trampoline = &*activation.0;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| trampoline.dispatch(ret, args)));
    let failure = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(error)) => error,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panic in callback".to_string());
            FfiError::host(message)
        }
    };
    trampoline.report(ret, failure);
}

/// Closure value of the function pointer type `ty`, optionally bound to `function`
pub(crate) fn new_closure(
    state: &Arc<EngineState>,
    ty: &CType,
    function: Option<HostFunction>,
) -> FfiResult<CData> {
    let ptr_ty = if ty.is_function() { ty.pointer_to() } else { ty.clone() }.as_closure();
    let trampoline = Trampoline::new(state, &ptr_ty)?;
    if let Some(function) = function {
        trampoline.bind(function)?;
    }

    let bytes = (trampoline.code_ptr() as usize).to_ne_bytes();
    let storage = Storage::from_bytes(&bytes, align_of::<usize>())?;
    Ok(CData::closure(state, ptr_ty, storage, trampoline))
}
