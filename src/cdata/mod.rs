//! Typed values
//!
//! A `CData` pairs a type descriptor with exactly one payload shape:
//! a type marker, inline storage, a weak view into foreign memory, or a
//! callback trampoline. The payload is a closed enum so every access site
//! has to handle each shape.

pub mod arith;
pub mod convert;
pub mod format;
pub mod index;
mod storage;

use std::fmt;
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::core::CType;
use crate::engine::EngineState;
use crate::errors::FfiResult;
use crate::host::Value;
use crate::interop::{CallInterface, Trampoline};
use crate::logging::log_finalizer_error;
use crate::metatype::MetaOp;

pub(crate) use storage::Storage;

pub(crate) enum Payload {
    /// Reified type, no instance
    TypeMarker,
    /// Value bytes owned by this value
    Inline(Storage),
    /// Array elements owned by someone else
    WeakView { ptr: *mut u8 },
    /// Function pointer backed by a trampoline; storage holds the code pointer
    Closure {
        storage: Storage,
        trampoline: Arc<Trampoline>,
    },
}

pub(crate) struct CDataInner {
    ctype: CType,
    payload: Payload,
    finalizer: Mutex<Option<Value>>,
    /// Host values the bytes depend on (pointed-to strings, owners of views)
    keepalive: Mutex<Vec<Value>>,
    call_iface: OnceCell<Arc<CallInterface>>,
    engine: Weak<EngineState>,
    /// False for the transient copies handed to finalizers
    managed: bool,
}

// Raw pointers inside the payload only ever point at memory kept alive
// through `keepalive` or owned by native code.
unsafe impl Send for CDataInner {}
unsafe impl Sync for CDataInner {}

/// A typed native value
#[derive(Clone)]
pub struct CData(Arc<CDataInner>);

impl CData {
    fn build(state: &Arc<EngineState>, ctype: CType, payload: Payload, managed: bool) -> Self {
        Self(Arc::new(CDataInner {
            ctype,
            payload,
            finalizer: Mutex::new(None),
            keepalive: Mutex::new(Vec::new()),
            call_iface: OnceCell::new(),
            engine: Arc::downgrade(state),
            managed,
        }))
    }

    pub(crate) fn type_marker(state: &Arc<EngineState>, ctype: CType) -> Self {
        Self::build(state, ctype, Payload::TypeMarker, true)
    }

    pub(crate) fn inline(state: &Arc<EngineState>, ctype: CType, storage: Storage) -> Self {
        Self::build(state, ctype, Payload::Inline(storage), true)
    }

    /// Zero-initialised value of a sized type
    pub(crate) fn zeroed(state: &Arc<EngineState>, ctype: CType, size: usize) -> FfiResult<Self> {
        let storage = Storage::zeroed(size, ctype.align())?;
        Ok(Self::inline(state, ctype, storage))
    }

    /// Value holding a single pointer
    pub(crate) fn from_pointer(state: &Arc<EngineState>, ctype: CType, ptr: *mut u8) -> FfiResult<Self> {
        let bytes = (ptr as usize).to_ne_bytes();
        let storage = Storage::from_bytes(&bytes, std::mem::align_of::<usize>())?;
        Ok(Self::inline(state, ctype, storage))
    }

    pub(crate) fn weak_view(state: &Arc<EngineState>, ctype: CType, ptr: *mut u8) -> Self {
        Self::build(state, ctype, Payload::WeakView { ptr }, true)
    }

    pub(crate) fn closure(
        state: &Arc<EngineState>,
        ctype: CType,
        storage: Storage,
        trampoline: Arc<Trampoline>,
    ) -> Self {
        Self::build(state, ctype, Payload::Closure { storage, trampoline }, true)
    }

    #[inline]
    pub fn ctype(&self) -> &CType {
        &self.0.ctype
    }

    pub fn is_type_marker(&self) -> bool {
        matches!(self.0.payload, Payload::TypeMarker)
    }

    pub fn is_weak_view(&self) -> bool {
        matches!(self.0.payload, Payload::WeakView { .. })
    }

    pub fn is_closure(&self) -> bool {
        matches!(self.0.payload, Payload::Closure { .. })
    }

    /// Address of the value's bytes; null for type markers
    pub fn address(&self) -> *mut u8 {
        match &self.0.payload {
            Payload::TypeMarker => std::ptr::null_mut(),
            Payload::Inline(storage) | Payload::Closure { storage, .. } => storage.as_ptr(),
            Payload::WeakView { ptr } => *ptr,
        }
    }

    /// Byte size of the value, including VLA elements
    pub fn size(&self) -> Option<usize> {
        match &self.0.payload {
            Payload::TypeMarker => None,
            Payload::Inline(storage) | Payload::Closure { storage, .. } => Some(storage.len()),
            Payload::WeakView { .. } => self.0.ctype.alloc_size(),
        }
    }

    /// Inline bytes, if owned
    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.0.payload {
            Payload::Inline(storage) | Payload::Closure { storage, .. } => Some(storage.as_slice()),
            _ => None,
        }
    }

    /// Pointer stored in a pointer-like value; arrays decay to their address
    pub fn pointer_value(&self) -> Option<*mut u8> {
        let ty = &self.0.ctype;
        if self.is_type_marker() {
            return None;
        }
        if ty.is_array() {
            return Some(self.address());
        }
        if ty.is_pointer() || ty.is_reference() || ty.is_function() {
            // SAFETY: pointer-like values store one pointer inline
            return Some(unsafe { (self.address() as *const *mut u8).read_unaligned() });
        }
        None
    }

    pub fn trampoline(&self) -> Option<&Arc<Trampoline>> {
        match &self.0.payload {
            Payload::Closure { trampoline, .. } => Some(trampoline),
            _ => None,
        }
    }

    pub fn ptr_eq(&self, other: &CData) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn call_iface(&self) -> &OnceCell<Arc<CallInterface>> {
        &self.0.call_iface
    }

    pub(crate) fn set_finalizer(&self, finalizer: Option<Value>) {
        *self.0.finalizer.lock() = finalizer;
    }

    pub fn has_finalizer(&self) -> bool {
        self.0.finalizer.lock().is_some()
    }

    /// Keep host values alive for as long as this value
    pub(crate) fn retain(&self, values: Vec<Value>) {
        if !values.is_empty() {
            self.0.keepalive.lock().extend(values);
        }
    }
}

impl CDataInner {
    /// Unmanaged copy handed to finalizers; takes over the keep-alive list
    fn detached(&mut self, state: &Arc<EngineState>) -> Option<CData> {
        let keep = std::mem::take(self.keepalive.get_mut());
        let payload = match &self.payload {
            Payload::TypeMarker => return None,
            Payload::Inline(storage) | Payload::Closure { storage, .. } => {
                Payload::Inline(Storage::from_bytes(storage.as_slice(), self.ctype.align()).ok()?)
            }
            Payload::WeakView { ptr } => Payload::WeakView { ptr: *ptr },
        };
        let copy = CData::build(state, self.ctype.clone(), payload, false);
        copy.retain(keep);
        Some(copy)
    }
}

impl Drop for CDataInner {
    fn drop(&mut self) {
        if !self.managed {
            return;
        }
        let Some(state) = self.engine.upgrade() else {
            return;
        };

        let finalizer = self.finalizer.get_mut().take();
        let meta_gc = if self.ctype.is_record() {
            state.metatypes.lookup(&self.ctype, MetaOp::Gc)
        } else {
            None
        };
        if finalizer.is_none() && meta_gc.is_none() {
            return;
        }

        let Some(copy) = self.detached(&state) else {
            return;
        };
        for handler in [finalizer, meta_gc].into_iter().flatten() {
            if let Value::Function(f) = handler {
                if let Err(e) = f.call(&[Value::CData(copy.clone())]) {
                    log_finalizer_error(&self.ctype.serialize(), &e.to_string());
                }
            }
        }
    }
}

impl fmt::Debug for CData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_type_marker() {
            write!(f, "ctype<{}>", self.0.ctype)
        } else {
            write!(f, "cdata<{}>: {:p}", self.0.ctype, self.address())
        }
    }
}
