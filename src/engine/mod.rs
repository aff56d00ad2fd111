//! Engine façade
//!
//! `Engine` owns everything that has to live as long as the embedding:
//! declarations, the metatype registry, the keep-alive registry and the
//! callback error channel. Typed values only hold a weak link back, so
//! dropping the engine tears all of it down.
//!
//! Every metamethod entry point consults the value's metatype first and
//! falls back to built-in semantics on a miss.

pub mod literal;
pub mod namespace;

use std::ffi::CStr;
use std::fmt;
use std::os::raw::c_char;
use std::path::Path;
use std::ptr;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::debug;
use tracing_appender::non_blocking::WorkerGuard;

use crate::cdata::arith::{self, ArithOp};
use crate::cdata::convert::{deref, make_value, to_host, to_host_lossy, Keep, Rule};
use crate::cdata::{index, CData};
use crate::config::EngineConfig;
use crate::core::{CType, Decl, DeclStore};
use crate::errors::{find_similar_names, ErrorKind, FfiError, FfiResult};
use crate::host::{HostFunction, HostString, Registry, Table, Value};
use crate::interop::{
    abi_flag, native_alignment, variadic_type, CallInterface, InteropCounters, InteropStats,
    Library, ARCH_NAME, OS_NAME,
};
use crate::logging::{init_logging, log_native_call};
use crate::metatype::{MetaOp, MetatypeRegistry};

use self::literal::Literal;
pub use self::namespace::Namespace;

/// State shared by the engine and everything it creates
pub(crate) struct EngineState {
    pub(crate) config: EngineConfig,
    pub(crate) decls: DeclStore,
    pub(crate) registry: Registry,
    pub(crate) metatypes: MetatypeRegistry,
    pub(crate) stats: InteropCounters,
    /// First failure raised inside a callback since the last drain
    callback_error: Mutex<Option<FfiError>>,
    /// Values kept alive until teardown (stored closures, strings behind globals)
    retained: Mutex<Vec<Value>>,
    default_library: OnceCell<Arc<Library>>,
}

impl EngineState {
    pub(crate) fn new(config: EngineConfig) -> Self {
        let registry = Registry::new();
        let metatypes = MetatypeRegistry::new(registry.clone(), config.host.clone());
        Self {
            config,
            decls: DeclStore::new(),
            registry,
            metatypes,
            stats: InteropCounters::default(),
            callback_error: Mutex::new(None),
            retained: Mutex::new(Vec::new()),
            default_library: OnceCell::new(),
        }
    }

    pub(crate) fn retain_closure(&self, cd: CData) {
        self.retained.lock().push(Value::CData(cd));
    }

    pub(crate) fn retain_values(&self, values: Vec<Value>) {
        if !values.is_empty() {
            self.retained.lock().extend(values);
        }
    }

    /// Record a callback failure; the first one wins until drained
    pub(crate) fn report_callback_error(&self, error: FfiError) {
        let mut slot = self.callback_error.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    pub(crate) fn take_callback_error(&self) -> Option<FfiError> {
        self.callback_error.lock().take()
    }
}

/// Anything that names a type: a descriptor, a typed value (its type), a
/// type marker, or a type name known to the declaration store.
pub trait IntoCType {
    fn into_ctype(self, decls: &DeclStore) -> FfiResult<CType>;
}

impl IntoCType for CType {
    fn into_ctype(self, _: &DeclStore) -> FfiResult<CType> {
        Ok(self)
    }
}

impl IntoCType for &CType {
    fn into_ctype(self, _: &DeclStore) -> FfiResult<CType> {
        Ok(self.clone())
    }
}

impl IntoCType for &CData {
    fn into_ctype(self, _: &DeclStore) -> FfiResult<CType> {
        Ok(self.ctype().clone())
    }
}

impl IntoCType for CData {
    fn into_ctype(self, _: &DeclStore) -> FfiResult<CType> {
        Ok(self.ctype().clone())
    }
}

impl IntoCType for &str {
    fn into_ctype(self, decls: &DeclStore) -> FfiResult<CType> {
        decls.type_named(self).ok_or_else(|| {
            FfiError::type_mismatch(format!("unknown type '{}'", self.trim()))
                .with_suggestions(
                    find_similar_names(self.trim(), &decls.names(), 2)
                        .into_iter()
                        .take(3)
                        .map(|s| format!("Did you mean '{}'?", s))
                        .collect(),
                )
        })
    }
}

impl IntoCType for &Value {
    fn into_ctype(self, decls: &DeclStore) -> FfiResult<CType> {
        match self {
            Value::CData(cd) => Ok(cd.ctype().clone()),
            Value::String(s) => s.to_string_lossy().as_str().into_ctype(decls),
            other => Err(FfiError::type_mismatch(format!(
                "expected a type, got {}",
                other.type_name()
            ))),
        }
    }
}

fn expect_cdata<'a>(value: &'a Value, what: &str) -> FfiResult<&'a CData> {
    match value {
        Value::CData(cd) if !cd.is_type_marker() => Ok(cd),
        Value::CData(_) => Err(FfiError::type_mismatch(format!("cannot convert 'ctype' to '{}'", what))),
        other => Err(FfiError::type_mismatch(format!(
            "cannot convert '{}' to '{}'",
            other.type_name(),
            what
        ))),
    }
}

/// Address behind a pointer-like argument of `copy`/`fill`/`string`
fn pointer_arg(value: &Value, what: &str) -> FfiResult<*mut u8> {
    if let Value::Handle(h) = value {
        return Ok(h.as_ptr());
    }
    let cd = expect_cdata(value, what)?;
    let ty = cd.ctype();
    if !(ty.is_pointer() || ty.is_reference() || ty.is_array()) {
        return Err(FfiError::type_mismatch(format!("cannot convert '{}' to '{}'", ty, what)));
    }
    Ok(cd.pointer_value().unwrap_or(ptr::null_mut()))
}

fn call_capability(op: MetaOp, capability: Value, args: &[Value]) -> FfiResult<Vec<Value>> {
    match capability {
        Value::Function(f) => f.call(args),
        other => Err(FfiError::type_mismatch(format!(
            "metamethod '{}' is a {}, not a function",
            op.key(),
            other.type_name()
        ))),
    }
}

fn first(values: Vec<Value>) -> Value {
    values.into_iter().next().unwrap_or(Value::Nil)
}

/// The dynamic typed-value engine
#[derive(Clone)]
pub struct Engine {
    state: Arc<EngineState>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.state.config)
            .field("stats", &self.state.stats.snapshot())
            .finish_non_exhaustive()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            state: Arc::new(EngineState::new(config)),
        }
    }

    /// Engine configured from a TOML file
    pub fn from_config_file(path: &Path) -> FfiResult<Self> {
        Ok(Self::with_config(EngineConfig::load(path)?))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.state.config
    }

    /// Install the subscriber described by the `[logging]` section.
    ///
    /// Keep the guard alive until shutdown.
    pub fn init_logging(&self) -> FfiResult<Option<WorkerGuard>> {
        Ok(init_logging(self.state.config.logging.to_log_config()?))
    }

    pub fn decls(&self) -> &DeclStore {
        &self.state.decls
    }

    pub fn declare(&self, name: &str, decl: Decl) -> FfiResult<()> {
        self.state.decls.declare(name, decl)
    }

    pub fn stats(&self) -> InteropStats {
        self.state.stats.snapshot()
    }

    /// Drain the callback error channel
    pub fn take_callback_error(&self) -> Option<FfiError> {
        self.state.take_callback_error()
    }

    fn ctype(&self, ty: impl IntoCType) -> FfiResult<CType> {
        ty.into_ctype(&self.state.decls)
    }

    fn capability(&self, cd: &CData, op: MetaOp) -> Option<Value> {
        self.state.metatypes.lookup(cd.ctype(), op)
    }

    /// Capability of the left operand, else of the right
    fn binary_capability(&self, op: MetaOp, a: &Value, b: &Value) -> Option<Value> {
        [a, b].into_iter().find_map(|v| match v {
            Value::CData(cd) => self.capability(cd, op),
            _ => None,
        })
    }

    // ---- construction -------------------------------------------------

    /// New value of `ty`, initialised from `args` under CONV.
    ///
    /// Variable-length arrays take their element count as the first argument.
    pub fn new_value(&self, ty: impl IntoCType, args: &[Value]) -> FfiResult<CData> {
        let ty = self.ctype(ty)?;
        make_value(&self.state, &ty, Rule::Conv, args)
    }

    /// Reinterpret `value` as `ty` under CAST
    pub fn cast(&self, ty: impl IntoCType, value: &Value) -> FfiResult<CData> {
        let ty = self.ctype(ty)?;
        make_value(&self.state, &ty, Rule::Cast, std::slice::from_ref(value))
    }

    /// Attach a capability table to a record type; returns its type marker
    pub fn metatype(&self, ty: impl IntoCType, table: Table) -> FfiResult<CData> {
        let ty = self.ctype(ty)?;
        self.state.metatypes.register(&ty, table)?;
        Ok(CData::type_marker(&self.state, ty))
    }

    pub fn type_of(&self, ty: impl IntoCType) -> FfiResult<CData> {
        let ty = self.ctype(ty)?;
        Ok(CData::type_marker(&self.state, ty))
    }

    /// Pointer to the value's storage; a reference becomes a pointer to
    /// the same address
    pub fn addressof(&self, cd: &CData) -> FfiResult<CData> {
        if cd.is_type_marker() {
            return Err(FfiError::type_mismatch("cannot take the address of a 'ctype'"));
        }
        let ty = cd.ctype();
        let out = if ty.is_reference() {
            let target = cd.pointer_value().unwrap_or(ptr::null_mut());
            CData::from_pointer(&self.state, ty.derive_as_pointer(), target)?
        } else {
            CData::from_pointer(&self.state, ty.pointer_to(), cd.address())?
        };
        out.retain(vec![Value::CData(cd.clone())]);
        Ok(out)
    }

    /// Reference to the value; references return themselves
    pub fn reference(&self, cd: &CData) -> FfiResult<CData> {
        if cd.is_type_marker() {
            return Err(FfiError::type_mismatch("cannot reference a 'ctype'"));
        }
        if cd.ctype().is_reference() {
            return Ok(cd.clone());
        }
        let out = CData::from_pointer(&self.state, cd.ctype().reference_to(), cd.address())?;
        out.retain(vec![Value::CData(cd.clone())]);
        Ok(out)
    }

    /// Set (function) or clear (nil) the finalizer; returns the value
    pub fn gc(&self, cd: &CData, finalizer: &Value) -> FfiResult<CData> {
        match finalizer {
            Value::Nil => cd.set_finalizer(None),
            Value::Function(_) => cd.set_finalizer(Some(finalizer.clone())),
            other => {
                return Err(FfiError::type_mismatch(format!(
                    "finalizer must be a function or nil, got {}",
                    other.type_name()
                )))
            }
        }
        Ok(cd.clone())
    }

    /// NULL `void *`
    pub fn nullptr(&self) -> FfiResult<CData> {
        CData::from_pointer(&self.state, CType::void().pointer_to(), ptr::null_mut())
    }

    // ---- type information ---------------------------------------------

    /// Byte size of a type or value.
    ///
    /// `None` for unbounded types and negative VLA counts.
    pub fn sizeof(&self, ty: &Value, count: Option<i64>) -> FfiResult<Option<usize>> {
        if let Value::CData(cd) = ty {
            if !cd.is_type_marker() {
                return Ok(cd.size());
            }
        }
        let ty = self.ctype(ty)?;
        if ty.is_variable_length() {
            let count = count.ok_or_else(|| {
                FfiError::type_mismatch(format!("size of '{}' needs an element count", ty))
            })?;
            if count < 0 {
                return Ok(None);
            }
            return Ok(ty.vla_size(count as usize));
        }
        if ty.is_unbounded() {
            return Ok(None);
        }
        Ok(ty.alloc_size())
    }

    pub fn alignof(&self, ty: impl IntoCType) -> FfiResult<usize> {
        Ok(native_alignment(&self.ctype(ty)?))
    }

    /// Offset of a record field; `None` for non-records, opaque records
    /// and unknown fields
    pub fn offsetof(&self, ty: impl IntoCType, field: &str) -> FfiResult<Option<usize>> {
        let ty = self.ctype(ty)?;
        Ok(match ty.as_record() {
            Some(rec) if !rec.is_opaque() => rec.field_offset(field).map(|(offset, _)| offset),
            _ => None,
        })
    }

    /// Whether `value` is a typed value of `ty`; record types also match
    /// pointers and references to them
    pub fn istype(&self, ty: impl IntoCType, value: &Value) -> FfiResult<bool> {
        let ty = self.ctype(ty)?;
        let cd = match value {
            Value::CData(cd) => cd,
            _ => return Ok(false),
        };
        let vt = cd.ctype();
        if ty.is_record() && (vt.is_pointer() || vt.is_reference()) {
            return Ok(vt.pointee().map_or(false, |base| ty.is_same(base, true)));
        }
        Ok(ty.is_same(vt, true))
    }

    // ---- utilities ----------------------------------------------------

    /// Current `errno`, optionally replacing it
    pub fn errno(&self, new: Option<i32>) -> i32 {
        errno::swap(new)
    }

    /// Host string from a `char` pointer or array; NUL-terminated unless
    /// `len` is given
    pub fn string(&self, value: &Value, len: Option<usize>) -> FfiResult<Value> {
        let p = pointer_arg(value, "char const *")?;
        if p.is_null() {
            return Err(FfiError::type_mismatch("cannot convert NULL to a string"));
        }
        // SAFETY: trusted like any native pointer
        let bytes = unsafe {
            match len {
                Some(n) => std::slice::from_raw_parts(p as *const u8, n),
                None => CStr::from_ptr(p as *const c_char).to_bytes(),
            }
        };
        Ok(Value::String(HostString::from_bytes(bytes)))
    }

    /// Copy bytes into `dst`. A string source defaults to its length and
    /// never reads past its terminating NUL.
    pub fn copy(&self, dst: &Value, src: &Value, len: Option<usize>) -> FfiResult<()> {
        let dest = pointer_arg(dst, "void *")?;
        let (source, len) = match src {
            Value::String(s) => {
                let available = s.as_bytes_with_nul().len();
                let n = len.unwrap_or(s.len()).min(available);
                (s.as_ptr() as *const u8, n)
            }
            other => {
                let len = len.ok_or_else(|| FfiError::type_mismatch("copy needs a length"))?;
                (pointer_arg(other, "void const *")? as *const u8, len)
            }
        };
        // SAFETY: the caller vouches for both regions
        unsafe { ptr::copy(source, dest, len) };
        Ok(())
    }

    pub fn fill(&self, dst: &Value, len: usize, byte: Option<i64>) -> FfiResult<()> {
        let dest = pointer_arg(dst, "void *")?;
        // SAFETY: as for `copy`
        unsafe { ptr::write_bytes(dest, byte.unwrap_or(0) as u8, len) };
        Ok(())
    }

    /// Host number of an arithmetic value (lossy for 64-bit integers);
    /// other typed values give nil and host values convert as usual
    pub fn tonumber(&self, value: &Value) -> FfiResult<Value> {
        match value {
            Value::CData(cd) if cd.is_type_marker() => Ok(Value::Nil),
            Value::CData(cd) => {
                let (ty, addr) = deref(cd);
                if !ty.is_arithmetic() {
                    return Ok(Value::Nil);
                }
                // SAFETY: arithmetic values are stored inline
                unsafe { to_host_lossy(&self.state, &ty, addr) }
            }
            Value::Integer(_) | Value::Number(_) => Ok(value.clone()),
            Value::String(s) => Ok(parse_number(&s.to_string_lossy())),
            _ => Ok(Value::Nil),
        }
    }

    /// Read the value as if returned from a native call
    pub fn toretval(&self, cd: &CData) -> FfiResult<Value> {
        if cd.is_type_marker() {
            return Err(FfiError::type_mismatch("cannot convert a 'ctype' to a value"));
        }
        // SAFETY: the value's own storage
        unsafe { to_host(&self.state, cd.ctype(), cd.address(), Rule::Ret, None) }
    }

    /// Typed value of a C numeric literal
    pub fn eval(&self, text: &str) -> FfiResult<CData> {
        match literal::parse(text)? {
            Literal::Int { ty, value } => {
                make_value(&self.state, &ty, Rule::Cast, &[Value::Integer(value as i64)])
            }
            Literal::Float { ty, value } => {
                make_value(&self.state, &ty, Rule::Cast, &[Value::Number(value)])
            }
        }
    }

    /// `"cdata"` for typed values, the host type name otherwise
    pub fn type_name(&self, value: &Value) -> &'static str {
        value.type_name()
    }

    pub fn abi(&self, flag: &str) -> bool {
        abi_flag(flag)
    }

    pub fn os(&self) -> &'static str {
        OS_NAME
    }

    pub fn arch(&self) -> &'static str {
        ARCH_NAME
    }

    // ---- libraries ----------------------------------------------------

    /// Load a library. `global` defaults to the configured visibility.
    pub fn load(&self, name: &str, global: Option<bool>) -> FfiResult<Namespace> {
        let config = &self.state.config.libraries;
        let global = global.unwrap_or(config.global_by_default);
        let library = Library::open(name, global, &config.search_paths)?;
        self.state.stats.record_library();
        Ok(Namespace::new(self.state.clone(), Arc::new(library)))
    }

    /// The default `C` namespace
    pub fn namespace(&self) -> FfiResult<Namespace> {
        let library = self
            .state
            .default_library
            .get_or_try_init(|| Library::default_namespace().map(Arc::new))?;
        Ok(Namespace::new(self.state.clone(), library.clone()))
    }

    // ---- metamethods --------------------------------------------------

    pub fn index(&self, cd: &CData, key: &Value) -> FfiResult<Value> {
        if let Some(capability) = self.capability(cd, MetaOp::Index) {
            return match capability {
                Value::Function(f) => f.call1(&[Value::CData(cd.clone()), key.clone()]),
                Value::Table(t) => Ok(t.get_value(key)),
                Value::CData(inner) if !inner.is_type_marker() => self.index(&inner, key),
                other => Err(FfiError::type_mismatch(format!(
                    "cannot index '__index' of type {}",
                    other.type_name()
                ))),
            };
        }
        if let Some(trampoline) = cd.trampoline() {
            return closure_method(cd, trampoline.clone(), key);
        }
        index::read(&self.state, cd, key)
    }

    pub fn newindex(&self, cd: &CData, key: &Value, value: &Value) -> FfiResult<()> {
        if let Some(capability) = self.capability(cd, MetaOp::NewIndex) {
            let args = [Value::CData(cd.clone()), key.clone(), value.clone()];
            call_capability(MetaOp::NewIndex, capability, &args)?;
            return Ok(());
        }
        index::write(&self.state, cd, key, value)
    }

    /// Call a typed value: type markers construct, functions call natively
    pub fn call(&self, cd: &CData, args: &[Value]) -> FfiResult<Vec<Value>> {
        if cd.is_type_marker() {
            let ty = cd.ctype().clone();
            return Ok(vec![Value::CData(make_value(&self.state, &ty, Rule::Conv, args)?)]);
        }
        if let Some(capability) = self.capability(cd, MetaOp::Call) {
            let mut full = Vec::with_capacity(args.len() + 1);
            full.push(Value::CData(cd.clone()));
            full.extend_from_slice(args);
            return call_capability(MetaOp::Call, capability, &full);
        }

        let ty = cd.ctype();
        let func = ty
            .function_sig()
            .cloned()
            .ok_or_else(|| FfiError::not_callable(&ty.serialize()))?;
        if let Some(trampoline) = cd.trampoline() {
            if !trampoline.is_armed() {
                return Err(FfiError::bad_callback(trampoline.state_name()));
            }
        }
        let code = cd.pointer_value().unwrap_or(ptr::null_mut());
        if code.is_null() {
            return Err(FfiError::type_mismatch(format!("attempt to call NULL '{}'", ty)));
        }

        let scratch;
        let iface: &CallInterface = if func.variadic {
            if args.len() < func.params.len() {
                return Err(ErrorKind::ArgumentCount {
                    expected: func.params.len(),
                    got: args.len(),
                }
                .into());
            }
            let tail = args[func.params.len()..]
                .iter()
                .map(variadic_type)
                .collect::<FfiResult<Vec<_>>>()?;
            scratch = CallInterface::prepare_variadic(&func, tail)?;
            &scratch
        } else {
            if args.len() != func.params.len() {
                return Err(ErrorKind::ArgumentCount {
                    expected: func.params.len(),
                    got: args.len(),
                }
                .into());
            }
            let cached = cd.call_iface().get_or_try_init(|| {
                debug!(target: "cffi::call", signature = %ty, "preparing call interface");
                CallInterface::prepare(&func).map(Arc::new)
            })?;
            cached.as_ref()
        };

        log_native_call(&ty.serialize(), args.len());
        // a failure pending for an enclosing call stays with that call
        let pending = self.state.take_callback_error();

        let mut keep = Keep::call_scoped();
        // SAFETY: `code` has the declared signature
        let result = unsafe { iface.invoke(&self.state, code, args, &mut keep) };
        for closure in keep.closures.drain(..) {
            if let Some(trampoline) = closure.trampoline() {
                // already freed by the callee is fine
                let _ = trampoline.free();
            }
        }
        drop(keep);

        let own = self.state.take_callback_error();
        if let Some(error) = pending {
            self.state.report_callback_error(error);
        }
        let value = match result {
            Ok(value) => value,
            Err(e) => {
                self.state.stats.record_marshaling_error();
                return Err(e);
            }
        };
        self.state.stats.record_call();
        if let Some(error) = own {
            return Err(error);
        }
        Ok(if func.ret.is_void() { Vec::new() } else { vec![value] })
    }

    pub fn tostring(&self, cd: &CData) -> FfiResult<String> {
        if let Some(capability) = self.capability(cd, MetaOp::ToString) {
            return match first(call_capability(MetaOp::ToString, capability, &[Value::CData(cd.clone())])?) {
                Value::String(s) => Ok(s.to_string_lossy()),
                other => Err(FfiError::type_mismatch(format!(
                    "'__tostring' must return a string, got {}",
                    other.type_name()
                ))),
            };
        }
        Ok(cd.to_display())
    }

    /// Binary arithmetic and bitwise operators
    pub fn arith(&self, op: ArithOp, a: &Value, b: &Value) -> FfiResult<Value> {
        if let Some(capability) = self.binary_capability(op.meta(), a, b) {
            return Ok(first(call_capability(op.meta(), capability, &[a.clone(), b.clone()])?));
        }
        arith::arith(&self.state, op, a, b)
    }

    pub fn unm(&self, a: &Value) -> FfiResult<Value> {
        if let Some(capability) = self.binary_capability(MetaOp::Unm, a, &Value::Nil) {
            return Ok(first(call_capability(MetaOp::Unm, capability, &[a.clone(), a.clone()])?));
        }
        arith::unm(&self.state, a)
    }

    pub fn bnot(&self, a: &Value) -> FfiResult<Value> {
        if let Some(capability) = self.binary_capability(MetaOp::BNot, a, &Value::Nil) {
            return Ok(first(call_capability(MetaOp::BNot, capability, &[a.clone(), a.clone()])?));
        }
        arith::bnot(&self.state, a)
    }

    pub fn concat(&self, a: &Value, b: &Value) -> FfiResult<Value> {
        if let Some(capability) = self.binary_capability(MetaOp::Concat, a, b) {
            return Ok(first(call_capability(MetaOp::Concat, capability, &[a.clone(), b.clone()])?));
        }
        Err(FfiError::type_mismatch(format!(
            "attempt to concatenate '{}' and '{}'",
            crate::cdata::convert::describe(a),
            crate::cdata::convert::describe(b)
        )))
    }

    pub fn len(&self, cd: &CData) -> FfiResult<Value> {
        if let Some(capability) = self.capability(cd, MetaOp::Len) {
            return Ok(first(call_capability(MetaOp::Len, capability, &[Value::CData(cd.clone())])?));
        }
        Err(FfiError::type_mismatch(format!(
            "attempt to get length of '{}'",
            cd.ctype()
        )))
    }

    pub fn eq(&self, a: &Value, b: &Value) -> FfiResult<bool> {
        if let Some(capability) = self.binary_capability(MetaOp::Eq, a, b) {
            return Ok(first(call_capability(MetaOp::Eq, capability, &[a.clone(), b.clone()])?).truthy());
        }
        Ok(arith::eq(a, b))
    }

    pub fn lt(&self, a: &Value, b: &Value) -> FfiResult<bool> {
        if let Some(capability) = self.binary_capability(MetaOp::Lt, a, b) {
            return Ok(first(call_capability(MetaOp::Lt, capability, &[a.clone(), b.clone()])?).truthy());
        }
        arith::lt(a, b)
    }

    pub fn le(&self, a: &Value, b: &Value) -> FfiResult<bool> {
        if let Some(capability) = self.binary_capability(MetaOp::Le, a, b) {
            return Ok(first(call_capability(MetaOp::Le, capability, &[a.clone(), b.clone()])?).truthy());
        }
        arith::le(a, b)
    }

    pub fn pairs(&self, cd: &CData) -> FfiResult<Vec<Value>> {
        match self.capability(cd, MetaOp::Pairs) {
            Some(capability) => call_capability(MetaOp::Pairs, capability, &[Value::CData(cd.clone())]),
            None => Err(FfiError::type_mismatch(format!("'{}' is not iterable", cd.ctype()))),
        }
    }

    pub fn ipairs(&self, cd: &CData) -> FfiResult<Vec<Value>> {
        match self.capability(cd, MetaOp::IPairs) {
            Some(capability) => call_capability(MetaOp::IPairs, capability, &[Value::CData(cd.clone())]),
            None => Err(FfiError::type_mismatch(format!("'{}' is not iterable", cd.ctype()))),
        }
    }
}

/// `free` and `set` on closure values
fn closure_method(cd: &CData, trampoline: Arc<crate::interop::Trampoline>, key: &Value) -> FfiResult<Value> {
    let name = match key {
        Value::String(s) => s.to_string_lossy(),
        other => {
            return Err(FfiError::type_mismatch(format!(
                "'{}' cannot be indexed with '{}'",
                cd.ctype(),
                other.type_name()
            )))
        }
    };
    let method = match name.as_str() {
        "free" => HostFunction::new(move |_| {
            trampoline.free()?;
            Ok(Vec::new())
        }),
        "set" => HostFunction::new(move |args| match args.get(1) {
            Some(Value::Function(f)) => {
                trampoline.bind(f.clone())?;
                Ok(Vec::new())
            }
            other => Err(FfiError::type_mismatch(format!(
                "bad argument #1 to 'set' (function expected, got {})",
                other.map_or("no value", Value::type_name)
            ))),
        }),
        _ => {
            let methods = ["free".to_string(), "set".to_string()];
            return Err(FfiError::unknown_member(&cd.ctype().serialize(), &name, &methods));
        }
    };
    Ok(Value::Function(method))
}

/// Host `tonumber` on a string: integers, decimal or hex, then floats
fn parse_number(text: &str) -> Value {
    let t = text.trim();
    if let Ok(i) = t.parse::<i64>() {
        return Value::Integer(i);
    }
    let (neg, body) = match t.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, t),
    };
    if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        if let Ok(u) = u64::from_str_radix(hex, 16) {
            let i = u as i64;
            return Value::Integer(if neg { i.wrapping_neg() } else { i });
        }
    }
    match t.parse::<f64>() {
        Ok(f) if !t.eq_ignore_ascii_case("nan") && !t.to_ascii_lowercase().contains("inf") => Value::Number(f),
        _ => Value::Nil,
    }
}

mod errno {
    #[cfg(any(target_os = "linux", target_os = "emscripten", target_os = "redox"))]
    unsafe fn location() -> *mut i32 {
        libc::__errno_location()
    }

    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "dragonfly"
    ))]
    unsafe fn location() -> *mut i32 {
        libc::__error()
    }

    #[cfg(any(target_os = "android", target_os = "netbsd", target_os = "openbsd"))]
    unsafe fn location() -> *mut i32 {
        libc::__errno()
    }

    #[cfg(any(
        target_os = "linux",
        target_os = "emscripten",
        target_os = "redox",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "android",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    pub fn swap(new: Option<i32>) -> i32 {
        // SAFETY: errno is thread-local and always addressable
        unsafe {
            let slot = location();
            let current = *slot;
            if let Some(v) = new {
                *slot = v;
            }
            current
        }
    }

    /// Read-only elsewhere
    #[cfg(not(any(
        target_os = "linux",
        target_os = "emscripten",
        target_os = "redox",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "android",
        target_os = "netbsd",
        target_os = "openbsd"
    )))]
    pub fn swap(_new: Option<i32>) -> i32 {
        std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_number() {
        assert!(matches!(parse_number("42"), Value::Integer(42)));
        assert!(matches!(parse_number(" 0x10 "), Value::Integer(16)));
        assert!(matches!(parse_number("-0x10"), Value::Integer(-16)));
        assert!(matches!(parse_number("1.5"), Value::Number(n) if n == 1.5));
        assert!(parse_number("abc").is_nil());
        assert!(parse_number("nan").is_nil());
    }

    #[test]
    fn test_callback_error_first_wins() {
        let state = EngineState::new(EngineConfig::default());
        state.report_callback_error(FfiError::host("first"));
        state.report_callback_error(FfiError::host("second"));
        assert_eq!(state.take_callback_error().unwrap().to_string(), "first");
        assert!(state.take_callback_error().is_none());
    }

    #[test]
    fn test_type_names_resolve() {
        let engine = Engine::new();
        assert_eq!(engine.type_of("unsigned int").unwrap().to_display(), "ctype<unsigned int>");
        let err = engine.type_of("unsigned itn").unwrap_err();
        assert!(err.is_type_mismatch());
    }

    #[test]
    fn test_errno_swap() {
        let engine = Engine::new();
        engine.errno(Some(7));
        assert_eq!(engine.errno(Some(0)), 7);
        assert_eq!(engine.errno(None), 0);
    }
}
