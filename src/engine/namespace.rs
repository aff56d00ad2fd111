//! Symbol namespaces
//!
//! A namespace binds declared names to the symbols of one library.
//! Symbols are resolved on every access; nothing is cached here.

use std::fmt;
use std::sync::Arc;

use super::EngineState;
use crate::cdata::convert::{from_host, to_host, Keep, Rule};
use crate::cdata::CData;
use crate::core::Decl;
use crate::errors::{FfiError, FfiResult};
use crate::host::Value;
use crate::interop::Library;

#[derive(Clone)]
pub struct Namespace {
    state: Arc<EngineState>,
    library: Arc<Library>,
}

impl Namespace {
    pub(crate) fn new(state: Arc<EngineState>, library: Arc<Library>) -> Self {
        Self { state, library }
    }

    pub fn library(&self) -> &Library {
        &self.library
    }

    fn unknown(&self, name: &str) -> FfiError {
        FfiError::unknown_member(&self.library.to_string(), name, &self.state.decls.names())
    }

    fn address(&self, name: &str) -> FfiResult<*mut u8> {
        // declared but absent from the library: no candidates to suggest
        self.library
            .symbol(name)
            .ok_or_else(|| FfiError::unknown_member(&self.library.to_string(), name, &[]))
    }

    /// Value bound to `name`: a callable for functions, the current value
    /// for variables, an integer for constants.
    pub fn get(&self, name: &str) -> FfiResult<Value> {
        let decl = self.state.decls.get(name).ok_or_else(|| self.unknown(name))?;
        match decl {
            Decl::Function(ty) => {
                let addr = self.address(name)?;
                Ok(Value::CData(CData::from_pointer(&self.state, ty, addr)?))
            }
            Decl::Variable(ty) => {
                let addr = self.address(name)?;
                // SAFETY: the symbol is a global of the declared type
                unsafe { to_host(&self.state, &ty, addr, Rule::Conv, None) }
            }
            Decl::Constant { value, .. } => Ok(Value::Integer(value)),
            Decl::Typedef(_) | Decl::Record(_) => Err(FfiError::type_mismatch(format!(
                "'{}' is a type, not a symbol",
                name
            ))),
        }
    }

    /// Assign to a declared global variable
    pub fn set(&self, name: &str, value: &Value) -> FfiResult<()> {
        let decl = self.state.decls.get(name).ok_or_else(|| self.unknown(name))?;
        let ty = match decl {
            Decl::Variable(ty) => ty,
            _ => {
                return Err(FfiError::type_mismatch(format!(
                    "'{}' is not a variable",
                    name
                )))
            }
        };
        if ty.is_const() {
            return Err(FfiError::type_mismatch(format!("cannot write to constant '{}'", name)));
        }

        let addr = self.address(name)?;
        let mut keep = Keep::persistent();
        // SAFETY: as for `get`
        unsafe { from_host(&self.state, &ty, value, Rule::Conv, addr, &mut keep)? };
        self.state.retain_values(keep.values);
        Ok(())
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.library, f)
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
