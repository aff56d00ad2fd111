//! Dynamic C typed values for scripting hosts
//!
//! Declare native types, build and index typed values, call native
//! functions through libffi and hand host functions to native code as
//! callbacks, all without compiled bindings.

// Core modules
pub mod cdata;
pub mod config;
pub mod core;
pub mod engine;
pub mod errors;
pub mod host;
pub mod interop;
pub mod logging;
pub mod metatype;

// Re-export commonly used items
pub use cdata::arith::ArithOp;
pub use cdata::CData;
pub use config::EngineConfig;
pub use core::{ArrayLen, CFunction, CKind, CRecord, CType, Decl, DeclStore, Quals, RecordBuilder};
pub use engine::{Engine, IntoCType, Namespace};
pub use errors::{ErrorKind, FfiError, FfiResult};
pub use host::{HostFunction, HostHandle, HostString, Table, Value};
pub use interop::{CallingConvention, InteropStats, Library, Trampoline};
pub use logging::{init_logging, LogConfig, LogFormat, LogOutput};
pub use metatype::{MetaFlags, MetaOp, MetatypeId};
