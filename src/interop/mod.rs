//! Interoperability - call native functions and let native code call back
//!
//! Architecture:
//! - `abi.rs` - type descriptors to libffi types, platform ABI queries
//! - `call.rs` - prepared call interfaces and invocation
//! - `callback.rs` - trampolines that route native calls to host functions
//! - `library.rs` - dynamic library loading (libloading)

mod abi;
mod call;
mod callback;
mod library;

use std::sync::atomic::{AtomicUsize, Ordering};

pub use abi::{abi_flag, native_alignment, CallingConvention, ARCH_NAME, OS_NAME};
pub use call::CallInterface;
pub use callback::Trampoline;
pub use library::Library;

pub(crate) use call::variadic_type;
pub(crate) use callback::new_closure;

/// Interop statistics for monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InteropStats {
    pub calls_made: usize,
    pub callbacks_invoked: usize,
    pub marshaling_errors: usize,
    pub libraries_loaded: usize,
}

/// Live counters behind `InteropStats`
#[derive(Debug, Default)]
pub(crate) struct InteropCounters {
    calls_made: AtomicUsize,
    callbacks_invoked: AtomicUsize,
    marshaling_errors: AtomicUsize,
    libraries_loaded: AtomicUsize,
}

impl InteropCounters {
    pub fn record_call(&self) {
        self.calls_made.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_callback(&self) {
        self.callbacks_invoked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_marshaling_error(&self) {
        self.marshaling_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_library(&self) {
        self.libraries_loaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> InteropStats {
        InteropStats {
            calls_made: self.calls_made.load(Ordering::Relaxed),
            callbacks_invoked: self.callbacks_invoked.load(Ordering::Relaxed),
            marshaling_errors: self.marshaling_errors.load(Ordering::Relaxed),
            libraries_loaded: self.libraries_loaded.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests;
