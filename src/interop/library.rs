//! Dynamic library loading and symbol resolution
//!
//! Thin wrapper over libloading. The default namespace is the running
//! process itself; named libraries are looked up in the configured search
//! paths first and then by the platform loader.

use std::ffi::{c_void, OsString};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::errors::{ErrorKind, FfiError, FfiResult};
use crate::logging::log_library_load;

#[cfg(unix)]
use libloading::os::unix::Library as RawLibrary;
#[cfg(not(unix))]
use libloading::os::windows::Library as RawLibrary;

/// Handle to a loaded library or to the process's default namespace
pub struct Library {
    raw: RawLibrary,
    handle: usize,
    default: bool,
}

fn load_error(name: &str, reason: impl fmt::Display) -> FfiError {
    ErrorKind::LibraryLoad {
        name: name.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

impl Library {
    /// Symbols of the running process
    pub fn default_namespace() -> FfiResult<Self> {
        #[cfg(unix)]
        let raw = RawLibrary::this();
        #[cfg(not(unix))]
        let raw = RawLibrary::this().map_err(|e| load_error("default", e))?;
        Ok(Self::wrap(raw, true))
    }

    /// Load a library by path or bare name.
    ///
    /// `global` makes its symbols visible to libraries loaded later.
    pub fn open(name: &str, global: bool, search_paths: &[PathBuf]) -> FfiResult<Self> {
        let mut last_error = None;
        for candidate in candidates(name, search_paths) {
            match open_raw(&candidate, global) {
                Ok(raw) => {
                    log_library_load(name, global);
                    return Ok(Self::wrap(raw, false));
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(load_error(
            name,
            last_error.map_or_else(|| "no candidate paths".to_string(), |e| e.to_string()),
        ))
    }

    fn wrap(raw: RawLibrary, default: bool) -> Self {
        let handle = raw.into_raw();
        // SAFETY: the handle was produced by `into_raw` just above
        let raw = unsafe { RawLibrary::from_raw(handle) };
        Self {
            raw,
            handle: handle as usize,
            default,
        }
    }

    /// Address of an exported symbol
    pub fn symbol(&self, name: &str) -> Option<*mut u8> {
        let mut bytes = Vec::with_capacity(name.len() + 1);
        bytes.extend_from_slice(name.as_bytes());
        bytes.push(0);
        // SAFETY: the symbol is read as an address, never called here
        let symbol = unsafe { self.raw.get::<*mut c_void>(&bytes) }.ok()?;
        let addr = *symbol as *mut u8;
        (!addr.is_null()).then_some(addr)
    }

    pub fn is_default(&self) -> bool {
        self.default
    }

    /// Native loader handle
    pub fn handle(&self) -> usize {
        self.handle
    }
}

#[cfg(unix)]
fn open_raw(path: &Path, global: bool) -> Result<RawLibrary, libloading::Error> {
    use libloading::os::unix::{RTLD_GLOBAL, RTLD_LOCAL, RTLD_NOW};

    let visibility = if global { RTLD_GLOBAL } else { RTLD_LOCAL };
    // SAFETY: running library initialisers is inherent to loading
    unsafe { RawLibrary::open(Some(path), RTLD_NOW | visibility) }
}

#[cfg(not(unix))]
fn open_raw(path: &Path, _global: bool) -> Result<RawLibrary, libloading::Error> {
    // SAFETY: running library initialisers is inherent to loading
    unsafe { RawLibrary::new(path) }
}

/// Paths tried, in order, for `name`
fn candidates(name: &str, search_paths: &[PathBuf]) -> Vec<PathBuf> {
    let given = PathBuf::from(name);
    if name.contains(std::path::MAIN_SEPARATOR) || name.contains('/') {
        return vec![given];
    }

    let file: OsString = if Path::new(name).extension().is_some() {
        OsString::from(name)
    } else {
        libloading::library_filename(name)
    };
    let mut out: Vec<PathBuf> = search_paths.iter().map(|dir| dir.join(&file)).collect();
    out.push(PathBuf::from(&file));
    if file.as_os_str() != given.as_os_str() {
        out.push(given);
    }
    out
}

impl fmt::Display for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.default {
            write!(f, "library: default")
        } else {
            write!(f, "library: {:#x}", self.handle)
        }
    }
}

impl fmt::Debug for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidates_for_bare_name() {
        let dirs = vec![PathBuf::from("/opt/lib")];
        let paths = candidates("m", &dirs);
        let file = PathBuf::from(libloading::library_filename("m"));
        assert_eq!(paths[0], Path::new("/opt/lib").join(&file));
        assert_eq!(paths[1], file);
        assert_eq!(paths.last().unwrap(), &PathBuf::from("m"));
    }

    #[test]
    fn test_candidates_for_path() {
        assert_eq!(candidates("./libfoo.so", &[]), vec![PathBuf::from("./libfoo.so")]);
    }

    #[test]
    fn test_missing_library() {
        let err = Library::open("definitely_not_a_library_xyz", false, &[]).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::LibraryLoad { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_default_namespace() {
        let lib = Library::default_namespace().unwrap();
        assert!(lib.is_default());
        assert_eq!(lib.to_string(), "library: default");
        assert!(lib.symbol("strlen").is_some());
        assert!(lib.symbol("no_such_symbol_xyz").is_none());
    }
}
