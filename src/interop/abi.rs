//! Native ABI description
//!
//! Maps type descriptors to libffi type descriptions and reports the
//! platform's calling convention and ABI flags.

use std::iter;

use libffi::middle::Type;

use crate::core::{ArrayLen, CKind, CType};
use crate::errors::{FfiError, FfiResult};

/// Calling convention of the default ABI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CallingConvention {
    /// C calling convention (platform default)
    C,
    /// System V AMD64 ABI (Unix x86-64)
    SysV,
    /// Microsoft x64 calling convention (Windows)
    Win64,
    /// ARM AAPCS (ARM 32-bit)
    Aapcs,
    /// ARM64 calling convention
    Aarch64,
}

impl CallingConvention {
    /// Platform default
    #[inline]
    pub const fn current() -> Self {
        #[cfg(all(target_arch = "x86_64", target_os = "windows"))]
        return Self::Win64;

        #[cfg(all(target_arch = "x86_64", not(target_os = "windows")))]
        return Self::SysV;

        #[cfg(target_arch = "aarch64")]
        return Self::Aarch64;

        #[cfg(target_arch = "arm")]
        return Self::Aapcs;

        #[cfg(not(any(
            target_arch = "x86_64",
            target_arch = "aarch64",
            target_arch = "arm"
        )))]
        return Self::C;
    }

    /// Whether floating-point values travel in separate registers
    #[inline]
    pub const fn has_fp_registers(self) -> bool {
        matches!(self, Self::SysV | Self::Win64 | Self::Aarch64) || !SOFT_FLOAT
    }
}

impl Default for CallingConvention {
    #[inline]
    fn default() -> Self {
        Self::current()
    }
}

const SOFT_FLOAT: bool = cfg!(all(target_arch = "arm", not(target_feature = "vfp2")));

/// Operating system name
pub const OS_NAME: &str = if cfg!(target_os = "windows") {
    "Windows"
} else if cfg!(target_os = "linux") || cfg!(target_os = "android") {
    "Linux"
} else if cfg!(any(target_os = "macos", target_os = "ios")) {
    "OSX"
} else if cfg!(any(
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)) {
    "BSD"
} else if cfg!(unix) {
    "POSIX"
} else {
    "Other"
};

/// Architecture name
pub const ARCH_NAME: &str = if cfg!(target_arch = "x86_64") {
    "x64"
} else if cfg!(target_arch = "x86") {
    "x86"
} else if cfg!(target_arch = "aarch64") {
    if cfg!(target_endian = "big") { "arm64be" } else { "arm64" }
} else if cfg!(target_arch = "arm") {
    if cfg!(target_endian = "big") { "armbe" } else { "arm" }
} else if cfg!(target_arch = "powerpc64") {
    "ppc64"
} else if cfg!(target_arch = "powerpc") {
    "ppc"
} else if cfg!(target_arch = "mips64") {
    "mips64"
} else if cfg!(target_arch = "mips") {
    "mips"
} else if cfg!(target_arch = "riscv64") {
    "riscv64"
} else if cfg!(target_arch = "s390x") {
    "s390x"
} else {
    "other"
};

/// Query one ABI property by name (`"64bit"`, `"le"`, `"win"`, `"hardfp"`, ...)
pub fn abi_flag(name: &str) -> bool {
    match name {
        "64bit" => cfg!(target_pointer_width = "64"),
        "32bit" => cfg!(target_pointer_width = "32"),
        "le" => cfg!(target_endian = "little"),
        "be" => cfg!(target_endian = "big"),
        "win" => cfg!(windows),
        "uwp" => cfg!(target_vendor = "uwp"),
        "eabi" => CallingConvention::current() == CallingConvention::Aapcs,
        "elfv2" => cfg!(all(target_arch = "powerpc64", target_endian = "little")),
        "fpu" => CallingConvention::current().has_fp_registers(),
        "softfp" => SOFT_FLOAT,
        "hardfp" => !SOFT_FLOAT,
        _ => false,
    }
}

/// Alignment of a type in native memory
pub fn native_alignment(ty: &CType) -> usize {
    ty.align()
}

fn unsupported(ty: &CType) -> FfiError {
    FfiError::unsupported_abi(&ty.serialize())
}

/// libffi description of a value of type `ty` laid out in memory
pub(crate) fn ffi_type_for(ty: &CType) -> FfiResult<Type> {
    let t = match ty.kind() {
        CKind::Void => Type::void(),
        CKind::Bool => Type::u8(),
        CKind::Char if ty.is_unsigned() => Type::c_uchar(),
        CKind::Char | CKind::SChar => Type::c_schar(),
        CKind::UChar => Type::c_uchar(),
        CKind::Short => Type::c_short(),
        CKind::UShort => Type::c_ushort(),
        CKind::Int => Type::c_int(),
        CKind::UInt => Type::c_uint(),
        CKind::Long => Type::c_long(),
        CKind::ULong => Type::c_ulong(),
        CKind::LLong => Type::c_longlong(),
        CKind::ULLong => Type::c_ulonglong(),
        CKind::Float => Type::f32(),
        CKind::Double => Type::f64(),
        CKind::Pointer(_) | CKind::Reference(_) => Type::pointer(),
        CKind::Array { elem, len: ArrayLen::Fixed(n) } if *n > 0 => {
            let elem = ffi_type_for(elem)?;
            let elems: Vec<Type> = iter::repeat(elem).take(*n).collect();
            Type::structure(elems)
        }
        CKind::Array { .. } | CKind::Function(_) => return Err(unsupported(ty)),
        CKind::Record(rec) => {
            if rec.is_opaque() || rec.has_flexible_member() || rec.fields().is_empty() {
                return Err(unsupported(ty));
            }
            if rec.is_union() {
                union_type(ty)?
            } else {
                let fields = rec
                    .fields()
                    .iter()
                    .map(|f| ffi_type_for(&f.ty))
                    .collect::<FfiResult<Vec<_>>>()?;
                Type::structure(fields)
            }
        }
    };
    Ok(t)
}

/// A union passes like a struct of its most aligned member repeated to
/// cover the union's size, padded with bytes.
fn union_type(ty: &CType) -> FfiResult<Type> {
    let rec = ty.as_record().ok_or_else(|| unsupported(ty))?;
    let size = rec.size().ok_or_else(|| unsupported(ty))?;
    let widest = rec
        .fields()
        .iter()
        .filter(|f| f.ty.alloc_size().map_or(false, |s| s > 0))
        .max_by_key(|f| f.ty.align())
        .ok_or_else(|| unsupported(ty))?;

    let unit_size = widest.ty.alloc_size().unwrap_or(1);
    let units = size / unit_size;
    let padding = size - units * unit_size;

    let unit = ffi_type_for(&widest.ty)?;
    let members: Vec<Type> = iter::repeat(unit)
        .take(units)
        .chain(iter::repeat(Type::u8()).take(padding))
        .collect();
    Ok(Type::structure(members))
}

/// Parameter type after decay: arrays and functions pass as pointers
pub(crate) fn decay(ty: &CType) -> CType {
    match ty.kind() {
        CKind::Array { elem, .. } => elem.pointer_to(),
        CKind::Function(_) => ty.pointer_to(),
        _ => ty.clone(),
    }
}

/// libffi description of a parameter slot
pub(crate) fn param_type(ty: &CType) -> FfiResult<Type> {
    if ty.is_void() {
        return Err(unsupported(ty));
    }
    ffi_type_for(&decay(ty))
}

/// libffi description of a return slot
pub(crate) fn return_type(ty: &CType) -> FfiResult<Type> {
    if ty.is_array() {
        return Err(unsupported(ty));
    }
    ffi_type_for(ty)
}
