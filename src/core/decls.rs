//! Declaration store
//!
//! Maps declared names to functions, variables, constants, typedefs and
//! tagged records. Lookups go through a `DashMap`, so readers never block.

use std::sync::Arc;

use dashmap::DashMap;

use super::ctype::CType;
use super::record::CRecord;
use crate::errors::{FfiError, FfiResult};

#[derive(Debug, Clone)]
pub enum Decl {
    /// External function; the type is a function type
    Function(CType),
    /// External global variable
    Variable(CType),
    /// Integer constant (enumerators, `static const int`)
    Constant { ty: CType, value: i64 },
    Typedef(CType),
    Record(Arc<CRecord>),
}

impl Decl {
    pub fn ty(&self) -> CType {
        match self {
            Self::Function(ty) | Self::Variable(ty) | Self::Typedef(ty) => ty.clone(),
            Self::Constant { ty, .. } => ty.clone(),
            Self::Record(rec) => CType::record(rec.clone()),
        }
    }
}

#[derive(Default)]
pub struct DeclStore {
    decls: DashMap<String, Decl>,
}

impl DeclStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a declaration; records are keyed as `struct name`/`union name`.
    ///
    /// Redeclaring a name with an identical type is accepted.
    pub fn declare(&self, name: &str, decl: Decl) -> FfiResult<()> {
        let key = match &decl {
            Decl::Record(rec) => rec.display_name(),
            _ => name.to_string(),
        };

        if let Some(existing) = self.decls.get(&key) {
            if existing.ty().is_same(&decl.ty(), false) {
                return Ok(());
            }
            return Err(FfiError::type_mismatch(format!("'{}' redefined", key)));
        }

        self.decls.insert(key, decl);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Decl> {
        self.decls.get(name).map(|d| d.value().clone())
    }

    pub fn len(&self) -> usize {
        self.decls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decls.is_empty()
    }

    /// Resolve a type name: builtin names, typedefs and `struct`/`union` tags.
    ///
    /// A trailing run of `*` adds pointer levels, so `"char *"` works.
    pub fn type_named(&self, name: &str) -> Option<CType> {
        let trimmed = name.trim();
        if let Some(base) = trimmed.strip_suffix('*') {
            return self.type_named(base).map(|t| t.pointer_to());
        }
        if let Some(base) = trimmed.strip_suffix("const") {
            if base.ends_with(' ') {
                return self.type_named(base).map(|t| t.as_const());
            }
        }

        if let Some(ty) = builtin_type(trimmed) {
            return Some(ty);
        }

        match self.decls.get(trimmed)?.value() {
            Decl::Typedef(ty) => Some(ty.clone()),
            Decl::Record(rec) => Some(CType::record(rec.clone())),
            _ => None,
        }
    }

    /// All declared names, used for suggestions
    pub fn names(&self) -> Vec<String> {
        self.decls.iter().map(|e| e.key().clone()).collect()
    }
}

fn builtin_type(name: &str) -> Option<CType> {
    use std::mem::size_of;

    let ty = match name {
        "void" => CType::void(),
        "bool" | "_Bool" => CType::bool(),
        "char" => CType::char(),
        "signed char" => CType::new(super::ctype::CKind::SChar),
        "unsigned char" | "uint8_t" => CType::uchar(),
        "int8_t" => CType::new(super::ctype::CKind::SChar),
        "short" | "short int" | "signed short" | "int16_t" => CType::short(),
        "unsigned short" | "unsigned short int" | "uint16_t" => {
            CType::new(super::ctype::CKind::UShort)
        }
        "int" | "signed" | "signed int" | "int32_t" => CType::int(),
        "unsigned" | "unsigned int" | "uint32_t" => CType::uint(),
        "long" | "long int" | "signed long" => CType::long(),
        "unsigned long" | "unsigned long int" => CType::ulong(),
        "long long" | "long long int" | "signed long long" => CType::llong(),
        "unsigned long long" | "unsigned long long int" => CType::ullong(),
        "int64_t" => CType::llong(),
        "uint64_t" => CType::ullong(),
        "float" => CType::float(),
        "double" => CType::double(),
        "size_t" | "uintptr_t" => {
            if size_of::<usize>() == size_of::<std::os::raw::c_ulong>() {
                CType::ulong()
            } else {
                CType::ullong()
            }
        }
        "ssize_t" | "intptr_t" | "ptrdiff_t" => {
            if size_of::<isize>() == size_of::<std::os::raw::c_long>() {
                CType::long()
            } else {
                CType::llong()
            }
        }
        _ => return None,
    };
    Some(ty)
}
