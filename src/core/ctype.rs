//! C type descriptors
//!
//! A `CType` is an immutable, reference-counted description of a native
//! type. Descriptors are shared freely between typed values; only the
//! metatype slot on a record may be written, and only once.

use std::fmt;
use std::mem::{align_of, size_of};
use std::os::raw::{c_char, c_int, c_long, c_longlong, c_short};
use std::sync::Arc;

use bitflags::bitflags;

use super::function::CFunction;
use super::record::CRecord;

bitflags! {
    /// cv-qualifiers of a type
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Quals: u8 {
        const CONST = 1 << 0;
        const VOLATILE = 1 << 1;
    }
}

/// Length of an array type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayLen {
    Fixed(usize),
    /// `T[?]`, the count is supplied at construction
    Variable,
    /// `T[]`
    Unbounded,
}

#[derive(Clone)]
pub enum CKind {
    Void,
    Bool,
    Char,
    SChar,
    UChar,
    Short,
    UShort,
    Int,
    UInt,
    Long,
    ULong,
    LLong,
    ULLong,
    Float,
    Double,
    Pointer(CType),
    Reference(CType),
    Array { elem: CType, len: ArrayLen },
    Record(Arc<CRecord>),
    Function(Arc<CFunction>),
}

struct TypeRepr {
    kind: CKind,
    quals: Quals,
    closure: bool,
}

#[derive(Clone)]
pub struct CType(Arc<TypeRepr>);

impl CType {
    pub fn new(kind: CKind) -> Self {
        Self(Arc::new(TypeRepr {
            kind,
            quals: Quals::empty(),
            closure: false,
        }))
    }

    pub fn void() -> Self { Self::new(CKind::Void) }
    pub fn bool() -> Self { Self::new(CKind::Bool) }
    pub fn char() -> Self { Self::new(CKind::Char) }
    pub fn uchar() -> Self { Self::new(CKind::UChar) }
    pub fn short() -> Self { Self::new(CKind::Short) }
    pub fn int() -> Self { Self::new(CKind::Int) }
    pub fn uint() -> Self { Self::new(CKind::UInt) }
    pub fn long() -> Self { Self::new(CKind::Long) }
    pub fn ulong() -> Self { Self::new(CKind::ULong) }
    pub fn llong() -> Self { Self::new(CKind::LLong) }
    pub fn ullong() -> Self { Self::new(CKind::ULLong) }
    pub fn float() -> Self { Self::new(CKind::Float) }
    pub fn double() -> Self { Self::new(CKind::Double) }

    pub fn record(record: Arc<CRecord>) -> Self {
        Self::new(CKind::Record(record))
    }

    pub fn function(func: CFunction) -> Self {
        Self::new(CKind::Function(Arc::new(func)))
    }

    /// `self *`
    pub fn pointer_to(&self) -> Self {
        Self::new(CKind::Pointer(self.clone()))
    }

    /// `self &`
    pub fn reference_to(&self) -> Self {
        Self::new(CKind::Reference(self.clone()))
    }

    pub fn array_of(&self, len: ArrayLen) -> Self {
        Self::new(CKind::Array {
            elem: self.clone(),
            len,
        })
    }

    /// Same type with different qualifiers
    pub fn with_quals(&self, quals: Quals) -> Self {
        Self(Arc::new(TypeRepr {
            kind: self.0.kind.clone(),
            quals,
            closure: self.0.closure,
        }))
    }

    pub fn as_const(&self) -> Self {
        self.with_quals(self.quals() | Quals::CONST)
    }

    /// Function pointer type marked as backed by a callback trampoline
    pub fn as_closure(&self) -> Self {
        Self(Arc::new(TypeRepr {
            kind: self.0.kind.clone(),
            quals: self.0.quals,
            closure: true,
        }))
    }

    /// Re-derive the descriptor as a pointer or reference over the same base.
    ///
    /// A pointer/reference keeps its pointee; any other type becomes the base.
    pub fn derive_as_pointer(&self) -> Self {
        match &self.0.kind {
            CKind::Pointer(_) => self.clone(),
            CKind::Reference(base) => base.pointer_to(),
            _ => self.pointer_to(),
        }
    }

    pub fn derive_as_reference(&self) -> Self {
        match &self.0.kind {
            CKind::Reference(_) => self.clone(),
            CKind::Pointer(base) => base.reference_to(),
            _ => self.reference_to(),
        }
    }

    #[inline]
    pub fn kind(&self) -> &CKind {
        &self.0.kind
    }

    #[inline]
    pub fn quals(&self) -> Quals {
        self.0.quals
    }

    #[inline]
    pub fn is_const(&self) -> bool {
        self.0.quals.contains(Quals::CONST)
    }

    #[inline]
    pub fn is_closure(&self) -> bool {
        self.0.closure
    }

    /// Identity of the descriptor allocation
    pub fn ptr_eq(&self, other: &CType) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Byte size of a value of this type, `None` if it cannot be allocated
    /// without more information (unbounded arrays, VLAs, functions, opaque records).
    pub fn alloc_size(&self) -> Option<usize> {
        match &self.0.kind {
            CKind::Void => Some(0),
            CKind::Bool | CKind::Char | CKind::SChar | CKind::UChar => Some(1),
            CKind::Short | CKind::UShort => Some(size_of::<c_short>()),
            CKind::Int | CKind::UInt => Some(size_of::<c_int>()),
            CKind::Long | CKind::ULong => Some(size_of::<c_long>()),
            CKind::LLong | CKind::ULLong => Some(size_of::<c_longlong>()),
            CKind::Float => Some(size_of::<f32>()),
            CKind::Double => Some(size_of::<f64>()),
            CKind::Pointer(_) | CKind::Reference(_) => Some(size_of::<*const u8>()),
            CKind::Array { elem, len } => match len {
                ArrayLen::Fixed(n) => elem.alloc_size().map(|sz| sz * n),
                ArrayLen::Variable | ArrayLen::Unbounded => None,
            },
            CKind::Record(rec) => rec.size(),
            CKind::Function(_) => None,
        }
    }

    /// Size of a variable-length array for the given element count
    pub fn vla_size(&self, count: usize) -> Option<usize> {
        match &self.0.kind {
            CKind::Array { elem, .. } => elem.alloc_size().map(|sz| sz * count),
            _ => self.alloc_size(),
        }
    }

    /// Natural C alignment
    pub fn align(&self) -> usize {
        match &self.0.kind {
            CKind::Void => 1,
            CKind::Bool | CKind::Char | CKind::SChar | CKind::UChar => 1,
            CKind::Short | CKind::UShort => align_of::<c_short>(),
            CKind::Int | CKind::UInt => align_of::<c_int>(),
            CKind::Long | CKind::ULong => align_of::<c_long>(),
            CKind::LLong | CKind::ULLong => align_of::<c_longlong>(),
            CKind::Float => align_of::<f32>(),
            CKind::Double => align_of::<f64>(),
            CKind::Pointer(_) | CKind::Reference(_) | CKind::Function(_) => {
                align_of::<*const u8>()
            }
            CKind::Array { elem, .. } => elem.align(),
            CKind::Record(rec) => rec.align(),
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self.0.kind, CKind::Void)
    }

    pub fn is_bool(&self) -> bool {
        matches!(self.0.kind, CKind::Bool)
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self.0.kind,
            CKind::Char
                | CKind::SChar
                | CKind::UChar
                | CKind::Short
                | CKind::UShort
                | CKind::Int
                | CKind::UInt
                | CKind::Long
                | CKind::ULong
                | CKind::LLong
                | CKind::ULLong
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self.0.kind, CKind::Float | CKind::Double)
    }

    pub fn is_arithmetic(&self) -> bool {
        self.is_bool() || self.is_integer() || self.is_float()
    }

    pub fn is_unsigned(&self) -> bool {
        match self.0.kind {
            CKind::Bool | CKind::UChar | CKind::UShort | CKind::UInt | CKind::ULong | CKind::ULLong => true,
            CKind::Char => c_char::MIN == 0,
            _ => false,
        }
    }

    /// `char`, `signed char` or `unsigned char`
    pub fn is_char_like(&self) -> bool {
        matches!(self.0.kind, CKind::Char | CKind::SChar | CKind::UChar)
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self.0.kind, CKind::Pointer(_))
    }

    pub fn is_reference(&self) -> bool {
        matches!(self.0.kind, CKind::Reference(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self.0.kind, CKind::Array { .. })
    }

    pub fn is_record(&self) -> bool {
        matches!(self.0.kind, CKind::Record(_))
    }

    pub fn is_function(&self) -> bool {
        matches!(self.0.kind, CKind::Function(_))
    }

    /// Functions and pointers to functions
    pub fn is_callable(&self) -> bool {
        self.function_sig().is_some()
    }

    pub fn is_variable_length(&self) -> bool {
        matches!(self.0.kind, CKind::Array { len: ArrayLen::Variable, .. })
    }

    pub fn is_unbounded(&self) -> bool {
        match &self.0.kind {
            CKind::Array { len: ArrayLen::Unbounded, .. } => true,
            CKind::Record(rec) => rec.is_opaque(),
            _ => false,
        }
    }

    /// Pointee of a pointer/reference or element of an array
    pub fn pointee(&self) -> Option<&CType> {
        match &self.0.kind {
            CKind::Pointer(base) | CKind::Reference(base) => Some(base),
            CKind::Array { elem, .. } => Some(elem),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Arc<CRecord>> {
        match &self.0.kind {
            CKind::Record(rec) => Some(rec),
            _ => None,
        }
    }

    /// Signature of a function or function pointer type
    pub fn function_sig(&self) -> Option<&Arc<CFunction>> {
        match &self.0.kind {
            CKind::Function(func) => Some(func),
            CKind::Pointer(base) => match base.kind() {
                CKind::Function(func) => Some(func),
                _ => None,
            },
            _ => None,
        }
    }

    /// Record reached directly or through one pointer/reference level
    pub fn record_target(&self) -> Option<&Arc<CRecord>> {
        match &self.0.kind {
            CKind::Record(rec) => Some(rec),
            CKind::Pointer(base) | CKind::Reference(base) => base.as_record(),
            _ => None,
        }
    }

    /// Structural type identity
    pub fn is_same(&self, other: &CType, ignore_quals: bool) -> bool {
        if !ignore_quals && self.quals() != other.quals() {
            return false;
        }
        match (&self.0.kind, &other.0.kind) {
            (CKind::Pointer(a), CKind::Pointer(b)) | (CKind::Reference(a), CKind::Reference(b)) => {
                a.is_same(b, false)
            }
            (CKind::Array { elem: ea, len: la }, CKind::Array { elem: eb, len: lb }) => {
                la == lb && ea.is_same(eb, false)
            }
            (CKind::Record(a), CKind::Record(b)) => Arc::ptr_eq(a, b),
            (CKind::Function(a), CKind::Function(b)) => a.is_same(b),
            (a, b) => std::mem::discriminant(a) == std::mem::discriminant(b),
        }
    }

    fn base_name(&self) -> String {
        match &self.0.kind {
            CKind::Void => "void".into(),
            CKind::Bool => "bool".into(),
            CKind::Char => "char".into(),
            CKind::SChar => "signed char".into(),
            CKind::UChar => "unsigned char".into(),
            CKind::Short => "short".into(),
            CKind::UShort => "unsigned short".into(),
            CKind::Int => "int".into(),
            CKind::UInt => "unsigned int".into(),
            CKind::Long => "long".into(),
            CKind::ULong => "unsigned long".into(),
            CKind::LLong => "long long".into(),
            CKind::ULLong => "unsigned long long".into(),
            CKind::Float => "float".into(),
            CKind::Double => "double".into(),
            CKind::Record(rec) => rec.display_name(),
            CKind::Pointer(_) | CKind::Reference(_) | CKind::Array { .. } | CKind::Function(_) => {
                String::new()
            }
        }
    }

    fn quals_text(&self) -> &'static str {
        let q = self.quals();
        if q.contains(Quals::CONST | Quals::VOLATILE) {
            " const volatile"
        } else if q.contains(Quals::CONST) {
            " const"
        } else if q.contains(Quals::VOLATILE) {
            " volatile"
        } else {
            ""
        }
    }

    /// Build the (base, declarator) pair around an inner declarator
    fn declarator(&self, inner: String) -> (String, String) {
        match &self.0.kind {
            CKind::Pointer(base) | CKind::Reference(base) => {
                let sigil = if self.is_pointer() { "*" } else { "&" };
                let quals = self.quals_text().trim_start();
                let sep = if !quals.is_empty() && !inner.is_empty() { " " } else { "" };
                let mut decl = format!("{}{}{}{}", sigil, quals, sep, inner);
                if base.is_array() || base.is_function() {
                    decl = format!("({})", decl);
                }
                base.declarator(decl)
            }
            CKind::Array { elem, len } => {
                let dim = match len {
                    ArrayLen::Fixed(n) => n.to_string(),
                    ArrayLen::Variable => "?".to_string(),
                    ArrayLen::Unbounded => String::new(),
                };
                elem.declarator(format!("{}[{}]", inner, dim))
            }
            CKind::Function(func) => {
                let mut params: Vec<String> = func.params.iter().map(|p| p.serialize()).collect();
                if func.variadic {
                    params.push("...".to_string());
                } else if params.is_empty() {
                    params.push("void".to_string());
                }
                func.ret.declarator(format!("{}({})", inner, params.join(", ")))
            }
            _ => (format!("{}{}", self.base_name(), self.quals_text()), inner),
        }
    }

    /// C declarator text, e.g. `int (*)(int)` or `char const *`
    pub fn serialize(&self) -> String {
        let (base, decl) = self.declarator(String::new());
        if decl.is_empty() {
            base
        } else {
            format!("{} {}", base, decl)
        }
    }
}

impl fmt::Debug for CType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CType({})", self.serialize())
    }
}

impl fmt::Display for CType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record::RecordBuilder;

    #[test]
    fn test_serialize_declarators() {
        assert_eq!(CType::int().serialize(), "int");
        assert_eq!(CType::int().pointer_to().serialize(), "int *");
        assert_eq!(CType::int().array_of(ArrayLen::Fixed(4)).serialize(), "int [4]");
        assert_eq!(CType::char().as_const().pointer_to().serialize(), "char const *");
        assert_eq!(CType::int().pointer_to().pointer_to().serialize(), "int **");
        assert_eq!(CType::int().reference_to().serialize(), "int &");

        let func = CType::function(CFunction::new(CType::int(), vec![CType::int()], false));
        assert_eq!(func.serialize(), "int (int)");
        assert_eq!(func.pointer_to().serialize(), "int (*)(int)");

        let arr_ptr = CType::double().array_of(ArrayLen::Fixed(3)).pointer_to();
        assert_eq!(arr_ptr.serialize(), "double (*)[3]");

        let variadic = CType::function(CFunction::new(
            CType::int(),
            vec![CType::char().as_const().pointer_to()],
            true,
        ));
        assert_eq!(variadic.serialize(), "int (char const *, ...)");
    }

    #[test]
    fn test_sizes() {
        assert_eq!(CType::char().alloc_size(), Some(1));
        assert_eq!(CType::int().alloc_size(), Some(4));
        assert_eq!(CType::llong().alloc_size(), Some(8));
        assert_eq!(CType::int().pointer_to().alloc_size(), Some(size_of::<usize>()));
        assert_eq!(CType::int().array_of(ArrayLen::Fixed(5)).alloc_size(), Some(20));
        assert_eq!(CType::int().array_of(ArrayLen::Unbounded).alloc_size(), None);
        assert_eq!(CType::int().array_of(ArrayLen::Variable).vla_size(3), Some(12));
    }

    #[test]
    fn test_is_same() {
        let a = CType::int().pointer_to();
        let b = CType::int().pointer_to();
        assert!(a.is_same(&b, false));
        assert!(!a.is_same(&CType::uint().pointer_to(), false));
        assert!(CType::int().as_const().is_same(&CType::int(), true));
        assert!(!CType::int().as_const().is_same(&CType::int(), false));

        let p1 = RecordBuilder::new_struct("p").field("x", CType::int()).build().unwrap();
        let p2 = RecordBuilder::new_struct("p").field("x", CType::int()).build().unwrap();
        assert!(CType::record(p1.clone()).is_same(&CType::record(p1), false));
        assert!(!CType::record(p2.clone()).is_same(&CType::record(
            RecordBuilder::new_struct("p").field("x", CType::int()).build().unwrap()
        ), false));
    }

    #[test]
    fn test_derive() {
        let r = CType::int().reference_to();
        assert_eq!(r.derive_as_pointer().serialize(), "int *");
        assert_eq!(CType::int().derive_as_reference().serialize(), "int &");
        assert!(CType::int().pointer_to().is_same(&CType::int().pointer_to().derive_as_pointer(), false));
    }
}
