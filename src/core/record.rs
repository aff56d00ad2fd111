//! Struct and union layout
//!
//! Records are declared first and given a body later, so self-referential
//! types (`struct node { struct node *next; }`) can be built. Layout follows
//! the platform C rules: each member is placed at the next multiple of its
//! alignment and the total size is rounded up to the strictest alignment.

use std::sync::Arc;

use once_cell::sync::OnceCell;

use super::ctype::{ArrayLen, CKind, CType};
use crate::errors::{FfiError, FfiResult};
use crate::metatype::{MetaFlags, MetatypeId};

#[derive(Debug, Clone)]
pub struct Field {
    /// `None` for an anonymous nested struct/union member
    pub name: Option<String>,
    pub ty: CType,
    pub offset: usize,
}

#[derive(Debug)]
struct RecordBody {
    fields: Vec<Field>,
    size: usize,
    align: usize,
    flexible: bool,
}

pub struct CRecord {
    name: Option<String>,
    is_union: bool,
    body: OnceCell<RecordBody>,
    metatype: OnceCell<(MetatypeId, MetaFlags)>,
}

impl CRecord {
    /// Declare an incomplete (opaque) record
    pub fn declare(name: Option<&str>, is_union: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.map(str::to_string),
            is_union,
            body: OnceCell::new(),
            metatype: OnceCell::new(),
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_union(&self) -> bool {
        self.is_union
    }

    /// `struct foo`, `union bar`
    pub fn display_name(&self) -> String {
        let tag = if self.is_union { "union" } else { "struct" };
        match &self.name {
            Some(name) => format!("{} {}", tag, name),
            None => format!("{} <anonymous>", tag),
        }
    }

    pub fn is_opaque(&self) -> bool {
        self.body.get().is_none()
    }

    pub fn size(&self) -> Option<usize> {
        self.body.get().map(|b| b.size)
    }

    pub fn align(&self) -> usize {
        self.body.get().map_or(1, |b| b.align)
    }

    /// True if the last member is a flexible array (`T name[]`)
    pub fn has_flexible_member(&self) -> bool {
        self.body.get().map_or(false, |b| b.flexible)
    }

    pub fn fields(&self) -> &[Field] {
        self.body.get().map_or(&[], |b| b.fields.as_slice())
    }

    /// Names reachable through `field_offset`, anonymous members flattened
    pub fn field_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for field in self.fields() {
            match (&field.name, field.ty.as_record()) {
                (Some(name), _) => names.push(name.clone()),
                (None, Some(inner)) => names.extend(inner.field_names()),
                (None, None) => {}
            }
        }
        names
    }

    /// Offset and type of a named member, searching anonymous members too
    pub fn field_offset(&self, name: &str) -> Option<(usize, CType)> {
        for field in self.fields() {
            match &field.name {
                Some(fname) if fname == name => return Some((field.offset, field.ty.clone())),
                None => {
                    if let Some(inner) = field.ty.as_record() {
                        if let Some((off, ty)) = inner.field_offset(name) {
                            return Some((field.offset + off, ty));
                        }
                    }
                }
                _ => {}
            }
        }
        None
    }

    /// Metatype registered for this record, if any
    pub fn metatype(&self) -> Option<(MetatypeId, MetaFlags)> {
        self.metatype.get().copied()
    }

    /// One-shot; returns false if a metatype was already set
    pub(crate) fn set_metatype(&self, id: MetatypeId, flags: MetaFlags) -> bool {
        self.metatype.set((id, flags)).is_ok()
    }

    /// Give a declared record its members and compute the layout
    pub fn define(&self, members: Vec<(Option<String>, CType)>) -> FfiResult<()> {
        let body = layout(self, members)?;
        self.body
            .set(body)
            .map_err(|_| FfiError::type_mismatch(format!("redefinition of '{}'", self.display_name())))
    }
}

impl std::fmt::Debug for CRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CRecord")
            .field("name", &self.display_name())
            .field("size", &self.size())
            .field("fields", &self.fields().len())
            .finish()
    }
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

fn layout(record: &CRecord, members: Vec<(Option<String>, CType)>) -> FfiResult<RecordBody> {
    let count = members.len();
    let mut fields = Vec::with_capacity(count);
    let mut offset = 0usize;
    let mut size = 0usize;
    let mut align = 1usize;
    let mut flexible = false;

    for (i, (name, ty)) in members.into_iter().enumerate() {
        let is_flex = matches!(ty.kind(), CKind::Array { len: ArrayLen::Unbounded, .. });
        let fsize = match ty.alloc_size() {
            Some(sz) => sz,
            None if is_flex && !record.is_union && i + 1 == count => {
                flexible = true;
                0
            }
            None => {
                return Err(FfiError::type_mismatch(format!(
                    "member '{}' of '{}' has incomplete type '{}'",
                    name.as_deref().unwrap_or("<anonymous>"),
                    record.display_name(),
                    ty.serialize()
                )))
            }
        };

        let falign = ty.align();
        align = align.max(falign);

        if record.is_union {
            fields.push(Field { name, ty, offset: 0 });
            size = size.max(fsize);
        } else {
            offset = align_up(offset, falign);
            fields.push(Field { name, ty, offset });
            offset += fsize;
            size = offset;
        }
    }

    Ok(RecordBody {
        fields,
        size: align_up(size, align),
        align,
        flexible,
    })
}

/// Builder for record types
pub struct RecordBuilder {
    record: Arc<CRecord>,
    members: Vec<(Option<String>, CType)>,
}

impl RecordBuilder {
    pub fn new_struct(name: &str) -> Self {
        Self::complete(CRecord::declare(Some(name), false))
    }

    pub fn new_union(name: &str) -> Self {
        Self::complete(CRecord::declare(Some(name), true))
    }

    pub fn anonymous(is_union: bool) -> Self {
        Self::complete(CRecord::declare(None, is_union))
    }

    /// Fill in a previously declared record
    pub fn complete(record: Arc<CRecord>) -> Self {
        Self {
            record,
            members: Vec::new(),
        }
    }

    pub fn field(mut self, name: &str, ty: CType) -> Self {
        self.members.push((Some(name.to_string()), ty));
        self
    }

    /// Anonymous nested struct/union whose members are reachable directly
    pub fn embed(mut self, ty: CType) -> Self {
        self.members.push((None, ty));
        self
    }

    pub fn build(self) -> FfiResult<Arc<CRecord>> {
        self.record.define(self.members)?;
        Ok(self.record)
    }

    /// Build and wrap in a `CType`
    pub fn build_type(self) -> FfiResult<CType> {
        self.build().map(CType::record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_padding() {
        let rec = RecordBuilder::new_struct("s")
            .field("c", CType::char())
            .field("i", CType::int())
            .field("d", CType::double())
            .field("c2", CType::char())
            .build()
            .unwrap();
        assert_eq!(rec.field_offset("c").unwrap().0, 0);
        assert_eq!(rec.field_offset("i").unwrap().0, 4);
        assert_eq!(rec.field_offset("d").unwrap().0, 8);
        assert_eq!(rec.field_offset("c2").unwrap().0, 16);
        assert_eq!(rec.size(), Some(24));
        assert_eq!(rec.align(), 8);
    }

    #[test]
    fn test_union_layout() {
        let rec = RecordBuilder::new_union("u")
            .field("i", CType::int())
            .field("d", CType::double())
            .field("c", CType::char().array_of(ArrayLen::Fixed(10)))
            .build()
            .unwrap();
        assert_eq!(rec.size(), Some(16));
        assert!(rec.fields().iter().all(|f| f.offset == 0));
    }

    #[test]
    fn test_anonymous_members() {
        let inner = RecordBuilder::anonymous(true)
            .field("a", CType::int())
            .field("b", CType::float())
            .build_type()
            .unwrap();
        let rec = RecordBuilder::new_struct("outer")
            .field("tag", CType::char())
            .embed(inner)
            .build()
            .unwrap();
        let (off, ty) = rec.field_offset("b").unwrap();
        assert_eq!(off, 4);
        assert!(ty.is_float());
        assert_eq!(rec.field_names(), vec!["tag", "a", "b"]);
    }

    #[test]
    fn test_flexible_array_member() {
        let rec = RecordBuilder::new_struct("buf")
            .field("len", CType::int())
            .field("data", CType::char().array_of(ArrayLen::Unbounded))
            .build()
            .unwrap();
        assert!(rec.has_flexible_member());
        assert_eq!(rec.size(), Some(4));

        let bad = RecordBuilder::new_struct("bad")
            .field("data", CType::char().array_of(ArrayLen::Unbounded))
            .field("len", CType::int())
            .build();
        assert!(bad.is_err());
    }

    #[test]
    fn test_self_referential() {
        let node = CRecord::declare(Some("node"), false);
        let node_ty = CType::record(node.clone());
        assert!(node_ty.is_unbounded());
        RecordBuilder::complete(node.clone())
            .field("value", CType::int())
            .field("next", node_ty.pointer_to())
            .build()
            .unwrap();
        assert!(!node_ty.is_unbounded());
        assert_eq!(node_ty.alloc_size(), Some(16));
        assert!(node.define(vec![]).is_err());
    }
}
