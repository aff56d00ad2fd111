//! Per-record operator overloads
//!
//! A record type may carry one capability table. Registration computes a
//! flag set from the keys present; dispatch checks the flag first and only
//! then reads the capability from the table, falling back to built-in
//! semantics on a miss.

use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use parking_lot::Mutex;
use tracing::debug;

use crate::config::HostConfig;
use crate::core::CType;
use crate::errors::{ErrorKind, FfiError, FfiResult};
use crate::host::{Registry, RegistryKey, Table, Value};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MetaFlags: u32 {
        const ADD = 1 << 0;
        const SUB = 1 << 1;
        const MUL = 1 << 2;
        const DIV = 1 << 3;
        const MOD = 1 << 4;
        const POW = 1 << 5;
        const UNM = 1 << 6;
        const CONCAT = 1 << 7;
        const LEN = 1 << 8;
        const EQ = 1 << 9;
        const LT = 1 << 10;
        const LE = 1 << 11;
        const INDEX = 1 << 12;
        const NEWINDEX = 1 << 13;
        const CALL = 1 << 14;
        const GC = 1 << 15;
        const TOSTRING = 1 << 16;
        const PAIRS = 1 << 17;
        const IPAIRS = 1 << 18;
        const IDIV = 1 << 19;
        const BAND = 1 << 20;
        const BOR = 1 << 21;
        const BXOR = 1 << 22;
        const BNOT = 1 << 23;
        const SHL = 1 << 24;
        const SHR = 1 << 25;
    }
}

/// Overridable operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Unm,
    Concat,
    Len,
    Eq,
    Lt,
    Le,
    Index,
    NewIndex,
    Call,
    Gc,
    ToString,
    Pairs,
    IPairs,
    IDiv,
    BAnd,
    BOr,
    BXor,
    BNot,
    Shl,
    Shr,
}

impl MetaOp {
    pub const ALL: [MetaOp; 26] = [
        Self::Add,
        Self::Sub,
        Self::Mul,
        Self::Div,
        Self::Mod,
        Self::Pow,
        Self::Unm,
        Self::Concat,
        Self::Len,
        Self::Eq,
        Self::Lt,
        Self::Le,
        Self::Index,
        Self::NewIndex,
        Self::Call,
        Self::Gc,
        Self::ToString,
        Self::Pairs,
        Self::IPairs,
        Self::IDiv,
        Self::BAnd,
        Self::BOr,
        Self::BXor,
        Self::BNot,
        Self::Shl,
        Self::Shr,
    ];

    /// Key in the capability table
    pub const fn key(self) -> &'static str {
        match self {
            Self::Add => "__add",
            Self::Sub => "__sub",
            Self::Mul => "__mul",
            Self::Div => "__div",
            Self::Mod => "__mod",
            Self::Pow => "__pow",
            Self::Unm => "__unm",
            Self::Concat => "__concat",
            Self::Len => "__len",
            Self::Eq => "__eq",
            Self::Lt => "__lt",
            Self::Le => "__le",
            Self::Index => "__index",
            Self::NewIndex => "__newindex",
            Self::Call => "__call",
            Self::Gc => "__gc",
            Self::ToString => "__tostring",
            Self::Pairs => "__pairs",
            Self::IPairs => "__ipairs",
            Self::IDiv => "__idiv",
            Self::BAnd => "__band",
            Self::BOr => "__bor",
            Self::BXor => "__bxor",
            Self::BNot => "__bnot",
            Self::Shl => "__shl",
            Self::Shr => "__shr",
        }
    }

    pub const fn flag(self) -> MetaFlags {
        match self {
            Self::Add => MetaFlags::ADD,
            Self::Sub => MetaFlags::SUB,
            Self::Mul => MetaFlags::MUL,
            Self::Div => MetaFlags::DIV,
            Self::Mod => MetaFlags::MOD,
            Self::Pow => MetaFlags::POW,
            Self::Unm => MetaFlags::UNM,
            Self::Concat => MetaFlags::CONCAT,
            Self::Len => MetaFlags::LEN,
            Self::Eq => MetaFlags::EQ,
            Self::Lt => MetaFlags::LT,
            Self::Le => MetaFlags::LE,
            Self::Index => MetaFlags::INDEX,
            Self::NewIndex => MetaFlags::NEWINDEX,
            Self::Call => MetaFlags::CALL,
            Self::Gc => MetaFlags::GC,
            Self::ToString => MetaFlags::TOSTRING,
            Self::Pairs => MetaFlags::PAIRS,
            Self::IPairs => MetaFlags::IPAIRS,
            Self::IDiv => MetaFlags::IDIV,
            Self::BAnd => MetaFlags::BAND,
            Self::BOr => MetaFlags::BOR,
            Self::BXor => MetaFlags::BXOR,
            Self::BNot => MetaFlags::BNOT,
            Self::Shl => MetaFlags::SHL,
            Self::Shr => MetaFlags::SHR,
        }
    }

    /// Whether the host recognises this key at all
    fn enabled(self, host: &HostConfig) -> bool {
        match self {
            Self::IPairs => host.ipairs_metamethod,
            Self::IDiv | Self::BAnd | Self::BOr | Self::BXor | Self::BNot | Self::Shl | Self::Shr => {
                host.bitwise_metamethods
            }
            _ => true,
        }
    }
}

/// Handle to a registered capability table.
///
/// Ids carry the owning registry's serial so a descriptor shared between
/// two engines never resolves against the wrong table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetatypeId {
    owner: u32,
    slot: u32,
}

static NEXT_OWNER: AtomicU32 = AtomicU32::new(1);

/// Capability tables of one engine
pub struct MetatypeRegistry {
    serial: u32,
    host: HostConfig,
    registry: Registry,
    tables: Mutex<Vec<RegistryKey>>,
}

impl MetatypeRegistry {
    pub fn new(registry: Registry, host: HostConfig) -> Self {
        Self {
            serial: NEXT_OWNER.fetch_add(1, Ordering::Relaxed),
            host,
            registry,
            tables: Mutex::new(Vec::new()),
        }
    }

    /// Attach `table` to the record type `ty`; one-shot per record
    pub fn register(&self, ty: &CType, table: Table) -> FfiResult<MetatypeId> {
        let record = ty.as_record().ok_or_else(|| {
            FfiError::type_mismatch(format!("'{}' is not a struct or union type", ty))
        })?;

        if record.metatype().is_some() {
            return Err(ErrorKind::ProtectedRegistration { ty: ty.serialize() }.into());
        }

        let flags = MetaOp::ALL
            .iter()
            .filter(|op| op.enabled(&self.host) && !table.get(op.key()).is_nil())
            .fold(MetaFlags::empty(), |acc, op| acc | op.flag());

        let mut tables = self.tables.lock();
        let id = MetatypeId {
            owner: self.serial,
            slot: tables.len() as u32,
        };
        if !record.set_metatype(id, flags) {
            return Err(ErrorKind::ProtectedRegistration { ty: ty.serialize() }.into());
        }
        tables.push(self.registry.insert(Value::Table(table)));

        debug!(target: "cffi::metatype", ty = %ty, ?flags, "registered metatype");
        Ok(id)
    }

    /// Capability table registered for the record behind `ty`
    pub fn table_for(&self, ty: &CType) -> Option<Table> {
        let (id, _) = ty.record_target()?.metatype()?;
        self.table(id)
    }

    fn table(&self, id: MetatypeId) -> Option<Table> {
        if id.owner != self.serial {
            return None;
        }
        match self.tables.lock().get(id.slot as usize)?.get() {
            Value::Table(table) => Some(table),
            _ => None,
        }
    }

    /// Capability for `op` on a value of type `ty`.
    ///
    /// Applies to records and to pointers/references to records.
    pub fn lookup(&self, ty: &CType, op: MetaOp) -> Option<Value> {
        let (id, flags) = ty.record_target()?.metatype()?;
        if !flags.contains(op.flag()) {
            return None;
        }
        let capability = self.table(id)?.get(op.key());
        if capability.is_nil() {
            None
        } else {
            Some(capability)
        }
    }

    pub fn len(&self) -> usize {
        self.tables.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RecordBuilder;

    fn point() -> CType {
        RecordBuilder::new_struct("point")
            .field("x", CType::int())
            .build_type()
            .unwrap()
    }

    #[test]
    fn test_flags_from_keys() {
        let metatypes = MetatypeRegistry::new(Registry::new(), HostConfig::default());
        let ty = point();
        let table = Table::from_pairs(vec![
            ("__add", Value::function(|_| Ok(vec![]))),
            ("__index", Value::Table(Table::new())),
        ]);
        metatypes.register(&ty, table).unwrap();

        let (_, flags) = ty.as_record().unwrap().metatype().unwrap();
        assert_eq!(flags, MetaFlags::ADD | MetaFlags::INDEX);
        assert!(metatypes.lookup(&ty, MetaOp::Add).is_some());
        assert!(metatypes.lookup(&ty, MetaOp::Sub).is_none());
        assert!(metatypes.lookup(&ty.pointer_to(), MetaOp::Index).is_some());
        assert!(metatypes.lookup(&ty.reference_to(), MetaOp::Index).is_some());
    }

    #[test]
    fn test_one_shot() {
        let metatypes = MetatypeRegistry::new(Registry::new(), HostConfig::default());
        let ty = point();
        let first = Table::from_pairs(vec![("__len", Value::Integer(1))]);
        metatypes.register(&ty, first.clone()).unwrap();

        let err = metatypes.register(&ty, Table::new()).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::ProtectedRegistration { .. }));
        assert!(metatypes.table_for(&ty).unwrap().ptr_eq(&first));
    }

    #[test]
    fn test_bitwise_keys_need_host_support() {
        let host = HostConfig {
            bitwise_metamethods: false,
            ..HostConfig::default()
        };
        let metatypes = MetatypeRegistry::new(Registry::new(), host);
        let ty = point();
        let table = Table::from_pairs(vec![("__band", Value::Integer(1))]);
        metatypes.register(&ty, table).unwrap();
        assert!(metatypes.lookup(&ty, MetaOp::BAnd).is_none());
    }

    #[test]
    fn test_non_record_rejected() {
        let metatypes = MetatypeRegistry::new(Registry::new(), HostConfig::default());
        let err = metatypes.register(&CType::int(), Table::new()).unwrap_err();
        assert!(err.is_type_mismatch());
    }

    #[test]
    fn test_foreign_registry_ignored() {
        let a = MetatypeRegistry::new(Registry::new(), HostConfig::default());
        let b = MetatypeRegistry::new(Registry::new(), HostConfig::default());
        let ty = point();
        a.register(&ty, Table::from_pairs(vec![("__len", Value::Integer(1))]))
            .unwrap();
        assert!(b.lookup(&ty, MetaOp::Len).is_none());
    }
}
