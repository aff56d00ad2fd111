//! Host scripting values
//!
//! The engine talks to the embedding interpreter through these types:
//! scalars, NUL-terminated strings, opaque handles, callables, tables and
//! typed values.

pub mod registry;

use std::collections::HashMap;
use std::fmt;
use std::os::raw::c_char;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cdata::CData;
use crate::errors::FfiResult;

pub use registry::{Registry, RegistryKey};

/// Immutable byte string, always followed by a NUL so it can be handed to C
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct HostString {
    bytes: Arc<[u8]>,
}

impl HostString {
    pub fn from_bytes(content: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(content.len() + 1);
        bytes.extend_from_slice(content);
        bytes.push(0);
        Self { bytes: bytes.into() }
    }

    /// Content without the trailing NUL
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.bytes.len() - 1]
    }

    /// Content including the trailing NUL
    pub fn as_bytes_with_nul(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_ptr(&self) -> *const c_char {
        self.bytes.as_ptr() as *const c_char
    }

    pub fn len(&self) -> usize {
        self.bytes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(self.as_bytes()).into_owned()
    }
}

impl From<&str> for HostString {
    fn from(s: &str) -> Self {
        Self::from_bytes(s.as_bytes())
    }
}

impl fmt::Debug for HostString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_string_lossy())
    }
}

/// Opaque host pointer (light userdata)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostHandle(pub usize);

impl HostHandle {
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }
}

type HostFn = dyn Fn(&[Value]) -> FfiResult<Vec<Value>> + Send + Sync;

/// Callable host function
#[derive(Clone)]
pub struct HostFunction(Arc<HostFn>);

impl HostFunction {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> FfiResult<Vec<Value>> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(&self, args: &[Value]) -> FfiResult<Vec<Value>> {
        (self.0)(args)
    }

    /// First result or nil
    pub fn call1(&self, args: &[Value]) -> FfiResult<Value> {
        Ok(self.call(args)?.into_iter().next().unwrap_or(Value::Nil))
    }

    pub fn ptr_eq(&self, other: &HostFunction) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "function: {:p}", Arc::as_ptr(&self.0) as *const u8)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TableKey {
    Integer(i64),
    String(String),
    Boolean(bool),
}

impl TableKey {
    /// Key for a host value; integral numbers normalise to integers
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Integer(i) => Some(Self::Integer(*i)),
            Value::Number(n) if n.fract() == 0.0 && n.is_finite() => Some(Self::Integer(*n as i64)),
            Value::String(s) => Some(Self::String(s.to_string_lossy())),
            Value::Boolean(b) => Some(Self::Boolean(*b)),
            _ => None,
        }
    }
}

impl From<&str> for TableKey {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<i64> for TableKey {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

/// Shared mutable host table
#[derive(Clone, Default)]
pub struct Table(Arc<Mutex<HashMap<TableKey, Value>>>);

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with `values` at keys `1..=n`
    pub fn sequence(values: Vec<Value>) -> Self {
        let table = Self::new();
        for (i, value) in values.into_iter().enumerate() {
            table.set(TableKey::Integer(i as i64 + 1), value);
        }
        table
    }

    pub fn from_pairs<K: Into<TableKey>>(pairs: Vec<(K, Value)>) -> Self {
        let table = Self::new();
        for (key, value) in pairs {
            table.set(key.into(), value);
        }
        table
    }

    pub fn get(&self, key: impl Into<TableKey>) -> Value {
        self.0.lock().get(&key.into()).cloned().unwrap_or(Value::Nil)
    }

    /// Lookup by an arbitrary host value; unusable keys read as nil
    pub fn get_value(&self, key: &Value) -> Value {
        match TableKey::from_value(key) {
            Some(key) => self.get(key),
            None => Value::Nil,
        }
    }

    /// Setting nil removes the key
    pub fn set(&self, key: impl Into<TableKey>, value: Value) {
        let key = key.into();
        let mut map = self.0.lock();
        if value.is_nil() {
            map.remove(&key);
        } else {
            map.insert(key, value);
        }
    }

    pub fn contains(&self, key: impl Into<TableKey>) -> bool {
        self.0.lock().contains_key(&key.into())
    }

    /// Border of the sequence part
    pub fn len(&self) -> usize {
        let map = self.0.lock();
        let mut n = 0;
        while map.contains_key(&TableKey::Integer(n as i64 + 1)) {
            n += 1;
        }
        n
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    /// Snapshot of the string-keyed entries
    pub fn string_entries(&self) -> Vec<(String, Value)> {
        self.0
            .lock()
            .iter()
            .filter_map(|(k, v)| match k {
                TableKey::String(s) => Some((s.clone(), v.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn ptr_eq(&self, other: &Table) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table: {:p}", Arc::as_ptr(&self.0))
    }
}

/// A value of the host interpreter
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(HostString),
    Handle(HostHandle),
    Function(HostFunction),
    Table(Table),
    CData(CData),
}

impl Value {
    pub fn string(s: &str) -> Self {
        Self::String(HostString::from(s))
    }

    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> FfiResult<Vec<Value>> + Send + Sync + 'static,
    {
        Self::Function(HostFunction::new(f))
    }

    /// Host type name, as reported by `type()`
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Boolean(_) => "boolean",
            Self::Integer(_) | Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Handle(_) => "userdata",
            Self::Function(_) => "function",
            Self::Table(_) => "table",
            Self::CData(_) => "cdata",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// Host truthiness: only nil and false are false
    pub fn truthy(&self) -> bool {
        !matches!(self, Self::Nil | Self::Boolean(false))
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Number(n) if n.fract() == 0.0 && n.is_finite() => Some(*n as i64),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_cdata(&self) -> Option<&CData> {
        match self {
            Self::CData(cd) => Some(cd),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&HostString> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Integer(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::string(s)
    }
}

impl From<CData> for Value {
    fn from(cd: CData) -> Self {
        Self::CData(cd)
    }
}

impl From<Table> for Value {
    fn from(t: Table) -> Self {
        Self::Table(t)
    }
}

impl From<HostFunction> for Value {
    fn from(f: HostFunction) -> Self {
        Self::Function(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_string_nul() {
        let s = HostString::from("abc");
        assert_eq!(s.len(), 3);
        assert_eq!(s.as_bytes_with_nul(), b"abc\0");
    }

    #[test]
    fn test_table_sequence_len() {
        let t = Table::sequence(vec![1.into(), 2.into(), 3.into()]);
        assert_eq!(t.len(), 3);
        t.set(2i64, Value::Nil);
        assert_eq!(t.len(), 1);
        assert!(matches!(t.get(3i64), Value::Integer(3)));
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::Number(4.0).as_integer(), Some(4));
        assert_eq!(Value::Number(4.5).as_integer(), None);
        assert_eq!(Value::Integer(7).type_name(), "number");
        assert!(!Value::Boolean(false).truthy());
        assert!(Value::Integer(0).truthy());
    }
}
