//! Native type descriptors and the declaration store

pub mod ctype;
pub mod decls;
pub mod function;
pub mod record;

pub use ctype::{ArrayLen, CKind, CType, Quals};
pub use decls::{Decl, DeclStore};
pub use function::CFunction;
pub use record::{CRecord, Field, RecordBuilder};
