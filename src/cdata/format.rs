use std::fmt;

use super::convert::{deref, load_int};
use super::CData;

impl CData {
    /// Built-in textual form.
    ///
    /// 8-byte integers print with a `LL`/`ULL` suffix so the text can be
    /// parsed back without loss.
    pub fn to_display(&self) -> String {
        if self.is_type_marker() {
            return format!("ctype<{}>", self.ctype());
        }

        let (ty, addr) = deref(self);
        if ty.is_integer() && ty.alloc_size() == Some(8) && !addr.is_null() {
            // SAFETY: integer values are stored inline
            let v = unsafe { load_int(&ty, addr) };
            return if ty.is_unsigned() {
                format!("{}ULL", v)
            } else {
                format!("{}LL", v)
            };
        }

        let shown = if self.ctype().is_pointer() || self.ctype().is_function() {
            self.pointer_value().unwrap_or(std::ptr::null_mut())
        } else {
            self.address()
        };
        if shown.is_null() {
            format!("cdata<{}>: NULL", self.ctype())
        } else {
            format!("cdata<{}>: {:#x}", self.ctype(), shown as usize)
        }
    }
}

impl fmt::Display for CData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_display())
    }
}
