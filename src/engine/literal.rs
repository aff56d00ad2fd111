//! C numeric literals
//!
//! An integer literal takes the first type of its candidate list that can
//! hold the value. The list depends on the suffix and on whether the
//! literal is decimal (signed types only unless `u` is given) or
//! octal/hexadecimal (signed and unsigned types interleaved).

use crate::cdata::convert::int_range;
use crate::core::CType;
use crate::errors::{FfiError, FfiResult};

#[derive(Debug, Clone)]
pub enum Literal {
    Int { ty: CType, value: u64 },
    Float { ty: CType, value: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Width {
    Plain,
    Long,
    LongLong,
}

fn invalid(text: &str) -> FfiError {
    FfiError::type_mismatch(format!("malformed number near '{}'", text))
}

/// Parse a literal such as `42`, `0xffu`, `077LL` or `1.5e3f`
pub fn parse(text: &str) -> FfiResult<Literal> {
    let text = text.trim();
    if text.is_empty() {
        return Err(invalid(text));
    }
    let is_hex = text.starts_with("0x") || text.starts_with("0X");
    let looks_float = if is_hex {
        text.contains(['p', 'P'])
    } else {
        text.contains(['.', 'e', 'E'])
    };
    if looks_float {
        return parse_float(text);
    }
    parse_int(text, is_hex)
}

fn parse_float(text: &str) -> FfiResult<Literal> {
    let (body, ty) = match text.as_bytes().last() {
        Some(b'f' | b'F') => (&text[..text.len() - 1], CType::float()),
        Some(b'l' | b'L') => (&text[..text.len() - 1], CType::double()),
        _ => (text, CType::double()),
    };
    // hexadecimal floating literals are not accepted
    let value: f64 = body.parse().map_err(|_| invalid(text))?;
    Ok(Literal::Float { ty, value })
}

fn split_suffix(text: &str) -> FfiResult<(&str, bool, Width)> {
    let digits_end = text
        .find(|c: char| matches!(c, 'u' | 'U' | 'l' | 'L'))
        .unwrap_or(text.len());
    let (digits, suffix) = text.split_at(digits_end);

    let (unsigned, width) = match suffix {
        "" => (false, Width::Plain),
        "u" | "U" => (true, Width::Plain),
        "l" | "L" => (false, Width::Long),
        "ul" | "uL" | "Ul" | "UL" | "lu" | "lU" | "Lu" | "LU" => (true, Width::Long),
        "ll" | "LL" => (false, Width::LongLong),
        "ull" | "uLL" | "Ull" | "ULL" | "llu" | "llU" | "LLu" | "LLU" => (true, Width::LongLong),
        _ => return Err(invalid(text)),
    };
    Ok((digits, unsigned, width))
}

fn candidates(decimal: bool, unsigned: bool, width: Width) -> Vec<CType> {
    let signed_and_unsigned = |signed: fn() -> CType, uns: fn() -> CType| -> Vec<CType> {
        if unsigned {
            vec![uns()]
        } else if decimal {
            vec![signed()]
        } else {
            vec![signed(), uns()]
        }
    };
    let mut out = Vec::new();
    if width == Width::Plain {
        out.extend(signed_and_unsigned(CType::int, CType::uint));
    }
    if width != Width::LongLong {
        out.extend(signed_and_unsigned(CType::long, CType::ulong));
    }
    out.extend(signed_and_unsigned(CType::llong, CType::ullong));
    out
}

fn parse_int(text: &str, is_hex: bool) -> FfiResult<Literal> {
    let (digits, unsigned, width) = split_suffix(text)?;
    let (radix, body) = if is_hex {
        (16, &digits[2..])
    } else if digits.len() > 1 && digits.starts_with('0') {
        (8, &digits[1..])
    } else {
        (10, digits)
    };
    if body.is_empty() {
        return Err(invalid(text));
    }
    let value = u64::from_str_radix(body, radix)
        .map_err(|_| FfiError::out_of_range(text, "unsigned long long"))?;

    let ty = candidates(radix == 10, unsigned, width)
        .into_iter()
        .find(|ty| (value as i128) <= int_range(ty).1)
        .ok_or_else(|| FfiError::out_of_range(text, "long long"))?;
    Ok(Literal::Int { ty, value })
}
