/*
 * Petrel mail transfer engine
 * Copyright (C) 2024 the Petrel developers
 *
 * This program is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * this program. If not, see https://www.gnu.org/licenses/.
 *
*/

/// Failure while decoding an xtext or utf-8-addr value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum XtextError {
    /// A `+` was not followed by two upper-case hex digits.
    #[error("malformed '+HH' escape at byte {0}")]
    BadHexChar(usize),
    /// A byte that the grammar requires to be escaped appeared raw.
    #[error("byte at offset {0} must be escaped")]
    IllegalChar(usize),
    /// A `\x{...}` escape was malformed.
    #[error("malformed unicode escape at byte {0}")]
    BadUnicodeEscape(usize),
    /// The escape named a surrogate or a value outside of the RFC 6533
    /// ranges for its digit count.
    #[error("code point out of range at byte {0}")]
    OutOfRange(usize),
    /// The decoded bytes are not valid utf-8.
    #[error("decoded text is not valid utf-8")]
    InvalidUtf8,
}

/// `xchar` of RFC 3461: printable ASCII except SP, `+` and `=`.
const fn is_xchar(byte: u8) -> bool {
    matches!(byte, 0x21..=0x2a | 0x2c..=0x3c | 0x3e..=0x7e)
}

/// `QCHAR` of RFC 6533: printable ASCII except SP, `+`, `=` and `\`.
const fn is_qchar(byte: u8) -> bool {
    matches!(byte, 0x21..=0x2a | 0x2c..=0x3c | 0x3e..=0x5b | 0x5d..=0x7e)
}

/// Encode a string to xtext (RFC 3461 §4, used by AUTH and ENVID values).
#[must_use]
#[inline]
pub fn encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if is_xchar(byte) {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("+{byte:02X}"));
        }
    }
    out
}

const fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Decode an xtext value.
///
/// # Errors
///
/// * a `+` not followed by two upper-case hex digits
/// * a raw byte outside of the `xchar` set
/// * the decoded bytes are not utf-8
#[inline]
pub fn decode(encoded: &str) -> Result<String, XtextError> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                let (high, low) = match (bytes.get(i + 1), bytes.get(i + 2)) {
                    (Some(&h), Some(&l)) => (hex_value(h), hex_value(l)),
                    _ => return Err(XtextError::BadHexChar(i)),
                };
                match (high, low) {
                    (Some(high), Some(low)) => out.push(high * 16 + low),
                    _ => return Err(XtextError::BadHexChar(i)),
                }
                i += 3;
            }
            byte if is_xchar(byte) => {
                out.push(byte);
                i += 1;
            }
            _ => return Err(XtextError::IllegalChar(i)),
        }
    }
    String::from_utf8(out).map_err(|_e| XtextError::InvalidUtf8)
}

fn push_unicode_escape(out: &mut String, scalar: char) {
    out.push_str(&format!("\\x{{{:X}}}", u32::from(scalar)));
}

/// Encode to utf-8-addr-xtext (RFC 6533 §3): pure ASCII output, every
/// non-`QCHAR` scalar as a `\x{...}` escape.
#[must_use]
#[inline]
pub fn encode_utf8_addr_xtext(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for scalar in raw.chars() {
        if scalar.is_ascii() && is_qchar(scalar as u8) {
            out.push(scalar);
        } else {
            push_unicode_escape(&mut out, scalar);
        }
    }
    out
}

/// Encode to utf-8-addr-unitext (RFC 6533 §3): non-ASCII scalars pass
/// through raw, ASCII outside of `QCHAR` is escaped.
#[must_use]
#[inline]
pub fn encode_utf8_addr_unitext(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for scalar in raw.chars() {
        if !scalar.is_ascii() || is_qchar(scalar as u8) {
            out.push(scalar);
        } else {
            push_unicode_escape(&mut out, scalar);
        }
    }
    out
}

/// Decode a utf-8-addr-xtext or utf-8-addr-unitext value.
///
/// Hexpoint rules of RFC 6533 are enforced: two digits only for the ASCII
/// characters that `QCHAR` cannot carry, three to six digits without a
/// leading zero for U+0080..=U+10FFFF, surrogates rejected.
///
/// # Errors
///
/// * malformed `\x{...}` escape
/// * hexpoint outside of the range allowed for its digit count
/// * a raw byte that the grammar requires to be escaped
#[inline]
#[allow(clippy::missing_panics_doc)] // checked conversions below
pub fn decode_utf8_addr(encoded: &str) -> Result<String, XtextError> {
    let mut out = String::with_capacity(encoded.len());
    let mut chars = encoded.char_indices();

    while let Some((at, scalar)) = chars.next() {
        if scalar != '\\' {
            if !scalar.is_ascii() || is_qchar(scalar as u8) {
                out.push(scalar);
                continue;
            }
            return Err(XtextError::IllegalChar(at));
        }

        if !matches!(chars.next(), Some((_, 'x'))) || !matches!(chars.next(), Some((_, '{'))) {
            return Err(XtextError::BadUnicodeEscape(at));
        }
        let mut hex = String::new();
        loop {
            match chars.next() {
                Some((_, '}')) => break,
                Some((_, digit)) if digit.is_ascii_hexdigit() && !digit.is_ascii_lowercase() => {
                    hex.push(digit);
                }
                _ => return Err(XtextError::BadUnicodeEscape(at)),
            }
            if hex.len() > 6 {
                return Err(XtextError::BadUnicodeEscape(at));
            }
        }

        #[allow(clippy::expect_used)]
        let value = match hex.len() {
            2..=6 => u32::from_str_radix(&hex, 16).expect("checked hex digits"),
            _ => return Err(XtextError::BadUnicodeEscape(at)),
        };

        let in_range = if hex.len() == 2 {
            // the ASCII characters QCHAR cannot carry
            matches!(value, 0x00..=0x20 | 0x2b | 0x3d | 0x5c | 0x7f)
        } else {
            !hex.starts_with('0') && (0x80..=0x0010_ffff).contains(&value)
        };
        if !in_range {
            return Err(XtextError::OutOfRange(at));
        }

        match char::from_u32(value) {
            Some(scalar) => out.push(scalar),
            // surrogates land here
            None => return Err(XtextError::OutOfRange(at)),
        }
    }
    Ok(out)
}
