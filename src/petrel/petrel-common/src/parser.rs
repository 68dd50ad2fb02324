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

//! Recursive-descent parsers over a byte cursor for the RFC 5321 path and
//! argument grammar. All parsers are pure, consume only what they accept and
//! report the byte offset that made them fail.

use crate::{types::Address, EnhancedCode, ReversePath};

/// Position-tracking view over the raw bytes of a command.
#[derive(Debug, Clone, Copy)]
pub struct Cursor<'buf> {
    buf: &'buf [u8],
    pos: usize,
}

/// Failure of one of the grammar parsers, pointing at the offending byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("expected {expected} at byte {at}")]
pub struct ParseError {
    /// Offset of the byte that broke the grammar.
    pub at: usize,
    /// What the grammar wanted there.
    pub expected: &'static str,
}

impl<'buf> Cursor<'buf> {
    /// Wrap a byte buffer, position at its start.
    #[must_use]
    #[inline]
    pub const fn new(buf: &'buf [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current offset into the buffer.
    #[must_use]
    #[inline]
    pub const fn pos(&self) -> usize {
        self.pos
    }

    /// Unconsumed bytes.
    #[must_use]
    #[inline]
    pub fn rest(&self) -> &'buf [u8] {
        &self.buf[self.pos..]
    }

    /// Everything has been consumed.
    #[must_use]
    #[inline]
    pub const fn is_eof(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Next byte without consuming it.
    #[must_use]
    #[inline]
    pub fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    /// Consume and return the next byte.
    #[inline]
    pub fn bump(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Some(byte)
    }

    /// Consume `byte` if it is next.
    #[inline]
    pub fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Consume `byte` or fail.
    ///
    /// # Errors
    ///
    /// * the next byte is not `byte`
    #[inline]
    pub fn expect(&mut self, byte: u8, expected: &'static str) -> Result<(), ParseError> {
        if self.eat(byte) {
            Ok(())
        } else {
            Err(self.fail(expected))
        }
    }

    /// Consume the longest prefix matching `pred`.
    #[inline]
    pub fn take_while(&mut self, pred: impl Fn(u8) -> bool) -> &'buf [u8] {
        let start = self.pos;
        while self.peek().is_some_and(|b| pred(b)) {
            self.pos += 1;
        }
        &self.buf[start..self.pos]
    }

    /// Consume any run of SP / HTAB.
    #[inline]
    pub fn skip_whitespace(&mut self) {
        self.take_while(|b| b == b' ' || b == b'\t');
    }

    /// An error anchored at the current position.
    #[must_use]
    #[inline]
    pub const fn fail(&self, expected: &'static str) -> ParseError {
        ParseError {
            at: self.pos,
            expected,
        }
    }
}

/// `atext` of RFC 5321 §4.1.2, extended with non-ASCII for SMTPUTF8.
const fn is_atext(byte: u8) -> bool {
    byte.is_ascii_alphanumeric()
        || matches!(
            byte,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'/'
                | b'='
                | b'?'
                | b'^'
                | b'_'
                | b'`'
                | b'{'
                | b'|'
                | b'}'
                | b'~'
        )
        || byte >= 0x80
}

const fn is_domain_byte(byte: u8) -> bool {
    !byte.is_ascii_whitespace() && byte != b'>' && !byte.is_ascii_control()
}

/// Parse `<>` or a full path.
///
/// The cursor is left on the first byte after the path, so trailing
/// extension arguments stay available to the caller.
///
/// # Errors
///
/// * the bytes are neither `<>` nor a valid path
#[inline]
pub fn parse_reverse_path(cursor: &mut Cursor<'_>) -> Result<ReversePath, ParseError> {
    if cursor.rest().starts_with(b"<>") {
        cursor.pos += 2;
        return Ok(ReversePath::Null);
    }
    parse_path(cursor).map(ReversePath::Mailbox)
}

/// Parse a forward/reverse path: optional angle brackets, an optional source
/// route which is discarded (RFC 5321 §4.1.2 relaxation), and a mailbox.
///
/// # Errors
///
/// * malformed route, mailbox or missing closing `>`
#[inline]
pub fn parse_path(cursor: &mut Cursor<'_>) -> Result<Address, ParseError> {
    let bracketed = cursor.eat(b'<');

    // source route `@one,@two:` is validated, then thrown away
    if cursor.peek() == Some(b'@') {
        loop {
            cursor.expect(b'@', "'@' starting a source route hop")?;
            let hop = cursor.take_while(|b| is_domain_byte(b) && b != b',' && b != b':');
            if hop.is_empty() {
                return Err(cursor.fail("a domain in the source route"));
            }
            if cursor.eat(b',') {
                continue;
            }
            cursor.expect(b':', "':' ending the source route")?;
            break;
        }
    }

    let mailbox = parse_mailbox(cursor)?;
    if bracketed {
        cursor.expect(b'>', "'>' closing the path")?;
    }
    Ok(mailbox)
}

/// Parse `local-part@domain`, the local part being a dot-string or a
/// quoted-string, the domain running up to whitespace or `>`.
///
/// # Errors
///
/// * empty or malformed local part, missing `@`, empty domain
#[inline]
pub fn parse_mailbox(cursor: &mut Cursor<'_>) -> Result<Address, ParseError> {
    let local = if cursor.peek() == Some(b'"') {
        parse_quoted_string(cursor)?
    } else {
        parse_dot_string(cursor)?
    };

    cursor.expect(b'@', "'@' between local part and domain")?;

    let domain = cursor.take_while(is_domain_byte);
    if domain.is_empty() {
        return Err(cursor.fail("a domain"));
    }
    let domain = std::str::from_utf8(domain).map_err(|_e| cursor.fail("utf-8 in the domain"))?;

    Ok(Address::from_parts(&local, domain))
}

fn parse_dot_string(cursor: &mut Cursor<'_>) -> Result<String, ParseError> {
    let mut local = Vec::new();
    loop {
        let atom = cursor.take_while(is_atext);
        if atom.is_empty() {
            return Err(cursor.fail("an atom in the local part"));
        }
        local.extend_from_slice(atom);
        if cursor.peek() == Some(b'.') {
            cursor.pos += 1;
            local.push(b'.');
        } else {
            break;
        }
    }
    String::from_utf8(local).map_err(|_e| cursor.fail("utf-8 in the local part"))
}

fn parse_quoted_string(cursor: &mut Cursor<'_>) -> Result<String, ParseError> {
    let mut local = vec![b'"'];
    cursor.expect(b'"', "'\"' opening a quoted local part")?;
    loop {
        match cursor.bump() {
            Some(b'"') => {
                local.push(b'"');
                break;
            }
            Some(b'\\') => {
                let escaped = cursor
                    .bump()
                    .filter(|b| (0x20..=0x7e).contains(b))
                    .ok_or_else(|| cursor.fail("a printable byte after '\\'"))?;
                local.push(b'\\');
                local.push(escaped);
            }
            Some(byte) if byte != b'\r' && byte != b'\n' => local.push(byte),
            _ => return Err(cursor.fail("'\"' closing the quoted local part")),
        }
    }
    String::from_utf8(local).map_err(|_e| cursor.fail("utf-8 in the local part"))
}

/// Parse the whitespace-separated `KEY` / `KEY=VALUE` extension arguments of
/// MAIL and RCPT. Keys are upcased; a duplicate key overwrites the earlier
/// value while keeping its position.
///
/// # Errors
///
/// * an argument starts with `=` (empty key)
#[inline]
pub fn parse_args(cursor: &mut Cursor<'_>) -> Result<Vec<(String, Option<String>)>, ParseError> {
    let mut args: Vec<(String, Option<String>)> = Vec::new();
    loop {
        cursor.skip_whitespace();
        if cursor.is_eof() {
            return Ok(args);
        }
        let token = cursor.take_while(|b| !b.is_ascii_whitespace());
        let token =
            std::str::from_utf8(token).map_err(|_e| cursor.fail("utf-8 in an argument"))?;

        let (key, value) = match token.split_once('=') {
            Some((key, value)) => (key, Some(value.to_owned())),
            None => (token, None),
        };
        if key.is_empty() {
            return Err(cursor.fail("a parameter keyword"));
        }
        let key = key.to_ascii_uppercase();

        match args.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => args.push((key, value)),
        }
    }
}

/// Parse the HELO/EHLO argument: one domain token, up to the first space.
///
/// # Errors
///
/// * the argument is empty or not utf-8
#[inline]
pub fn parse_hello_arg(cursor: &mut Cursor<'_>) -> Result<String, ParseError> {
    cursor.skip_whitespace();
    let token = cursor.take_while(|b| b != b' ');
    if token.is_empty() {
        return Err(cursor.fail("a client name"));
    }
    std::str::from_utf8(token)
        .map(str::to_owned)
        .map_err(|_e| cursor.fail("utf-8 in the client name"))
}

fn parse_u16(cursor: &mut Cursor<'_>, expected: &'static str) -> Result<u16, ParseError> {
    let digits = cursor.take_while(|b| b.is_ascii_digit());
    if digits.is_empty() || digits.len() > 3 {
        return Err(cursor.fail(expected));
    }
    let mut value = 0_u16;
    for digit in digits {
        value = value * 10 + u16::from(digit - b'0');
    }
    Ok(value)
}

/// Parse a `class.subject.detail` enhanced status code.
///
/// # Errors
///
/// * a component is missing, non-numeric or longer than three digits
#[inline]
pub fn parse_enhanced_code(cursor: &mut Cursor<'_>) -> Result<EnhancedCode, ParseError> {
    let class = parse_u16(cursor, "a status class")?;
    cursor.expect(b'.', "'.' after the status class")?;
    let subject = parse_u16(cursor, "a status subject")?;
    cursor.expect(b'.', "'.' after the status subject")?;
    let detail = parse_u16(cursor, "a status detail")?;
    Ok(EnhancedCode(class, subject, detail))
}
