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

/// An RFC 5321 mailbox, `local-part@domain`.
///
/// The local part may be a quoted-string; the separator offset is recorded at
/// construction so accessors never re-scan for the `@`.
#[derive(Clone, Debug, Eq, serde_with::SerializeDisplay, serde_with::DeserializeFromStr)]
pub struct Address {
    at_sign: usize,
    full: String,
}

/// Syntax sugar to build an [`Address`] from a literal.
///
/// # Panics
///
/// if the argument is not a valid mailbox
#[macro_export]
macro_rules! addr {
    ($e:expr) => {
        <$crate::Address as core::str::FromStr>::from_str($e).unwrap()
    };
}

/// The string was not a valid RFC 5321 mailbox.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("'{input}' is not a valid RFC 5321 mailbox: {source}")]
pub struct InvalidAddress {
    /// Rejected input.
    pub input: String,
    /// Grammar failure, with the offending byte offset.
    #[source]
    pub source: crate::parser::ParseError,
}

impl std::str::FromStr for Address {
    type Err = InvalidAddress;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut cursor = crate::parser::Cursor::new(s.as_bytes());
        let mailbox = crate::parser::parse_mailbox(&mut cursor).map_err(|source| InvalidAddress {
            input: s.to_owned(),
            source,
        })?;
        if !cursor.is_eof() {
            return Err(InvalidAddress {
                input: s.to_owned(),
                source: cursor.fail("end of the mailbox"),
            });
        }
        Ok(mailbox)
    }
}

impl PartialEq for Address {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.full == other.full
    }
}

impl std::hash::Hash for Address {
    #[inline]
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.full.hash(state);
    }
}

impl std::fmt::Display for Address {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full)
    }
}

impl Address {
    /// Assemble an address from an already-parsed local part and domain.
    #[must_use]
    #[inline]
    pub fn from_parts(local_part: &str, domain: &str) -> Self {
        Self {
            at_sign: local_part.len(),
            full: format!("{local_part}@{domain}"),
        }
    }

    /// The full mailbox.
    #[must_use]
    #[inline]
    pub fn full(&self) -> &str {
        &self.full
    }

    /// The part before the separating `@`, quotes included for a
    /// quoted-string local part.
    #[must_use]
    #[inline]
    pub fn local_part(&self) -> &str {
        #[allow(clippy::indexing_slicing, clippy::string_slice)]
        &self.full[..self.at_sign]
    }

    /// The part after the separating `@`.
    #[must_use]
    #[inline]
    pub fn domain(&self) -> &str {
        #[allow(clippy::indexing_slicing, clippy::string_slice)]
        &self.full[self.at_sign + 1..]
    }

    /// Does transporting this mailbox require the SMTPUTF8 extension ?
    #[must_use]
    #[inline]
    pub fn needs_smtputf8(&self) -> bool {
        !self.full.is_ascii()
    }

    /// Create an address without checking the syntax.
    ///
    /// # Panics
    ///
    /// * there is no '@' in the string
    #[must_use]
    #[inline]
    #[allow(clippy::unwrap_used)]
    pub fn new_unchecked(addr: String) -> Self {
        Self {
            at_sign: addr.find('@').unwrap(),
            full: addr,
        }
    }
}
