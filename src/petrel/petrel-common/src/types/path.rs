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

use crate::types::Address;

/// The sender path of a transaction: a mailbox, or `<>` for bounces and
/// notifications that must not themselves bounce.
#[derive(Debug, Clone, PartialEq, Eq, serde_with::SerializeDisplay, serde_with::DeserializeFromStr)]
pub enum ReversePath {
    /// The null path, `<>`.
    Null,
    /// A regular sender mailbox.
    Mailbox(Address),
}

impl ReversePath {
    /// The mailbox, unless this is the null path.
    #[must_use]
    #[inline]
    pub const fn mailbox(&self) -> Option<&Address> {
        match self {
            Self::Null => None,
            Self::Mailbox(mailbox) => Some(mailbox),
        }
    }

    /// Is this `<>` ?
    #[must_use]
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Bracketed form, `<>` or `<local@domain>`.
    #[must_use]
    #[inline]
    pub fn bracketed(&self) -> String {
        match self {
            Self::Null => "<>".to_owned(),
            Self::Mailbox(mailbox) => format!("<{mailbox}>"),
        }
    }
}

impl std::fmt::Display for ReversePath {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Mailbox(mailbox) => write!(f, "{mailbox}"),
        }
    }
}

impl From<Address> for ReversePath {
    #[inline]
    fn from(mailbox: Address) -> Self {
        Self::Mailbox(mailbox)
    }
}

impl std::str::FromStr for ReversePath {
    type Err = crate::parser::ParseError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // the unbracketed form of the null path is the empty string
        if s.is_empty() {
            return Ok(Self::Null);
        }
        let mut cursor = crate::parser::Cursor::new(s.as_bytes());
        let path = crate::parser::parse_reverse_path(&mut cursor)?;
        if !cursor.is_eof() {
            return Err(cursor.fail("end of the path"));
        }
        Ok(path)
    }
}
