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

use crate::{EnhancedCode, Reply};

/// A structured SMTP failure.
///
/// Backends return it to put an exact code, enhanced code and message on the
/// wire; the client produces it from any 4xx/5xx response it reads.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
pub struct SmtpError {
    /// Basic reply code, 400..=599.
    pub code: u16,
    /// Optional RFC 2034 status code.
    pub enhanced: Option<EnhancedCode>,
    /// Human readable text, single line.
    pub message: String,
}

impl std::fmt::Display for SmtpError {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.enhanced {
            Some(enhanced) => write!(f, "{} {} {}", self.code, enhanced, self.message),
            None => write!(f, "{} {}", self.code, self.message),
        }
    }
}

impl SmtpError {
    /// Build an error from a code and message.
    #[must_use]
    #[inline]
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            enhanced: None,
            message: message.into(),
        }
    }

    /// Build an error carrying an enhanced status code.
    #[must_use]
    #[inline]
    pub fn with_enhanced(code: u16, enhanced: EnhancedCode, message: impl Into<String>) -> Self {
        Self {
            code,
            enhanced: Some(enhanced),
            message: message.into(),
        }
    }

    /// 4xx, worth retrying later.
    #[must_use]
    #[inline]
    pub const fn is_temporary(&self) -> bool {
        self.code / 100 == 4
    }

    /// 5xx, do not retry.
    #[must_use]
    #[inline]
    pub const fn is_permanent(&self) -> bool {
        self.code / 100 == 5
    }
}

impl From<&Reply> for SmtpError {
    #[inline]
    fn from(reply: &Reply) -> Self {
        Self {
            code: reply.code(),
            enhanced: reply.enhanced(),
            message: reply.text(),
        }
    }
}
