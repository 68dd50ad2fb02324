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

use petrel_common::{EnhancedCode, SmtpError};

/// Transport-level failure of the engine.
///
/// The conditions the state machine branches on (overlong line, message size,
/// aborted transfer) are distinguished variants; everything else is carried
/// as the underlying io error.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A line exceeded the configured limit. Unread bytes remain in the
    /// transport, the connection cannot be recovered.
    #[error("line longer than the {limit} octet limit")]
    LineTooLong {
        /// Configured limit, CRLF included.
        limit: usize,
    },
    /// The message grew past the configured maximum.
    #[error("message larger than the {limit} byte limit")]
    MessageSizeExceeded {
        /// Configured limit in bytes.
        limit: usize,
    },
    /// A body transfer was cut short by RSET, QUIT or connection loss.
    #[error("transfer aborted: {reason}")]
    Aborted {
        /// What interrupted the transfer.
        reason: &'static str,
    },
    /// A read or write deadline expired.
    #[error("timed out after {after:?} while {doing}")]
    Timeout {
        /// The deadline that expired.
        after: std::time::Duration,
        /// What the engine was waiting for.
        doing: &'static str,
    },
    /// The peer closed the stream mid-dialogue.
    #[error("unexpected end of stream")]
    UnexpectedEof,
    /// Any other transport failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) const fn aborted(reason: &'static str) -> Self {
        Self::Aborted { reason }
    }

    /// Is this the distinguished overlong-line condition ?
    #[must_use]
    #[inline]
    pub const fn is_line_too_long(&self) -> bool {
        matches!(self, Self::LineTooLong { .. })
    }

    /// Did a deadline expire ?
    #[must_use]
    #[inline]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Was a transfer aborted mid-stream ?
    #[must_use]
    #[inline]
    pub const fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    /// The reply a backend should produce when it hits this error while
    /// consuming a body stream.
    #[must_use]
    #[inline]
    pub fn to_smtp_error(&self) -> SmtpError {
        match self {
            Self::MessageSizeExceeded { .. } => SmtpError::with_enhanced(
                552,
                EnhancedCode(5, 3, 4),
                "Maximum message size exceeded",
            ),
            Self::Aborted { .. } | Self::Timeout { .. } => {
                SmtpError::with_enhanced(451, EnhancedCode(4, 0, 0), "Transfer aborted")
            }
            Self::LineTooLong { .. } | Self::UnexpectedEof | Self::Io(_) => {
                SmtpError::with_enhanced(554, EnhancedCode(5, 0, 0), "Transaction failed")
            }
        }
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    #[inline]
    fn from(_elapsed: tokio::time::error::Elapsed) -> Self {
        Self::Timeout {
            after: std::time::Duration::ZERO,
            doing: "io",
        }
    }
}

/// Error while parsing the arguments of a command.
#[allow(clippy::module_name_repetitions)]
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ParseArgsError {
    /// Non-UTF8 buffer.
    #[error("{0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    /// The path or argument grammar was broken.
    #[error("{0}")]
    Grammar(#[from] petrel_common::parser::ParseError),
    /// An extension parameter value was malformed.
    #[error("{0}")]
    Parameter(#[from] petrel_common::options::InvalidParameter),
    /// Invalid IP literal in a HELO/EHLO argument.
    #[error("{0}")]
    BadClientName(#[from] petrel_common::types::InvalidDomain),
    /// A mailbox failed RFC 5321 validation.
    #[error("the address {mail:?} is not a valid RFC 5321 address")]
    InvalidMailAddress {
        /// ill-formatted mail address
        mail: String,
    },
    /// Missing the `FROM:` / `TO:` prefix of MAIL and RCPT.
    #[error("missing the {0:?} prefix")]
    MissingPrefix(&'static str),
    /// Everything else.
    #[error("invalid arguments")]
    InvalidArgs,
}
