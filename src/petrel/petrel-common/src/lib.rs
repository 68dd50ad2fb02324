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

//! Shared vocabulary of the Petrel ESMTP/LMTP engine: replies with enhanced
//! status codes, the strict path/mailbox grammar, envelope extension
//! parameters and the xtext family of encodings.

#![doc(html_no_source)]
#![deny(missing_docs)]
#![forbid(unsafe_code)]
//
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::cargo)]
//
#![allow(clippy::multiple_crate_versions)]

mod error;
mod reply;
mod stage;

/// SASL mechanism names exchanged on the AUTH verb.
pub mod auth;
/// Envelope extension parameters carried by `MAIL FROM` and `RCPT TO`.
pub mod options;
/// Strict recursive-descent grammar over raw command bytes.
pub mod parser;
/// Mailbox, domain and path types.
pub mod types;
/// `xtext` (RFC 3461/4954) and `utf-8-addr-*` (RFC 6533) codecs.
pub mod xtext;

pub use error::SmtpError;
pub use reply::{EnhancedCode, InvalidReply, Reply};
pub use stage::Stage;
pub use types::{Address, Domain, ReversePath};
