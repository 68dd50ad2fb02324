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

//! The sending half of the Petrel engine: a typed ESMTP/LMTP client that
//! sequences hello, STARTTLS, AUTH, MAIL, RCPT and DATA over any async
//! stream, with capability-gated extension parameters and per-recipient
//! LMTP results.

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

mod client;
mod data;
mod error;

/// Client-side SASL mechanisms.
pub mod sasl;

pub use client::{Client, ClientOptions, DataWriter, RcptOutcome, Submission};
pub use data::DotStuffer;
pub use error::ClientError;

pub use petrel_protocol::rustls;
