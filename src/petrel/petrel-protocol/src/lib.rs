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

//! The wire engine of Petrel: CRLF framing with pipelined command windows,
//! the ESMTP/LMTP command grammar, dot-stuffed and chunked body streams, and
//! the server-side receiver state machine that drives an application
//! [`Backend`] over them.

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

mod command;
mod config;
mod error;
mod lmtp;
mod reader;
mod receiver;
mod session;
mod writer;

pub use command::{
    parse_command_line, AuthArgs, Batch, BdatArgs, Command, ConnectionKind, EhloArgs, HeloArgs,
    MailFromArgs, RcptToArgs, UnparsedArgs, Verb,
};
pub use config::{DeliverByPolicy, Extensions, MtPriorityProfile, ReceiverConfig};
pub use error::{Error, ParseArgsError};
pub use lmtp::{DeliveryStatus, StatusCollector};
pub use reader::{Reader, DEFAULT_LINE_MAX};
pub use receiver::{ErrorCounter, Receiver};
pub use session::{Backend, ConnectionInfo, SaslServer, SaslStep, Session};
pub use writer::WindowWriter;

pub use tokio_rustls::rustls;
