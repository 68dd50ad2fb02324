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

/// How far the SMTP dialogue has progressed on a connection. Commands are
/// dispatched against the current stage; body transfers are sub-states of
/// [`Stage::RcptTo`] handled inside the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum::Display, serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "snake_case")]
#[allow(clippy::exhaustive_enums)]
pub enum Stage {
    /// Greeting sent, no HELO/EHLO/LHLO yet.
    Connect,
    /// Hello received, ready for a transaction.
    Helo,
    /// `MAIL FROM` accepted, collecting recipients.
    MailFrom,
    /// At least one `RCPT TO` accepted, DATA/BDAT possible.
    RcptTo,
}
