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

//! Line-exchange harness and end-to-end tests for the Petrel engine: a
//! scripted TCP client against a real [`petrel_protocol::Receiver`] backed
//! by a recording mock.

/// Receiver configurations and TLS material for tests.
pub mod config;
/// A backend that records envelopes and injects failures by address.
pub mod mock;
mod receiver;

#[cfg(test)]
mod tests;
