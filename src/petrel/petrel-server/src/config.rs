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

use petrel_protocol::ReceiverConfig;

/// Process-level configuration: where to listen, how many peers to accept,
/// and the per-connection [`ReceiverConfig`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
#[allow(clippy::exhaustive_structs)]
pub struct ServerConfig {
    /// Addresses to bind; the address family follows each entry.
    pub listen: Vec<std::net::SocketAddr>,
    /// Simultaneous connections accepted; `-1` means unbounded.
    pub client_count_max: i64,
    /// Everything the protocol engine needs per connection.
    pub receiver: ReceiverConfig,
}

impl Default for ServerConfig {
    #[inline]
    fn default() -> Self {
        Self {
            listen: vec!["0.0.0.0:25".parse().expect("valid address literal")],
            client_count_max: 256,
            receiver: ReceiverConfig::default(),
        }
    }
}
