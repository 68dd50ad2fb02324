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

use petrel_common::auth::Mechanism;

/// A pluggable client-side SASL state machine. The client owns the wire
/// framing (`AUTH`, base64, `334`, `*` cancellation); mechanisms only see
/// decoded buffers.
pub trait SaslClient: Send {
    /// Mechanism name and optional initial response.
    fn start(&mut self) -> (Mechanism, Option<Vec<u8>>);

    /// Answer one decoded server challenge.
    ///
    /// # Errors
    ///
    /// * the challenge makes no sense for this mechanism; the client sends
    ///   `*` to cancel the exchange
    fn next(&mut self, challenge: &[u8]) -> Result<Vec<u8>, String>;
}

/// RFC 4616 PLAIN: everything goes in the initial response.
pub struct Plain {
    authzid: String,
    authcid: String,
    password: String,
}

impl Plain {
    /// Authenticate as `authcid` with no separate authorization identity.
    #[must_use]
    #[inline]
    pub fn new(authcid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            authzid: String::new(),
            authcid: authcid.into(),
            password: password.into(),
        }
    }

    /// Authenticate as `authcid`, acting on behalf of `authzid`.
    #[must_use]
    #[inline]
    pub fn with_authzid(
        authzid: impl Into<String>,
        authcid: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            authzid: authzid.into(),
            authcid: authcid.into(),
            password: password.into(),
        }
    }
}

impl SaslClient for Plain {
    #[inline]
    fn start(&mut self) -> (Mechanism, Option<Vec<u8>>) {
        let response = [
            self.authzid.as_bytes(),
            b"\0",
            self.authcid.as_bytes(),
            b"\0",
            self.password.as_bytes(),
        ]
        .concat();
        (Mechanism::Plain, Some(response))
    }

    #[inline]
    fn next(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, String> {
        Err("PLAIN expects no challenge".to_owned())
    }
}

/// The two-step LOGIN exchange: username then password, each behind a
/// server prompt.
pub struct Login {
    username: String,
    password: String,
    prompts_answered: u8,
}

impl Login {
    ///
    #[must_use]
    #[inline]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            prompts_answered: 0,
        }
    }
}

impl SaslClient for Login {
    #[inline]
    fn start(&mut self) -> (Mechanism, Option<Vec<u8>>) {
        (Mechanism::Login, None)
    }

    #[inline]
    fn next(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, String> {
        self.prompts_answered += 1;
        match self.prompts_answered {
            1 => Ok(self.username.clone().into_bytes()),
            2 => Ok(self.password.clone().into_bytes()),
            _ => Err("LOGIN expects exactly two prompts".to_owned()),
        }
    }
}
