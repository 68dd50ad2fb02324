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

/// A SASL mechanism name, as advertised on the `AUTH` capability line and
/// selected by the `AUTH` command.
///
/// The engine does not implement mechanisms; they are plugged in behind the
/// server/client SASL traits. Unknown names are carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde_with::SerializeDisplay, serde_with::DeserializeFromStr)]
#[non_exhaustive]
pub enum Mechanism {
    /// RFC 4616.
    Plain,
    /// De-facto standard two-step user/password exchange.
    Login,
    /// RFC 4505.
    Anonymous,
    /// RFC 2195.
    CramMd5,
    /// OAuth 2.0 bearer tokens, Google/Microsoft flavour.
    XOauth2,
    /// Any other mechanism, upcased.
    Other(String),
}

impl std::str::FromStr for Mechanism {
    type Err = std::convert::Infallible;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "PLAIN" => Self::Plain,
            "LOGIN" => Self::Login,
            "ANONYMOUS" => Self::Anonymous,
            "CRAM-MD5" => Self::CramMd5,
            "XOAUTH2" => Self::XOauth2,
            other => Self::Other(other.to_owned()),
        })
    }
}

impl std::fmt::Display for Mechanism {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
            Self::Anonymous => "ANONYMOUS",
            Self::CramMd5 => "CRAM-MD5",
            Self::XOauth2 => "XOAUTH2",
            Self::Other(name) => name,
        })
    }
}
