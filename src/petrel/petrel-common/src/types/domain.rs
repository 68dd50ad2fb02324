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

/// A validated domain name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde_with::SerializeDisplay, serde_with::DeserializeFromStr)]
pub struct Domain(String);

/// The string was not a valid domain name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("'{0}' is not a valid domain name")]
pub struct InvalidDomain(
    /// Rejected input.
    pub String,
);

impl std::str::FromStr for Domain {
    type Err = InvalidDomain;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        addr::parse_domain_name(s)
            .map(|domain| Self(domain.as_str().to_owned()))
            .map_err(|_error| InvalidDomain(s.to_owned()))
    }
}

impl std::fmt::Display for Domain {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Domain {
    /// The domain as text.
    #[must_use]
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The name a client introduces itself with on HELO/EHLO/LHLO: a domain or
/// an address literal.
#[derive(Debug, Clone, PartialEq, Eq, serde_with::SerializeDisplay, serde_with::DeserializeFromStr)]
pub enum ClientName {
    /// A fully qualified domain name.
    Domain(Domain),
    /// `[127.0.0.1]`
    Ip4(std::net::Ipv4Addr),
    /// `[IPv6:::1]`
    Ip6(std::net::Ipv6Addr),
}

impl std::fmt::Display for ClientName {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Domain(domain) => write!(f, "{domain}"),
            Self::Ip4(ip) => write!(f, "[{ip}]"),
            Self::Ip6(ip) => write!(f, "[IPv6:{ip}]"),
        }
    }
}

impl std::str::FromStr for ClientName {
    type Err = InvalidDomain;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            ipv6 if ipv6.len() > "[IPv6:]".len()
                && ipv6.to_lowercase().starts_with("[ipv6:")
                && ipv6.ends_with(']') =>
            {
                ipv6["[IPv6:".len()..ipv6.len() - 1]
                    .parse::<std::net::Ipv6Addr>()
                    .map(Self::Ip6)
                    .map_err(|_error| InvalidDomain(s.to_owned()))
            }
            ipv4 if ipv4.len() > "[]".len() && ipv4.starts_with('[') && ipv4.ends_with(']') => {
                ipv4[1..ipv4.len() - 1]
                    .parse::<std::net::Ipv4Addr>()
                    .map(Self::Ip4)
                    .map_err(|_error| InvalidDomain(s.to_owned()))
            }
            domain => domain.parse::<Domain>().map(Self::Domain),
        }
    }
}
