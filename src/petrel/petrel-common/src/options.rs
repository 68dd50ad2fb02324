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

use crate::{xtext, ReversePath};

/// A parameter value did not match its extension grammar.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum InvalidParameter {
    /// Value missing, duplicated or not in the keyword's vocabulary.
    #[error("invalid value for parameter {keyword}: {value:?}")]
    BadValue {
        /// Parameter keyword, upcased.
        keyword: &'static str,
        /// The raw value.
        value: String,
    },
    /// An xtext-encoded value failed to decode.
    #[error("parameter {keyword}: {source}")]
    BadEncoding {
        /// Parameter keyword, upcased.
        keyword: &'static str,
        /// Decoder failure.
        #[source]
        source: xtext::XtextError,
    },
}

impl InvalidParameter {
    /// Shorthand used by the value parsers below.
    #[must_use]
    #[inline]
    pub fn bad_value(keyword: &'static str, value: impl Into<String>) -> Self {
        Self::BadValue {
            keyword,
            value: value.into(),
        }
    }
}

/// See "SMTP Service Extension for 8-bit MIME Transport"
/// <https://datatracker.ietf.org/doc/html/rfc6152> and RFC 3030 for the
/// binary variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::AsRefStr, strum::EnumString, serde::Serialize, serde::Deserialize)]
#[strum(ascii_case_insensitive)]
#[allow(clippy::exhaustive_enums)]
pub enum BodyType {
    ///
    #[strum(serialize = "7BIT")]
    SevenBit,
    ///
    #[strum(serialize = "8BITMIME")]
    EightBitMime,
    /// Requires BDAT; DATA is refused for the transaction.
    #[strum(serialize = "BINARYMIME")]
    BinaryMime,
}

/// <https://www.rfc-editor.org/rfc/rfc3461>
/// return either the full message or only the headers in a DSN.
#[allow(clippy::exhaustive_enums)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::AsRefStr, strum::EnumString, serde::Serialize, serde::Deserialize)]
#[strum(ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum DsnReturn {
    /// Complete message.
    #[strum(serialize = "FULL")]
    Full,
    /// Only the message headers.
    #[strum(serialize = "HDRS")]
    Headers,
}

/// Parameters attached to `MAIL FROM`.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[allow(clippy::exhaustive_structs)]
pub struct MailOptions {
    /// `BODY=` (8BITMIME / BINARYMIME).
    pub body: Option<BodyType>,
    /// `SIZE=`, the client's declared message size.
    pub size: Option<usize>,
    /// `SMTPUTF8`: non-ASCII mailboxes are permitted in this transaction.
    pub utf8: bool,
    /// `REQUIRETLS`: onward delivery only over TLS.
    pub require_tls: bool,
    /// `RET=`, DSN return policy.
    pub ret: Option<DsnReturn>,
    /// `ENVID=`, DSN envelope identifier (decoded).
    pub envelope_id: Option<String>,
    /// `AUTH=`, trusted original submitter (decoded), `<>` when unknown.
    pub auth: Option<ReversePath>,
}

/// `NOTIFY=` of RFC 3461: when a DSN should be produced for a recipient.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
#[allow(clippy::exhaustive_enums)]
pub enum NotifyOn {
    /// This recipient must explicitly not produce a DSN.
    Never,
    /// One or more scenarios that should produce a DSN.
    Some {
        /// Delivery succeeded.
        success: bool,
        /// Delivery failed.
        failure: bool,
        /// Delivery has been delayed.
        delay: bool,
    },
}

impl std::str::FromStr for NotifyOn {
    type Err = InvalidParameter;

    /// Parse the comma-separated list; `NEVER` must appear alone and
    /// duplicates are forbidden.
    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut notify = None;
        for item in s.split(',') {
            #[allow(clippy::pattern_type_mismatch)]
            match (item, &mut notify) {
                (never, None) if never.eq_ignore_ascii_case("NEVER") => {
                    notify = Some(Self::Never);
                }
                (success, None) if success.eq_ignore_ascii_case("SUCCESS") => {
                    notify = Some(Self::Some {
                        success: true,
                        failure: false,
                        delay: false,
                    });
                }
                (failure, None) if failure.eq_ignore_ascii_case("FAILURE") => {
                    notify = Some(Self::Some {
                        success: false,
                        failure: true,
                        delay: false,
                    });
                }
                (delay, None) if delay.eq_ignore_ascii_case("DELAY") => {
                    notify = Some(Self::Some {
                        success: false,
                        failure: false,
                        delay: true,
                    });
                }
                (success, Some(Self::Some { success: seen, .. }))
                    if success.eq_ignore_ascii_case("SUCCESS") && !*seen =>
                {
                    *seen = true;
                }
                (failure, Some(Self::Some { failure: seen, .. }))
                    if failure.eq_ignore_ascii_case("FAILURE") && !*seen =>
                {
                    *seen = true;
                }
                (delay, Some(Self::Some { delay: seen, .. }))
                    if delay.eq_ignore_ascii_case("DELAY") && !*seen =>
                {
                    *seen = true;
                }
                // NEVER combined with anything, duplicates, unknown keyword
                _ => return Err(InvalidParameter::bad_value("NOTIFY", s)),
            }
        }
        notify.ok_or_else(|| InvalidParameter::bad_value("NOTIFY", s))
    }
}

impl std::fmt::Display for NotifyOn {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Never => f.write_str("NEVER"),
            Self::Some {
                success,
                failure,
                delay,
            } => {
                let mut first = true;
                for (wanted, keyword) in [(success, "SUCCESS"), (failure, "FAILURE"), (delay, "DELAY")]
                {
                    if wanted {
                        if !first {
                            f.write_str(",")?;
                        }
                        f.write_str(keyword)?;
                        first = false;
                    }
                }
                Ok(())
            }
        }
    }
}

/// The address form used in an `ORCPT=` argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::AsRefStr, strum::EnumString, serde::Serialize, serde::Deserialize)]
#[allow(clippy::exhaustive_enums)]
pub enum OrcptAddrType {
    /// xtext-encoded legacy address.
    #[strum(serialize = "rfc822", ascii_case_insensitive)]
    Rfc822,
    /// utf-8-addr-xtext / utf-8-addr-unitext encoded address.
    #[strum(serialize = "utf-8", ascii_case_insensitive)]
    Utf8,
}

/// `ORCPT=` of RFC 3461/6533: the original, pre-rewriting recipient.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[allow(clippy::exhaustive_structs)]
pub struct OriginalRecipient {
    /// Address type tag.
    pub addr_type: OrcptAddrType,
    /// The original recipient address, decoded.
    pub mailbox: String,
}

impl std::str::FromStr for OriginalRecipient {
    type Err = InvalidParameter;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_type, encoded) = s
            .split_once(';')
            .ok_or_else(|| InvalidParameter::bad_value("ORCPT", s))?;
        let addr_type = addr_type
            .parse::<OrcptAddrType>()
            .map_err(|_e| InvalidParameter::bad_value("ORCPT", s))?;
        let mailbox = match addr_type {
            OrcptAddrType::Rfc822 => xtext::decode(encoded),
            OrcptAddrType::Utf8 => xtext::decode_utf8_addr(encoded),
        }
        .map_err(|source| InvalidParameter::BadEncoding {
            keyword: "ORCPT",
            source,
        })?;
        Ok(Self { addr_type, mailbox })
    }
}

impl OriginalRecipient {
    /// Wire form of the argument value. `utf-8` addresses use unitext when
    /// the transaction negotiated SMTPUTF8 and the pure-ASCII xtext form
    /// otherwise.
    #[must_use]
    #[inline]
    pub fn encode(&self, smtputf8: bool) -> String {
        let encoded = match self.addr_type {
            OrcptAddrType::Rfc822 => xtext::encode(&self.mailbox),
            OrcptAddrType::Utf8 if smtputf8 => xtext::encode_utf8_addr_unitext(&self.mailbox),
            OrcptAddrType::Utf8 => xtext::encode_utf8_addr_xtext(&self.mailbox),
        };
        format!("{};{encoded}", self.addr_type.as_ref())
    }
}

/// `BY=` mode of RFC 2852.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[allow(clippy::exhaustive_enums)]
pub enum ByMode {
    /// `N`: notify on expiry, keep trying.
    Notify,
    /// `R`: return the message on expiry.
    Return,
}

/// `BY=seconds;mode[T]` of RFC 2852 (DELIVERBY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[allow(clippy::exhaustive_structs)]
pub struct DeliverBy {
    /// Seconds until the deadline, possibly negative in notify mode.
    pub seconds: i64,
    /// What to do when the deadline passes.
    pub mode: ByMode,
    /// The `T` trace modifier.
    pub trace: bool,
}

impl std::str::FromStr for DeliverBy {
    type Err = InvalidParameter;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (seconds, mode) = s
            .split_once(';')
            .ok_or_else(|| InvalidParameter::bad_value("BY", s))?;
        let seconds = seconds
            .parse::<i64>()
            .map_err(|_e| InvalidParameter::bad_value("BY", s))?;

        let (mode, trace) = match mode {
            "N" | "n" => (ByMode::Notify, false),
            "NT" | "nt" | "Nt" | "nT" => (ByMode::Notify, true),
            "R" | "r" => (ByMode::Return, false),
            "RT" | "rt" | "Rt" | "rT" => (ByMode::Return, true),
            _ => return Err(InvalidParameter::bad_value("BY", s)),
        };
        // a return-mode deadline in the past is not satisfiable
        if matches!(mode, ByMode::Return) && seconds <= 0 {
            return Err(InvalidParameter::bad_value("BY", s));
        }
        Ok(Self {
            seconds,
            mode,
            trace,
        })
    }
}

impl std::fmt::Display for DeliverBy {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{};{}{}",
            self.seconds,
            match self.mode {
                ByMode::Notify => 'N',
                ByMode::Return => 'R',
            },
            if self.trace { "T" } else { "" }
        )
    }
}

/// `MT-PRIORITY=` of RFC 6710, a priority in -9..=9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct MtPriority(i8);

impl MtPriority {
    /// Wrap a priority value.
    ///
    /// # Errors
    ///
    /// * the value is outside of -9..=9
    #[inline]
    pub fn new(value: i8) -> Result<Self, InvalidParameter> {
        if (-9..=9).contains(&value) {
            Ok(Self(value))
        } else {
            Err(InvalidParameter::bad_value("MT-PRIORITY", value.to_string()))
        }
    }

    /// The wrapped value.
    #[must_use]
    #[inline]
    pub const fn value(self) -> i8 {
        self.0
    }
}

impl std::str::FromStr for MtPriority {
    type Err = InvalidParameter;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<i8>()
            .map_err(|_e| InvalidParameter::bad_value("MT-PRIORITY", s))
            .and_then(Self::new)
    }
}

impl std::fmt::Display for MtPriority {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parse an `RRVS=` timestamp (RFC 7293): an RFC 3339 date-time, any
/// trailing `;action` clause ignored.
///
/// # Errors
///
/// * the timestamp is not RFC 3339
#[inline]
pub fn parse_rrvs(value: &str) -> Result<time::OffsetDateTime, InvalidParameter> {
    let timestamp = value.split(';').next().unwrap_or(value);
    time::OffsetDateTime::parse(timestamp, &time::format_description::well_known::Rfc3339)
        .map_err(|_e| InvalidParameter::bad_value("RRVS", value))
}

/// Format a timestamp for `RRVS=`.
///
/// # Errors
///
/// * the timestamp cannot be represented in RFC 3339 (year out of range)
#[inline]
pub fn format_rrvs(timestamp: time::OffsetDateTime) -> Result<String, InvalidParameter> {
    timestamp
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|_e| InvalidParameter::bad_value("RRVS", timestamp.to_string()))
}

/// Parameters attached to a single `RCPT TO`.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[allow(clippy::exhaustive_structs)]
pub struct RcptOptions {
    /// `NOTIFY=`.
    pub notify: Option<NotifyOn>,
    /// `ORCPT=`.
    pub orcpt: Option<OriginalRecipient>,
    /// `RRVS=`, require-recipient-valid-since.
    #[serde(with = "time::serde::rfc3339::option")]
    pub rrvs: Option<time::OffsetDateTime>,
    /// `BY=`, deliver-by deadline.
    pub by: Option<DeliverBy>,
    /// `MT-PRIORITY=`.
    pub mt_priority: Option<MtPriority>,
}
