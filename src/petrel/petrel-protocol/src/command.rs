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

use crate::ParseArgsError;
use petrel_common::{
    auth::Mechanism,
    options::{
        parse_rrvs, DeliverBy, DsnReturn, InvalidParameter, MailOptions, MtPriority, NotifyOn,
        OriginalRecipient, RcptOptions,
    },
    parser, types::ClientName, Address, Domain, ReversePath,
};

macro_rules! strip_suffix_crlf {
    ($v:expr) => {
        $v.0.strip_suffix(b"\r\n")
            .ok_or(ParseArgsError::InvalidArgs)?
    };
}

/// Buffer received from the client, CRLF included.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct UnparsedArgs(pub Vec<u8>);

/// A dispatched command: its verb and the bytes that followed it.
pub type Command<Verb, Args> = (Verb, Args);

/// One TCP window worth of pipelined commands.
pub type Batch = Vec<Command<Verb, UnparsedArgs>>;

/// SMTP command verbs, matched case-insensitively on the first token of a
/// line. The `FROM:` / `TO:` argument prefixes are handled by the argument
/// parsers, also case-insensitively.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, strum::AsRefStr, strum::EnumString, strum::Display,
)]
#[strum(ascii_case_insensitive)]
#[non_exhaustive]
pub enum Verb {
    /// Historical hello; disables every extension.
    #[strum(serialize = "HELO")]
    Helo,
    /// Extended hello, answered with the capability list.
    #[strum(serialize = "EHLO")]
    Ehlo,
    /// The LMTP hello, RFC 2033. Mandatory (and only valid) in LMTP mode.
    #[strum(serialize = "LHLO")]
    Lhlo,
    /// Opens a mail transaction.
    #[strum(serialize = "MAIL")]
    Mail,
    /// Adds one recipient to the transaction.
    #[strum(serialize = "RCPT")]
    Rcpt,
    /// Starts the dot-stuffed message transfer.
    #[strum(serialize = "DATA")]
    Data,
    /// Transfers one binary chunk, RFC 3030.
    #[strum(serialize = "BDAT")]
    Bdat,
    /// Aborts the current transaction.
    #[strum(serialize = "RSET")]
    Rset,
    /// Does nothing.
    #[strum(serialize = "NOOP")]
    Noop,
    /// Mailbox verification; always answered `252`.
    #[strum(serialize = "VRFY")]
    Vrfy,
    /// SASL authentication, RFC 4954.
    #[strum(serialize = "AUTH")]
    Auth,
    /// TLS negotiation, RFC 3207.
    #[strum(serialize = "STARTTLS")]
    StartTls,
    /// Closes the connection after a `221`.
    #[strum(serialize = "QUIT")]
    Quit,
    /// Commands of RFC 5321 the engine deliberately refuses.
    #[strum(
        serialize = "SEND",
        serialize = "SOML",
        serialize = "SAML",
        serialize = "EXPN",
        serialize = "HELP",
        serialize = "TURN"
    )]
    Unsupported,
    /// Anything else.
    #[strum(disabled)]
    Unknown,
}

impl Verb {
    /// Can the reply be held back and flushed with the rest of the pipelined
    /// window (RFC 2920) ?
    #[inline]
    #[must_use]
    pub const fn is_bufferable(self) -> bool {
        !matches!(
            self,
            Self::Helo
                | Self::Ehlo
                | Self::Lhlo
                | Self::Data
                | Self::Bdat
                | Self::Quit
                | Self::StartTls
                | Self::Auth
        )
    }

    /// Does this verb change the meaning of the bytes that follow it on the
    /// wire (message body, chunk payload, SASL exchange, TLS records) ? The
    /// window reader must stop splitting lines right after it.
    #[inline]
    #[must_use]
    pub const fn ends_window(self) -> bool {
        matches!(
            self,
            Self::Data | Self::Bdat | Self::Auth | Self::StartTls | Self::Quit
        )
    }
}

/// Split one CRLF-terminated line into its verb and raw arguments.
#[must_use]
#[inline]
pub fn parse_command_line(line: Vec<u8>) -> Command<Verb, UnparsedArgs> {
    let token_end = line
        .iter()
        .position(|b| *b == b' ' || *b == b'\r')
        .unwrap_or(line.len());

    let verb = std::str::from_utf8(&line[..token_end])
        .ok()
        .and_then(|token| token.parse::<Verb>().ok())
        .unwrap_or(Verb::Unknown);

    match verb {
        Verb::Unknown => (verb, UnparsedArgs(line)),
        _ => (verb, UnparsedArgs(line[token_end..].to_vec())),
    }
}

/// Kind of listener a connection came in on, deciding the greeting, the
/// hello verb and the shape of the post-body replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, serde::Serialize, serde::Deserialize)]
#[allow(clippy::exhaustive_enums)]
pub enum ConnectionKind {
    /// RFC 5321 over the network.
    #[strum(serialize = "ESMTP")]
    Smtp,
    /// RFC 2033: LHLO hello, one reply per recipient after a body.
    #[strum(serialize = "LMTP")]
    Lmtp,
}

/// Information received from the client at the HELO command.
#[non_exhaustive]
pub struct HeloArgs {
    /// Name of the client.
    pub client_name: Domain,
}

/// Information received from the client at the EHLO/LHLO command.
#[non_exhaustive]
pub struct EhloArgs {
    /// Name of the client.
    pub client_name: ClientName,
}

/// Information received from the client at the AUTH command.
#[non_exhaustive]
pub struct AuthArgs {
    /// Authentication mechanism.
    pub mechanism: Mechanism,
    /// First buffer of the exchange, still [`base64`] encoded.
    /// A bare `=` stands for an empty initial response.
    pub initial_response: Option<Vec<u8>>,
}

/// Information received from the client at the MAIL FROM command.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailFromArgs {
    /// Sender address, possibly `<>`.
    pub reverse_path: ReversePath,
    /// Recognized extension parameters.
    pub options: MailOptions,
    /// Parameter keywords the grammar does not know, upcased. The receiver
    /// refuses the command when this is not empty.
    pub unknown: Vec<String>,
}

/// Information received from the client at the RCPT TO command.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RcptToArgs {
    /// Recipient address.
    pub forward_path: Address,
    /// Recognized extension parameters.
    pub options: RcptOptions,
    /// Parameter keywords the grammar does not know, upcased.
    pub unknown: Vec<String>,
}

/// Information received from the client at a BDAT command.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BdatArgs {
    /// Exact number of payload bytes following the command.
    pub size: u64,
    /// This chunk ends the message.
    pub last: bool,
}

impl TryFrom<UnparsedArgs> for HeloArgs {
    type Error = ParseArgsError;

    #[inline]
    fn try_from(value: UnparsedArgs) -> Result<Self, Self::Error> {
        let value = strip_suffix_crlf!(value);
        let mut cursor = parser::Cursor::new(value);
        let name = parser::parse_hello_arg(&mut cursor)?;

        Ok(Self {
            client_name: name.parse::<Domain>()?,
        })
    }
}

impl TryFrom<UnparsedArgs> for EhloArgs {
    type Error = ParseArgsError;

    #[inline]
    fn try_from(value: UnparsedArgs) -> Result<Self, Self::Error> {
        let value = strip_suffix_crlf!(value);
        let mut cursor = parser::Cursor::new(value);
        let name = parser::parse_hello_arg(&mut cursor)?;

        if !name.is_ascii() {
            return Err(ParseArgsError::InvalidArgs);
        }
        Ok(Self {
            client_name: name.parse::<ClientName>()?,
        })
    }
}

impl TryFrom<UnparsedArgs> for AuthArgs {
    type Error = ParseArgsError;

    #[inline]
    fn try_from(value: UnparsedArgs) -> Result<Self, Self::Error> {
        let value = strip_suffix_crlf!(value);
        let start = value
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(value.len());
        let value = &value[start..];

        let mut split = value.splitn(2, |b| b.is_ascii_whitespace());
        let mechanism = split.next().filter(|m| !m.is_empty()).ok_or(ParseArgsError::InvalidArgs)?;
        let initial_response = split.next().map(<[u8]>::to_vec);

        let mechanism = String::from_utf8(mechanism.to_vec())?
            .parse()
            .map_err(|_err| ParseArgsError::InvalidArgs)?;

        Ok(Self {
            mechanism,
            initial_response,
        })
    }
}

/// The path token a failed parse was looking at, for the `553` reply.
fn first_token(value: &[u8]) -> String {
    String::from_utf8_lossy(value)
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_owned()
}

/// Case-insensitively strip the `FROM:` / `TO:` prefix of MAIL and RCPT.
fn strip_prefix_fold<'args>(
    value: &'args [u8],
    prefix: &'static str,
) -> Result<&'args [u8], ParseArgsError> {
    let mut cursor = parser::Cursor::new(value);
    cursor.skip_whitespace();
    let rest = cursor.rest();
    if rest.len() < prefix.len() || !rest[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes()) {
        return Err(ParseArgsError::MissingPrefix(prefix));
    }
    Ok(&rest[prefix.len()..])
}

/// `ENVID` must decode to printable ASCII (RFC 3461 §4.4).
fn check_envid(decoded: &str) -> Result<(), InvalidParameter> {
    if decoded.bytes().all(|b| (0x20..=0x7e).contains(&b)) {
        Ok(())
    } else {
        Err(InvalidParameter::bad_value("ENVID", decoded))
    }
}

fn require_value(
    keyword: &'static str,
    value: Option<String>,
) -> Result<String, InvalidParameter> {
    value.ok_or(InvalidParameter::BadValue {
        keyword,
        value: String::new(),
    })
}

fn forbid_value(keyword: &'static str, value: Option<String>) -> Result<(), InvalidParameter> {
    match value {
        None => Ok(()),
        Some(value) => Err(InvalidParameter::BadValue { keyword, value }),
    }
}

impl TryFrom<UnparsedArgs> for MailFromArgs {
    type Error = ParseArgsError;

    #[inline]
    fn try_from(value: UnparsedArgs) -> Result<Self, Self::Error> {
        let value = strip_suffix_crlf!(value);
        let value = strip_prefix_fold(value, "FROM:")?;

        let mut cursor = parser::Cursor::new(value);
        cursor.skip_whitespace();
        let path_text = first_token(cursor.rest());
        let reverse_path = parser::parse_reverse_path(&mut cursor)
            .map_err(|_e| ParseArgsError::InvalidMailAddress { mail: path_text })?;

        let mut options = MailOptions::default();
        let mut unknown = vec![];

        for (key, value) in parser::parse_args(&mut cursor)? {
            match key.as_str() {
                "SIZE" => {
                    let value = require_value("SIZE", value)?;
                    options.size = Some(
                        value
                            .parse()
                            .map_err(|_e| InvalidParameter::bad_value("SIZE", value.clone()))?,
                    );
                }
                "BODY" => {
                    let value = require_value("BODY", value)?;
                    options.body = Some(
                        value
                            .parse()
                            .map_err(|_e| InvalidParameter::bad_value("BODY", value.clone()))?,
                    );
                }
                "SMTPUTF8" => {
                    forbid_value("SMTPUTF8", value)?;
                    options.utf8 = true;
                }
                "REQUIRETLS" => {
                    forbid_value("REQUIRETLS", value)?;
                    options.require_tls = true;
                }
                "RET" => {
                    let value = require_value("RET", value)?;
                    options.ret = Some(
                        value
                            .parse::<DsnReturn>()
                            .map_err(|_e| InvalidParameter::bad_value("RET", value.clone()))?,
                    );
                }
                "ENVID" => {
                    let decoded = petrel_common::xtext::decode(&require_value("ENVID", value)?)
                        .map_err(|source| InvalidParameter::BadEncoding {
                            keyword: "ENVID",
                            source,
                        })?;
                    check_envid(&decoded)?;
                    options.envelope_id = Some(decoded);
                }
                "AUTH" => {
                    let value = require_value("AUTH", value)?;
                    let decoded = petrel_common::xtext::decode(&value).map_err(|source| {
                        InvalidParameter::BadEncoding {
                            keyword: "AUTH",
                            source,
                        }
                    })?;
                    options.auth = Some(
                        decoded
                            .parse::<ReversePath>()
                            .map_err(|_e| InvalidParameter::bad_value("AUTH", value))?,
                    );
                }
                _ => unknown.push(key),
            }
        }

        Ok(Self {
            reverse_path,
            options,
            unknown,
        })
    }
}

impl TryFrom<UnparsedArgs> for RcptToArgs {
    type Error = ParseArgsError;

    #[inline]
    fn try_from(value: UnparsedArgs) -> Result<Self, Self::Error> {
        let value = strip_suffix_crlf!(value);
        let value = strip_prefix_fold(value, "TO:")?;

        let mut cursor = parser::Cursor::new(value);
        cursor.skip_whitespace();
        let path_text = first_token(cursor.rest());
        let forward_path = parser::parse_path(&mut cursor)
            .map_err(|_e| ParseArgsError::InvalidMailAddress { mail: path_text })?;

        let mut options = RcptOptions::default();
        let mut unknown = vec![];

        for (key, value) in parser::parse_args(&mut cursor)? {
            match key.as_str() {
                "NOTIFY" => {
                    options.notify = Some(require_value("NOTIFY", value)?.parse::<NotifyOn>()?);
                }
                "ORCPT" => {
                    options.orcpt =
                        Some(require_value("ORCPT", value)?.parse::<OriginalRecipient>()?);
                }
                "RRVS" => {
                    options.rrvs = Some(parse_rrvs(&require_value("RRVS", value)?)?);
                }
                "BY" => {
                    options.by = Some(require_value("BY", value)?.parse::<DeliverBy>()?);
                }
                "MT-PRIORITY" => {
                    options.mt_priority =
                        Some(require_value("MT-PRIORITY", value)?.parse::<MtPriority>()?);
                }
                _ => unknown.push(key),
            }
        }

        Ok(Self {
            forward_path,
            options,
            unknown,
        })
    }
}

impl TryFrom<UnparsedArgs> for BdatArgs {
    type Error = ParseArgsError;

    #[inline]
    fn try_from(value: UnparsedArgs) -> Result<Self, Self::Error> {
        let value = strip_suffix_crlf!(value);
        let mut split = value.split(u8::is_ascii_whitespace).filter(|s| !s.is_empty());

        let size = split
            .next()
            .and_then(|s| std::str::from_utf8(s).ok())
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or(ParseArgsError::InvalidArgs)?;

        let last = match split.next() {
            None => false,
            Some(token) if token.eq_ignore_ascii_case(b"LAST") => true,
            Some(_) => return Err(ParseArgsError::InvalidArgs),
        };
        if split.next().is_some() {
            return Err(ParseArgsError::InvalidArgs);
        }

        Ok(Self { size, last })
    }
}
