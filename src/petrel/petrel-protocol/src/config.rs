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

use crate::ConnectionKind;

/// Delivery deadline policy for the DELIVERBY extension (RFC 2852).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[allow(clippy::exhaustive_structs)]
pub struct DeliverByPolicy {
    /// Smallest deadline the server commits to, advertised on the EHLO line
    /// when set.
    pub min_seconds: Option<i64>,
}

/// Priority profile advertised with MT-PRIORITY (RFC 6710 §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString, serde::Serialize, serde::Deserialize)]
#[non_exhaustive]
pub enum MtPriorityProfile {
    ///
    #[strum(serialize = "MIXER")]
    Mixer,
    ///
    #[strum(serialize = "STANAG4406")]
    Stanag4406,
    ///
    #[strum(serialize = "NSEP")]
    Nsep,
}

/// Which optional ESMTP extensions the receiver advertises and accepts.
/// PIPELINING, 8BITMIME, ENHANCEDSTATUSCODES, CHUNKING and SIZE are always
/// on.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
#[allow(clippy::exhaustive_structs)]
pub struct Extensions {
    /// SMTPUTF8 (RFC 6531).
    pub utf8: bool,
    /// REQUIRETLS (RFC 8689); only advertised once TLS is up.
    pub require_tls: bool,
    /// BINARYMIME (RFC 3030).
    pub binary_mime: bool,
    /// DSN parameters: RET, ENVID, NOTIFY, ORCPT (RFC 3461).
    pub dsn: bool,
    /// RRVS (RFC 7293).
    pub rrvs: bool,
    /// DELIVERBY (RFC 2852).
    pub deliver_by: Option<DeliverByPolicy>,
    /// MT-PRIORITY (RFC 6710).
    pub mt_priority: Option<MtPriorityProfile>,
}

impl Default for Extensions {
    #[inline]
    fn default() -> Self {
        Self {
            utf8: true,
            require_tls: true,
            binary_mime: true,
            dsn: true,
            rrvs: false,
            deliver_by: None,
            mt_priority: None,
        }
    }
}

/// Everything one receiver needs to know about its connection handling.
#[serde_with::serde_as]
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
#[allow(clippy::exhaustive_structs)]
pub struct ReceiverConfig {
    /// Domain announced in the greeting and EHLO replies.
    pub domain: String,
    /// ESMTP or LMTP.
    pub kind: ConnectionKind,
    /// Longest acceptable line, CRLF included.
    pub line_max: usize,
    /// Largest accepted message; also the advertised SIZE value.
    pub message_size_max: Option<usize>,
    /// Cap on recipients per transaction; advertised as `LIMITS RCPTMAX`.
    pub rcpt_max: Option<usize>,
    /// Batch pipelined commands (RFC 2920). Advertised unconditionally.
    pub pipelining: bool,
    /// Errors tolerated before `500 5.5.1` and a forced close.
    pub error_threshold: i64,
    /// Idle read deadline; expiry answers `421 4.4.2` and closes.
    #[serde_as(as = "Option<serde_with::DurationSeconds<u64>>")]
    pub read_timeout: Option<std::time::Duration>,
    /// Write deadline; expiry closes without a reply.
    #[serde_as(as = "Option<serde_with::DurationSeconds<u64>>")]
    pub write_timeout: Option<std::time::Duration>,
    /// Accept AUTH on plaintext connections.
    pub allow_insecure_auth: bool,
    /// Server-side TLS for STARTTLS; the capability follows this.
    #[serde(skip)]
    pub tls: Option<std::sync::Arc<tokio_rustls::rustls::ServerConfig>>,
    /// Deadline on the TLS handshake after STARTTLS.
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub tls_handshake_timeout: std::time::Duration,
    /// Optional extension toggles.
    pub extensions: Extensions,
}

impl Default for ReceiverConfig {
    #[inline]
    fn default() -> Self {
        Self {
            domain: "localhost".to_owned(),
            kind: ConnectionKind::Smtp,
            line_max: crate::reader::DEFAULT_LINE_MAX,
            message_size_max: Some(25 * 1024 * 1024),
            rcpt_max: Some(1000),
            pipelining: true,
            error_threshold: 3,
            read_timeout: Some(std::time::Duration::from_secs(300)),
            write_timeout: Some(std::time::Duration::from_secs(30)),
            allow_insecure_auth: false,
            tls: None,
            tls_handshake_timeout: std::time::Duration::from_secs(10),
            extensions: Extensions::default(),
        }
    }
}
