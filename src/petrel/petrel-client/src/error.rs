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

use crate::client::RcptOutcome;
use petrel_common::SmtpError;

fn summarize(outcomes: &[RcptOutcome]) -> String {
    let mut failures = outcomes
        .iter()
        .filter_map(|outcome| {
            outcome
                .result
                .as_ref()
                .err()
                .map(|error| format!("<{}>: {error}", outcome.recipient))
        })
        .collect::<Vec<_>>();
    // deterministic whatever the wire order was
    failures.sort();
    failures.join("; ")
}

/// Everything the client can fail with.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ClientError {
    /// Transport failure below the protocol.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Framing failure (overlong reply line, truncated reply...).
    #[error(transparent)]
    Transport(#[from] petrel_protocol::Error),
    /// The server answered 4xx/5xx.
    #[error(transparent)]
    Smtp(#[from] SmtpError),
    /// A command needs an extension the server did not advertise.
    #[error("the server does not support {0}")]
    CapabilityMissing(&'static str),
    /// A supplied parameter value cannot be represented on the wire.
    #[error(transparent)]
    InvalidParameter(#[from] petrel_common::options::InvalidParameter),
    /// A user-supplied string contained CR or LF; nothing was written.
    #[error("a line break is not allowed in {what}: {value:?}")]
    LineInjection {
        /// Which argument was poisoned.
        what: &'static str,
        /// The offending value.
        value: String,
    },
    /// The server answered outside of the expected codes.
    #[error("unexpected reply to {command}: {reply:?}")]
    UnexpectedReply {
        /// The command that was sent.
        command: &'static str,
        /// First line of what came back.
        reply: String,
    },
    /// The SASL exchange broke down (bad base64, mechanism failure).
    #[error("authentication exchange failed: {0}")]
    Sasl(String),
    /// A command round-trip exceeded its deadline.
    #[error("command timed out after {0:?}")]
    Timeout(std::time::Duration),
    /// LMTP accepted the body for some recipients and refused it for
    /// others; `outcomes` keeps the wire order.
    #[error("delivery failed for {}", summarize(.outcomes))]
    LmtpDelivery {
        /// One entry per recipient, in RCPT order.
        outcomes: Vec<RcptOutcome>,
    },
}
