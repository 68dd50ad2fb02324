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

use crate::{lmtp::StatusCollector, ConnectionKind, Error};
use petrel_common::{
    auth::Mechanism,
    options::{MailOptions, RcptOptions},
    Address, EnhancedCode, ReversePath, SmtpError,
};

/// Facts about an accepted connection, handed to the backend when it builds
/// a session.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ConnectionInfo {
    /// Peer address of the connection.
    pub client_addr: std::net::SocketAddr,
    /// Address of the listener which accepted the connection.
    pub server_addr: std::net::SocketAddr,
    /// SMTP or LMTP.
    pub kind: ConnectionKind,
    /// Instant when the connection was accepted.
    pub timestamp: time::OffsetDateTime,
    /// Universal unique identifier of the connection.
    pub uuid: uuid::Uuid,
    /// Has TLS been negotiated ?
    pub tls: bool,
}

impl ConnectionInfo {
    /// Describe a freshly accepted plaintext connection.
    #[must_use]
    #[inline]
    pub fn new(
        client_addr: std::net::SocketAddr,
        server_addr: std::net::SocketAddr,
        kind: ConnectionKind,
    ) -> Self {
        Self {
            client_addr,
            server_addr,
            kind,
            timestamp: time::OffsetDateTime::now_utc(),
            uuid: uuid::Uuid::new_v4(),
            tls: false,
        }
    }
}

/// One step of a server-side SASL exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::exhaustive_enums)]
pub enum SaslStep {
    /// Send this challenge (it will be base64-encoded on the wire) and wait
    /// for the client's response.
    Challenge(Vec<u8>),
    /// The exchange succeeded.
    Done,
}

/// A pluggable server-side SASL mechanism state machine.
///
/// The engine owns the wire framing (`334` challenges, base64, `*`
/// cancellation); implementations only see decoded buffers.
pub trait SaslServer: Send {
    /// Drive one round. `response` is `None` on the first round when the
    /// client supplied no initial response.
    ///
    /// # Errors
    ///
    /// * authentication failed; the error is sent verbatim
    fn next(&mut self, response: Option<&[u8]>) -> Result<SaslStep, SmtpError>;
}

/// The application behind the engine: builds one [`Session`] per accepted
/// connection.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Per-connection state.
    type Session: Session;

    /// Called once the client has introduced itself.
    ///
    /// # Errors
    ///
    /// * refuse the connection; the error is sent as the hello reply
    async fn new_session(&self, connection: &ConnectionInfo)
        -> Result<Self::Session, SmtpError>;
}

/// Per-connection application state, driven by the receiver.
///
/// Envelope callbacks reply `250` on `Ok(())` and put the returned
/// [`SmtpError`] on the wire verbatim otherwise. A panic anywhere in the
/// session is caught, answered with `421 4.0.0` and closes the connection.
#[async_trait::async_trait]
pub trait Session: Send {
    /// Mechanisms to advertise on the `AUTH` capability line. Empty list:
    /// no AUTH capability.
    fn auth_mechanisms(&self) -> Vec<Mechanism> {
        Vec::new()
    }

    /// Start a SASL exchange for one of the advertised mechanisms.
    ///
    /// # Errors
    ///
    /// * the mechanism is not supported; sent verbatim
    fn auth(&mut self, mechanism: &Mechanism) -> Result<Box<dyn SaslServer>, SmtpError> {
        Err(SmtpError::with_enhanced(
            504,
            EnhancedCode(5, 5, 4),
            format!("Mechanism {mechanism} is not supported"),
        ))
    }

    /// `MAIL FROM`, opening a transaction.
    async fn mail(&mut self, from: &ReversePath, opts: &MailOptions) -> Result<(), SmtpError>;

    /// `RCPT TO`, one call per recipient, in wire order.
    async fn rcpt(&mut self, to: &Address, opts: &RcptOptions) -> Result<(), SmtpError>;

    /// Consume the message body.
    ///
    /// `body` yields raw body fragments: dot-unstuffed CRLF lines for DATA,
    /// byte blocks for BDAT. An `Err` item means the transfer failed
    /// mid-stream (size limit, RSET, connection loss); the session should
    /// give up and return an error; [`Error::to_smtp_error`] provides the
    /// canonical mapping. Returning before the stream is exhausted is fine,
    /// the receiver drains the wire.
    async fn data<S>(&mut self, body: S) -> Result<(), SmtpError>
    where
        S: tokio_stream::Stream<Item = Result<Vec<u8>, Error>> + Send + Unpin;

    /// LMTP body consumption with per-recipient verdicts.
    ///
    /// Implementations report each recipient through `status`; anything left
    /// unset when this returns is filled with the overall result. The
    /// default implementation fans the single [`Session::data`] result out
    /// to every recipient.
    async fn data_lmtp<S>(
        &mut self,
        body: S,
        status: &mut StatusCollector,
    ) -> Result<(), SmtpError>
    where
        S: tokio_stream::Stream<Item = Result<Vec<u8>, Error>> + Send + Unpin,
    {
        let result = self.data(body).await;
        status.fill_remaining(&result);
        result
    }

    /// `RSET`, or an implicit abort (re-hello, STARTTLS): forget any
    /// transaction in progress.
    async fn reset(&mut self);

    /// The connection is going away.
    async fn logout(&mut self);
}
