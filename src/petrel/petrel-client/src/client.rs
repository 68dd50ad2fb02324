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

use crate::{data::DotStuffer, error::ClientError, sasl::SaslClient};
use base64::Engine;
use petrel_common::{
    options::{format_rrvs, BodyType, MailOptions, RcptOptions},
    xtext, Reply, ReversePath, SmtpError,
};
use petrel_protocol::{rustls, ConnectionKind, Reader, DEFAULT_LINE_MAX};
use tokio::io::AsyncWriteExt;

const BASE64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// How to run the dialogue; see [`Client::new`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ClientOptions {
    /// Speak ESMTP or LMTP. LMTP uses LHLO and reads one post-body reply
    /// per recipient.
    pub kind: ConnectionKind,
    /// Name sent on EHLO/LHLO.
    pub local_name: String,
    /// Deadline on one command round-trip.
    pub command_timeout: std::time::Duration,
    /// Deadline on the reply (or replies) that follow the message body.
    pub submission_timeout: std::time::Duration,
}

impl Default for ClientOptions {
    #[inline]
    fn default() -> Self {
        Self {
            kind: ConnectionKind::Smtp,
            local_name: "localhost".to_owned(),
            command_timeout: std::time::Duration::from_secs(5 * 60),
            submission_timeout: std::time::Duration::from_secs(12 * 60),
        }
    }
}

impl ClientOptions {
    /// LMTP with the defaults.
    #[must_use]
    #[inline]
    pub fn lmtp() -> Self {
        Self {
            kind: ConnectionKind::Lmtp,
            ..Self::default()
        }
    }
}

/// Outcome of one delivered recipient after an LMTP body.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::exhaustive_structs)]
pub struct RcptOutcome {
    /// The recipient, as passed to [`Client::rcpt`].
    pub recipient: String,
    /// Final reply text, or the refusal.
    pub result: Result<String, SmtpError>,
}

/// What the server made of a finished message.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Submission {
    /// SMTP: the single final reply's text.
    Accepted(String),
    /// LMTP: one outcome per recipient, in RCPT order. Only produced when
    /// every recipient succeeded; mixed results surface as
    /// [`ClientError::LmtpDelivery`].
    PerRecipient(Vec<RcptOutcome>),
}

fn validate_line(what: &'static str, value: &str) -> Result<(), ClientError> {
    if value.contains('\r') || value.contains('\n') {
        return Err(ClientError::LineInjection {
            what,
            value: value.to_owned(),
        });
    }
    Ok(())
}

fn expect(reply: Reply, command: &'static str, expected: &[u16]) -> Result<Reply, ClientError> {
    if expected.contains(&reply.code()) {
        return Ok(reply);
    }
    if reply.is_error() {
        return Err(SmtpError::from(&reply).into());
    }
    Err(ClientError::UnexpectedReply {
        command,
        reply: format!("{} {}", reply.code(), reply.text()),
    })
}

/// The sending peer: issues commands in protocol order over any async
/// stream and exposes a typed surface for the extensions the server
/// advertises.
///
/// Hello is performed lazily before the first command that needs it; EHLO
/// falls back to HELO on `500`/`502` (SMTP only).
#[derive(Debug)]
pub struct Client<S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send> {
    stream: Reader<tokio::io::ReadHalf<S>>,
    sink: tokio::io::WriteHalf<S>,
    kind: ConnectionKind,
    local_name: String,
    dial_host: Option<String>,
    command_timeout: std::time::Duration,
    submission_timeout: std::time::Duration,
    greeting_read: bool,
    did_hello: bool,
    capabilities: std::collections::BTreeMap<String, String>,
    recipients: Vec<String>,
    transaction_utf8: bool,
}

impl Client<tokio::net::TcpStream> {
    /// Dial `host:port` and wrap the connection. The host is remembered as
    /// the default TLS server name for [`Client::starttls`].
    ///
    /// # Errors
    ///
    /// * connection failure
    #[inline]
    pub async fn connect(
        host: &str,
        port: u16,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let stream = tokio::net::TcpStream::connect((host, port)).await?;
        let mut client = Self::new(stream, options);
        client.dial_host = Some(host.to_owned());
        Ok(client)
    }
}

impl<S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send> Client<S> {
    /// Wrap an established stream (a tunnel, an already-TLS socket, a test
    /// duplex...). The server greeting must not have been consumed yet.
    #[must_use]
    #[inline]
    pub fn new(stream: S, options: ClientOptions) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            stream: Reader::new(read, DEFAULT_LINE_MAX, None, false),
            sink: write,
            kind: options.kind,
            local_name: options.local_name,
            dial_host: None,
            command_timeout: options.command_timeout,
            submission_timeout: options.submission_timeout,
            greeting_read: false,
            did_hello: false,
            capabilities: std::collections::BTreeMap::new(),
            recipients: Vec::new(),
            transaction_utf8: false,
        }
    }

    async fn read_reply_unbounded(&mut self) -> Result<Reply, ClientError> {
        let replies = self.stream.as_reply_stream();
        tokio::pin!(replies);
        match tokio_stream::StreamExt::next(&mut replies).await {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(e)) => Err(e.into()),
            None => Err(ClientError::Transport(petrel_protocol::Error::UnexpectedEof)),
        }
    }

    /// Write one command line and read the reply, under the command
    /// deadline. No code checking.
    async fn exchange(&mut self, command: &str) -> Result<Reply, ClientError> {
        let deadline = self.command_timeout;
        let round_trip = async {
            tracing::trace!(">> {:?}", command);
            self.sink.write_all(command.as_bytes()).await?;
            self.sink.write_all(b"\r\n").await?;
            self.sink.flush().await?;
            self.read_reply_unbounded().await
        };
        tokio::time::timeout(deadline, round_trip)
            .await
            .map_err(|_elapsed| ClientError::Timeout(deadline))?
    }

    async fn cmd(
        &mut self,
        command: String,
        name: &'static str,
        expected: &[u16],
    ) -> Result<Reply, ClientError> {
        let reply = self.exchange(&command).await?;
        expect(reply, name, expected)
    }

    fn absorb_capabilities(&mut self, reply: &Reply) {
        self.capabilities.clear();
        for line in reply.lines().iter().skip(1) {
            let mut words = line.split_whitespace();
            let Some(keyword) = words.next() else { continue };
            let params = words.collect::<Vec<_>>().join(" ");
            self.capabilities.insert(keyword.to_ascii_uppercase(), params);
        }
    }

    /// Greeting + EHLO/LHLO, once per connection (and again after
    /// STARTTLS). EHLO falls back to HELO when the server answers `500` or
    /// `502`.
    async fn ensure_hello(&mut self) -> Result<(), ClientError> {
        if !self.greeting_read {
            let deadline = self.command_timeout;
            let greeting = tokio::time::timeout(deadline, self.read_reply_unbounded())
                .await
                .map_err(|_elapsed| ClientError::Timeout(deadline))??;
            expect(greeting, "greeting", &[220])?;
            self.greeting_read = true;
        }
        if self.did_hello {
            return Ok(());
        }

        let name = self.local_name.clone();
        validate_line("hello name", &name)?;

        match self.kind {
            ConnectionKind::Lmtp => {
                let reply = self.cmd(format!("LHLO {name}"), "LHLO", &[250]).await?;
                self.absorb_capabilities(&reply);
            }
            ConnectionKind::Smtp => {
                let reply = self.exchange(&format!("EHLO {name}")).await?;
                match reply.code() {
                    250 => self.absorb_capabilities(&reply),
                    // ancient server; no extensions then
                    500 | 502 => {
                        self.cmd(format!("HELO {name}"), "HELO", &[250]).await?;
                        self.capabilities.clear();
                    }
                    _ => {
                        expect(reply, "EHLO", &[250])?;
                    }
                }
            }
        }
        self.did_hello = true;
        Ok(())
    }

    /// The parameter string of an advertised capability, `None` when the
    /// server does not have it. Triggers hello on first use.
    ///
    /// # Errors
    ///
    /// * hello failed
    #[inline]
    pub async fn extension(&mut self, keyword: &str) -> Result<Option<String>, ClientError> {
        self.ensure_hello().await?;
        Ok(self.capabilities.get(&keyword.to_ascii_uppercase()).cloned())
    }

    /// Is `mechanism` on the advertised `AUTH` line ?
    ///
    /// # Errors
    ///
    /// * hello failed
    #[inline]
    pub async fn supports_auth(
        &mut self,
        mechanism: &petrel_common::auth::Mechanism,
    ) -> Result<bool, ClientError> {
        let name = mechanism.to_string();
        Ok(self
            .extension("AUTH")
            .await?
            .is_some_and(|list| list.split_whitespace().any(|m| m.eq_ignore_ascii_case(&name))))
    }

    /// The server's advertised SIZE limit, when it gave one.
    ///
    /// # Errors
    ///
    /// * hello failed
    #[inline]
    pub async fn max_message_size(&mut self) -> Result<Option<usize>, ClientError> {
        Ok(self
            .extension("SIZE")
            .await?
            .and_then(|params| params.parse::<usize>().ok()))
    }

    fn has(&self, keyword: &str) -> bool {
        self.capabilities.contains_key(keyword)
    }

    /// Upgrade the transport with STARTTLS. Hello state is cleared; the
    /// next command re-runs EHLO over TLS. The TLS server name defaults to
    /// the dialed host when not given.
    ///
    /// # Errors
    ///
    /// * the capability is missing, the command is refused, or the
    ///   handshake fails
    #[inline]
    pub async fn starttls(
        mut self,
        tls_config: std::sync::Arc<rustls::ClientConfig>,
        server_name: Option<&str>,
    ) -> Result<Client<tokio_rustls::client::TlsStream<S>>, ClientError> {
        self.ensure_hello().await?;
        if !self.has("STARTTLS") {
            return Err(ClientError::CapabilityMissing("STARTTLS"));
        }
        self.cmd("STARTTLS".to_owned(), "STARTTLS", &[220]).await?;

        let name = server_name
            .map(str::to_owned)
            .or_else(|| self.dial_host.clone())
            .ok_or_else(|| {
                ClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "no TLS server name available",
                ))
            })?;
        let server = name.parse::<std::net::IpAddr>().map_or_else(
            |_not_ip| {
                rustls::ServerName::try_from(name.as_str()).map_err(|_e| {
                    ClientError::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("invalid TLS server name {name:?}"),
                    ))
                })
            },
            |ip| Ok(rustls::ServerName::IpAddress(ip)),
        )?;

        let Self {
            stream,
            sink,
            kind,
            local_name,
            dial_host,
            command_timeout,
            submission_timeout,
            ..
        } = self;
        let plain = stream.into_inner().unsplit(sink);
        let connector = tokio_rustls::TlsConnector::from(tls_config);
        let tls_stream = connector.connect(server, plain).await?;

        let (read, write) = tokio::io::split(tls_stream);
        Ok(Client {
            stream: Reader::new(read, DEFAULT_LINE_MAX, None, false),
            sink: write,
            kind,
            local_name,
            dial_host,
            command_timeout,
            submission_timeout,
            // no new greeting after the handshake, but EHLO must re-run
            greeting_read: true,
            did_hello: false,
            capabilities: std::collections::BTreeMap::new(),
            recipients: Vec::new(),
            transaction_utf8: false,
        })
    }

    /// Drive a SASL exchange. A mechanism-level refusal of a challenge
    /// sends `*` to cancel before surfacing the error.
    ///
    /// # Errors
    ///
    /// * the exchange failed, on either side
    #[inline]
    pub async fn auth(&mut self, mechanism: &mut dyn SaslClient) -> Result<(), ClientError> {
        self.ensure_hello().await?;

        let (name, initial) = mechanism.start();
        let mut command = format!("AUTH {name}");
        if let Some(initial) = initial {
            command.push(' ');
            if initial.is_empty() {
                command.push('=');
            } else {
                command.push_str(&BASE64.encode(initial));
            }
        }

        let mut reply = self.exchange(&command).await?;
        loop {
            match reply.code() {
                235 => return Ok(()),
                334 => {
                    let encoded = reply.lines().first().cloned().unwrap_or_default();
                    let challenge = match BASE64.decode(encoded.trim()) {
                        Ok(challenge) => challenge,
                        Err(_e) => {
                            // protocol is out of sync; cancel before bailing
                            let _cancelled = self.exchange("*").await;
                            return Err(ClientError::Sasl(
                                "server sent a challenge that is not valid base64".to_owned(),
                            ));
                        }
                    };
                    let response = match mechanism.next(&challenge) {
                        Ok(response) => response,
                        Err(refused) => {
                            let _cancelled = self.exchange("*").await;
                            return Err(ClientError::Sasl(refused));
                        }
                    };
                    reply = self.exchange(&BASE64.encode(response)).await?;
                }
                _ => {
                    expect(reply, "AUTH", &[235, 334])?;
                    unreachable!("expect() rejects everything else");
                }
            }
        }
    }

    /// `MAIL FROM`, with extension parameters gated on the server's
    /// capability list. An empty `from` sends the null path `<>`.
    ///
    /// # Errors
    ///
    /// * line injection in `from`, a missing required capability, or a
    ///   refusal from the server
    #[inline]
    pub async fn mail(&mut self, from: &str, opts: &MailOptions) -> Result<(), ClientError> {
        self.ensure_hello().await?;
        validate_line("sender address", from)?;

        let mut command = format!("MAIL FROM:<{from}>");
        match opts.body {
            Some(BodyType::SevenBit) => command.push_str(" BODY=7BIT"),
            Some(BodyType::EightBitMime) if self.has("8BITMIME") => {
                command.push_str(" BODY=8BITMIME");
            }
            Some(BodyType::EightBitMime) | None => {}
            Some(BodyType::BinaryMime) => {
                if !self.has("BINARYMIME") || !self.has("CHUNKING") {
                    return Err(ClientError::CapabilityMissing("BINARYMIME"));
                }
                command.push_str(" BODY=BINARYMIME");
            }
        }
        if let Some(size) = opts.size {
            if self.has("SIZE") {
                command.push_str(&format!(" SIZE={size}"));
            }
        }
        if opts.require_tls {
            if !self.has("REQUIRETLS") {
                return Err(ClientError::CapabilityMissing("REQUIRETLS"));
            }
            command.push_str(" REQUIRETLS");
        }
        if opts.utf8 {
            if !self.has("SMTPUTF8") {
                return Err(ClientError::CapabilityMissing("SMTPUTF8"));
            }
            command.push_str(" SMTPUTF8");
        }
        if self.has("DSN") {
            if let Some(ret) = opts.ret {
                command.push_str(&format!(" RET={}", ret.as_ref()));
            }
            if let Some(envelope_id) = &opts.envelope_id {
                validate_line("envelope id", envelope_id)?;
                command.push_str(&format!(" ENVID={}", xtext::encode(envelope_id)));
            }
        }
        if let Some(auth) = &opts.auth {
            if self.has("AUTH") {
                let value = match auth {
                    ReversePath::Null => "<>".to_owned(),
                    ReversePath::Mailbox(mailbox) => xtext::encode(mailbox.full()),
                };
                command.push_str(&format!(" AUTH={value}"));
            }
        }

        self.cmd(command, "MAIL", &[250]).await?;
        self.recipients.clear();
        self.transaction_utf8 = opts.utf8;
        Ok(())
    }

    /// `RCPT TO`, once per recipient.
    ///
    /// # Errors
    ///
    /// * line injection in `to`, a missing required capability, or a
    ///   refusal from the server
    #[inline]
    pub async fn rcpt(&mut self, to: &str, opts: &RcptOptions) -> Result<(), ClientError> {
        self.ensure_hello().await?;
        validate_line("recipient address", to)?;

        let mut command = format!("RCPT TO:<{to}>");
        if self.has("DSN") {
            if let Some(notify) = &opts.notify {
                command.push_str(&format!(" NOTIFY={notify}"));
            }
            if let Some(orcpt) = &opts.orcpt {
                command.push_str(&format!(" ORCPT={}", orcpt.encode(self.transaction_utf8)));
            }
        }
        if let Some(rrvs) = opts.rrvs {
            if !self.has("RRVS") {
                return Err(ClientError::CapabilityMissing("RRVS"));
            }
            command.push_str(&format!(" RRVS={}", format_rrvs(rrvs)?));
        }
        if let Some(by) = opts.by {
            if !self.has("DELIVERBY") {
                return Err(ClientError::CapabilityMissing("DELIVERBY"));
            }
            command.push_str(&format!(" BY={by}"));
        }
        if let Some(priority) = opts.mt_priority {
            if !self.has("MT-PRIORITY") {
                return Err(ClientError::CapabilityMissing("MT-PRIORITY"));
            }
            command.push_str(&format!(" MT-PRIORITY={priority}"));
        }

        self.cmd(command, "RCPT", &[250, 251]).await?;
        self.recipients.push(to.to_owned());
        Ok(())
    }

    /// Open the message body. The returned writer dot-stuffs everything
    /// written to it; [`DataWriter::finish`] sends the terminator and
    /// collects the final reply (SMTP) or one reply per recipient (LMTP).
    ///
    /// # Errors
    ///
    /// * the server refused `DATA`
    #[inline]
    pub async fn data(&mut self) -> Result<DataWriter<'_, S>, ClientError> {
        self.ensure_hello().await?;
        self.cmd("DATA".to_owned(), "DATA", &[354]).await?;
        Ok(DataWriter {
            client: self,
            stuffer: DotStuffer::new(),
        })
    }

    /// MAIL + RCPTs + DATA in one call, for the common case.
    ///
    /// # Errors
    ///
    /// * whatever the individual steps can fail with
    #[inline]
    pub async fn send_message(
        &mut self,
        from: &str,
        recipients: &[&str],
        body: &[u8],
    ) -> Result<Submission, ClientError> {
        self.mail(from, &MailOptions::default()).await?;
        for recipient in recipients {
            self.rcpt(recipient, &RcptOptions::default()).await?;
        }
        let mut writer = self.data().await?;
        writer.write_all(body).await?;
        writer.finish().await
    }

    /// `RSET`: abort the transaction in progress, keep the connection for
    /// the next one.
    ///
    /// # Errors
    ///
    /// * the server refused
    #[inline]
    pub async fn reset(&mut self) -> Result<(), ClientError> {
        self.ensure_hello().await?;
        self.cmd("RSET".to_owned(), "RSET", &[250]).await?;
        self.recipients.clear();
        Ok(())
    }

    /// `NOOP`.
    ///
    /// # Errors
    ///
    /// * the server refused
    #[inline]
    pub async fn noop(&mut self) -> Result<(), ClientError> {
        self.ensure_hello().await?;
        self.cmd("NOOP".to_owned(), "NOOP", &[250]).await?;
        Ok(())
    }

    /// `VRFY`. Most servers answer a non-committal `252`.
    ///
    /// # Errors
    ///
    /// * line injection in `address`, or the server refused
    #[inline]
    pub async fn verify(&mut self, address: &str) -> Result<Reply, ClientError> {
        self.ensure_hello().await?;
        validate_line("address", address)?;
        self.cmd(format!("VRFY {address}"), "VRFY", &[250, 251, 252])
            .await
    }

    /// `QUIT`, then close the stream.
    ///
    /// # Errors
    ///
    /// * the server refused, or the close failed
    #[inline]
    pub async fn quit(mut self) -> Result<(), ClientError> {
        self.ensure_hello().await?;
        self.cmd("QUIT".to_owned(), "QUIT", &[221]).await?;
        self.sink.shutdown().await?;
        Ok(())
    }
}

/// Dot-stuffing body writer borrowed from [`Client::data`].
pub struct DataWriter<'client, S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send> {
    client: &'client mut Client<S>,
    stuffer: DotStuffer,
}

impl<S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send> DataWriter<'_, S> {
    /// Append a body fragment; CRLF handling and dot stuffing are applied
    /// on the way through.
    ///
    /// # Errors
    ///
    /// * transport failure
    #[inline]
    pub async fn write_all(&mut self, chunk: &[u8]) -> Result<(), ClientError> {
        let mut stuffed = Vec::with_capacity(chunk.len() + 8);
        self.stuffer.process_chunk(chunk, |s| stuffed.extend_from_slice(s));
        self.client.sink.write_all(&stuffed).await?;
        Ok(())
    }

    /// Terminate the body with `CRLF.CRLF` and collect the verdict, under
    /// the submission deadline.
    ///
    /// # Errors
    ///
    /// * [`ClientError::Smtp`] when the (single) final reply is a refusal
    /// * [`ClientError::LmtpDelivery`] when any recipient was refused
    /// * [`ClientError::Timeout`] when the deadline expires
    #[inline]
    pub async fn finish(mut self) -> Result<Submission, ClientError> {
        let mut terminator = Vec::with_capacity(5);
        self.stuffer.end_message(|s| terminator.extend_from_slice(s));

        let client = self.client;
        client.sink.write_all(&terminator).await?;
        client.sink.flush().await?;

        let deadline = client.submission_timeout;
        match client.kind {
            ConnectionKind::Smtp => {
                let reply = tokio::time::timeout(deadline, client.read_reply_unbounded())
                    .await
                    .map_err(|_elapsed| ClientError::Timeout(deadline))??;
                let reply = expect(reply, "DATA", &[250])?;
                client.recipients.clear();
                Ok(Submission::Accepted(reply.text()))
            }
            ConnectionKind::Lmtp => {
                let recipients = std::mem::take(&mut client.recipients);
                let collect = async {
                    let mut outcomes = Vec::with_capacity(recipients.len());
                    // exactly one reply per RCPT, in order
                    for recipient in recipients {
                        let reply = client.read_reply_unbounded().await?;
                        let result = if reply.is_error() {
                            Err(SmtpError::from(&reply))
                        } else {
                            Ok(reply.text())
                        };
                        outcomes.push(RcptOutcome { recipient, result });
                    }
                    Ok::<Vec<RcptOutcome>, ClientError>(outcomes)
                };
                let outcomes = tokio::time::timeout(deadline, collect)
                    .await
                    .map_err(|_elapsed| ClientError::Timeout(deadline))??;

                if outcomes.iter().any(|outcome| outcome.result.is_err()) {
                    Err(ClientError::LmtpDelivery { outcomes })
                } else {
                    Ok(Submission::PerRecipient(outcomes))
                }
            }
        }
    }
}
