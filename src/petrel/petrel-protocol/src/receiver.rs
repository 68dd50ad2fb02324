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

use crate::{
    command::{
        parse_command_line, AuthArgs, BdatArgs, EhloArgs, HeloArgs, MailFromArgs, RcptToArgs,
        UnparsedArgs, Verb,
    },
    lmtp::{StatusCollector, StatusSlots},
    reader::Reader,
    session::{Backend, ConnectionInfo, SaslStep, Session},
    writer::WindowWriter,
    ConnectionKind, Error, ParseArgsError, ReceiverConfig,
};
use base64::Engine;
use futures_util::FutureExt;
use petrel_common::{
    options::{BodyType, MailOptions},
    Address, EnhancedCode, Reply, SmtpError, Stage,
};
use std::panic::AssertUnwindSafe;
use tokio_rustls::rustls;

const BASE64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Counter of offending commands; past the threshold the connection is
/// answered `500 5.5.1` and closed.
pub struct ErrorCounter {
    /// Syntax errors seen so far.
    pub error_count: i64,
    /// `-1` disables the escalation.
    pub threshold: i64,
}

impl ErrorCounter {
    fn bump(&mut self) -> bool {
        self.error_count += 1;
        self.threshold != -1 && self.error_count >= self.threshold
    }
}

/// What a command loop iteration decided about the connection.
enum Outcome {
    /// `DATA` was accepted, read a dot-stuffed body.
    Message,
    /// A first `BDAT` arrived, run the chunked transfer.
    Chunked(BdatArgs),
    /// `AUTH` was accepted, run the SASL exchange.
    Authenticate(AuthArgs),
    /// `STARTTLS` was accepted, hand the transport to rustls.
    UpgradeTls,
    /// Close the connection (QUIT, EOF, error escalation).
    Closed,
}

enum SessionEnd {
    Closed,
    UpgradeTls,
}

/// How the BDAT feeder left the wire.
enum FeedEnd {
    /// `BDAT ... LAST` completed; `oversized` carries the sticky `552`
    /// when the accumulated size crossed the limit.
    Last { oversized: Option<Reply> },
    /// RSET aborted the transfer.
    Reset,
    /// QUIT aborted the transfer.
    Quit,
    /// The inbound side died (EOF, framer error, read timeout).
    Dead(Error),
}

struct Transaction {
    options: MailOptions,
    recipients: Vec<Address>,
}

struct SessionState<S> {
    session: Option<S>,
    authenticated: bool,
    stage: Stage,
    transaction: Option<Transaction>,
}

impl<S> SessionState<S> {
    const fn new() -> Self {
        Self {
            session: None,
            authenticated: false,
            stage: Stage::Connect,
            transaction: None,
        }
    }
}

/// Wrap a backend invocation in a fault-isolation boundary: an unwinding
/// panic becomes `Err(())`, mapped to `421 4.0.0` by the caller.
async fn isolate<F: std::future::Future>(fut: F) -> Result<F::Output, ()> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(value) => Ok(value),
        Err(_panic) => {
            tracing::error!("backend invocation panicked");
            Err(())
        }
    }
}

fn isolate_sync<T>(f: impl FnOnce() -> T) -> Result<T, ()> {
    std::panic::catch_unwind(AssertUnwindSafe(f)).map_err(|_panic| {
        tracing::error!("backend invocation panicked");
    })
}

fn internal_error() -> SmtpError {
    SmtpError::with_enhanced(421, EnhancedCode(4, 0, 0), "Internal server error")
}

fn sequence_error(text: &str) -> Reply {
    Reply::with_enhanced(502, EnhancedCode(5, 5, 1), text)
}

fn syntax_error(text: &str) -> Reply {
    Reply::with_enhanced(501, EnhancedCode(5, 5, 2), text)
}

fn unsupported_parameter(keyword: &str) -> Reply {
    Reply::with_enhanced(
        504,
        EnhancedCode(5, 5, 4),
        format!("Unsupported parameter {keyword}"),
    )
}

fn backend_reply(error: SmtpError) -> Reply {
    Reply::from(error).or_enhanced_default()
}

fn ok_reply() -> Reply {
    Reply::with_enhanced(250, EnhancedCode(2, 0, 0), "Ok")
}

fn queued_reply() -> Reply {
    Reply::with_enhanced(250, EnhancedCode(2, 0, 0), "Ok: queued")
}

fn size_exceeded_reply() -> Reply {
    Reply::with_enhanced(552, EnhancedCode(5, 3, 4), "Maximum message size exceeded")
}

fn line_too_long_reply() -> Reply {
    Reply::with_enhanced(500, EnhancedCode(5, 4, 0), "Too long line, closing connection")
}

fn idle_timeout_reply() -> Reply {
    Reply::with_enhanced(421, EnhancedCode(4, 4, 2), "Idle timeout, closing connection")
}

/// The server half of the engine: owns the framer and the reply writer for
/// one connection and drives a [`Backend`] session through the command
/// machine.
pub struct Receiver<
    B: Backend,
    R: tokio::io::AsyncRead + Unpin + Send,
    W: tokio::io::AsyncWrite + Unpin + Send,
> {
    stream: Reader<R>,
    sink: WindowWriter<W>,
    backend: std::sync::Arc<B>,
    config: std::sync::Arc<ReceiverConfig>,
    error_counter: ErrorCounter,
}

impl<B: Backend>
    Receiver<B, tokio::net::tcp::OwnedReadHalf, tokio::net::tcp::OwnedWriteHalf>
{
    /// Take ownership of a freshly accepted TCP stream.
    #[inline]
    #[must_use]
    pub fn new(
        tcp_stream: tokio::net::TcpStream,
        backend: std::sync::Arc<B>,
        config: std::sync::Arc<ReceiverConfig>,
    ) -> Self {
        let (read, write) = tcp_stream.into_split();
        let threshold = config.error_threshold;
        Self {
            stream: Reader::new(read, config.line_max, config.read_timeout, config.pipelining),
            sink: WindowWriter::new(write, config.write_timeout),
            backend,
            config,
            error_counter: ErrorCounter {
                error_count: 0,
                threshold,
            },
        }
    }

    /// Run the connection to completion: greeting, command dialogue, body
    /// transfers, a possible STARTTLS upgrade, close.
    ///
    /// # Errors
    ///
    /// * transport failures; everything protocol-level is handled inside
    #[inline]
    pub async fn serve(mut self, info: ConnectionInfo) -> Result<(), Error> {
        let greeting = Reply::new(
            220,
            format!("{} {} Service Ready", self.config.domain, self.config.kind),
        );
        self.sink.direct_send_reply(greeting).await?;

        match self.run_session(&info).await? {
            SessionEnd::Closed => Ok(()),
            SessionEnd::UpgradeTls => self.upgrade_tls(info).await,
        }
    }

    #[allow(clippy::expect_used)]
    async fn upgrade_tls(self, mut info: ConnectionInfo) -> Result<(), Error> {
        let Self {
            stream,
            sink,
            backend,
            config,
            error_counter,
        } = self;
        let tls_config = config.tls.clone().expect("STARTTLS accepted without TLS config");

        let tcp_stream = sink
            .into_inner()
            .reunite(stream.into_inner())
            .expect("reuniting halves of the same stream");

        let acceptor = tokio_rustls::TlsAcceptor::from(tls_config);
        let tls_stream = match tokio::time::timeout(
            config.tls_handshake_timeout,
            acceptor.accept(tcp_stream),
        )
        .await
        {
            Ok(Ok(tls_stream)) => tls_stream,
            Ok(Err(e)) => return Err(e.into()),
            Err(_elapsed) => {
                return Err(Error::Timeout {
                    after: config.tls_handshake_timeout,
                    doing: "the TLS handshake",
                })
            }
        };

        {
            let (_, tls_session) = tls_stream.get_ref();
            tracing::debug!(
                protocol = ?tls_session.protocol_version(),
                cipher_suite = ?tls_session.negotiated_cipher_suite().map(|suite| suite.suite()),
                sni = tls_session.sni_hostname(),
                "TLS established.",
            );
        }

        // the plaintext framer died with its buffer (RFC 3207: discard
        // anything pipelined ahead of the handshake)
        let (read, write) = tokio::io::split(tls_stream);
        info.tls = true;

        let mut secured = Receiver {
            stream: Reader::new(read, config.line_max, config.read_timeout, config.pipelining),
            sink: WindowWriter::new(write, config.write_timeout),
            backend,
            config,
            error_counter,
        };
        match secured.run_session(&info).await? {
            SessionEnd::Closed => Ok(()),
            SessionEnd::UpgradeTls => unreachable!("STARTTLS is refused on a TLS connection"),
        }
    }
}

impl<
        B: Backend,
        R: tokio::io::AsyncRead + Unpin + Send,
        W: tokio::io::AsyncWrite + Unpin + Send,
    > Receiver<B, R, W>
{
    /// One full session on the current transport. The peer starts from (or
    /// returns to) the greeting state; a fresh backend session is created at
    /// the next hello.
    async fn run_session(&mut self, info: &ConnectionInfo) -> Result<SessionEnd, Error> {
        let mut state = SessionState::<B::Session>::new();
        let end = self.session_loop(info, &mut state).await;
        if let Some(mut session) = state.session.take() {
            let _panicked = isolate(session.logout()).await;
        }
        end
    }

    async fn session_loop(
        &mut self,
        info: &ConnectionInfo,
        state: &mut SessionState<B::Session>,
    ) -> Result<SessionEnd, Error> {
        loop {
            let handled = match self.command_phase(info, state).await? {
                Outcome::Closed => return Ok(SessionEnd::Closed),
                Outcome::UpgradeTls => return Ok(SessionEnd::UpgradeTls),
                Outcome::Message => self.handle_data(state).await?,
                Outcome::Chunked(args) => self.handle_bdat(state, args).await?,
                Outcome::Authenticate(args) => self.handle_auth(state, args).await?,
            };
            if let Some(end) = handled {
                return Ok(end);
            }
        }
    }

    /// Read command windows and dispatch until something other than a plain
    /// reply has to happen.
    async fn command_phase(
        &mut self,
        info: &ConnectionInfo,
        state: &mut SessionState<B::Session>,
    ) -> Result<Outcome, Error> {
        loop {
            let batch = match self.stream.next_batch().await {
                Ok(batch) if batch.is_empty() => {
                    tracing::debug!("Peer closed the connection.");
                    return Ok(Outcome::Closed);
                }
                Ok(batch) => batch,
                Err(e) => return self.close_for_read_error(e).await,
            };

            let mut pending = None;
            for (verb, args) in batch {
                let (reply, outcome) = self.dispatch(info, state, verb, args).await?;
                match (reply, outcome) {
                    (Some(reply), None) => self.sink.send_reply(reply, verb).await?,
                    (Some(reply), Some(outcome)) => {
                        self.sink.direct_send_reply(reply).await?;
                        pending = Some(outcome);
                        break;
                    }
                    (None, Some(outcome)) => {
                        pending = Some(outcome);
                        break;
                    }
                    (None, None) => {}
                }
            }
            self.sink.flush().await?;
            if let Some(outcome) = pending {
                return Ok(outcome);
            }
        }
    }

    /// Overlong lines and idle timeouts get a final reply; everything else
    /// closes silently.
    async fn close_for_read_error(&mut self, error: Error) -> Result<Outcome, Error> {
        match error {
            Error::LineTooLong { .. } => {
                let _best_effort = self.sink.direct_send_reply(line_too_long_reply()).await;
                Ok(Outcome::Closed)
            }
            Error::Timeout { .. } => {
                tracing::warn!(%error, "Closing after an idle period.");
                let _best_effort = self.sink.direct_send_reply(idle_timeout_reply()).await;
                Ok(Outcome::Closed)
            }
            other => Err(other),
        }
    }

    fn counted(&mut self, reply: Reply) -> (Option<Reply>, Option<Outcome>) {
        if self.error_counter.bump() {
            (
                Some(Reply::with_enhanced(
                    500,
                    EnhancedCode(5, 5, 1),
                    "Too many invalid commands, closing connection",
                )),
                Some(Outcome::Closed),
            )
        } else {
            (Some(reply), None)
        }
    }

    fn auth_allowed(&self, info: &ConnectionInfo) -> bool {
        info.tls || self.config.allow_insecure_auth
    }

    fn capability_reply(&self, info: &ConnectionInfo, state: &SessionState<B::Session>) -> Reply {
        let config = &*self.config;
        let ext = &config.extensions;
        let mut reply = Reply::new(250, config.domain.clone());

        reply.push_line("PIPELINING");
        reply.push_line("8BITMIME");
        reply.push_line("ENHANCEDSTATUSCODES");
        reply.push_line("CHUNKING");

        if config.tls.is_some() && !info.tls {
            reply.push_line("STARTTLS");
        }
        if self.auth_allowed(info) {
            if let Some(session) = &state.session {
                let mechanisms = session.auth_mechanisms();
                if !mechanisms.is_empty() {
                    let list = mechanisms
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(" ");
                    reply.push_line(format!("AUTH {list}"));
                }
            }
        }
        if ext.utf8 {
            reply.push_line("SMTPUTF8");
        }
        if ext.binary_mime {
            reply.push_line("BINARYMIME");
        }
        if ext.dsn {
            reply.push_line("DSN");
        }
        if ext.rrvs {
            reply.push_line("RRVS");
        }
        if ext.require_tls && info.tls {
            reply.push_line("REQUIRETLS");
        }
        if let Some(max) = config.rcpt_max {
            reply.push_line(format!("LIMITS RCPTMAX={max}"));
        }
        match config.message_size_max {
            Some(max) => reply.push_line(format!("SIZE {max}")),
            None => reply.push_line("SIZE"),
        }
        if let Some(policy) = ext.deliver_by {
            match policy.min_seconds {
                Some(min) => reply.push_line(format!("DELIVERBY {min}")),
                None => reply.push_line("DELIVERBY"),
            }
        }
        if let Some(profile) = ext.mt_priority {
            reply.push_line(format!("MT-PRIORITY {profile}"));
        }
        reply
    }

    /// Create the backend session at the first hello, reset it on a repeated
    /// one.
    async fn hello_session(
        &mut self,
        info: &ConnectionInfo,
        state: &mut SessionState<B::Session>,
    ) -> Result<(), Reply> {
        match state.session.as_mut() {
            Some(session) => {
                isolate(session.reset())
                    .await
                    .map_err(|()| backend_reply(internal_error()))?;
            }
            None => match isolate(self.backend.new_session(info)).await {
                Ok(Ok(session)) => state.session = Some(session),
                Ok(Err(refused)) => return Err(backend_reply(refused)),
                Err(()) => return Err(backend_reply(internal_error())),
            },
        }
        state.stage = Stage::Helo;
        state.transaction = None;
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    async fn dispatch(
        &mut self,
        info: &ConnectionInfo,
        state: &mut SessionState<B::Session>,
        verb: Verb,
        args: UnparsedArgs,
    ) -> Result<(Option<Reply>, Option<Outcome>), Error> {
        let kind = self.config.kind;
        let dispatched = match (verb, state.stage) {
            (Verb::Helo, _) => {
                if kind == ConnectionKind::Lmtp {
                    (Some(sequence_error("HELO is not allowed in LMTP, use LHLO")), None)
                } else {
                    match HeloArgs::try_from(args) {
                        Err(_e) => self.counted(syntax_error("Invalid HELO argument")),
                        Ok(helo) => match self.hello_session(info, state).await {
                            Err(reply) => (Some(reply), None),
                            Ok(()) => (
                                Some(Reply::new(
                                    250,
                                    format!("{} greets {}", self.config.domain, helo.client_name),
                                )),
                                None,
                            ),
                        },
                    }
                }
            }
            (Verb::Ehlo | Verb::Lhlo, _) => {
                let wrong_mode = match kind {
                    ConnectionKind::Smtp if verb == Verb::Lhlo => {
                        Some("LHLO is only allowed in LMTP")
                    }
                    ConnectionKind::Lmtp if verb == Verb::Ehlo => {
                        Some("EHLO is not allowed in LMTP, use LHLO")
                    }
                    _ => None,
                };
                if let Some(text) = wrong_mode {
                    (Some(sequence_error(text)), None)
                } else {
                    match EhloArgs::try_from(args) {
                        Err(_e) => self.counted(syntax_error("Invalid hello argument")),
                        Ok(_ehlo) => match self.hello_session(info, state).await {
                            Err(reply) => (Some(reply), None),
                            Ok(()) => (Some(self.capability_reply(info, state)), None),
                        },
                    }
                }
            }
            (Verb::Noop, _) => (Some(ok_reply()), None),
            (Verb::Vrfy, Stage::Connect) => {
                (Some(sequence_error("Please introduce yourself first")), None)
            }
            (Verb::Vrfy, _) => (
                Some(Reply::with_enhanced(
                    252,
                    EnhancedCode(2, 0, 0),
                    "Cannot VRFY user, but will accept message and attempt delivery",
                )),
                None,
            ),
            (Verb::Rset, Stage::Connect) => {
                (Some(sequence_error("Please introduce yourself first")), None)
            }
            (Verb::Rset, _) => {
                if let Some(session) = state.session.as_mut() {
                    if isolate(session.reset()).await.is_err() {
                        return Ok((Some(backend_reply(internal_error())), Some(Outcome::Closed)));
                    }
                }
                state.transaction = None;
                state.stage = Stage::Helo;
                (Some(ok_reply()), None)
            }
            (Verb::Quit, _) => (
                Some(Reply::with_enhanced(
                    221,
                    EnhancedCode(2, 0, 0),
                    "Service closing transmission channel",
                )),
                Some(Outcome::Closed),
            ),
            (Verb::Unsupported, _) => (Some(sequence_error("Command not implemented")), None),
            (Verb::Unknown, _) => self.counted(Reply::with_enhanced(
                500,
                EnhancedCode(5, 5, 2),
                "Syntax error, command unrecognized",
            )),
            (Verb::StartTls, Stage::Connect) => {
                (Some(sequence_error("Please introduce yourself first")), None)
            }
            (Verb::StartTls, Stage::Helo) => {
                if info.tls {
                    (Some(sequence_error("TLS is already active")), None)
                } else if self.config.tls.is_none() {
                    (Some(sequence_error("TLS is not available")), None)
                } else {
                    (
                        Some(Reply::with_enhanced(
                            220,
                            EnhancedCode(2, 0, 0),
                            "Ready to start TLS",
                        )),
                        Some(Outcome::UpgradeTls),
                    )
                }
            }
            (Verb::Auth, Stage::Helo) => {
                if state.authenticated {
                    (
                        Some(Reply::with_enhanced(503, EnhancedCode(5, 5, 1), "Already authenticated")),
                        None,
                    )
                } else if !self.auth_allowed(info) {
                    (
                        Some(Reply::with_enhanced(
                            523,
                            EnhancedCode(5, 7, 10),
                            "Encryption required for requested authentication mechanism",
                        )),
                        None,
                    )
                } else {
                    match AuthArgs::try_from(args) {
                        Err(_e) => self.counted(syntax_error("Invalid AUTH argument")),
                        Ok(auth) => (None, Some(Outcome::Authenticate(auth))),
                    }
                }
            }
            (Verb::Auth, _) => {
                let text = if state.stage == Stage::Connect {
                    "Please introduce yourself first"
                } else {
                    "AUTH is not permitted during a mail transaction"
                };
                (Some(sequence_error(text)), None)
            }
            (Verb::Mail, Stage::Helo) => self.handle_mail(info, state, args).await,
            (Verb::Mail, Stage::Connect) => {
                (Some(sequence_error("Please introduce yourself first")), None)
            }
            (Verb::Mail, _) => (Some(sequence_error("Nested MAIL command")), None),
            (Verb::Rcpt, Stage::MailFrom | Stage::RcptTo) => {
                self.handle_rcpt(state, args).await
            }
            (Verb::Rcpt, _) => (Some(sequence_error("Missing MAIL FROM command")), None),
            (Verb::Data, Stage::RcptTo) => {
                let binary = state
                    .transaction
                    .as_ref()
                    .is_some_and(|txn| txn.options.body == Some(BodyType::BinaryMime));
                if binary {
                    (
                        Some(sequence_error("DATA is not allowed with BODY=BINARYMIME, use BDAT")),
                        None,
                    )
                } else {
                    (
                        Some(Reply::new(354, "Start mail input; end with <CRLF>.<CRLF>")),
                        Some(Outcome::Message),
                    )
                }
            }
            (Verb::Data, Stage::MailFrom) => {
                (Some(sequence_error("Missing RCPT TO command")), None)
            }
            (Verb::Data, _) => (Some(sequence_error("Missing MAIL FROM command")), None),
            (Verb::Bdat, Stage::RcptTo) => match BdatArgs::try_from(args) {
                Err(_e) => self.counted(syntax_error("Invalid BDAT argument")),
                Ok(bdat) => (None, Some(Outcome::Chunked(bdat))),
            },
            (Verb::Bdat, Stage::MailFrom) => {
                (Some(sequence_error("Missing RCPT TO command")), None)
            }
            (Verb::Bdat, _) => (Some(sequence_error("Missing MAIL FROM command")), None),
            (Verb::StartTls, _) => {
                (Some(sequence_error("STARTTLS is not permitted during a mail transaction")), None)
            }
        };
        Ok(dispatched)
    }

    async fn handle_mail(
        &mut self,
        info: &ConnectionInfo,
        state: &mut SessionState<B::Session>,
        args: UnparsedArgs,
    ) -> (Option<Reply>, Option<Outcome>) {
        let parsed = match MailFromArgs::try_from(args) {
            Ok(parsed) => parsed,
            Err(ParseArgsError::InvalidMailAddress { mail }) => {
                return (
                    Some(Reply::with_enhanced(
                        553,
                        EnhancedCode(5, 1, 7),
                        format!("The address {mail:?} is not a valid RFC 5321 address"),
                    )),
                    None,
                )
            }
            Err(_e) => return self.counted(syntax_error("Invalid MAIL FROM argument")),
        };

        let ext = &self.config.extensions;
        if let Some(keyword) = parsed.unknown.first() {
            return (Some(unsupported_parameter(keyword)), None);
        }
        if parsed.options.utf8 && !ext.utf8 {
            return (Some(unsupported_parameter("SMTPUTF8")), None);
        }
        if parsed.options.require_tls && !(ext.require_tls && info.tls) {
            return (Some(unsupported_parameter("REQUIRETLS")), None);
        }
        if parsed.options.body == Some(BodyType::BinaryMime) && !ext.binary_mime {
            return (Some(unsupported_parameter("BODY=BINARYMIME")), None);
        }
        if (parsed.options.ret.is_some() || parsed.options.envelope_id.is_some()) && !ext.dsn {
            return (Some(unsupported_parameter("RET")), None);
        }
        if parsed.options.auth.is_some() && !self.auth_allowed(info) {
            return (Some(unsupported_parameter("AUTH")), None);
        }
        if let (Some(declared), Some(max)) = (parsed.options.size, self.config.message_size_max) {
            if declared > max {
                return (Some(size_exceeded_reply()), None);
            }
        }
        if !parsed.options.utf8
            && parsed
                .reverse_path
                .mailbox()
                .is_some_and(Address::needs_smtputf8)
        {
            return (
                Some(Reply::with_enhanced(
                    553,
                    EnhancedCode(5, 6, 7),
                    "International mailbox name requires the SMTPUTF8 extension",
                )),
                None,
            );
        }

        #[allow(clippy::expect_used)]
        let session = state.session.as_mut().expect("hello created the session");
        match isolate(session.mail(&parsed.reverse_path, &parsed.options)).await {
            Err(()) => (Some(backend_reply(internal_error())), Some(Outcome::Closed)),
            Ok(Err(refused)) => (Some(backend_reply(refused)), None),
            Ok(Ok(())) => {
                state.transaction = Some(Transaction {
                    options: parsed.options,
                    recipients: vec![],
                });
                state.stage = Stage::MailFrom;
                (Some(ok_reply()), None)
            }
        }
    }

    async fn handle_rcpt(
        &mut self,
        state: &mut SessionState<B::Session>,
        args: UnparsedArgs,
    ) -> (Option<Reply>, Option<Outcome>) {
        #[allow(clippy::expect_used)]
        let transaction = state.transaction.as_mut().expect("MAIL opened the transaction");

        if let Some(max) = self.config.rcpt_max {
            if transaction.recipients.len() >= max {
                return (
                    Some(Reply::with_enhanced(
                        452,
                        EnhancedCode(4, 5, 3),
                        "Too many recipients",
                    )),
                    None,
                );
            }
        }

        let parsed = match RcptToArgs::try_from(args) {
            Ok(parsed) => parsed,
            Err(ParseArgsError::InvalidMailAddress { mail }) => {
                return (
                    Some(Reply::with_enhanced(
                        553,
                        EnhancedCode(5, 1, 7),
                        format!("The address {mail:?} is not a valid RFC 5321 address"),
                    )),
                    None,
                )
            }
            Err(_e) => return self.counted(syntax_error("Invalid RCPT TO argument")),
        };

        let ext = &self.config.extensions;
        if let Some(keyword) = parsed.unknown.first() {
            return (Some(unsupported_parameter(keyword)), None);
        }
        if (parsed.options.notify.is_some() || parsed.options.orcpt.is_some()) && !ext.dsn {
            return (Some(unsupported_parameter("NOTIFY")), None);
        }
        if parsed.options.rrvs.is_some() && !ext.rrvs {
            return (Some(unsupported_parameter("RRVS")), None);
        }
        if parsed.options.by.is_some() && ext.deliver_by.is_none() {
            return (Some(unsupported_parameter("BY")), None);
        }
        if parsed.options.mt_priority.is_some() && ext.mt_priority.is_none() {
            return (Some(unsupported_parameter("MT-PRIORITY")), None);
        }
        if parsed.forward_path.needs_smtputf8() && !transaction.options.utf8 {
            return (
                Some(Reply::with_enhanced(
                    553,
                    EnhancedCode(5, 6, 7),
                    "International mailbox name requires the SMTPUTF8 extension",
                )),
                None,
            );
        }

        #[allow(clippy::expect_used)]
        let session = state.session.as_mut().expect("hello created the session");
        match isolate(session.rcpt(&parsed.forward_path, &parsed.options)).await {
            Err(()) => (Some(backend_reply(internal_error())), Some(Outcome::Closed)),
            Ok(Err(refused)) => (Some(backend_reply(refused)), None),
            Ok(Ok(())) => {
                // order and duplicates are preserved: LMTP replies one
                // status per occurrence
                #[allow(clippy::expect_used)]
                state
                    .transaction
                    .as_mut()
                    .expect("checked above")
                    .recipients
                    .push(parsed.forward_path);
                state.stage = Stage::RcptTo;
                (Some(ok_reply()), None)
            }
        }
    }

    /// The base64 challenge/response loop of RFC 4954.
    async fn handle_auth(
        &mut self,
        state: &mut SessionState<B::Session>,
        args: AuthArgs,
    ) -> Result<Option<SessionEnd>, Error> {
        #[allow(clippy::expect_used)]
        let session = state.session.as_mut().expect("hello created the session");

        let mut sasl = match isolate_sync(|| session.auth(&args.mechanism)) {
            Err(()) => {
                self.sink.direct_send_reply(backend_reply(internal_error())).await?;
                return Ok(Some(SessionEnd::Closed));
            }
            Ok(Err(refused)) => {
                self.sink.direct_send_reply(backend_reply(refused)).await?;
                return Ok(None);
            }
            Ok(Ok(sasl)) => sasl,
        };

        let mut response = match args.initial_response.as_deref() {
            None => None,
            Some(b"=") => Some(vec![]),
            Some(encoded) => match BASE64.decode(encoded) {
                Ok(decoded) => Some(decoded),
                Err(_e) => {
                    self.sink
                        .direct_send_reply(syntax_error("Invalid base64 in the initial response"))
                        .await?;
                    return Ok(None);
                }
            },
        };

        loop {
            let step = match isolate_sync(|| sasl.next(response.as_deref())) {
                Err(()) => {
                    self.sink.direct_send_reply(backend_reply(internal_error())).await?;
                    return Ok(Some(SessionEnd::Closed));
                }
                Ok(Err(refused)) => {
                    self.sink.direct_send_reply(backend_reply(refused)).await?;
                    return Ok(None);
                }
                Ok(Ok(step)) => step,
            };

            match step {
                SaslStep::Done => {
                    state.authenticated = true;
                    self.sink
                        .direct_send_reply(Reply::with_enhanced(
                            235,
                            EnhancedCode(2, 7, 0),
                            "Authentication succeeded",
                        ))
                        .await?;
                    return Ok(None);
                }
                SaslStep::Challenge(challenge) => {
                    self.sink
                        .direct_send_reply(Reply::new(334, BASE64.encode(challenge)))
                        .await?;

                    let line = match self.stream.next_line().await {
                        Ok(Some(line)) => line,
                        Ok(None) => return Ok(Some(SessionEnd::Closed)),
                        Err(e) => {
                            return match self.close_for_read_error(e).await? {
                                Outcome::Closed => Ok(Some(SessionEnd::Closed)),
                                _ => unreachable!("read errors always close"),
                            }
                        }
                    };
                    let line = line.strip_suffix(b"\r\n").unwrap_or(&line);

                    if line == b"*" {
                        self.sink
                            .direct_send_reply(Reply::with_enhanced(
                                501,
                                EnhancedCode(5, 0, 0),
                                "Authentication cancelled",
                            ))
                            .await?;
                        return Ok(None);
                    }
                    match BASE64.decode(line) {
                        Ok(decoded) => response = Some(decoded),
                        Err(_e) => {
                            self.sink
                                .direct_send_reply(syntax_error("Invalid base64 response"))
                                .await?;
                            return Ok(None);
                        }
                    }
                }
            }
        }
    }

    /// DATA: 354 was already sent; stream the dot-stuffed body to the
    /// session, drain the wire, reply.
    async fn handle_data(
        &mut self,
        state: &mut SessionState<B::Session>,
    ) -> Result<Option<SessionEnd>, Error> {
        #[allow(clippy::expect_used)]
        let transaction = state.transaction.take().expect("DATA only after RCPT");
        #[allow(clippy::expect_used)]
        let session = state.session.as_mut().expect("hello created the session");

        let finished = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let size_max = self.config.message_size_max;
        let kind = self.config.kind;
        let Self { stream, sink, .. } = self;

        let end = match kind {
            ConnectionKind::Smtp => {
                let outcome = {
                    let body = stream.as_message_stream(size_max, finished.clone());
                    tokio::pin!(body);
                    isolate(session.data(body)).await
                };
                match outcome {
                    Err(()) => {
                        sink.direct_send_reply(backend_reply(internal_error())).await?;
                        return Ok(Some(SessionEnd::Closed));
                    }
                    Ok(Ok(())) => {
                        Self::settle_body(stream, sink, &finished).await?;
                        sink.direct_send_reply(queued_reply()).await?;
                        None
                    }
                    Ok(Err(refused)) => {
                        Self::settle_body(stream, sink, &finished).await?;
                        sink.direct_send_reply(backend_reply(refused)).await?;
                        None
                    }
                }
            }
            ConnectionKind::Lmtp => {
                let (mut collector, slots) = StatusCollector::new(&transaction.recipients);
                let backend_side = async {
                    let body = stream.as_message_stream(size_max, finished.clone());
                    tokio::pin!(body);
                    match isolate(session.data_lmtp(body, &mut collector)).await {
                        Ok(Ok(())) => {
                            collector.fill_remaining(&Ok(()));
                            false
                        }
                        Ok(Err(refused)) => {
                            collector.fill_remaining(&Err(refused));
                            false
                        }
                        Err(()) => {
                            collector.fill_remaining(&Err(internal_error()));
                            true
                        }
                    }
                };
                let (panicked, emitted) = tokio::join!(backend_side, emit_statuses(sink, slots));
                emitted?;
                Self::settle_body(stream, sink, &finished).await?;
                panicked.then_some(SessionEnd::Closed)
            }
        };

        if end.is_some() {
            return Ok(end);
        }
        state.stage = Stage::Helo;
        Ok(None)
    }

    /// Consume whatever of the body is still on the wire once the backend
    /// has returned.
    async fn settle_body(
        stream: &mut Reader<R>,
        sink: &mut WindowWriter<W>,
        finished: &std::sync::Arc<std::sync::atomic::AtomicBool>,
    ) -> Result<(), Error> {
        if finished.load(std::sync::atomic::Ordering::Acquire) {
            return Ok(());
        }
        match stream.drain_message().await {
            Ok(()) => Ok(()),
            Err(e @ Error::LineTooLong { .. }) => {
                let _best_effort = sink.direct_send_reply(line_too_long_reply()).await;
                Err(e)
            }
            Err(e @ Error::Timeout { .. }) => {
                let _best_effort = sink.direct_send_reply(idle_timeout_reply()).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// BDAT: feed chunk payloads into a bounded pipe consumed by the
    /// session, interleaving protocol replies, until LAST, RSET or QUIT.
    async fn handle_bdat(
        &mut self,
        state: &mut SessionState<B::Session>,
        first: BdatArgs,
    ) -> Result<Option<SessionEnd>, Error> {
        #[allow(clippy::expect_used)]
        let transaction = state.transaction.take().expect("BDAT only after RCPT");
        #[allow(clippy::expect_used)]
        let session = state.session.as_mut().expect("hello created the session");

        let size_max = self.config.message_size_max;
        let kind = self.config.kind;
        let Self { stream, sink, .. } = self;

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Vec<u8>, Error>>(8);
        let body = tokio_stream::wrappers::ReceiverStream::new(rx);

        let (collector, slots) = match kind {
            ConnectionKind::Lmtp => {
                let (collector, slots) = StatusCollector::new(&transaction.recipients);
                (Some(collector), Some(slots))
            }
            ConnectionKind::Smtp => (None, None),
        };

        let backend_side = async {
            match kind {
                ConnectionKind::Smtp => match isolate(session.data(body)).await {
                    Ok(result) => (result, false),
                    Err(()) => (Err(internal_error()), true),
                },
                ConnectionKind::Lmtp => {
                    #[allow(clippy::expect_used)]
                    let mut collector = collector.expect("built for LMTP above");
                    match isolate(session.data_lmtp(body, &mut collector)).await {
                        Ok(Ok(())) => {
                            collector.fill_remaining(&Ok(()));
                            (Ok(()), false)
                        }
                        Ok(Err(refused)) => {
                            collector.fill_remaining(&Err(refused.clone()));
                            (Err(refused), false)
                        }
                        Err(()) => {
                            collector.fill_remaining(&Err(internal_error()));
                            (Err(internal_error()), true)
                        }
                    }
                }
            }
        };

        let wire_side = async {
            let end = feed_chunks(stream, sink, tx, first, size_max).await?;
            if matches!(end, FeedEnd::Last { .. }) {
                if let Some(slots) = slots {
                    emit_statuses(sink, slots).await?;
                }
            }
            Ok::<FeedEnd, Error>(end)
        };

        let (wire_end, (backend_result, panicked)) = tokio::join!(wire_side, backend_side);

        match wire_end? {
            FeedEnd::Last { oversized } => {
                if panicked {
                    if kind == ConnectionKind::Smtp {
                        sink.direct_send_reply(backend_reply(internal_error())).await?;
                    }
                    return Ok(Some(SessionEnd::Closed));
                }
                if kind == ConnectionKind::Smtp {
                    // the per-recipient replies already went out in LMTP
                    let reply = match (oversized, backend_result) {
                        (Some(oversized), _) => oversized,
                        (None, Ok(())) => queued_reply(),
                        (None, Err(refused)) => backend_reply(refused),
                    };
                    sink.direct_send_reply(reply).await?;
                }
                state.stage = Stage::Helo;
                Ok(None)
            }
            FeedEnd::Reset => {
                if let Some(session) = state.session.as_mut() {
                    if isolate(session.reset()).await.is_err() {
                        sink.direct_send_reply(backend_reply(internal_error())).await?;
                        return Ok(Some(SessionEnd::Closed));
                    }
                }
                sink.direct_send_reply(Reply::with_enhanced(
                    250,
                    EnhancedCode(2, 0, 0),
                    "Session reset",
                ))
                .await?;
                state.stage = Stage::Helo;
                Ok(None)
            }
            FeedEnd::Quit => {
                sink.direct_send_reply(Reply::with_enhanced(
                    221,
                    EnhancedCode(2, 0, 0),
                    "Service closing transmission channel",
                ))
                .await?;
                Ok(Some(SessionEnd::Closed))
            }
            FeedEnd::Dead(error) => {
                match &error {
                    Error::LineTooLong { .. } => {
                        let _best_effort = sink.direct_send_reply(line_too_long_reply()).await;
                    }
                    Error::Timeout { .. } => {
                        let _best_effort = sink.direct_send_reply(idle_timeout_reply()).await;
                    }
                    _other => return Err(error),
                }
                Ok(Some(SessionEnd::Closed))
            }
        }
    }
}

/// Emit one reply per recipient occurrence, in wire order, as the slots
/// resolve.
async fn emit_statuses<W: tokio::io::AsyncWrite + Unpin + Send>(
    sink: &mut WindowWriter<W>,
    slots: StatusSlots,
) -> Result<(), Error> {
    for (rcpt, slot) in slots.slots {
        let status = slot.await.unwrap_or_else(|_recv| Err(internal_error()));
        let reply = match status {
            Ok(()) => Reply::with_enhanced(
                250,
                EnhancedCode(2, 0, 0),
                format!("<{rcpt}> Ok: queued"),
            ),
            Err(refused) => {
                let text = format!("<{rcpt}> {}", refused.message);
                match refused.enhanced {
                    Some(enhanced) => Reply::with_enhanced(refused.code, enhanced, text),
                    None => Reply::new(refused.code, text).or_enhanced_default(),
                }
            }
        };
        sink.direct_send_reply(reply).await?;
    }
    Ok(())
}

/// Copy BDAT payloads from the wire into the session's pipe, replying per
/// chunk and fielding the few commands that are legal mid-transfer.
async fn feed_chunks<R, W>(
    stream: &mut Reader<R>,
    sink: &mut WindowWriter<W>,
    tx: tokio::sync::mpsc::Sender<Result<Vec<u8>, Error>>,
    first: BdatArgs,
    size_max: Option<usize>,
) -> Result<FeedEnd, Error>
where
    R: tokio::io::AsyncRead + Unpin + Send,
    W: tokio::io::AsyncWrite + Unpin + Send,
{
    use tokio_stream::StreamExt;

    let mut args = first;
    let mut received: u64 = 0;
    let mut oversized: Option<Reply> = None;

    loop {
        let over_limit = oversized.is_none()
            && size_max.is_some_and(|max| received.saturating_add(args.size) > max as u64);

        if over_limit {
            // the size check runs against the accumulated count at the
            // start of the chunk; the crossing chunk is dropped whole and
            // the connection stays usable so the client can RSET
            if let Err(e) = stream.discard_chunk(args.size).await {
                let _closed = tx
                    .send(Err(Error::aborted("transfer failed mid-chunk")))
                    .await;
                return Ok(FeedEnd::Dead(e));
            }
            let limit = size_max.unwrap_or_default();
            let _closed = tx.send(Err(Error::MessageSizeExceeded { limit })).await;
            oversized = Some(size_exceeded_reply());
        } else if oversized.is_none() {
            let chunk = stream.as_chunk_stream(args.size);
            tokio::pin!(chunk);
            while let Some(block) = chunk.next().await {
                match block {
                    Ok(block) => {
                        received += block.len() as u64;
                        // a closed pipe means the session already gave up;
                        // keep consuming so the wire stays framed
                        let _closed = tx.send(Ok(block)).await;
                    }
                    Err(e) => {
                        let _closed = tx
                            .send(Err(Error::aborted("transfer failed mid-chunk")))
                            .await;
                        return Ok(FeedEnd::Dead(e));
                    }
                }
            }
        } else if let Err(e) = stream.discard_chunk(args.size).await {
            return Ok(FeedEnd::Dead(e));
        }

        if args.last {
            drop(tx);
            return Ok(FeedEnd::Last { oversized });
        }

        let chunk_reply = oversized.clone().unwrap_or_else(|| {
            Reply::with_enhanced(250, EnhancedCode(2, 0, 0), format!("{} bytes received", args.size))
        });
        sink.direct_send_reply(chunk_reply).await?;

        // only BDAT, RSET, QUIT and NOOP are meaningful here
        loop {
            let line = match stream.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    let _closed = tx.send(Err(Error::aborted("connection closed"))).await;
                    return Ok(FeedEnd::Dead(Error::UnexpectedEof));
                }
                Err(e) => {
                    let _closed = tx.send(Err(Error::aborted("transfer failed"))).await;
                    return Ok(FeedEnd::Dead(e));
                }
            };
            tracing::trace!("<< {:?}", std::str::from_utf8(&line));
            let (verb, vargs) = parse_command_line(line);
            match verb {
                Verb::Bdat => match BdatArgs::try_from(vargs) {
                    Ok(next) => {
                        args = next;
                        break;
                    }
                    Err(_e) => {
                        sink.direct_send_reply(syntax_error("Invalid BDAT argument")).await?;
                    }
                },
                Verb::Rset => {
                    let _closed = tx
                        .send(Err(Error::aborted("transfer aborted by RSET")))
                        .await;
                    return Ok(FeedEnd::Reset);
                }
                Verb::Quit => {
                    let _closed = tx
                        .send(Err(Error::aborted("transfer aborted by QUIT")))
                        .await;
                    return Ok(FeedEnd::Quit);
                }
                Verb::Noop => sink.direct_send_reply(ok_reply()).await?,
                Verb::Mail | Verb::Rcpt | Verb::Data => {
                    sink.direct_send_reply(sequence_error(
                        "Only BDAT is allowed during a chunked transfer",
                    ))
                    .await?;
                }
                _ => {
                    sink.direct_send_reply(Reply::with_enhanced(
                        500,
                        EnhancedCode(5, 5, 2),
                        "Syntax error, command unrecognized",
                    ))
                    .await?;
                }
            }
        }
    }
}
