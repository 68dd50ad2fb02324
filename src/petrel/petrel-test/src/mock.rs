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

//! A backend for the protocol tests. Behavior is keyed on the local part of
//! the addresses in play:
//!
//! * sender `spammer@...`: MAIL is refused with `554 5.7.1`
//! * recipient `deny@...`: RCPT is refused with `550 5.1.1`
//! * recipient `unlucky@...`: accepted, but LMTP delivery reports
//!   `554 5.0.0` for it
//! * recipient `boom@...`: the body callback panics mid-delivery
//!
//! Everything accepted is recorded in the shared journal.

use petrel_common::{
    auth::Mechanism,
    options::{MailOptions, RcptOptions},
    Address, EnhancedCode, ReversePath, SmtpError,
};
use petrel_protocol::{
    Backend, ConnectionInfo, Error, SaslServer, SaslStep, Session, StatusCollector,
};

/// One fully received message.
#[derive(Debug, Clone)]
pub struct RecordedMessage {
    /// Envelope sender.
    pub from: ReversePath,
    /// MAIL parameters as parsed.
    pub mail_options: MailOptions,
    /// Recipients in wire order, with their parameters.
    pub recipients: Vec<(Address, RcptOptions)>,
    /// Raw body bytes as the backend saw them.
    pub body: Vec<u8>,
}

/// Everything the mock observed, shared with the test body.
pub type Journal = std::sync::Arc<std::sync::Mutex<Vec<RecordedMessage>>>;

/// The test backend.
#[derive(Default)]
pub struct MockBackend {
    /// Accepted messages.
    pub journal: Journal,
    /// Mechanisms to advertise; empty disables AUTH.
    pub mechanisms: Vec<Mechanism>,
    /// The one PLAIN identity that authenticates, as `(login, password)`.
    pub credentials: Option<(String, String)>,
}

impl MockBackend {
    /// A backend advertising `AUTH PLAIN` for the given identity.
    #[must_use]
    pub fn with_credentials(login: &str, password: &str) -> Self {
        Self {
            mechanisms: vec![Mechanism::Plain],
            credentials: Some((login.to_owned(), password.to_owned())),
            ..Self::default()
        }
    }
}

#[async_trait::async_trait]
impl Backend for MockBackend {
    type Session = MockSession;

    async fn new_session(&self, _connection: &ConnectionInfo) -> Result<MockSession, SmtpError> {
        Ok(MockSession {
            journal: self.journal.clone(),
            mechanisms: self.mechanisms.clone(),
            credentials: self.credentials.clone(),
            envelope: None,
        })
    }
}

struct Envelope {
    from: ReversePath,
    mail_options: MailOptions,
    recipients: Vec<(Address, RcptOptions)>,
}

/// Per-connection state of the mock.
pub struct MockSession {
    journal: Journal,
    mechanisms: Vec<Mechanism>,
    credentials: Option<(String, String)>,
    envelope: Option<Envelope>,
}

/// PLAIN validation against the mock's single identity.
struct PlainServer {
    expected: (String, String),
}

impl SaslServer for PlainServer {
    fn next(&mut self, response: Option<&[u8]>) -> Result<SaslStep, SmtpError> {
        let Some(response) = response else {
            return Ok(SaslStep::Challenge(vec![]));
        };
        let mut parts = response.split(|b| *b == 0);
        let (_authzid, authcid, password) = (parts.next(), parts.next(), parts.next());
        let matches = authcid == Some(self.expected.0.as_bytes())
            && password == Some(self.expected.1.as_bytes());
        if matches {
            Ok(SaslStep::Done)
        } else {
            Err(SmtpError::with_enhanced(
                535,
                EnhancedCode(5, 7, 8),
                "Authentication credentials invalid",
            ))
        }
    }
}

impl MockSession {
    async fn consume<S>(&mut self, mut body: S) -> Result<Vec<u8>, SmtpError>
    where
        S: tokio_stream::Stream<Item = Result<Vec<u8>, Error>> + Send + Unpin,
    {
        use tokio_stream::StreamExt;

        let mut bytes = vec![];
        while let Some(fragment) = body.next().await {
            match fragment {
                Ok(fragment) => bytes.extend(fragment),
                Err(e) => return Err(e.to_smtp_error()),
            }
        }
        Ok(bytes)
    }

    fn record(&mut self, body: Vec<u8>) {
        let envelope = self.envelope.take().expect("DATA comes after MAIL and RCPT");
        if envelope
            .recipients
            .iter()
            .any(|(rcpt, _)| rcpt.local_part() == "boom")
        {
            panic!("injected backend failure");
        }
        self.journal.lock().expect("journal poisoned").push(RecordedMessage {
            from: envelope.from,
            mail_options: envelope.mail_options,
            recipients: envelope.recipients,
            body,
        });
    }
}

#[async_trait::async_trait]
impl Session for MockSession {
    fn auth_mechanisms(&self) -> Vec<Mechanism> {
        self.mechanisms.clone()
    }

    fn auth(&mut self, mechanism: &Mechanism) -> Result<Box<dyn SaslServer>, SmtpError> {
        match (mechanism, &self.credentials) {
            (Mechanism::Plain, Some(expected)) => Ok(Box::new(PlainServer {
                expected: expected.clone(),
            })),
            _ => Err(SmtpError::with_enhanced(
                504,
                EnhancedCode(5, 5, 4),
                format!("Mechanism {mechanism} is not supported"),
            )),
        }
    }

    async fn mail(&mut self, from: &ReversePath, opts: &MailOptions) -> Result<(), SmtpError> {
        if from.mailbox().is_some_and(|mailbox| mailbox.local_part() == "spammer") {
            return Err(SmtpError::with_enhanced(
                554,
                EnhancedCode(5, 7, 1),
                "Sender refused",
            ));
        }
        self.envelope = Some(Envelope {
            from: from.clone(),
            mail_options: opts.clone(),
            recipients: vec![],
        });
        Ok(())
    }

    async fn rcpt(&mut self, to: &Address, opts: &RcptOptions) -> Result<(), SmtpError> {
        if to.local_part() == "deny" {
            return Err(SmtpError::with_enhanced(
                550,
                EnhancedCode(5, 1, 1),
                "Mailbox unavailable",
            ));
        }
        self.envelope
            .as_mut()
            .expect("RCPT comes after MAIL")
            .recipients
            .push((to.clone(), opts.clone()));
        Ok(())
    }

    async fn data<S>(&mut self, body: S) -> Result<(), SmtpError>
    where
        S: tokio_stream::Stream<Item = Result<Vec<u8>, Error>> + Send + Unpin,
    {
        let bytes = self.consume(body).await?;
        self.record(bytes);
        Ok(())
    }

    async fn data_lmtp<S>(
        &mut self,
        body: S,
        status: &mut StatusCollector,
    ) -> Result<(), SmtpError>
    where
        S: tokio_stream::Stream<Item = Result<Vec<u8>, Error>> + Send + Unpin,
    {
        let bytes = self.consume(body).await?;
        let recipients = self
            .envelope
            .as_ref()
            .expect("DATA comes after MAIL and RCPT")
            .recipients
            .iter()
            .map(|(rcpt, _)| rcpt.clone())
            .collect::<Vec<_>>();
        // a panicking delivery must leave the statuses to fill_remaining
        if recipients.iter().any(|rcpt| rcpt.local_part() == "boom") {
            panic!("injected backend failure");
        }
        for rcpt in recipients {
            if rcpt.local_part() == "unlucky" {
                status.set_status(
                    &rcpt,
                    Err(SmtpError::with_enhanced(
                        554,
                        EnhancedCode(5, 0, 0),
                        "Delivery failed",
                    )),
                );
            } else {
                status.set_status(&rcpt, Ok(()));
            }
        }
        self.record(bytes);
        Ok(())
    }

    async fn reset(&mut self) {
        self.envelope = None;
    }

    async fn logout(&mut self) {}
}
