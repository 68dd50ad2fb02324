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

use super::{read_reply, write_line};
use crate::config::{capabilities, greeting, lmtp_greeting, lmtp_test};
use crate::{bind_random_port, run_test};
use petrel_common::{
    options::{MailOptions, RcptOptions},
    Address, ReversePath, SmtpError,
};
use petrel_protocol::{Backend, ConnectionInfo, Error, Session};

run_test! {
    fn lhlo_is_mandatory_in_lmtp,
    input = [
        "EHLO client.example.org\r\n",
        "HELO client.example.org\r\n",
        "LHLO client.example.org\r\n",
        "QUIT\r\n",
    ],
    expected = [
        lmtp_greeting(),
        "502 5.5.1 EHLO is not allowed in LMTP, use LHLO\r\n",
        "502 5.5.1 HELO is not allowed in LMTP, use LHLO\r\n",
        capabilities(),
        "221 2.0.0 Service closing transmission channel\r\n",
    ],
    config = lmtp_test(),
}

run_test! {
    fn lhlo_is_refused_in_smtp,
    input = [
        "LHLO client.example.org\r\n",
        "QUIT\r\n",
    ],
    expected = [
        greeting(),
        "502 5.5.1 LHLO is only allowed in LMTP\r\n",
        "221 2.0.0 Service closing transmission channel\r\n",
    ],
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn one_reply_per_recipient_in_order() {
    let backend = run_test! {
        input = [
            "LHLO client.example.org\r\n",
            "MAIL FROM:<s@x>\r\n",
            "RCPT TO:<unlucky@x>\r\n",
            "RCPT TO:<b@x>\r\n",
            "DATA\r\n",
            "Hello\r\n.\r\n",
            "",
            "QUIT\r\n",
        ],
        expected = [
            lmtp_greeting(),
            capabilities(),
            "250 2.0.0 Ok\r\n",
            "250 2.0.0 Ok\r\n",
            "250 2.0.0 Ok\r\n",
            "354 Start mail input; end with <CRLF>.<CRLF>\r\n",
            "554 5.0.0 <unlucky@x> Delivery failed\r\n",
            "250 2.0.0 <b@x> Ok: queued\r\n",
            "221 2.0.0 Service closing transmission channel\r\n",
        ],
        config = lmtp_test(),
    };

    // partial failure still records the message once
    let journal = backend.journal.lock().unwrap();
    assert_eq!(journal.len(), 1);
    assert_eq!(journal[0].body, b"Hello\r\n");
}

run_test! {
    fn duplicate_recipients_get_one_reply_each,
    input = [
        "LHLO client.example.org\r\n",
        "MAIL FROM:<s@x>\r\n",
        "RCPT TO:<b@x>\r\n",
        "RCPT TO:<b@x>\r\n",
        "DATA\r\n",
        "Hello\r\n.\r\n",
        "",
        "QUIT\r\n",
    ],
    expected = [
        lmtp_greeting(),
        capabilities(),
        "250 2.0.0 Ok\r\n",
        "250 2.0.0 Ok\r\n",
        "250 2.0.0 Ok\r\n",
        "354 Start mail input; end with <CRLF>.<CRLF>\r\n",
        "250 2.0.0 <b@x> Ok: queued\r\n",
        "250 2.0.0 <b@x> Ok: queued\r\n",
        "221 2.0.0 Service closing transmission channel\r\n",
    ],
    config = lmtp_test(),
}

run_test! {
    fn chunked_lmtp_replies_per_recipient,
    input = [
        "LHLO client.example.org\r\n",
        "MAIL FROM:<s@x>\r\n",
        "RCPT TO:<unlucky@x>\r\n",
        "RCPT TO:<b@x>\r\n",
        "BDAT 5 LAST\r\nHello",
        "",
        "QUIT\r\n",
    ],
    expected = [
        lmtp_greeting(),
        capabilities(),
        "250 2.0.0 Ok\r\n",
        "250 2.0.0 Ok\r\n",
        "250 2.0.0 Ok\r\n",
        "554 5.0.0 <unlucky@x> Delivery failed\r\n",
        "250 2.0.0 <b@x> Ok: queued\r\n",
        "221 2.0.0 Service closing transmission channel\r\n",
    ],
    config = lmtp_test(),
}

/// A backend that only speaks the basic interface: no `data_lmtp`
/// implementation, so the engine fans the single result out.
struct BasicBackend;

struct BasicSession;

#[async_trait::async_trait]
impl Backend for BasicBackend {
    type Session = BasicSession;

    async fn new_session(&self, _connection: &ConnectionInfo) -> Result<BasicSession, SmtpError> {
        Ok(BasicSession)
    }
}

#[async_trait::async_trait]
impl Session for BasicSession {
    async fn mail(&mut self, _from: &ReversePath, _opts: &MailOptions) -> Result<(), SmtpError> {
        Ok(())
    }

    async fn rcpt(&mut self, _to: &Address, _opts: &RcptOptions) -> Result<(), SmtpError> {
        Ok(())
    }

    async fn data<S>(&mut self, body: S) -> Result<(), SmtpError>
    where
        S: tokio_stream::Stream<Item = Result<Vec<u8>, Error>> + Send + Unpin,
    {
        use tokio_stream::StreamExt;
        let mut body = body;
        while let Some(fragment) = body.next().await {
            fragment.map_err(|e| e.to_smtp_error())?;
        }
        Ok(())
    }

    async fn reset(&mut self) {}

    async fn logout(&mut self) {}
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn basic_sessions_fan_the_single_result_out() {
    let (socket_server, server_addr) = bind_random_port!();
    let config = std::sync::Arc::new(lmtp_test());
    let server = {
        let config = config.clone();
        tokio::spawn(async move {
            let (client_stream, client_addr) = socket_server.accept().await.unwrap();
            let info = ConnectionInfo::new(client_addr, server_addr, config.kind);
            let receiver = petrel_protocol::Receiver::new(
                client_stream,
                std::sync::Arc::new(BasicBackend),
                config,
            );
            let _outcome = receiver.serve(info).await;
        })
    };

    let tcp = tokio::net::TcpStream::connect(server_addr).await.unwrap();
    let mut stream = tokio::io::BufReader::new(tcp);

    assert_eq!(read_reply(&mut stream).await, lmtp_greeting());
    write_line(&mut stream, "LHLO client.example.org").await;
    read_reply(&mut stream).await;
    write_line(&mut stream, "MAIL FROM:<s@x>").await;
    read_reply(&mut stream).await;
    write_line(&mut stream, "RCPT TO:<a@x>").await;
    read_reply(&mut stream).await;
    write_line(&mut stream, "RCPT TO:<b@x>").await;
    read_reply(&mut stream).await;
    write_line(&mut stream, "DATA").await;
    read_reply(&mut stream).await;
    tokio::io::AsyncWriteExt::write_all(&mut stream, b"fan out\r\n.\r\n")
        .await
        .unwrap();

    assert_eq!(read_reply(&mut stream).await, "250 2.0.0 <a@x> Ok: queued\r\n");
    assert_eq!(read_reply(&mut stream).await, "250 2.0.0 <b@x> Ok: queued\r\n");

    write_line(&mut stream, "QUIT").await;
    read_reply(&mut stream).await;
    server.await.unwrap();
}

run_test! {
    fn backend_panic_fills_every_recipient_before_closing,
    input = [
        "LHLO client.example.org\r\n",
        "MAIL FROM:<s@x>\r\n",
        "RCPT TO:<boom@x>\r\n",
        "RCPT TO:<b@x>\r\n",
        "DATA\r\n",
        "Hello\r\n.\r\n",
        "",
    ],
    expected = [
        lmtp_greeting(),
        capabilities(),
        "250 2.0.0 Ok\r\n",
        "250 2.0.0 Ok\r\n",
        "250 2.0.0 Ok\r\n",
        "354 Start mail input; end with <CRLF>.<CRLF>\r\n",
        "421 4.0.0 <boom@x> Internal server error\r\n",
        "421 4.0.0 <b@x> Internal server error\r\n",
    ],
    config = lmtp_test(),
}
