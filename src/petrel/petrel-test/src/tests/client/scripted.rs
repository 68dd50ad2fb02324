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

//! The client sequencer against scripted, non-Petrel servers.

use crate::bind_random_port;
use petrel_client::{Client, ClientError, ClientOptions};
use petrel_common::options::MailOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// A fake server: sends the greeting, then for every line received answers
/// with the reply of the first matching `(prefix, reply)` rule.
async fn scripted_server(
    listener: tokio::net::TcpListener,
    greeting: &'static str,
    rules: Vec<(&'static str, &'static str)>,
) {
    let (stream, _addr) = listener.accept().await.unwrap();
    let mut stream = BufReader::new(stream);
    stream.write_all(greeting.as_bytes()).await.unwrap();

    loop {
        let mut line = String::new();
        if stream.read_line(&mut line).await.map_or(true, |l| l == 0) {
            return;
        }
        let Some((_, reply)) = rules
            .iter()
            .find(|(prefix, _)| line.to_uppercase().starts_with(prefix))
        else {
            return;
        };
        stream.write_all(reply.as_bytes()).await.unwrap();
        if reply.starts_with("221") {
            return;
        }
    }
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn ehlo_falls_back_to_helo_on_502() {
    let (listener, addr) = bind_random_port!();
    let server = tokio::spawn(scripted_server(
        listener,
        "220 ancient.example ESMTP\r\n",
        vec![
            ("EHLO", "502 5.5.1 what is this modern nonsense\r\n"),
            ("HELO", "250 ancient.example\r\n"),
            ("MAIL", "250 Ok\r\n"),
            ("QUIT", "221 Bye\r\n"),
        ],
    ));

    let mut client = Client::connect(&addr.ip().to_string(), addr.port(), ClientOptions::default())
        .await
        .unwrap();

    // the fallback leaves no capabilities behind
    client.mail("a@x", &MailOptions::default()).await.unwrap();
    assert!(client.extension("SIZE").await.unwrap().is_none());

    client.quit().await.unwrap();
    server.await.unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn extension_parameters_are_read_from_the_ehlo_reply() {
    let (listener, addr) = bind_random_port!();
    let server = tokio::spawn(scripted_server(
        listener,
        "220 modern.example ESMTP\r\n",
        vec![
            (
                "EHLO",
                "250-modern.example\r\n250-SIZE 1337\r\n250-AUTH PLAIN LOGIN\r\n250 PIPELINING\r\n",
            ),
            ("QUIT", "221 Bye\r\n"),
        ],
    ));

    let mut client = Client::connect(&addr.ip().to_string(), addr.port(), ClientOptions::default())
        .await
        .unwrap();

    assert_eq!(client.max_message_size().await.unwrap(), Some(1337));
    assert!(client
        .supports_auth(&petrel_common::auth::Mechanism::Login)
        .await
        .unwrap());
    assert!(!client
        .supports_auth(&petrel_common::auth::Mechanism::CramMd5)
        .await
        .unwrap());

    client.quit().await.unwrap();
    server.await.unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn missing_capability_fails_before_sending_mail_parameters() {
    let (listener, addr) = bind_random_port!();
    let server = tokio::spawn(scripted_server(
        listener,
        "220 plain.example ESMTP\r\n",
        vec![
            ("EHLO", "250-plain.example\r\n250 PIPELINING\r\n"),
            ("QUIT", "221 Bye\r\n"),
        ],
    ));

    let mut client = Client::connect(&addr.ip().to_string(), addr.port(), ClientOptions::default())
        .await
        .unwrap();

    let require_tls = MailOptions {
        require_tls: true,
        ..MailOptions::default()
    };
    let error = client.mail("a@x", &require_tls).await.unwrap_err();
    assert!(matches!(error, ClientError::CapabilityMissing("REQUIRETLS")));

    let utf8 = MailOptions {
        utf8: true,
        ..MailOptions::default()
    };
    let error = client.mail("dédé@x", &utf8).await.unwrap_err();
    assert!(matches!(error, ClientError::CapabilityMissing("SMTPUTF8")));

    client.quit().await.unwrap();
    server.await.unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn refused_mail_surfaces_the_structured_error() {
    let (listener, addr) = bind_random_port!();
    let server = tokio::spawn(scripted_server(
        listener,
        "220 picky.example ESMTP\r\n",
        vec![
            ("EHLO", "250 picky.example\r\n"),
            ("MAIL", "451 4.7.1 Greylisted, come back later\r\n"),
            ("QUIT", "221 Bye\r\n"),
        ],
    ));

    let mut client = Client::connect(&addr.ip().to_string(), addr.port(), ClientOptions::default())
        .await
        .unwrap();

    let error = client.mail("a@x", &MailOptions::default()).await.unwrap_err();
    match error {
        ClientError::Smtp(e) => {
            assert_eq!(e.code, 451);
            assert_eq!(e.enhanced, Some(petrel_common::EnhancedCode(4, 7, 1)));
            assert!(e.is_temporary());
            assert_eq!(e.message, "Greylisted, come back later");
        }
        other => panic!("expected a structured SMTP error, got {other}"),
    }

    client.quit().await.unwrap();
    server.await.unwrap();
}
