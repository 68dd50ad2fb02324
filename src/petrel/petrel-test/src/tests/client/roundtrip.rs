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

//! The two peer libraries driving each other over loopback TCP.

use crate::config::{client_tls_config, lmtp_test, local_test, tls_test};
use crate::mock::MockBackend;
use crate::{bind_random_port, spawn_receiver};
use petrel_client::{Client, ClientError, ClientOptions, Submission};
use petrel_common::options::{MailOptions, RcptOptions};

async fn start_server(
    config: petrel_protocol::ReceiverConfig,
    backend: MockBackend,
) -> (
    std::net::SocketAddr,
    std::sync::Arc<MockBackend>,
    tokio::task::JoinHandle<()>,
) {
    let (socket_server, server_addr) = bind_random_port!();
    let backend = std::sync::Arc::new(backend);
    let server = spawn_receiver!(
        socket_server,
        server_addr,
        std::sync::Arc::new(config),
        backend.clone()
    );
    (server_addr, backend, server)
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn vanilla_submission_through_the_client() {
    let (addr, backend, server) = start_server(local_test(), MockBackend::default()).await;

    let mut client = Client::connect(&addr.ip().to_string(), addr.port(), ClientOptions::default())
        .await
        .unwrap();

    assert_eq!(client.max_message_size().await.unwrap(), Some(20_000_000));
    assert!(client.extension("CHUNKING").await.unwrap().is_some());
    assert!(client.extension("STARTTLS").await.unwrap().is_none());

    client.mail("a@x", &MailOptions::default()).await.unwrap();
    client.rcpt("b@y", &RcptOptions::default()).await.unwrap();

    let mut body = client.data().await.unwrap();
    body.write_all(b"Hey <3\r\n.stuff this\r\n").await.unwrap();
    let submission = body.finish().await.unwrap();
    assert!(matches!(submission, Submission::Accepted(_)));

    client.quit().await.unwrap();
    server.await.unwrap();

    let journal = backend.journal.lock().unwrap();
    assert_eq!(journal[0].body, b"Hey <3\r\n.stuff this\r\n");
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn lmtp_results_are_aggregated_and_sorted() {
    let (addr, _backend, server) = start_server(lmtp_test(), MockBackend::default()).await;

    let mut client = Client::connect(&addr.ip().to_string(), addr.port(), ClientOptions::lmtp())
        .await
        .unwrap();

    client.mail("s@x", &MailOptions::default()).await.unwrap();
    client.rcpt("zz-unlucky@x", &RcptOptions::default()).await.unwrap();
    client.rcpt("ok@x", &RcptOptions::default()).await.unwrap();
    client.rcpt("unlucky@x", &RcptOptions::default()).await.unwrap();

    let mut body = client.data().await.unwrap();
    body.write_all(b"Hello\r\n").await.unwrap();
    let error = body.finish().await.unwrap_err();

    match &error {
        ClientError::LmtpDelivery { outcomes } => {
            // wire order is preserved in the outcomes
            assert_eq!(outcomes.len(), 3);
            assert_eq!(outcomes[0].recipient, "zz-unlucky@x");
            assert!(outcomes[0].result.is_ok(), "local part is not exactly 'unlucky'");
            assert!(outcomes[1].result.is_ok());
            assert!(outcomes[2].result.is_err());
        }
        other => panic!("expected an LMTP delivery error, got {other}"),
    }
    // the aggregate message is deterministic
    assert_eq!(
        error.to_string(),
        "delivery failed for <unlucky@x>: 554 5.0.0 Delivery failed"
    );

    client.quit().await.unwrap();
    server.await.unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn injection_attempts_fail_before_any_byte_leaves() {
    let (addr, backend, server) = start_server(local_test(), MockBackend::default()).await;

    let mut client = Client::connect(&addr.ip().to_string(), addr.port(), ClientOptions::default())
        .await
        .unwrap();

    client.mail("a@x", &MailOptions::default()).await.unwrap();
    let error = client
        .rcpt("a@b>\r\nDATA\r\nowned", &RcptOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(error, ClientError::LineInjection { .. }));

    // the transaction is still healthy: nothing was written
    client.rcpt("b@y", &RcptOptions::default()).await.unwrap();
    client.reset().await.unwrap();
    client.quit().await.unwrap();
    server.await.unwrap();

    assert!(backend.journal.lock().unwrap().is_empty());
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn capability_gated_options_fail_locally() {
    let config = petrel_protocol::ReceiverConfig {
        extensions: petrel_protocol::Extensions {
            rrvs: false,
            ..local_test().extensions
        },
        ..local_test()
    };
    let (addr, _backend, server) = start_server(config, MockBackend::default()).await;

    let mut client = Client::connect(&addr.ip().to_string(), addr.port(), ClientOptions::default())
        .await
        .unwrap();

    client.mail("a@x", &MailOptions::default()).await.unwrap();

    let rrvs = RcptOptions {
        rrvs: Some(time::macros::datetime!(2014-04-03 23:01:00 UTC)),
        ..RcptOptions::default()
    };
    let error = client.rcpt("b@y", &rrvs).await.unwrap_err();
    assert!(matches!(error, ClientError::CapabilityMissing("RRVS")));

    let utf8 = MailOptions {
        utf8: true,
        ..MailOptions::default()
    };
    // SMTPUTF8 is advertised here, so the client-side gate passes and the
    // server accepts it
    client.reset().await.unwrap();
    client.mail("dédé@exämple.org", &utf8).await.unwrap();

    client.quit().await.unwrap();
    server.await.unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn authentication_and_dsn_parameters() {
    let (addr, backend, server) = start_server(
        local_test(),
        MockBackend::with_credentials("jdoe", "secret"),
    )
    .await;

    let mut client = Client::connect(&addr.ip().to_string(), addr.port(), ClientOptions::default())
        .await
        .unwrap();

    assert!(client
        .supports_auth(&petrel_common::auth::Mechanism::Plain)
        .await
        .unwrap());

    let mut wrong = petrel_client::sasl::Plain::new("jdoe", "nope");
    let error = client.auth(&mut wrong).await.unwrap_err();
    assert!(matches!(error, ClientError::Smtp(e) if e.code == 535));

    let mut plain = petrel_client::sasl::Plain::new("jdoe", "secret");
    client.auth(&mut plain).await.unwrap();

    let mail = MailOptions {
        ret: Some(petrel_common::options::DsnReturn::Full),
        envelope_id: Some("QQ 314159".to_owned()),
        ..MailOptions::default()
    };
    client.mail("a@x", &mail).await.unwrap();

    let rcpt = RcptOptions {
        notify: Some(petrel_common::options::NotifyOn::Some {
            success: true,
            failure: true,
            delay: false,
        }),
        orcpt: Some(petrel_common::options::OriginalRecipient {
            addr_type: petrel_common::options::OrcptAddrType::Rfc822,
            mailbox: "b+old@y".to_owned(),
        }),
        ..RcptOptions::default()
    };
    client.rcpt("b@y", &rcpt).await.unwrap();

    let mut body = client.data().await.unwrap();
    body.write_all(b"dsn roundtrip\r\n").await.unwrap();
    body.finish().await.unwrap();
    client.quit().await.unwrap();
    server.await.unwrap();

    let journal = backend.journal.lock().unwrap();
    let message = &journal[0];
    // the xtext encoding survived the round trip
    assert_eq!(message.mail_options.envelope_id.as_deref(), Some("QQ 314159"));
    assert_eq!(
        message.recipients[0].1.orcpt.as_ref().unwrap().mailbox,
        "b+old@y"
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn starttls_through_the_client() {
    let (addr, backend, server) = start_server(tls_test(), MockBackend::default()).await;

    let client = Client::connect(&addr.ip().to_string(), addr.port(), ClientOptions::default())
        .await
        .unwrap();

    let mut client = client
        .starttls(client_tls_config(), Some("testserver.com"))
        .await
        .unwrap();

    // hello re-ran over TLS; STARTTLS is gone from the capability list
    assert!(client.extension("STARTTLS").await.unwrap().is_none());
    assert!(client.extension("REQUIRETLS").await.unwrap().is_some());

    client
        .send_message("a@x", &["b@y"], b"secret stuff\r\n")
        .await
        .unwrap();
    client.quit().await.unwrap();
    server.await.unwrap();

    assert_eq!(backend.journal.lock().unwrap()[0].body, b"secret stuff\r\n");
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn doubled_starttls_is_refused_locally() {
    let (addr, _backend, server) = start_server(tls_test(), MockBackend::default()).await;

    let client = Client::connect(&addr.ip().to_string(), addr.port(), ClientOptions::default())
        .await
        .unwrap();
    let client = client
        .starttls(client_tls_config(), Some("testserver.com"))
        .await
        .unwrap();

    // the server no longer advertises STARTTLS, the client refuses locally
    let error = client
        .starttls(client_tls_config(), Some("testserver.com"))
        .await
        .unwrap_err();
    assert!(matches!(error, ClientError::CapabilityMissing("STARTTLS")));

    server.abort();
}
