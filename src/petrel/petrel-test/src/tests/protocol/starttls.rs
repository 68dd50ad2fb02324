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
use crate::config::{capabilities_with, client_tls_config, greeting, local_test, tls_test};
use crate::mock::MockBackend;
use crate::{bind_random_port, run_test, spawn_receiver};
use petrel_protocol::rustls;
use tokio::io::{AsyncWriteExt, BufReader};

run_test! {
    fn starttls_requires_hello,
    input = [
        "STARTTLS\r\n",
        "EHLO client.example.org\r\n",
        "QUIT\r\n",
    ],
    expected = [
        greeting(),
        "502 5.5.1 Please introduce yourself first\r\n",
        capabilities_with("250-STARTTLS\r\n"),
        "221 2.0.0 Service closing transmission channel\r\n",
    ],
    config = tls_test(),
}

run_test! {
    fn starttls_is_refused_without_a_tls_config,
    input = [
        "EHLO client.example.org\r\n",
        "STARTTLS\r\n",
        "QUIT\r\n",
    ],
    expected = [
        greeting(),
        crate::config::capabilities(),
        "502 5.5.1 TLS is not available\r\n",
        "221 2.0.0 Service closing transmission channel\r\n",
    ],
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn starttls_clears_session_state() {
    let (socket_server, server_addr) = bind_random_port!();
    let server = spawn_receiver!(
        socket_server,
        server_addr,
        std::sync::Arc::new(tls_test()),
        std::sync::Arc::new(MockBackend::default())
    );

    let tcp = tokio::net::TcpStream::connect(server_addr).await.unwrap();
    let mut plain = BufReader::new(tcp);

    assert_eq!(read_reply(&mut plain).await, greeting());
    write_line(&mut plain, "EHLO client.example.org").await;
    assert_eq!(
        read_reply(&mut plain).await,
        capabilities_with("250-STARTTLS\r\n")
    );
    write_line(&mut plain, "STARTTLS").await;
    assert_eq!(read_reply(&mut plain).await, "220 2.0.0 Ready to start TLS\r\n");

    let connector = tokio_rustls::TlsConnector::from(client_tls_config());
    let tls = connector
        .connect(
            rustls::ServerName::try_from("testserver.com").unwrap(),
            plain.into_inner(),
        )
        .await
        .unwrap();
    let mut tls = BufReader::new(tls);

    // the upgrade reset everything: the old hello is gone
    write_line(&mut tls, "MAIL FROM:<a@x>").await;
    assert_eq!(
        read_reply(&mut tls).await,
        "502 5.5.1 Please introduce yourself first\r\n"
    );

    write_line(&mut tls, "EHLO client.example.org").await;
    let capabilities = read_reply(&mut tls).await;
    assert!(!capabilities.contains("250-STARTTLS\r\n"));
    assert!(capabilities.contains("250-REQUIRETLS\r\n"));

    write_line(&mut tls, "MAIL FROM:<a@x>").await;
    assert_eq!(read_reply(&mut tls).await, "250 2.0.0 Ok\r\n");
    write_line(&mut tls, "QUIT").await;
    assert_eq!(
        read_reply(&mut tls).await,
        "221 2.0.0 Service closing transmission channel\r\n"
    );

    server.await.unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn requiretls_is_accepted_over_tls() {
    let (socket_server, server_addr) = bind_random_port!();
    let backend = std::sync::Arc::new(MockBackend::default());
    let server = spawn_receiver!(
        socket_server,
        server_addr,
        std::sync::Arc::new(tls_test()),
        backend.clone()
    );

    let tcp = tokio::net::TcpStream::connect(server_addr).await.unwrap();
    let mut plain = BufReader::new(tcp);
    assert_eq!(read_reply(&mut plain).await, greeting());
    write_line(&mut plain, "EHLO client.example.org").await;
    read_reply(&mut plain).await;
    write_line(&mut plain, "STARTTLS").await;
    read_reply(&mut plain).await;

    let connector = tokio_rustls::TlsConnector::from(client_tls_config());
    let tls = connector
        .connect(
            rustls::ServerName::try_from("testserver.com").unwrap(),
            plain.into_inner(),
        )
        .await
        .unwrap();
    let mut tls = BufReader::new(tls);

    write_line(&mut tls, "EHLO client.example.org").await;
    read_reply(&mut tls).await;
    write_line(&mut tls, "MAIL FROM:<a@x> REQUIRETLS").await;
    assert_eq!(read_reply(&mut tls).await, "250 2.0.0 Ok\r\n");
    write_line(&mut tls, "RCPT TO:<b@y>").await;
    assert_eq!(read_reply(&mut tls).await, "250 2.0.0 Ok\r\n");
    write_line(&mut tls, "DATA").await;
    read_reply(&mut tls).await;
    tls.write_all(b"over tls\r\n.\r\n").await.unwrap();
    assert_eq!(read_reply(&mut tls).await, "250 2.0.0 Ok: queued\r\n");
    write_line(&mut tls, "QUIT").await;
    read_reply(&mut tls).await;

    server.await.unwrap();

    let journal = backend.journal.lock().unwrap();
    assert!(journal[0].mail_options.require_tls);
    assert_eq!(journal[0].body, b"over tls\r\n");
}

run_test! {
    fn local_test_does_not_advertise_starttls,
    input = [
        "EHLO client.example.org\r\n",
        "QUIT\r\n",
    ],
    expected = [
        greeting(),
        crate::config::capabilities(),
        "221 2.0.0 Service closing transmission channel\r\n",
    ],
    config = local_test(),
}
