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

/// Bind a listener on a random loopback port.
#[macro_export]
macro_rules! bind_random_port {
    () => {
        loop {
            let port = rand::random::<u32>().rem_euclid(65535 - 1025) + 1025;
            let server_addr: std::net::SocketAddr =
                format!("127.0.0.1:{port}").parse().expect("valid address");
            match tokio::net::TcpListener::bind(server_addr).await {
                Ok(socket_server) => break (socket_server, server_addr),
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => (),
                Err(e) => panic!("{}", e),
            };
        }
    };
}

/// Spawn one [`petrel_protocol::Receiver`] for the next connection on
/// `$socket`.
#[macro_export]
macro_rules! spawn_receiver {
    ($socket:expr, $server_addr:expr, $config:expr, $backend:expr) => {{
        let socket_server = $socket;
        let server_addr = $server_addr;
        let config: std::sync::Arc<petrel_protocol::ReceiverConfig> = $config;
        let backend: std::sync::Arc<$crate::mock::MockBackend> = $backend;
        tokio::spawn(async move {
            let (client_stream, client_addr) = socket_server.accept().await.unwrap();
            let info = petrel_protocol::ConnectionInfo::new(client_addr, server_addr, config.kind);
            let receiver = petrel_protocol::Receiver::new(client_stream, backend, config);
            let _outcome = receiver.serve(info).await;
        })
    }};
}

/// Run one scripted connection against a receiver and assert the exact
/// reply transcript.
///
/// `input` entries are written verbatim, one after each final reply line;
/// an empty entry reads one more reply without writing (LMTP emits several
/// replies for one input). `expected` entries are whole replies,
/// continuation lines included. Returns the backend for journal
/// assertions.
#[macro_export]
macro_rules! run_test {
    (
        input = $input:expr,
        expected = [$($expected:expr),* $(,)?]
        $(, config = $config:expr)?
        $(, backend = $backend:expr)?
        $(,)?
    ) => {{
        let expected: Vec<String> = vec![$($expected.to_string()),*];
        let input: Vec<String> = $input.into_iter().map(|s| s.to_string()).collect::<Vec<_>>();

        let (socket_server, server_addr) = $crate::bind_random_port!();

        let config: std::sync::Arc<petrel_protocol::ReceiverConfig> = {
            let _f = || std::sync::Arc::new($crate::config::local_test());      $(
            let _f = || std::sync::Arc::new($config);                           )?
            _f()
        };

        let backend: std::sync::Arc<$crate::mock::MockBackend> = {
            let _f = || std::sync::Arc::new($crate::mock::MockBackend::default());  $(
            let _f = || std::sync::Arc::new($backend);                              )?
            _f()
        };
        let backend_handle = backend.clone();

        let server = $crate::spawn_receiver!(socket_server, server_addr, config, backend);

        let client = tokio::spawn(async move {
            use tokio::io::AsyncBufReadExt;
            use tokio::io::AsyncWriteExt;

            let stream = tokio::net::TcpStream::connect(server_addr).await.unwrap();
            let mut stream = tokio::io::BufReader::new(stream);

            let mut output: Vec<String> = vec![];
            let mut reply = String::new();
            let mut line_to_send = input.iter().cloned();

            loop {
                let mut line_received = String::new();
                // read until '\n' or '\r\n'
                if stream.read_line(&mut line_received).await.map_or(true, |l| l == 0) {
                    break;
                }
                let continuation = line_received.chars().nth(3) == Some('-');
                reply.push_str(&line_received);
                if continuation {
                    continue;
                }
                output.push(std::mem::take(&mut reply));

                match line_to_send.next() {
                    // an empty entry: just read the next reply
                    Some(line) if line.is_empty() => {}
                    Some(line) => stream.write_all(line.as_bytes()).await.unwrap(),
                    None => break,
                }
            }
            output
        });

        let (client, server) = tokio::join!(client, server);
        let (client, _server) = (client.unwrap(), server.unwrap());

        pretty_assertions::assert_eq!(expected, client);

        backend_handle
    }};
    (
        fn $name:ident,
        input = $input:expr,
        expected = [$($expected:expr),* $(,)?]
        $(, config = $config:expr)?
        $(, backend = $backend:expr)?
        $(,)?
    ) => {
        #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
        async fn $name() {
            run_test! {
                input = $input,
                expected = [$($expected),*]
                $(, config = $config)?
                $(, backend = $backend)?
            };
        }
    };
}

/// Like [`run_test!`], but each `expected` entry is one whole TCP burst:
/// every reply the server produced for one pipelined `input` window.
#[macro_export]
macro_rules! run_pipelined_test {
    (
        input = $input:expr,
        expected = [$($expected:expr),* $(,)?]
        $(, config = $config:expr)?
        $(, backend = $backend:expr)?
        $(,)?
    ) => {{
        let expected: Vec<String> = vec![$($expected.to_string()),*];
        let input: Vec<String> = $input.into_iter().map(|s| s.to_string()).collect::<Vec<_>>();

        let (socket_server, server_addr) = $crate::bind_random_port!();

        let config: std::sync::Arc<petrel_protocol::ReceiverConfig> = {
            let _f = || std::sync::Arc::new($crate::config::local_test());      $(
            let _f = || std::sync::Arc::new($config);                           )?
            _f()
        };

        let backend: std::sync::Arc<$crate::mock::MockBackend> = {
            let _f = || std::sync::Arc::new($crate::mock::MockBackend::default());  $(
            let _f = || std::sync::Arc::new($backend);                              )?
            _f()
        };
        let backend_handle = backend.clone();

        let server = $crate::spawn_receiver!(socket_server, server_addr, config, backend);

        let client = tokio::spawn(async move {
            use tokio::io::AsyncBufReadExt;
            use tokio::io::AsyncWriteExt;

            let stream = tokio::net::TcpStream::connect(server_addr).await.unwrap();
            let mut stream = tokio::io::BufReader::new(stream);

            let mut output: Vec<String> = vec![];
            let mut line_to_send = input.iter().cloned();

            loop {
                // collect everything the server wrote for this window
                let read_timeout = tokio::time::Duration::from_millis(100);
                let mut burst = String::new();
                loop {
                    let mut line_received = String::new();
                    match tokio::time::timeout(read_timeout, stream.read_line(&mut line_received))
                        .await
                    {
                        Ok(Ok(0)) | Err(_) => break,
                        Ok(Ok(_)) => burst.push_str(&line_received),
                        Ok(Err(e)) => panic!("{}", e),
                    }
                }
                if burst.is_empty() {
                    break;
                }
                output.push(burst);
                match line_to_send.next() {
                    Some(line) => stream.write_all(line.as_bytes()).await.unwrap(),
                    None => break,
                }
            }
            output
        });

        let (client, server) = tokio::join!(client, server);
        let (client, _server) = (client.unwrap(), server.unwrap());

        pretty_assertions::assert_eq!(expected, client);

        backend_handle
    }};
    (
        fn $name:ident,
        input = $input:expr,
        expected = [$($expected:expr),* $(,)?]
        $(, config = $config:expr)?
        $(, backend = $backend:expr)?
        $(,)?
    ) => {
        #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
        async fn $name() {
            run_pipelined_test! {
                input = $input,
                expected = [$($expected),*]
                $(, config = $config)?
                $(, backend = $backend)?
            };
        }
    };
}
