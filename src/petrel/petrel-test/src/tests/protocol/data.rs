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

use crate::config::{capabilities, greeting, local_test};
use crate::run_test;
use petrel_protocol::ReceiverConfig;

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn leading_dots_are_unstuffed() {
    let backend = run_test! {
        input = [
            "EHLO client.example.org\r\n",
            "MAIL FROM:<a@x>\r\n",
            "RCPT TO:<b@y>\r\n",
            "DATA\r\n",
            "..leading dot\r\n.\r\n",
            "QUIT\r\n",
        ],
        expected = [
            greeting(),
            capabilities(),
            "250 2.0.0 Ok\r\n",
            "250 2.0.0 Ok\r\n",
            "354 Start mail input; end with <CRLF>.<CRLF>\r\n",
            "250 2.0.0 Ok: queued\r\n",
            "221 2.0.0 Service closing transmission channel\r\n",
        ],
    };

    let journal = backend.journal.lock().unwrap();
    assert_eq!(journal[0].body, b".leading dot\r\n");
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn transaction_state_clears_after_data() {
    let backend = run_test! {
        input = [
            "EHLO client.example.org\r\n",
            "MAIL FROM:<a@x>\r\n",
            "RCPT TO:<b@y>\r\n",
            "DATA\r\n",
            "first\r\n.\r\n",
            "MAIL FROM:<c@x>\r\n",
            "RCPT TO:<d@y>\r\n",
            "DATA\r\n",
            "second\r\n.\r\n",
            "QUIT\r\n",
        ],
        expected = [
            greeting(),
            capabilities(),
            "250 2.0.0 Ok\r\n",
            "250 2.0.0 Ok\r\n",
            "354 Start mail input; end with <CRLF>.<CRLF>\r\n",
            "250 2.0.0 Ok: queued\r\n",
            "250 2.0.0 Ok\r\n",
            "250 2.0.0 Ok\r\n",
            "354 Start mail input; end with <CRLF>.<CRLF>\r\n",
            "250 2.0.0 Ok: queued\r\n",
            "221 2.0.0 Service closing transmission channel\r\n",
        ],
    };

    let journal = backend.journal.lock().unwrap();
    assert_eq!(journal.len(), 2);
    assert_eq!(journal[0].body, b"first\r\n");
    assert_eq!(journal[1].body, b"second\r\n");
}

run_test! {
    fn oversized_message_is_refused_and_drained,
    input = [
        "EHLO client.example.org\r\n",
        "MAIL FROM:<a@x>\r\n",
        "RCPT TO:<b@y>\r\n",
        "DATA\r\n",
        &("X".repeat(64) + "\r\n" + &"Y".repeat(64) + "\r\n.\r\n"),
        "NOOP\r\n",
        "QUIT\r\n",
    ],
    expected = [
        greeting(),
        capabilities().replace("250-SIZE 20000000\r\n", "250-SIZE 100\r\n"),
        "250 2.0.0 Ok\r\n",
        "250 2.0.0 Ok\r\n",
        "354 Start mail input; end with <CRLF>.<CRLF>\r\n",
        "552 5.3.4 Maximum message size exceeded\r\n",
        // the protocol cursor survived the refused body
        "250 2.0.0 Ok\r\n",
        "221 2.0.0 Service closing transmission channel\r\n",
    ],
    config = ReceiverConfig {
        message_size_max: Some(100),
        ..local_test()
    },
}

run_test! {
    fn declared_size_over_the_limit_is_refused_at_mail,
    input = [
        "EHLO client.example.org\r\n",
        "MAIL FROM:<a@x> SIZE=200\r\n",
        "QUIT\r\n",
    ],
    expected = [
        greeting(),
        capabilities().replace("250-SIZE 20000000\r\n", "250-SIZE 100\r\n"),
        "552 5.3.4 Maximum message size exceeded\r\n",
        "221 2.0.0 Service closing transmission channel\r\n",
    ],
    config = ReceiverConfig {
        message_size_max: Some(100),
        ..local_test()
    },
}
