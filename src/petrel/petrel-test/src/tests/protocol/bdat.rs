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
async fn chunked_transfer_concatenates() {
    let backend = run_test! {
        input = [
            "EHLO client.example.org\r\n",
            "MAIL FROM:<a@x>\r\n",
            "RCPT TO:<b@y>\r\n",
            "BDAT 5\r\nHello",
            "BDAT 6 LAST\r\n World",
            "QUIT\r\n",
        ],
        expected = [
            greeting(),
            capabilities(),
            "250 2.0.0 Ok\r\n",
            "250 2.0.0 Ok\r\n",
            "250 2.0.0 5 bytes received\r\n",
            "250 2.0.0 Ok: queued\r\n",
            "221 2.0.0 Service closing transmission channel\r\n",
        ],
    };

    let journal = backend.journal.lock().unwrap();
    assert_eq!(journal.len(), 1);
    assert_eq!(journal[0].body, b"Hello World");
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn bdat_zero_last_closes_the_transfer() {
    let backend = run_test! {
        input = [
            "EHLO client.example.org\r\n",
            "MAIL FROM:<a@x>\r\n",
            "RCPT TO:<b@y>\r\n",
            "BDAT 7\r\npayload",
            "BDAT 0 LAST\r\n",
            "QUIT\r\n",
        ],
        expected = [
            greeting(),
            capabilities(),
            "250 2.0.0 Ok\r\n",
            "250 2.0.0 Ok\r\n",
            "250 2.0.0 7 bytes received\r\n",
            "250 2.0.0 Ok: queued\r\n",
            "221 2.0.0 Service closing transmission channel\r\n",
        ],
    };

    assert_eq!(backend.journal.lock().unwrap()[0].body, b"payload");
}

run_test! {
    fn binarymime_forbids_data,
    input = [
        "EHLO client.example.org\r\n",
        "MAIL FROM:<a@x> BODY=BINARYMIME\r\n",
        "RCPT TO:<b@y>\r\n",
        "DATA\r\n",
        "BDAT 2 LAST\r\nhi",
        "QUIT\r\n",
    ],
    expected = [
        greeting(),
        capabilities(),
        "250 2.0.0 Ok\r\n",
        "250 2.0.0 Ok\r\n",
        "502 5.5.1 DATA is not allowed with BODY=BINARYMIME, use BDAT\r\n",
        "250 2.0.0 Ok: queued\r\n",
        "221 2.0.0 Service closing transmission channel\r\n",
    ],
}

run_test! {
    fn mail_and_rcpt_are_rejected_mid_chunking,
    input = [
        "EHLO client.example.org\r\n",
        "MAIL FROM:<a@x>\r\n",
        "RCPT TO:<b@y>\r\n",
        "BDAT 5\r\nHello",
        "MAIL FROM:<other@x>\r\n",
        "BDAT 0 LAST\r\n",
        "QUIT\r\n",
    ],
    expected = [
        greeting(),
        capabilities(),
        "250 2.0.0 Ok\r\n",
        "250 2.0.0 Ok\r\n",
        "250 2.0.0 5 bytes received\r\n",
        "502 5.5.1 Only BDAT is allowed during a chunked transfer\r\n",
        "250 2.0.0 Ok: queued\r\n",
        "221 2.0.0 Service closing transmission channel\r\n",
    ],
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn rset_aborts_a_chunked_transfer() {
    let backend = run_test! {
        input = [
            "EHLO client.example.org\r\n",
            "MAIL FROM:<a@x>\r\n",
            "RCPT TO:<b@y>\r\n",
            "BDAT 5\r\nHello",
            "RSET\r\n",
            "MAIL FROM:<c@x>\r\n",
            "QUIT\r\n",
        ],
        expected = [
            greeting(),
            capabilities(),
            "250 2.0.0 Ok\r\n",
            "250 2.0.0 Ok\r\n",
            "250 2.0.0 5 bytes received\r\n",
            "250 2.0.0 Session reset\r\n",
            "250 2.0.0 Ok\r\n",
            "221 2.0.0 Service closing transmission channel\r\n",
        ],
    };

    // the aborted transfer never reached the journal
    assert!(backend.journal.lock().unwrap().is_empty());
}

run_test! {
    fn chunk_crossing_the_size_limit_is_drained_not_fatal,
    input = [
        "EHLO client.example.org\r\n",
        "MAIL FROM:<a@x>\r\n",
        "RCPT TO:<b@y>\r\n",
        &format!("BDAT 150\r\n{}", "Z".repeat(150)),
        "BDAT 4 LAST\r\ntail",
        "RSET\r\n",
        "QUIT\r\n",
    ],
    expected = [
        greeting(),
        capabilities().replace("250-SIZE 20000000\r\n", "250-SIZE 100\r\n"),
        "250 2.0.0 Ok\r\n",
        "250 2.0.0 Ok\r\n",
        "552 5.3.4 Maximum message size exceeded\r\n",
        "552 5.3.4 Maximum message size exceeded\r\n",
        "250 2.0.0 Ok\r\n",
        "221 2.0.0 Service closing transmission channel\r\n",
    ],
    config = ReceiverConfig {
        message_size_max: Some(100),
        ..local_test()
    },
}
