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

use crate::config::{capabilities_with, greeting, local_test};
use crate::mock::MockBackend;
use crate::run_test;
use petrel_protocol::ReceiverConfig;

// "\0jdoe\0secret"
const GOOD_PLAIN: &str = "AGpkb2UAc2VjcmV0";
// "\0jdoe\0wrong"
const BAD_PLAIN: &str = "AGpkb2UAd3Jvbmc=";

run_test! {
    fn plain_with_initial_response,
    input = [
        "EHLO client.example.org\r\n",
        &format!("AUTH PLAIN {GOOD_PLAIN}\r\n"),
        "MAIL FROM:<a@x>\r\n",
        "QUIT\r\n",
    ],
    expected = [
        greeting(),
        capabilities_with("250-AUTH PLAIN\r\n"),
        "235 2.7.0 Authentication succeeded\r\n",
        "250 2.0.0 Ok\r\n",
        "221 2.0.0 Service closing transmission channel\r\n",
    ],
    backend = MockBackend::with_credentials("jdoe", "secret"),
}

run_test! {
    fn plain_with_challenge_round,
    input = [
        "EHLO client.example.org\r\n",
        "AUTH PLAIN\r\n",
        &format!("{GOOD_PLAIN}\r\n"),
        "QUIT\r\n",
    ],
    expected = [
        greeting(),
        capabilities_with("250-AUTH PLAIN\r\n"),
        "334 \r\n",
        "235 2.7.0 Authentication succeeded\r\n",
        "221 2.0.0 Service closing transmission channel\r\n",
    ],
    backend = MockBackend::with_credentials("jdoe", "secret"),
}

run_test! {
    fn wrong_credentials_are_refused,
    input = [
        "EHLO client.example.org\r\n",
        &format!("AUTH PLAIN {BAD_PLAIN}\r\n"),
        "QUIT\r\n",
    ],
    expected = [
        greeting(),
        capabilities_with("250-AUTH PLAIN\r\n"),
        "535 5.7.8 Authentication credentials invalid\r\n",
        "221 2.0.0 Service closing transmission channel\r\n",
    ],
    backend = MockBackend::with_credentials("jdoe", "secret"),
}

run_test! {
    fn a_star_cancels_the_exchange,
    input = [
        "EHLO client.example.org\r\n",
        "AUTH PLAIN\r\n",
        "*\r\n",
        "QUIT\r\n",
    ],
    expected = [
        greeting(),
        capabilities_with("250-AUTH PLAIN\r\n"),
        "334 \r\n",
        "501 5.0.0 Authentication cancelled\r\n",
        "221 2.0.0 Service closing transmission channel\r\n",
    ],
    backend = MockBackend::with_credentials("jdoe", "secret"),
}

run_test! {
    fn malformed_base64_is_a_syntax_error,
    input = [
        "EHLO client.example.org\r\n",
        "AUTH PLAIN\r\n",
        "!!!not base64!!!\r\n",
        "QUIT\r\n",
    ],
    expected = [
        greeting(),
        capabilities_with("250-AUTH PLAIN\r\n"),
        "334 \r\n",
        "501 5.5.2 Invalid base64 response\r\n",
        "221 2.0.0 Service closing transmission channel\r\n",
    ],
    backend = MockBackend::with_credentials("jdoe", "secret"),
}

run_test! {
    fn unknown_mechanisms_are_refused,
    input = [
        "EHLO client.example.org\r\n",
        "AUTH CRAM-MD5\r\n",
        "QUIT\r\n",
    ],
    expected = [
        greeting(),
        capabilities_with("250-AUTH PLAIN\r\n"),
        "504 5.5.4 Mechanism CRAM-MD5 is not supported\r\n",
        "221 2.0.0 Service closing transmission channel\r\n",
    ],
    backend = MockBackend::with_credentials("jdoe", "secret"),
}

run_test! {
    fn auth_requires_hello,
    input = [
        &format!("AUTH PLAIN {GOOD_PLAIN}\r\n"),
        "QUIT\r\n",
    ],
    expected = [
        greeting(),
        "502 5.5.1 Please introduce yourself first\r\n",
        "221 2.0.0 Service closing transmission channel\r\n",
    ],
    backend = MockBackend::with_credentials("jdoe", "secret"),
}

run_test! {
    fn plaintext_auth_needs_the_insecure_override,
    input = [
        "EHLO client.example.org\r\n",
        &format!("AUTH PLAIN {GOOD_PLAIN}\r\n"),
        "QUIT\r\n",
    ],
    expected = [
        greeting(),
        // AUTH is not even advertised without TLS
        "250-testserver.com\r\n\
         250-PIPELINING\r\n\
         250-8BITMIME\r\n\
         250-ENHANCEDSTATUSCODES\r\n\
         250-CHUNKING\r\n\
         250-SMTPUTF8\r\n\
         250-BINARYMIME\r\n\
         250-DSN\r\n\
         250-RRVS\r\n\
         250-LIMITS RCPTMAX=32\r\n\
         250-SIZE 20000000\r\n\
         250-DELIVERBY 60\r\n\
         250 MT-PRIORITY MIXER\r\n",
        "523 5.7.10 Encryption required for requested authentication mechanism\r\n",
        "221 2.0.0 Service closing transmission channel\r\n",
    ],
    config = ReceiverConfig {
        allow_insecure_auth: false,
        ..local_test()
    },
    backend = MockBackend::with_credentials("jdoe", "secret"),
}

run_test! {
    fn double_authentication_is_refused,
    input = [
        "EHLO client.example.org\r\n",
        &format!("AUTH PLAIN {GOOD_PLAIN}\r\n"),
        &format!("AUTH PLAIN {GOOD_PLAIN}\r\n"),
        "QUIT\r\n",
    ],
    expected = [
        greeting(),
        capabilities_with("250-AUTH PLAIN\r\n"),
        "235 2.7.0 Authentication succeeded\r\n",
        "503 5.5.1 Already authenticated\r\n",
        "221 2.0.0 Service closing transmission channel\r\n",
    ],
    backend = MockBackend::with_credentials("jdoe", "secret"),
}

run_test! {
    fn auth_is_refused_during_a_transaction,
    input = [
        "EHLO client.example.org\r\n",
        "MAIL FROM:<a@x>\r\n",
        &format!("AUTH PLAIN {GOOD_PLAIN}\r\n"),
        "QUIT\r\n",
    ],
    expected = [
        greeting(),
        capabilities_with("250-AUTH PLAIN\r\n"),
        "250 2.0.0 Ok\r\n",
        "502 5.5.1 AUTH is not permitted during a mail transaction\r\n",
        "221 2.0.0 Service closing transmission channel\r\n",
    ],
    backend = MockBackend::with_credentials("jdoe", "secret"),
}
