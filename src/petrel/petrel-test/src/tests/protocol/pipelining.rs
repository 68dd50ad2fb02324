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

use crate::config::{capabilities, greeting};
use crate::run_pipelined_test;

run_pipelined_test! {
    fn full_transaction_in_one_window,
    input = [
        "EHLO client.example.org\r\n",
        "MAIL FROM:<john@doe.example>\r\n\
         RCPT TO:<galvin@tis.example>\r\n\
         DATA\r\n",
        &("X".repeat(10) + "\r\n.\r\n"),
        "QUIT\r\n",
    ],
    expected = [
        greeting(),
        capabilities(),
        "250 2.0.0 Ok\r\n\
         250 2.0.0 Ok\r\n\
         354 Start mail input; end with <CRLF>.<CRLF>\r\n",
        "250 2.0.0 Ok: queued\r\n",
        "221 2.0.0 Service closing transmission channel\r\n",
    ],
}

run_pipelined_test! {
    fn error_surfaces_in_command_order,
    input = [
        "EHLO client.example.org\r\n",
        "MAIL FROM:<john@doe.example>\r\n\
         RCPT TO:<fitz@trusted.example>\r\n\
         NOTACOMMAND and its args\r\n\
         DATA\r\n",
        ".\r\n",
        "QUIT\r\n",
    ],
    expected = [
        greeting(),
        capabilities(),
        "250 2.0.0 Ok\r\n\
         250 2.0.0 Ok\r\n\
         500 5.5.2 Syntax error, command unrecognized\r\n\
         354 Start mail input; end with <CRLF>.<CRLF>\r\n",
        "250 2.0.0 Ok: queued\r\n",
        "221 2.0.0 Service closing transmission channel\r\n",
    ],
}

run_pipelined_test! {
    fn sequence_error_mid_window,
    input = [
        "EHLO client.example.org\r\n",
        "MAIL FROM:<john@doe.example>\r\n\
         DATA\r\n",
        "QUIT\r\n",
    ],
    expected = [
        greeting(),
        capabilities(),
        "250 2.0.0 Ok\r\n\
         502 5.5.1 Missing RCPT TO command\r\n",
        "221 2.0.0 Service closing transmission channel\r\n",
    ],
}

run_pipelined_test! {
    fn recipient_refusal_keeps_the_order,
    input = [
        "EHLO client.example.org\r\n",
        "MAIL FROM:<john@doe.example>\r\n\
         RCPT TO:<henry@trusted.example>\r\n\
         RCPT TO:<deny@trusted.example>\r\n\
         DATA\r\n",
        &("X".repeat(10) + "\r\n.\r\n"),
        "QUIT\r\n",
    ],
    expected = [
        greeting(),
        capabilities(),
        "250 2.0.0 Ok\r\n\
         250 2.0.0 Ok\r\n\
         550 5.1.1 Mailbox unavailable\r\n\
         354 Start mail input; end with <CRLF>.<CRLF>\r\n",
        "250 2.0.0 Ok: queued\r\n",
        "221 2.0.0 Service closing transmission channel\r\n",
    ],
}

run_pipelined_test! {
    fn reset_pipelined_after_the_body,
    input = [
        "EHLO client.example.org\r\n",
        "MAIL FROM:<john@doe.example>\r\n\
         RCPT TO:<henry@trusted.example>\r\n\
         DATA\r\n",
        &("X".repeat(10) + "\r\n.\r\nRSET\r\n"),
        "MAIL FROM:<john@doe.example>\r\n",
        "QUIT\r\n",
    ],
    expected = [
        greeting(),
        capabilities(),
        "250 2.0.0 Ok\r\n\
         250 2.0.0 Ok\r\n\
         354 Start mail input; end with <CRLF>.<CRLF>\r\n",
        "250 2.0.0 Ok: queued\r\n\
         250 2.0.0 Ok\r\n",
        "250 2.0.0 Ok\r\n",
        "221 2.0.0 Service closing transmission channel\r\n",
    ],
}
