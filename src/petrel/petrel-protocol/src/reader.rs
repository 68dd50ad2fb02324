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

use crate::{
    command::{self, Batch},
    Error,
};
use petrel_common::Reply;
use tokio::io::AsyncReadExt;

/// Default longest acceptable line, CRLF included: twice the RFC 5321
/// minimum of 1000 octets, leaving room for AUTH and SMTPUTF8 growth.
pub const DEFAULT_LINE_MAX: usize = 2000;

fn find_crlf(bytes: &[u8]) -> Option<usize> {
    memchr::memmem::find(bytes, b"\r\n")
}

/// Buffered CRLF framer over the inbound half of a connection.
///
/// Every protocol read path is derived from it: pipelined command windows,
/// the dot-stuffed message stream, raw BDAT chunks and, on the client side,
/// multi-line replies. All inbound lines are mirrored at trace level.
#[derive(Debug)]
pub struct Reader<R: tokio::io::AsyncRead + Unpin + Send> {
    inner: R,
    buffer: bytes::BytesMut,
    additional_reserve: usize,
    line_max: usize,
    read_timeout: Option<std::time::Duration>,
    pipelining_enabled: bool,
}

impl<R: tokio::io::AsyncRead + Unpin + Send> Reader<R> {
    /// Create a new framer.
    #[must_use]
    #[inline]
    pub fn new(
        tcp_stream: R,
        line_max: usize,
        read_timeout: Option<std::time::Duration>,
        enable_pipelining: bool,
    ) -> Self {
        Self {
            inner: tcp_stream,
            buffer: bytes::BytesMut::with_capacity(80),
            additional_reserve: 100,
            line_max,
            read_timeout,
            pipelining_enabled: enable_pipelining,
        }
    }

    /// Consume the instance and return the underlying reader.
    ///
    /// Any buffered-but-unparsed bytes are dropped with the framer, which is
    /// what the STARTTLS upgrade needs (RFC 3207 §4.2: plaintext queued
    /// before the handshake must not survive it).
    #[must_use]
    #[inline]
    pub fn into_inner(self) -> R {
        self.inner
    }

    async fn read_more(&mut self) -> Result<usize, Error> {
        self.buffer.reserve(self.additional_reserve);
        let read = match self.read_timeout {
            Some(deadline) => {
                tokio::time::timeout(deadline, self.inner.read_buf(&mut self.buffer))
                    .await
                    .map_err(|_elapsed| Error::Timeout {
                        after: deadline,
                        doing: "reading from the peer",
                    })??
            }
            None => self.inner.read_buf(&mut self.buffer).await?,
        };
        Ok(read)
    }

    /// The next CRLF-terminated line, terminator included, or `None` once
    /// the peer closed the stream.
    ///
    /// # Errors
    ///
    /// * [`Error::LineTooLong`] once more than the limit is buffered without
    ///   a CRLF; unread bytes remain, the connection must be closed
    /// * [`Error::Timeout`] when the read deadline expires
    /// * transport errors from the underlying stream
    #[inline]
    pub async fn next_line(&mut self) -> Result<Option<Vec<u8>>, Error> {
        loop {
            if let Some(pos) = find_crlf(&self.buffer) {
                if pos + 2 > self.line_max {
                    return Err(Error::LineTooLong {
                        limit: self.line_max,
                    });
                }
                let line = self.buffer.split_to(pos + 2);
                return Ok(Some(Vec::<u8>::from(line)));
            }
            if self.buffer.len() >= self.line_max {
                return Err(Error::LineTooLong {
                    limit: self.line_max,
                });
            }
            if self.read_more().await? == 0 {
                // a partial line at EOF is dropped with the connection
                return Ok(None);
            }
        }
    }

    /// One batch of parsed commands: a full TCP window when pipelining is
    /// enabled, a single command otherwise. An empty batch means the peer
    /// closed the connection.
    ///
    /// A batch is cut short at any verb whose following bytes are not
    /// commands (DATA, BDAT, AUTH, STARTTLS, QUIT) so that message bodies,
    /// chunk payloads and SASL exchanges stay in the buffer for the
    /// dedicated readers.
    ///
    /// # Errors
    ///
    /// * see [`Reader::next_line`]
    #[inline]
    pub async fn next_batch(&mut self) -> Result<Batch, Error> {
        let mut batch: Batch = vec![];
        loop {
            match self.next_line().await? {
                None => return Ok(batch),
                Some(line) => {
                    tracing::trace!("<< {:?}", std::str::from_utf8(&line));
                    let (verb, args) = command::parse_command_line(line);
                    let barrier = verb.ends_window() || !self.pipelining_enabled;
                    batch.push((verb, args));
                    if barrier || self.buffer.is_empty() {
                        return Ok(batch);
                    }
                }
            }
        }
    }

    /// [`Reader::next_batch`] as a stream, ending after the batch that hit
    /// EOF.
    #[inline]
    pub fn as_window_stream(
        &mut self,
    ) -> impl tokio_stream::Stream<Item = Result<Batch, Error>> + '_ {
        async_stream::stream! {
            loop {
                match self.next_batch().await {
                    Ok(batch) => {
                        let eof = batch.is_empty();
                        yield Ok(batch);
                        if eof {
                            return;
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        }
    }

    /// The dot-stuffed message body of a DATA transfer: each item is one
    /// line with its CRLF, a single leading `.` removed, ending silently at
    /// the `.` terminator line.
    ///
    /// `finished` flips to `true` when the terminator has been consumed, so
    /// the caller knows whether [`Reader::drain_message`] still has to run.
    #[inline]
    pub fn as_message_stream(
        &mut self,
        size_max: Option<usize>,
        finished: std::sync::Arc<std::sync::atomic::AtomicBool>,
    ) -> impl tokio_stream::Stream<Item = Result<Vec<u8>, Error>> + '_ {
        async_stream::stream! {
            let mut size = 0_usize;
            loop {
                let mut line = match self.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        yield Err(Error::aborted("connection closed during the message"));
                        return;
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                tracing::trace!("<< {:?}", std::str::from_utf8(&line));

                if line == b".\r\n" {
                    finished.store(true, std::sync::atomic::Ordering::Release);
                    return;
                }
                if line.first() == Some(&b'.') {
                    line = line[1..].to_vec();
                }

                size += line.len();
                if let Some(max) = size_max {
                    if size > max {
                        yield Err(Error::MessageSizeExceeded { limit: max });
                        return;
                    }
                }
                yield Ok(line);
            }
        }
    }

    /// Consume body lines up to the `.` terminator so that the protocol
    /// cursor lands on the next command, whatever the backend left behind.
    ///
    /// # Errors
    ///
    /// * the peer closed or a line broke the framer before the terminator
    #[inline]
    pub async fn drain_message(&mut self) -> Result<(), Error> {
        loop {
            match self.next_line().await? {
                None => return Err(Error::aborted("connection closed during the message")),
                Some(line) if line == b".\r\n" => return Ok(()),
                Some(_) => {}
            }
        }
    }

    /// Exactly `size` raw bytes of a BDAT chunk, yielded as they arrive.
    /// The line limit does not apply here.
    #[inline]
    pub fn as_chunk_stream(
        &mut self,
        size: u64,
    ) -> impl tokio_stream::Stream<Item = Result<Vec<u8>, Error>> + '_ {
        async_stream::stream! {
            let mut remaining = size;
            while remaining > 0 {
                if self.buffer.is_empty() {
                    match self.read_more().await {
                        Ok(0) => {
                            yield Err(Error::aborted("connection closed inside a chunk"));
                            return;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
                let take = self
                    .buffer
                    .len()
                    .min(usize::try_from(remaining).unwrap_or(usize::MAX));
                let block = self.buffer.split_to(take);
                remaining -= take as u64;
                tracing::trace!("<< {take} chunk bytes, {remaining} to go");
                yield Ok(Vec::<u8>::from(block));
            }
        }
    }

    /// Discard exactly `size` raw bytes, keeping the wire framed after a
    /// refused chunk.
    ///
    /// # Errors
    ///
    /// * the peer closed before sending the whole chunk
    #[inline]
    pub async fn discard_chunk(&mut self, size: u64) -> Result<(), Error> {
        let stream = self.as_chunk_stream(size);
        tokio::pin!(stream);
        while let Some(block) = tokio_stream::StreamExt::next(&mut stream).await {
            block?;
        }
        Ok(())
    }

    /// Produce a stream of parsed SMTP replies, multi-line continuations
    /// assembled. This is the client's receive path.
    #[inline]
    pub fn as_reply_stream(
        &mut self,
    ) -> impl tokio_stream::Stream<Item = Result<Reply, Error>> + '_ {
        async_stream::stream! {
            loop {
                let mut wire = Vec::<u8>::new();
                loop {
                    match self.next_line().await {
                        Ok(Some(line)) => {
                            tracing::trace!("<< {:?}", std::str::from_utf8(&line));
                            let done = line.get(3) != Some(&b'-');
                            wire.extend_from_slice(&line);
                            if done {
                                break;
                            }
                        }
                        Ok(None) if wire.is_empty() => return,
                        Ok(None) => {
                            yield Err(Error::UnexpectedEof);
                            return;
                        }
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
                let parsed: Result<Reply, Error> = std::str::from_utf8(&wire)
                    .map_err(|e| {
                        Error::from(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
                    })
                    .and_then(|text| {
                        text.parse::<Reply>().map_err(|e| {
                            Error::from(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
                        })
                    });
                let failed = parsed.is_err();
                yield parsed;
                if failed {
                    return;
                }
            }
        }
    }
}
