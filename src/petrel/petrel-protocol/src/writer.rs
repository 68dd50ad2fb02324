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

use crate::{Error, Verb};
use petrel_common::Reply;
use tokio::io::AsyncWriteExt;

/// Reply writer with a pipelining buffer.
///
/// Replies to bufferable verbs are held back and flushed in one write when
/// the window ends (RFC 2920); replies that gate the dialogue (354, the EHLO
/// list, 221...) bypass the buffer. Every write runs under the configured
/// deadline.
#[allow(clippy::module_name_repetitions)]
pub struct WindowWriter<W: tokio::io::AsyncWrite + Unpin + Send> {
    inner: W,
    buffer: Vec<Reply>,
    write_timeout: Option<std::time::Duration>,
}

impl<W: tokio::io::AsyncWrite + Unpin + Send> WindowWriter<W> {
    /// Create a new writer.
    #[inline]
    #[must_use]
    pub const fn new(inner: W, write_timeout: Option<std::time::Duration>) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            write_timeout,
        }
    }

    /// Consume the instance and return the underlying writer.
    #[inline]
    #[must_use]
    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Are replies waiting for the window flush ?
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Send raw bytes under the write deadline.
    ///
    /// # Errors
    ///
    /// * [`Error::Timeout`] when the deadline expires; the caller closes the
    ///   connection without further output
    /// * transport errors from the underlying writer
    #[inline]
    pub async fn write_all(&mut self, buffer: &str) -> Result<(), Error> {
        tracing::trace!(">> {:?}", buffer);
        self.write_all_bytes(buffer.as_bytes()).await
    }

    /// Send raw bytes under the write deadline, without the trace mirror.
    ///
    /// # Errors
    ///
    /// * see [`WindowWriter::write_all`]
    #[inline]
    pub async fn write_all_bytes(&mut self, buffer: &[u8]) -> Result<(), Error> {
        match self.write_timeout {
            Some(deadline) => tokio::time::timeout(deadline, self.inner.write_all(buffer))
                .await
                .map_err(|_elapsed| Error::Timeout {
                    after: deadline,
                    doing: "writing to the peer",
                })??,
            None => self.inner.write_all(buffer).await?,
        }
        Ok(())
    }

    /// Send a reply immediately, flushing any buffered window first.
    ///
    /// # Errors
    ///
    /// * see [`WindowWriter::write_all`]
    #[inline]
    pub async fn direct_send_reply(&mut self, reply: Reply) -> Result<(), Error> {
        if !self.buffer.is_empty() {
            self.flush().await?;
        }
        self.write_all(reply.as_ref()).await
    }

    /// Buffer the reply when its verb allows it, send it directly otherwise.
    ///
    /// # Errors
    ///
    /// * see [`WindowWriter::write_all`]
    #[inline]
    pub async fn send_reply(&mut self, reply: Reply, verb: Verb) -> Result<(), Error> {
        if verb.is_bufferable() {
            self.buffer.push(reply);
            return Ok(());
        }
        self.direct_send_reply(reply).await
    }

    /// Send every buffered reply in one write.
    ///
    /// # Errors
    ///
    /// * see [`WindowWriter::write_all`]
    #[inline]
    pub async fn flush(&mut self) -> Result<(), Error> {
        let full_response: String = self
            .buffer
            .drain(..)
            .map(|reply| reply.as_ref().to_owned())
            .collect::<Vec<_>>()
            .concat();
        if full_response.is_empty() {
            return Ok(());
        }
        self.write_all(&full_response).await
    }
}
