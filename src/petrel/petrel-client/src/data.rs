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

//! Dot stuffing for DATA (RFC 5321 §4.5.2): a `.` at the start of any line
//! is doubled so that the bare `.` line stays the terminator.

#[derive(Clone, Copy, PartialEq, Eq)]
enum LineState {
    /// Start of the message or right after a CRLF.
    Start,
    /// Mid-line.
    Normal,
    /// Saw CR, waiting for the LF.
    SawCr,
}

/// Streaming dot-stuffer. Bytes pass through untouched except for the extra
/// `.` inserted before a line-leading `.`; the terminator logic guarantees
/// the message ends with `CRLF.CRLF` whatever the caller wrote last.
pub struct DotStuffer {
    state: LineState,
    emitted: bool,
}

impl Default for DotStuffer {
    #[inline]
    fn default() -> Self {
        Self {
            state: LineState::Start,
            emitted: false,
        }
    }
}

impl DotStuffer {
    /// Fresh stuffer, positioned at the start of a line.
    #[must_use]
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one chunk, handing every slice to write to `out`.
    #[inline]
    pub fn process_chunk<F>(&mut self, chunk: &[u8], mut out: F)
    where
        F: FnMut(&[u8]),
    {
        let mut start = 0;
        for (i, byte) in chunk.iter().copied().enumerate() {
            match self.state {
                LineState::Start => {
                    if byte == b'.' {
                        out(&chunk[start..i]);
                        out(b".");
                        start = i;
                    }
                    self.state = if byte == b'\r' {
                        LineState::SawCr
                    } else {
                        LineState::Normal
                    };
                }
                LineState::Normal => {
                    if byte == b'\r' {
                        self.state = LineState::SawCr;
                    }
                }
                LineState::SawCr => {
                    self.state = match byte {
                        b'\n' => LineState::Start,
                        b'\r' => LineState::SawCr,
                        _ => LineState::Normal,
                    };
                }
            }
        }
        if start < chunk.len() {
            self.emitted = true;
            out(&chunk[start..]);
        }
    }

    /// Emit the terminator, completing a missing final CRLF first, and
    /// reset for the next message.
    #[inline]
    pub fn end_message<F>(&mut self, mut out: F)
    where
        F: FnMut(&[u8]),
    {
        match self.state {
            LineState::Start if self.emitted => out(b".\r\n"),
            LineState::SawCr => out(b"\n.\r\n"),
            LineState::Start | LineState::Normal => out(b"\r\n.\r\n"),
        }
        self.state = LineState::Start;
        self.emitted = false;
    }
}
