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

/// Three-integer status code accompanying a basic reply code, see RFC 2034.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde_with::SerializeDisplay, serde_with::DeserializeFromStr)]
pub struct EnhancedCode(
    /// Class, agreeing with the first digit of the basic code.
    pub u16,
    /// Subject.
    pub u16,
    /// Detail.
    pub u16,
);

impl std::fmt::Display for EnhancedCode {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

impl std::str::FromStr for EnhancedCode {
    type Err = InvalidReply;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut cursor = crate::parser::Cursor::new(s.as_bytes());
        let code = crate::parser::parse_enhanced_code(&mut cursor)
            .map_err(|_e| InvalidReply::BadEnhancedCode(s.to_owned()))?;
        if !cursor.is_eof() {
            return Err(InvalidReply::BadEnhancedCode(s.to_owned()));
        }
        Ok(code)
    }
}

impl EnhancedCode {
    /// Does the class digit agree with the basic code it decorates ?
    #[must_use]
    #[inline]
    pub const fn matches(&self, code: u16) -> bool {
        self.0 == code / 100
    }
}

/// Error produced when parsing a wire reply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum InvalidReply {
    /// The buffer did not even hold `NNN<SP>`.
    #[error("reply line too short: {0:?}")]
    TooShort(String),
    /// Reply code outside of 100..=599 or non-numeric.
    #[error("invalid reply code: {0:?}")]
    BadCode(String),
    /// Continuation lines carried inconsistent codes.
    #[error("reply code changed mid-reply: {0} then {1}")]
    CodeMismatch(u16, u16),
    /// The continuation marker was neither ' ' nor '-'.
    #[error("invalid reply separator: {0:?}")]
    BadSeparator(String),
    /// A `x.y.z` token failed to parse.
    #[error("invalid enhanced status code: {0:?}")]
    BadEnhancedCode(String),
    /// Multi-line reply without a terminating `NNN<SP>` line.
    #[error("unterminated multi-line reply")]
    Unterminated,
}

/// An SMTP reply: basic code, optional enhanced status code and one or more
/// text lines.
///
/// The folded wire form is cached so that writing a reply is an allocation
/// free `as_ref()`.
#[derive(Debug, Clone, PartialEq, Eq, serde_with::SerializeDisplay, serde_with::DeserializeFromStr)]
pub struct Reply {
    code: u16,
    enhanced: Option<EnhancedCode>,
    lines: Vec<String>,
    folded: String,
}

impl Reply {
    /// Build a single or multi-line reply without an enhanced code.
    ///
    /// # Panics
    ///
    /// * `code` is outside of 100..=599
    /// * `text` is empty
    #[must_use]
    #[inline]
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self::build(code, None, text.into())
    }

    /// Build a reply carrying an enhanced status code.
    ///
    /// # Panics
    ///
    /// * `code` is outside of 100..=599
    /// * `text` is empty
    #[must_use]
    #[inline]
    pub fn with_enhanced(code: u16, enhanced: EnhancedCode, text: impl Into<String>) -> Self {
        Self::build(code, Some(enhanced), text.into())
    }

    #[allow(clippy::panic)]
    fn build(code: u16, enhanced: Option<EnhancedCode>, text: String) -> Self {
        assert!((100..=599).contains(&code), "reply code out of range: {code}");
        let lines = text
            .split('\n')
            .map(|l| l.trim_end_matches('\r').to_owned())
            .collect::<Vec<_>>();
        assert!(!lines.is_empty(), "reply without text");

        let mut reply = Self {
            code,
            enhanced,
            lines,
            folded: String::new(),
        };
        reply.refold();
        reply
    }

    /// Append a text line, refolding the cached wire form.
    #[inline]
    pub fn push_line(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
        self.refold();
    }

    /// Attach a synthetic `X.0.0` enhanced code to 2xx/4xx/5xx replies that
    /// lack one, as the server does before serialization.
    #[must_use]
    #[inline]
    pub fn or_enhanced_default(mut self) -> Self {
        if self.enhanced.is_none() && matches!(self.code / 100, 2 | 4 | 5) {
            self.enhanced = Some(EnhancedCode(self.code / 100, 0, 0));
            self.refold();
        }
        self
    }

    fn refold(&mut self) {
        use std::fmt::Write;

        let mut folded = String::new();
        let last = self.lines.len() - 1;
        for (i, line) in self.lines.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            #[allow(clippy::expect_used)]
            match self.enhanced {
                Some(enhanced) => write!(folded, "{}{sep}{enhanced} {line}\r\n", self.code),
                None => write!(folded, "{}{sep}{line}\r\n", self.code),
            }
            .expect("write to string is infallible");
        }
        self.folded = folded;
    }

    /// Basic reply code, in 100..=599.
    #[must_use]
    #[inline]
    pub const fn code(&self) -> u16 {
        self.code
    }

    /// Enhanced status code, when one was attached or parsed.
    #[must_use]
    #[inline]
    pub const fn enhanced(&self) -> Option<EnhancedCode> {
        self.enhanced
    }

    /// Text lines, stripped of codes and CRLF.
    #[must_use]
    #[inline]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// All text lines joined with a space, convenient for error messages.
    #[must_use]
    #[inline]
    pub fn text(&self) -> String {
        self.lines.join(" ")
    }

    /// 4xx or 5xx.
    #[must_use]
    #[inline]
    pub const fn is_error(&self) -> bool {
        self.code >= 400
    }

    /// 2xx.
    #[must_use]
    #[inline]
    pub const fn is_positive_completion(&self) -> bool {
        self.code / 100 == 2
    }

    /// 3xx, e.g. `354` or the `334` SASL challenge.
    #[must_use]
    #[inline]
    pub const fn is_intermediate(&self) -> bool {
        self.code / 100 == 3
    }
}

impl AsRef<str> for Reply {
    #[inline]
    fn as_ref(&self) -> &str {
        &self.folded
    }
}

impl std::fmt::Display for Reply {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.folded)
    }
}

/// Split one wire line into `(code, separator, text)`.
fn split_line(line: &str) -> Result<(u16, char, &str), InvalidReply> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.len() < 3 {
        return Err(InvalidReply::TooShort(line.to_owned()));
    }
    let code = line
        .get(..3)
        .and_then(|c| c.parse::<u16>().ok())
        .filter(|c| (100..=599).contains(c))
        .ok_or_else(|| InvalidReply::BadCode(line.to_owned()))?;

    match line.as_bytes().get(3) {
        None => Ok((code, ' ', "")),
        Some(b' ') => Ok((code, ' ', line.get(4..).unwrap_or(""))),
        Some(b'-') => Ok((code, '-', line.get(4..).unwrap_or(""))),
        Some(_) => Err(InvalidReply::BadSeparator(line.to_owned())),
    }
}

/// Strip a leading `x.y.z ` token when it agrees with the reply class.
fn strip_enhanced(code: u16, text: &str) -> (Option<EnhancedCode>, String) {
    let Some((token, rest)) = text.split_once(' ') else {
        return (None, text.to_owned());
    };
    token.parse::<EnhancedCode>().map_or_else(
        |_e| (None, text.to_owned()),
        |enhanced| {
            if enhanced.matches(code) {
                (Some(enhanced), rest.to_owned())
            } else {
                (None, text.to_owned())
            }
        },
    )
}

impl std::str::FromStr for Reply {
    type Err = InvalidReply;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut code = None::<u16>;
        let mut enhanced = None;
        let mut lines = vec![];
        let mut terminated = false;

        for raw in s.split('\n').filter(|l| !l.trim_end_matches('\r').is_empty()) {
            if terminated {
                // trailing garbage after the `NNN<SP>` line
                return Err(InvalidReply::BadSeparator(raw.to_owned()));
            }
            let (line_code, sep, text) = split_line(raw)?;
            match code {
                None => code = Some(line_code),
                Some(previous) if previous != line_code => {
                    return Err(InvalidReply::CodeMismatch(previous, line_code));
                }
                Some(_) => {}
            }
            let (line_enhanced, text) = strip_enhanced(line_code, text);
            if lines.is_empty() {
                enhanced = line_enhanced;
            }
            lines.push(text);
            terminated = sep == ' ';
        }

        let code = code.ok_or(InvalidReply::Unterminated)?;
        if !terminated {
            return Err(InvalidReply::Unterminated);
        }

        let mut reply = Reply {
            code,
            enhanced,
            lines,
            folded: String::new(),
        };
        reply.refold();
        Ok(reply)
    }
}

impl From<crate::SmtpError> for Reply {
    #[inline]
    fn from(error: crate::SmtpError) -> Self {
        match error.enhanced {
            Some(enhanced) => Self::with_enhanced(error.code, enhanced, error.message),
            None => Self::new(error.code, error.message),
        }
    }
}
