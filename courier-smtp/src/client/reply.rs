use std::fmt::{self, Display};

use super::error::{ClientError, Result};

/// A complete, possibly multi-line, SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    #[must_use]
    pub const fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// The reply text with continuation lines joined by newlines.
    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join("\n")
    }

    /// 2xx and 3xx (DATA's 354 is a positive intermediate reply).
    #[must_use]
    pub const fn is_positive(&self) -> bool {
        self.code >= 200 && self.code < 400
    }

    #[must_use]
    pub const fn is_transient(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    /// Whether an EHLO reply advertises `keyword` (case-insensitive).
    ///
    /// The first line is the server greeting and is not considered.
    #[must_use]
    pub fn has_extension(&self, keyword: &str) -> bool {
        self.lines.iter().skip(1).any(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(keyword))
        })
    }

    /// Whether the `AUTH` extension lists `mechanism`.
    #[must_use]
    pub fn has_auth_mechanism(&self, mechanism: &str) -> bool {
        self.lines.iter().skip(1).any(|line| {
            let mut words = line.split_whitespace();
            words
                .next()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("AUTH"))
                && words.any(|offered| offered.eq_ignore_ascii_case(mechanism))
        })
    }

    /// Tries to take one complete reply off the front of `buffer`.
    ///
    /// Returns the reply and the number of bytes it occupied, or `None`
    /// when the buffer ends before the final line of the reply.
    ///
    /// # Errors
    ///
    /// Fails when a line does not start with a three digit code, uses an
    /// unknown separator, or changes code part way through a reply.
    pub fn parse(buffer: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut consumed = 0;
        let mut code = None;
        let mut lines = Vec::new();

        while let Some(end) = buffer[consumed..].iter().position(|&b| b == b'\n') {
            let raw = &buffer[consumed..consumed + end];
            consumed += end + 1;

            let line = std::str::from_utf8(raw)?.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }

            let (line_code, last, text) = split_line(line)?;
            match code {
                None => code = Some(line_code),
                Some(expected) if expected != line_code => {
                    return Err(ClientError::Parse(format!(
                        "Reply code changed from {expected} to {line_code} within one reply"
                    )));
                }
                Some(_) => {}
            }

            lines.push(text.to_string());

            if last {
                return Ok(code.map(|code| (Self::new(code, lines), consumed)));
            }
        }

        Ok(None)
    }
}

fn split_line(line: &str) -> Result<(u16, bool, &str)> {
    let Some(digits) = line.get(..3) else {
        return Err(ClientError::Parse(format!("Reply line too short: '{line}'")));
    };

    let code = digits
        .parse::<u16>()
        .map_err(|_| ClientError::Parse(format!("Invalid reply code: '{digits}'")))?;

    match line.as_bytes().get(3) {
        None => Ok((code, true, "")),
        Some(b' ') => Ok((code, true, &line[4..])),
        Some(b'-') => Ok((code, false, &line[4..])),
        Some(other) => Err(ClientError::Parse(format!(
            "Invalid separator '{}' in '{line}'",
            char::from(*other)
        ))),
    }
}

impl Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.lines.join(" "))
    }
}
