//! SMTP reply formatting.
//!
//! A reply is a three-digit code plus one or more text lines. On the wire
//! every line but the last uses `NNN-text`, the last uses `NNN text`, each
//! terminated with CRLF, per RFC 5321 section 4.2.

use core::fmt::{self, Display, Formatter};

/// A formatted server reply, ready to be written to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    code: u16,
    lines: Vec<String>,
}

impl Reply {
    /// Builds a single-line reply.
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Reply {
            code,
            lines: vec![text.into()],
        }
    }

    /// Builds a multi-line reply. Every line shares the same code; all but
    /// the last are emitted with the `-` continuation separator.
    pub fn with_lines(code: u16, lines: Vec<String>) -> Self {
        debug_assert!(!lines.is_empty(), "a reply needs at least one line");
        Reply { code, lines }
    }

    /// The three-digit reply code.
    pub fn code(&self) -> u16 {
        self.code
    }

    /// The reply text lines, without codes or separators.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

impl Display for Reply {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        let last = self.lines.len().saturating_sub(1);
        for (i, line) in self.lines.iter().enumerate() {
            let sep = if i < last { '-' } else { ' ' };
            write!(fmt, "{}{}{}\r\n", self.code, sep, line)?;
        }
        Ok(())
    }
}
