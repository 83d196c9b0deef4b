//! Lexer for SMTP command lines.
//!
//! Turns one CRLF-stripped, length-checked line into a [`Command`]. The lexer
//! is total: it never fails, and anything it cannot make sense of becomes
//! `Command::Unknown` carrying the raw line. Sequencing decisions belong to
//! the state machine, not here.

use core::fmt::{self, Display, Formatter};

/// One parsed SMTP command.
///
/// The `MailFrom`/`RcptTo` payloads are the path string found inside the
/// angle brackets of the command's address token; an empty `MailFrom` path is
/// the null reverse-path (`MAIL FROM:<>`) used for bounces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Helo(String),
    Ehlo(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    Reset,
    Noop,
    Quit,
    Vrfy(String),
    StartTls,
    /// Anything unrecognized or malformed, carrying the raw trimmed line.
    Unknown(String),
}

impl Display for Command {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(domain) => write!(fmt, "HELO {domain}"),
            Self::Ehlo(domain) => write!(fmt, "EHLO {domain}"),
            Self::MailFrom(path) => write!(fmt, "MAIL FROM:<{path}>"),
            Self::RcptTo(path) => write!(fmt, "RCPT TO:<{path}>"),
            Self::Data => fmt.write_str("DATA"),
            Self::Reset => fmt.write_str("RSET"),
            Self::Noop => fmt.write_str("NOOP"),
            Self::Quit => fmt.write_str("QUIT"),
            Self::Vrfy(addr) => write!(fmt, "VRFY {addr}"),
            Self::StartTls => fmt.write_str("STARTTLS"),
            Self::Unknown(raw) => fmt.write_str(raw),
        }
    }
}

impl From<&str> for Command {
    fn from(line: &str) -> Self {
        let trimmed = line.trim_matches(|c: char| c.is_ascii_whitespace());

        // Split the verb off at the first whitespace run; the rest (if any)
        // is the parameter string.
        let (verb, params) = match trimmed.find(|c: char| c.is_ascii_whitespace()) {
            Some(idx) => {
                let (verb, rest) = trimmed.split_at(idx);
                (verb, rest.trim_start_matches(|c: char| c.is_ascii_whitespace()))
            }
            None => (trimmed, ""),
        };

        match verb.to_ascii_uppercase().as_str() {
            "HELO" if !params.is_empty() => Self::Helo(params.to_string()),
            "EHLO" if !params.is_empty() => Self::Ehlo(params.to_string()),
            "VRFY" if !params.is_empty() => Self::Vrfy(params.to_string()),
            "MAIL" => match address_token(params, "FROM:") {
                Some(path) => Self::MailFrom(path),
                None => Self::Unknown(trimmed.to_string()),
            },
            "RCPT" => match address_token(params, "TO:") {
                Some(path) => Self::RcptTo(path),
                None => Self::Unknown(trimmed.to_string()),
            },
            // Extra parameters after these verbs are tolerated and ignored.
            "DATA" => Self::Data,
            "RSET" => Self::Reset,
            "NOOP" => Self::Noop,
            "QUIT" => Self::Quit,
            "STARTTLS" => Self::StartTls,
            _ => Self::Unknown(trimmed.to_string()),
        }
    }
}

/// Extracts the path from a `MAIL FROM:` / `RCPT TO:` parameter string.
///
/// The parameters must begin (case-insensitively) with `prefix`; the
/// remainder is the address token, with one enclosing `<…>` pair stripped
/// when present. The stripped content may be empty (the null reverse-path).
/// Returns `None` when the prefix is missing.
fn address_token(params: &str, prefix: &str) -> Option<String> {
    // `get` keeps the split on a char boundary; arbitrary junk after the
    // verb must not be able to panic the lexer.
    let head = params.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }

    let token = params[prefix.len()..].trim_matches(|c: char| c.is_ascii_whitespace());
    let path = token
        .strip_prefix('<')
        .and_then(|rest| rest.strip_suffix('>'))
        .unwrap_or(token);

    Some(path.to_string())
}
