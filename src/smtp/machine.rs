//! The SMTP command state machine.
//!
//! Implements the RFC 5321 command sequencing rules as a pure transition
//! function over `(state, command)`. The machine owns the current
//! [`SessionState`] and the in-flight [`Transaction`]; it performs no I/O.
//! The session feeds it one [`Command`] at a time and acts on the returned
//! [`Action`]: writing the reply, collecting the message body after DATA, or
//! performing the TLS upgrade after STARTTLS.

use bytes::Bytes;

use super::command::Command;
use super::error::SessionError;
use super::reply::Reply;
use super::Message;

/// The sequencing states of one SMTP dialogue.
///
/// `DataBody` is never entered by a command directly: the machine accepts
/// DATA from `Recipient` and the session then drives the body sub-protocol,
/// finishing it with [`StateMachine::complete_data`].
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SessionState {
    /// Connected, greeting sent, no HELO/EHLO seen yet.
    Initial,
    /// HELO/EHLO accepted; ready for a mail transaction.
    Greeted,
    /// MAIL FROM accepted; waiting for recipients.
    Mail,
    /// At least one RCPT TO accepted; more recipients or DATA may follow.
    Recipient,
    /// DATA accepted; the session is collecting body lines.
    DataBody,
    /// QUIT accepted; the session is over.
    Quit,
}

/// The envelope being assembled between MAIL FROM and the end of DATA.
///
/// Exists exactly while the state is `Mail`, `Recipient`, or `DataBody`;
/// cleared on commit, RSET, HELO/EHLO, and TLS upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// The reverse-path; empty for the null sender.
    pub from: String,
    /// The forward-paths, in the order they were accepted. Append-only.
    pub recipients: Vec<String>,
}

impl Transaction {
    fn new(from: String) -> Self {
        Transaction {
            from,
            recipients: Vec::new(),
        }
    }
}

/// What the session must do with a processed command.
#[derive(Debug, PartialEq, Eq)]
pub enum Action {
    /// The command was accepted; write the reply and keep reading commands.
    Accept(Reply),
    /// The command was rejected; write the reply and keep reading commands.
    /// State and transaction are untouched.
    Reject(Reply),
    /// QUIT: write the reply, then close the connection.
    Close(Reply),
    /// DATA was accepted: write the 354 reply, then collect body lines until
    /// the lone-dot terminator and call [`StateMachine::complete_data`].
    StartData(Reply),
    /// STARTTLS was accepted: write the 220 reply, discard any read-ahead
    /// bytes, and perform the TLS handshake on the connection.
    UpgradeTls(Reply),
}

/// The per-connection protocol state machine.
#[derive(Debug)]
pub struct StateMachine {
    domain: String,
    max_message_size: usize,
    state: SessionState,
    transaction: Option<Transaction>,
    /// TLS is configured at the server level, so STARTTLS may be offered.
    tls_available: bool,
    /// The handshake has completed on this connection. Monotonic.
    tls_active: bool,
}

impl StateMachine {
    /// Creates a machine for a fresh connection.
    ///
    /// `domain` appears in replies; `max_message_size` is advertised through
    /// the EHLO `SIZE` capability; `tls_available` controls whether STARTTLS
    /// is advertised and accepted.
    pub fn new(domain: impl Into<String>, max_message_size: usize, tls_available: bool) -> Self {
        StateMachine {
            domain: domain.into(),
            max_message_size,
            state: SessionState::Initial,
            transaction: None,
            tls_available,
            tls_active: false,
        }
    }

    /// The current sequencing state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the TLS handshake has completed on this connection.
    pub fn is_tls_active(&self) -> bool {
        self.tls_active
    }

    /// The in-flight transaction, if any.
    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    /// Processes one command, mutating state and transaction only when the
    /// command is accepted, and returns the action the session must take.
    pub fn process(&mut self, command: Command) -> Action {
        if self.state == SessionState::Quit {
            // Unreachable through the session (it closes on Quit), but the
            // machine stays total.
            return Action::Reject(Reply::new(503, "Bad sequence of commands"));
        }

        match command {
            Command::Helo(client) => {
                self.transaction = None;
                self.state = SessionState::Greeted;
                Action::Accept(Reply::new(250, format!("{} Hello {}", self.domain, client)))
            }
            Command::Ehlo(client) => {
                self.transaction = None;
                self.state = SessionState::Greeted;
                Action::Accept(self.ehlo_reply(&client))
            }
            Command::MailFrom(path) => match self.state {
                SessionState::Initial => {
                    Action::Reject(Reply::new(503, "Send HELO/EHLO first"))
                }
                SessionState::Greeted | SessionState::Mail | SessionState::Recipient => {
                    // A new MAIL FROM replaces any half-built envelope.
                    let reply = Reply::new(250, format!("Sender <{}> OK", path));
                    self.transaction = Some(Transaction::new(path));
                    self.state = SessionState::Mail;
                    Action::Accept(reply)
                }
                _ => Action::Reject(Reply::new(503, "Bad sequence of commands")),
            },
            Command::RcptTo(path) => match self.state {
                SessionState::Initial => {
                    Action::Reject(Reply::new(503, "Send HELO/EHLO first"))
                }
                SessionState::Greeted => Action::Reject(Reply::new(503, "Send MAIL FROM first")),
                SessionState::Mail | SessionState::Recipient => {
                    let reply = Reply::new(250, format!("Recipient <{}> OK", path));
                    match self.transaction.as_mut() {
                        Some(transaction) => transaction.recipients.push(path),
                        // Transaction existence is tied to the state; reaching
                        // here without one is a bug, not a protocol error.
                        None => {
                            return Action::Reject(Reply::new(451, "Local error in processing"))
                        }
                    }
                    self.state = SessionState::Recipient;
                    Action::Accept(reply)
                }
                _ => Action::Reject(Reply::new(503, "Bad sequence of commands")),
            },
            Command::Data => match self.state {
                SessionState::Initial => {
                    Action::Reject(Reply::new(503, "Send HELO/EHLO first"))
                }
                SessionState::Greeted => Action::Reject(Reply::new(503, "Send MAIL FROM first")),
                SessionState::Mail => Action::Reject(Reply::new(503, "Send RCPT TO first")),
                SessionState::Recipient => {
                    self.state = SessionState::DataBody;
                    Action::StartData(Reply::new(
                        354,
                        "Start mail input; end with <CRLF>.<CRLF>",
                    ))
                }
                _ => Action::Reject(Reply::new(503, "Bad sequence of commands")),
            },
            Command::Reset => {
                self.transaction = None;
                self.state = SessionState::Greeted;
                Action::Accept(Reply::new(250, "Reset OK"))
            }
            Command::Noop => Action::Accept(Reply::new(250, "OK")),
            Command::Quit => {
                self.transaction = None;
                self.state = SessionState::Quit;
                Action::Close(Reply::new(
                    221,
                    format!("{} closing connection", self.domain),
                ))
            }
            Command::Vrfy(_) => Action::Reject(Reply::new(502, "Command not implemented")),
            Command::StartTls => {
                if self.state != SessionState::Greeted {
                    Action::Reject(Reply::new(503, "Bad sequence of commands"))
                } else if self.tls_active {
                    Action::Reject(Reply::new(502, "TLS already active"))
                } else if !self.tls_available {
                    Action::Reject(Reply::new(502, "STARTTLS not available"))
                } else {
                    // The client must re-greet over the encrypted stream, so
                    // the dialogue restarts from Initial.
                    self.transaction = None;
                    self.state = SessionState::Initial;
                    Action::UpgradeTls(Reply::new(220, "Ready to start TLS"))
                }
            }
            Command::Unknown(_) => Action::Reject(Reply::new(500, "Unknown command")),
        }
    }

    /// Commits the body collected by the session: clears the transaction,
    /// returns to `Greeted`, and yields the 250 reply alongside the finished
    /// [`Message`].
    ///
    /// # Errors
    ///
    /// Returns an internal error if called outside the `DataBody` state.
    pub fn complete_data(&mut self, body: Bytes) -> Result<(Reply, Message), SessionError> {
        if self.state != SessionState::DataBody {
            return Err(SessionError::Internal(format!(
                "complete_data called in state {:?}",
                self.state
            )));
        }

        let transaction = self.transaction.take().ok_or_else(|| {
            SessionError::Internal("no transaction at end of DATA".to_string())
        })?;
        self.state = SessionState::Greeted;

        let message = Message {
            from: transaction.from,
            recipients: transaction.recipients,
            data: body,
        };

        Ok((Reply::new(250, "Message accepted for delivery"), message))
    }

    /// Records a successful TLS handshake. `tls_active` flips true (it never
    /// reverses) and any envelope state from the plaintext phase is dropped.
    pub fn tls_established(&mut self) {
        self.tls_active = true;
        self.transaction = None;
        self.state = SessionState::Initial;
    }

    /// Builds the multi-line EHLO reply. `STARTTLS` is advertised only while
    /// TLS is configured and the connection is still plaintext.
    fn ehlo_reply(&self, client: &str) -> Reply {
        let mut lines = vec![format!("{} Hello {}", self.domain, client)];
        if self.tls_available && !self.tls_active {
            lines.push("STARTTLS".to_string());
        }
        lines.push(format!("SIZE {}", self.max_message_size));
        lines.push("8BITMIME".to_string());
        Reply::with_lines(250, lines)
    }
}
