//! Session-level tests over in-memory duplex streams.
//!
//! Each test plays the client side of a dialogue byte-for-byte and asserts
//! the exact wire replies, so the framing (codes, separators, CRLF) is
//! checked along with the protocol logic.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::smtp::error::SessionError;
use crate::smtp::session::{unstuff, Session, SessionConfig};
use crate::smtp::{Message, MessageHandler};

fn test_config() -> SessionConfig {
    SessionConfig {
        domain: "localhost".to_string(),
        max_message_size: 10 * 1024 * 1024,
        connection_timeout: Duration::from_secs(300),
        command_timeout: Duration::from_secs(60),
        tls: None,
    }
}

/// A handler that appends every delivered message to a shared vector.
fn collecting_handler(
    received: Arc<Mutex<Vec<Message>>>,
) -> Arc<dyn MessageHandler> {
    Arc::new(move |message: Message| -> anyhow::Result<()> {
        received.lock().unwrap().push(message);
        Ok(())
    })
}

/// Spawns a session over one end of a duplex pipe and returns the client end
/// plus the session's join handle.
fn spawn_session(
    config: SessionConfig,
    handler: Option<Arc<dyn MessageHandler>>,
    shutdown: CancellationToken,
) -> (
    DuplexStream,
    tokio::task::JoinHandle<Result<(), SessionError>>,
) {
    let (client, server) = tokio::io::duplex(16 * 1024);
    let session = Session::new(
        Uuid::new_v4(),
        server,
        "[::1]:49152".parse().unwrap(),
        Arc::new(config),
        handler,
        shutdown,
    );
    (client, tokio::spawn(session.run()))
}

async fn read_reply_line<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> String {
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    line
}

#[tokio::test]
async fn minimal_session_matches_the_wire_transcript() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let (client, handle) = spawn_session(
        test_config(),
        Some(collecting_handler(Arc::clone(&received))),
        CancellationToken::new(),
    );
    let (read_half, mut write_half) = tokio::io::split(client);
    let mut reader = BufReader::new(read_half);

    assert_eq!(
        read_reply_line(&mut reader).await,
        "220 localhost ESMTP Service ready\r\n"
    );

    write_half.write_all(b"EHLO c.example\r\n").await.unwrap();
    assert_eq!(
        read_reply_line(&mut reader).await,
        "250-localhost Hello c.example\r\n"
    );
    assert_eq!(read_reply_line(&mut reader).await, "250-SIZE 10485760\r\n");
    assert_eq!(read_reply_line(&mut reader).await, "250 8BITMIME\r\n");

    write_half.write_all(b"MAIL FROM:<a@b>\r\n").await.unwrap();
    assert_eq!(read_reply_line(&mut reader).await, "250 Sender <a@b> OK\r\n");

    write_half.write_all(b"RCPT TO:<c@d>\r\n").await.unwrap();
    assert_eq!(
        read_reply_line(&mut reader).await,
        "250 Recipient <c@d> OK\r\n"
    );

    write_half.write_all(b"DATA\r\n").await.unwrap();
    assert_eq!(
        read_reply_line(&mut reader).await,
        "354 Start mail input; end with <CRLF>.<CRLF>\r\n"
    );

    write_half.write_all(b"Hi\r\n.\r\n").await.unwrap();
    assert_eq!(
        read_reply_line(&mut reader).await,
        "250 Message accepted for delivery\r\n"
    );

    write_half.write_all(b"QUIT\r\n").await.unwrap();
    assert_eq!(
        read_reply_line(&mut reader).await,
        "221 localhost closing connection\r\n"
    );

    assert!(handle.await.unwrap().is_ok());

    let messages = received.lock().unwrap();
    assert_eq!(messages.len(), 1, "handler should run exactly once");
    assert_eq!(messages[0].from, "a@b");
    assert_eq!(messages[0].recipients, vec!["c@d"]);
    assert_eq!(&messages[0].data[..], b"Hi\r\n");
}

#[tokio::test]
async fn mail_before_greeting_leaves_the_connection_open() {
    let (client, handle) = spawn_session(test_config(), None, CancellationToken::new());
    let (read_half, mut write_half) = tokio::io::split(client);
    let mut reader = BufReader::new(read_half);

    read_reply_line(&mut reader).await; // greeting

    write_half.write_all(b"MAIL FROM:<x@y>\r\n").await.unwrap();
    assert_eq!(
        read_reply_line(&mut reader).await,
        "503 Send HELO/EHLO first\r\n"
    );

    // Still alive: a follow-up command gets answered.
    write_half.write_all(b"NOOP\r\n").await.unwrap();
    assert_eq!(read_reply_line(&mut reader).await, "250 OK\r\n");

    write_half.write_all(b"QUIT\r\n").await.unwrap();
    read_reply_line(&mut reader).await;
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn dot_stuffed_body_lines_are_unstuffed() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let (client, handle) = spawn_session(
        test_config(),
        Some(collecting_handler(Arc::clone(&received))),
        CancellationToken::new(),
    );
    let (read_half, mut write_half) = tokio::io::split(client);
    let mut reader = BufReader::new(read_half);

    read_reply_line(&mut reader).await; // greeting
    write_half
        .write_all(b"EHLO c\r\nMAIL FROM:<a@b>\r\nRCPT TO:<c@d>\r\nDATA\r\n")
        .await
        .unwrap();
    for _ in 0..6 {
        read_reply_line(&mut reader).await; // EHLO x3, MAIL, RCPT, 354
    }

    write_half
        .write_all(b".line1\r\n..line2\r\n.\r\n")
        .await
        .unwrap();
    assert_eq!(
        read_reply_line(&mut reader).await,
        "250 Message accepted for delivery\r\n"
    );

    write_half.write_all(b"QUIT\r\n").await.unwrap();
    read_reply_line(&mut reader).await;
    assert!(handle.await.unwrap().is_ok());

    let messages = received.lock().unwrap();
    assert_eq!(&messages[0].data[..], b"line1\r\n.line2\r\n");
}

#[tokio::test]
async fn over_long_command_line_gets_500_and_the_session_continues() {
    let (client, handle) = spawn_session(test_config(), None, CancellationToken::new());
    let (read_half, mut write_half) = tokio::io::split(client);
    let mut reader = BufReader::new(read_half);

    read_reply_line(&mut reader).await; // greeting

    let mut long_line = b"EHLO ".to_vec();
    long_line.extend(std::iter::repeat(b'x').take(600));
    long_line.extend_from_slice(b"\r\n");
    write_half.write_all(&long_line).await.unwrap();
    assert_eq!(
        read_reply_line(&mut reader).await,
        "500 Command too long (max 512 bytes)\r\n"
    );

    write_half.write_all(b"NOOP\r\n").await.unwrap();
    assert_eq!(read_reply_line(&mut reader).await, "250 OK\r\n");

    write_half.write_all(b"QUIT\r\n").await.unwrap();
    read_reply_line(&mut reader).await;
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn command_line_length_boundaries() {
    let (client, handle) = spawn_session(test_config(), None, CancellationToken::new());
    let (read_half, mut write_half) = tokio::io::split(client);
    let mut reader = BufReader::new(read_half);

    read_reply_line(&mut reader).await; // greeting

    // Exactly 510 content bytes + CRLF: accepted (NOOP ignores its parameters).
    let mut line = b"NOOP ".to_vec();
    line.extend(std::iter::repeat(b'x').take(505));
    assert_eq!(line.len(), 510);
    line.extend_from_slice(b"\r\n");
    write_half.write_all(&line).await.unwrap();
    assert_eq!(read_reply_line(&mut reader).await, "250 OK\r\n");

    // 511 content bytes + CRLF: rejected with 500.
    let mut line = b"NOOP ".to_vec();
    line.extend(std::iter::repeat(b'x').take(506));
    assert_eq!(line.len(), 511);
    line.extend_from_slice(b"\r\n");
    write_half.write_all(&line).await.unwrap();
    assert_eq!(
        read_reply_line(&mut reader).await,
        "500 Command too long (max 512 bytes)\r\n"
    );

    write_half.write_all(b"QUIT\r\n").await.unwrap();
    read_reply_line(&mut reader).await;
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn data_line_length_boundaries() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let (client, handle) = spawn_session(
        test_config(),
        Some(collecting_handler(Arc::clone(&received))),
        CancellationToken::new(),
    );
    let (read_half, mut write_half) = tokio::io::split(client);
    let mut reader = BufReader::new(read_half);

    read_reply_line(&mut reader).await; // greeting
    write_half
        .write_all(b"EHLO c\r\nMAIL FROM:<a@b>\r\nRCPT TO:<c@d>\r\nDATA\r\n")
        .await
        .unwrap();
    for _ in 0..6 {
        read_reply_line(&mut reader).await;
    }

    // Exactly 998 content bytes: accepted silently as body content.
    let mut ok_line = vec![b'a'; 998];
    ok_line.extend_from_slice(b"\r\n");
    write_half.write_all(&ok_line).await.unwrap();

    // 999 content bytes: rejected with 500, body collection continues.
    let mut long_line = vec![b'b'; 999];
    long_line.extend_from_slice(b"\r\n");
    write_half.write_all(&long_line).await.unwrap();
    assert_eq!(
        read_reply_line(&mut reader).await,
        "500 Line too long (max 998 bytes)\r\n"
    );

    write_half.write_all(b".\r\n").await.unwrap();
    assert_eq!(
        read_reply_line(&mut reader).await,
        "250 Message accepted for delivery\r\n"
    );

    write_half.write_all(b"QUIT\r\n").await.unwrap();
    read_reply_line(&mut reader).await;
    assert!(handle.await.unwrap().is_ok());

    // Only the accepted 998-byte line made it into the body.
    let messages = received.lock().unwrap();
    let mut expected = vec![b'a'; 998];
    expected.extend_from_slice(b"\r\n");
    assert_eq!(&messages[0].data[..], &expected[..]);
}

#[tokio::test]
async fn unterminated_flood_overflows_the_buffer() {
    let (client, handle) = spawn_session(test_config(), None, CancellationToken::new());
    let (read_half, mut write_half) = tokio::io::split(client);
    let mut reader = BufReader::new(read_half);

    read_reply_line(&mut reader).await; // greeting

    // 2000 bytes without a CRLF exceed the 3x512 read-ahead ceiling.
    write_half.write_all(&vec![b'z'; 2000]).await.unwrap();
    assert_eq!(
        read_reply_line(&mut reader).await,
        "421 localhost Line limits exceeded, closing connection\r\n"
    );

    // The server closes after the 421.
    let mut rest = Vec::new();
    reader.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
    assert!(matches!(
        handle.await.unwrap(),
        Err(SessionError::BufferOverflow)
    ));
}

#[tokio::test]
async fn oversized_message_gets_552_and_closes() {
    let mut config = test_config();
    config.max_message_size = 10;
    let (client, handle) = spawn_session(config, None, CancellationToken::new());
    let (read_half, mut write_half) = tokio::io::split(client);
    let mut reader = BufReader::new(read_half);

    read_reply_line(&mut reader).await; // greeting
    write_half
        .write_all(b"EHLO c\r\nMAIL FROM:<a@b>\r\nRCPT TO:<c@d>\r\nDATA\r\n")
        .await
        .unwrap();
    for _ in 0..6 {
        read_reply_line(&mut reader).await;
    }

    write_half
        .write_all(b"this body line is too large\r\n.\r\n")
        .await
        .unwrap();
    assert_eq!(
        read_reply_line(&mut reader).await,
        "552 Message exceeds fixed maximum size\r\n"
    );

    let mut rest = Vec::new();
    reader.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
    assert!(matches!(
        handle.await.unwrap(),
        Err(SessionError::MessageTooLarge)
    ));
}

#[tokio::test]
async fn body_within_the_limit_commits() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let mut config = test_config();
    config.max_message_size = 16;
    let (client, handle) = spawn_session(
        config,
        Some(collecting_handler(Arc::clone(&received))),
        CancellationToken::new(),
    );
    let (read_half, mut write_half) = tokio::io::split(client);
    let mut reader = BufReader::new(read_half);

    read_reply_line(&mut reader).await; // greeting
    write_half
        .write_all(b"EHLO c\r\nMAIL FROM:<a@b>\r\nRCPT TO:<c@d>\r\nDATA\r\n")
        .await
        .unwrap();
    for _ in 0..6 {
        read_reply_line(&mut reader).await;
    }

    // 14 bytes of body including CRLFs, within the 16-byte limit.
    write_half.write_all(b"123456\r\n1234\r\n.\r\n").await.unwrap();
    assert_eq!(
        read_reply_line(&mut reader).await,
        "250 Message accepted for delivery\r\n"
    );

    write_half.write_all(b"QUIT\r\n").await.unwrap();
    read_reply_line(&mut reader).await;
    assert!(handle.await.unwrap().is_ok());
    assert_eq!(&received.lock().unwrap()[0].data[..], b"123456\r\n1234\r\n");
}

#[tokio::test]
async fn non_utf8_command_line_gets_500() {
    let (client, handle) = spawn_session(test_config(), None, CancellationToken::new());
    let (read_half, mut write_half) = tokio::io::split(client);
    let mut reader = BufReader::new(read_half);

    read_reply_line(&mut reader).await; // greeting

    write_half.write_all(b"EHLO \xff\xfe\r\n").await.unwrap();
    assert_eq!(
        read_reply_line(&mut reader).await,
        "500 Invalid character encoding\r\n"
    );

    write_half.write_all(b"NOOP\r\n").await.unwrap();
    assert_eq!(read_reply_line(&mut reader).await, "250 OK\r\n");

    write_half.write_all(b"QUIT\r\n").await.unwrap();
    read_reply_line(&mut reader).await;
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn pipelined_commands_are_answered_in_order() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let (client, handle) = spawn_session(
        test_config(),
        Some(collecting_handler(Arc::clone(&received))),
        CancellationToken::new(),
    );
    let (read_half, mut write_half) = tokio::io::split(client);
    let mut reader = BufReader::new(read_half);

    // Everything in one write; replies must still arrive strictly in order.
    write_half
        .write_all(b"EHLO c\r\nMAIL FROM:<a@b>\r\nRCPT TO:<c@d>\r\nDATA\r\nHi\r\n.\r\nQUIT\r\n")
        .await
        .unwrap();

    let expected = [
        "220 localhost ESMTP Service ready\r\n",
        "250-localhost Hello c\r\n",
        "250-SIZE 10485760\r\n",
        "250 8BITMIME\r\n",
        "250 Sender <a@b> OK\r\n",
        "250 Recipient <c@d> OK\r\n",
        "354 Start mail input; end with <CRLF>.<CRLF>\r\n",
        "250 Message accepted for delivery\r\n",
        "221 localhost closing connection\r\n",
    ];
    for want in expected {
        assert_eq!(read_reply_line(&mut reader).await, want);
    }

    assert!(handle.await.unwrap().is_ok());
    assert_eq!(received.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn starttls_without_configuration_is_rejected() {
    let (client, handle) = spawn_session(test_config(), None, CancellationToken::new());
    let (read_half, mut write_half) = tokio::io::split(client);
    let mut reader = BufReader::new(read_half);

    read_reply_line(&mut reader).await; // greeting
    write_half.write_all(b"EHLO c\r\n").await.unwrap();

    // Without TLS configured the capability list has no STARTTLS line.
    assert_eq!(
        read_reply_line(&mut reader).await,
        "250-localhost Hello c\r\n"
    );
    assert_eq!(read_reply_line(&mut reader).await, "250-SIZE 10485760\r\n");
    assert_eq!(read_reply_line(&mut reader).await, "250 8BITMIME\r\n");

    write_half.write_all(b"STARTTLS\r\n").await.unwrap();
    assert_eq!(
        read_reply_line(&mut reader).await,
        "502 STARTTLS not available\r\n"
    );

    write_half.write_all(b"QUIT\r\n").await.unwrap();
    read_reply_line(&mut reader).await;
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn failing_handler_does_not_break_the_session() {
    let handler: Arc<dyn MessageHandler> = Arc::new(|_message: Message| -> anyhow::Result<()> {
        anyhow::bail!("downstream store is on fire")
    });
    let (client, handle) = spawn_session(test_config(), Some(handler), CancellationToken::new());
    let (read_half, mut write_half) = tokio::io::split(client);
    let mut reader = BufReader::new(read_half);

    read_reply_line(&mut reader).await; // greeting
    write_half
        .write_all(b"EHLO c\r\nMAIL FROM:<a@b>\r\nRCPT TO:<c@d>\r\nDATA\r\nHi\r\n.\r\n")
        .await
        .unwrap();
    for _ in 0..6 {
        read_reply_line(&mut reader).await;
    }

    // The 250 is sent regardless of what the handler does afterwards.
    assert_eq!(
        read_reply_line(&mut reader).await,
        "250 Message accepted for delivery\r\n"
    );

    // And the dialogue keeps going.
    write_half.write_all(b"NOOP\r\n").await.unwrap();
    assert_eq!(read_reply_line(&mut reader).await, "250 OK\r\n");

    write_half.write_all(b"QUIT\r\n").await.unwrap();
    read_reply_line(&mut reader).await;
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn idle_session_times_out_with_421() {
    let mut config = test_config();
    config.command_timeout = Duration::from_secs(1);
    let (client, handle) = spawn_session(config, None, CancellationToken::new());
    let (read_half, _write_half) = tokio::io::split(client);
    let mut reader = BufReader::new(read_half);

    read_reply_line(&mut reader).await; // greeting

    // No command ever arrives; virtual time runs the timeout out.
    assert_eq!(
        read_reply_line(&mut reader).await,
        "421 localhost Command timeout, closing connection\r\n"
    );
    assert!(matches!(
        handle.await.unwrap(),
        Err(SessionError::CommandTimeout)
    ));
}

#[tokio::test(start_paused = true)]
async fn session_wall_clock_budget_is_enforced() {
    let mut config = test_config();
    config.connection_timeout = Duration::from_secs(5);
    config.command_timeout = Duration::from_secs(0);
    let (client, handle) = spawn_session(config, None, CancellationToken::new());
    let (read_half, mut write_half) = tokio::io::split(client);
    let mut reader = BufReader::new(read_half);

    read_reply_line(&mut reader).await; // greeting

    tokio::time::sleep(Duration::from_secs(6)).await;
    write_half.write_all(b"NOOP\r\n").await.unwrap();
    assert_eq!(read_reply_line(&mut reader).await, "250 OK\r\n");

    // The budget check runs before the next read.
    assert_eq!(
        read_reply_line(&mut reader).await,
        "421 localhost Session timeout, closing connection\r\n"
    );
    assert!(matches!(
        handle.await.unwrap(),
        Err(SessionError::ConnectionTimeout)
    ));
}

#[tokio::test]
async fn cancelled_session_says_goodbye_and_exits_cleanly() {
    let shutdown = CancellationToken::new();
    let (client, handle) = spawn_session(test_config(), None, shutdown.clone());
    let (read_half, _write_half) = tokio::io::split(client);
    let mut reader = BufReader::new(read_half);

    read_reply_line(&mut reader).await; // greeting

    shutdown.cancel();
    assert_eq!(
        read_reply_line(&mut reader).await,
        "421 localhost Service shutting down, closing connection\r\n"
    );
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn eof_before_any_command_closes_silently() {
    let (mut client, handle) = spawn_session(test_config(), None, CancellationToken::new());

    let mut buf = [0u8; 128];
    let n = client.read(&mut buf).await.unwrap(); // greeting
    assert!(n > 0);

    // Dropping the client end is the peer hanging up.
    drop(client);

    assert!(handle.await.unwrap().is_ok());
}

mod unstuff_props {
    use super::unstuff;
    use proptest::prelude::*;

    /// Sender-side dot-stuffing per RFC 5321 section 4.5.2.
    fn stuff(line: &str) -> String {
        if line.starts_with('.') {
            format!(".{line}")
        } else {
            line.to_string()
        }
    }

    proptest! {
        #[test]
        fn unstuffing_undoes_stuffing(line in "[^\r\n]{0,200}") {
            let stuffed = stuff(&line);
            prop_assert_eq!(unstuff(&stuffed), line.as_str());
        }

        #[test]
        fn unstuff_strips_exactly_one_dot(tail in "[^\r\n]{0,200}") {
            let stuffed = format!("..{tail}");
            let expected = format!(".{tail}");
            prop_assert_eq!(unstuff(&stuffed), expected.as_str());
        }
    }
}
