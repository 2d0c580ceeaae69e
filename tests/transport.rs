//! End-to-end connection tests over an in-memory duplex transport.
//!
//! Each test plays the server side of the wire on a spawned task; the
//! task returns what it observed so assertions run on the test body.

#![allow(clippy::unwrap_used)]

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};

use mailwire::{
    CollectingObserver, CommandOptions, CommandStatus, Config, ConnectionEvent, DeflateEngine,
    Error, ImapConnection, PrecheckHandle, Request, Transport,
};

/// In-memory transport for driving the connection core.
struct TestTransport(DuplexStream);

impl AsyncRead for TestTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for TestTransport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

impl Transport for TestTransport {
    fn is_secure(&self) -> bool {
        false
    }

    fn upgrade_tls(self, _config: &Config) -> impl Future<Output = mailwire::Result<Self>> + Send {
        async move { Ok(self) }
    }
}

/// Transport over a scripted mock stream; panics the driver on any write
/// that deviates from the script.
struct ScriptedTransport(tokio_test::io::Mock);

impl AsyncRead for ScriptedTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for ScriptedTransport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

impl Transport for ScriptedTransport {
    fn is_secure(&self) -> bool {
        false
    }

    fn upgrade_tls(self, _config: &Config) -> impl Future<Output = mailwire::Result<Self>> + Send {
        async move { Ok(self) }
    }
}

fn test_config() -> Config {
    Config::new("test.invalid")
}

/// Starts a connection over one end of a duplex pipe; the other end is
/// the server.
fn start(observer: CollectingObserver) -> (ImapConnection, DuplexStream) {
    let (client_end, server_end) = tokio::io::duplex(64 * 1024);
    let connection =
        ImapConnection::from_transport(TestTransport(client_end), test_config(), observer);
    (connection, server_end)
}

async fn read_line(stream: &mut DuplexStream) -> String {
    let mut line = Vec::new();
    loop {
        let byte = stream.read_u8().await.unwrap();
        line.push(byte);
        if byte == b'\n' {
            break;
        }
    }
    String::from_utf8(line).unwrap()
}

async fn wait_for_event(observer: &CollectingObserver, wanted: &ConnectionEvent) {
    for _ in 0..500 {
        if observer.events().iter().any(|event| event == wanted) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("event {wanted:?} never observed; saw {:?}", observer.events());
}

#[tokio::test]
async fn greeting_arrives_chunked_and_fires_ready_once() {
    let observer = CollectingObserver::new();
    let (connection, mut server) = start(observer.clone());

    let server_task = tokio::spawn(async move {
        server
            .write_all(b"* OK [CAPABILITY IMAP4rev1 LIT")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        server.write_all(b"ERAL+] ready\r\n").await.unwrap();

        let line = read_line(&mut server).await;
        server.write_all(b"W1 OK done\r\n").await.unwrap();
        line
    });

    let response = connection
        .enqueue_command(Request::new("NOOP"), &[], CommandOptions::default())
        .await
        .unwrap();
    assert_eq!(response.human_readable.as_deref(), Some("done"));

    let line = server_task.await.unwrap();
    assert_eq!(line, "W1 NOOP\r\n");

    let ready_count = observer
        .events()
        .iter()
        .filter(|event| **event == ConnectionEvent::Ready)
        .count();
    assert_eq!(ready_count, 1);
}

#[tokio::test]
async fn untagged_payload_with_literal_is_collected() {
    let (connection, mut server) = start(CollectingObserver::new());

    let server_task = tokio::spawn(async move {
        server.write_all(b"* OK ready\r\n").await.unwrap();
        let line = read_line(&mut server).await;
        // Split mid-response, right after the literal announcement.
        server
            .write_all(b"* 1 FETCH (BODY[] {5}\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        server.write_all(b"hello)\r\nW1 OK done\r\n").await.unwrap();
        line
    });

    let response = connection
        .enqueue_command(
            Request::new("FETCH").atom("1").atom("BODY[]"),
            &["FETCH"],
            CommandOptions::default(),
        )
        .await
        .unwrap();

    let line = server_task.await.unwrap();
    assert_eq!(line, "W1 FETCH 1 BODY[]\r\n");

    let collected = &response.payload["FETCH"];
    assert_eq!(collected.len(), 1);
    assert_eq!(collected[0].nr, Some(1));
    assert_eq!(collected[0].command, "FETCH");
    let mailwire::Attribute::List(items) = &collected[0].attributes[0] else {
        panic!("expected fetch item list");
    };
    assert_eq!(
        items[1],
        mailwire::Attribute::Literal(bytes::Bytes::from_static(b"hello"))
    );
}

#[tokio::test]
async fn exact_wire_bytes_for_capability_exchange() {
    let mock = tokio_test::io::Builder::new()
        .read(b"* OK ready\r\n")
        .write(b"W1 CAPABILITY\r\n")
        .read(b"* CAPABILITY IMAP4rev1 AUTH=PLAIN\r\nW1 OK done\r\n")
        .build();

    let connection = ImapConnection::from_transport(
        ScriptedTransport(mock),
        test_config(),
        CollectingObserver::new(),
    );
    let response = connection
        .enqueue_command(
            Request::new("CAPABILITY"),
            &["CAPABILITY"],
            CommandOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(response.payload["CAPABILITY"].len(), 1);
    assert_eq!(response.human_readable.as_deref(), Some("done"));
}

#[tokio::test]
async fn capability_exchange_resolves_with_payload() {
    let (connection, mut server) = start(CollectingObserver::new());

    let server_task = tokio::spawn(async move {
        server.write_all(b"* OK ready\r\n").await.unwrap();
        let line = read_line(&mut server).await;
        server
            .write_all(b"* CAPABILITY IMAP4rev1 AUTH=PLAIN\r\nW1 OK done\r\n")
            .await
            .unwrap();
        line
    });

    let response = connection
        .enqueue_command(
            Request::new("CAPABILITY"),
            &["CAPABILITY"],
            CommandOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(server_task.await.unwrap(), "W1 CAPABILITY\r\n");
    assert_eq!(response.human_readable.as_deref(), Some("done"));
    assert_eq!(response.payload["CAPABILITY"].len(), 1);
    assert_eq!(
        response.payload["CAPABILITY"][0].attributes[0],
        mailwire::Attribute::Atom("IMAP4rev1".to_string())
    );
}

#[tokio::test(start_paused = true)]
async fn continuation_prompts_drive_multi_chunk_sends() {
    let (connection, mut server) = start(CollectingObserver::new());

    let server_task = tokio::spawn(async move {
        server.write_all(b"* OK ready\r\n").await.unwrap();

        let first = read_line(&mut server).await;
        assert_eq!(first, "W1 LOGIN \"user\" {4}\r\n");

        // Nothing more may arrive until the prompt is sent.
        let mut probe = [0u8; 1];
        let early = tokio::time::timeout(Duration::from_secs(1), server.read(&mut probe)).await;
        assert!(early.is_err(), "literal sent before continuation prompt");

        server.write_all(b"+ go\r\n").await.unwrap();
        let second = read_line(&mut server).await;
        assert_eq!(second, "pass\r\n");

        server.write_all(b"W1 OK done\r\n").await.unwrap();
    });

    let response = connection
        .enqueue_command(
            Request::new("LOGIN").string("user").literal(&b"pass"[..]),
            &[],
            CommandOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(response.human_readable.as_deref(), Some("done"));
    server_task.await.unwrap();
}

#[tokio::test]
async fn failed_completion_carries_text_and_code() {
    let (connection, mut server) = start(CollectingObserver::new());

    tokio::spawn(async move {
        server.write_all(b"* OK ready\r\n").await.unwrap();
        let _ = read_line(&mut server).await;
        server
            .write_all(b"W1 NO [ALERT] bad mailbox\r\n")
            .await
            .unwrap();
        // Keep the server end open until the test finishes.
        std::mem::forget(server);
    });

    let error = connection
        .enqueue_command(
            Request::new("SELECT").string("missing"),
            &[],
            CommandOptions::default(),
        )
        .await
        .unwrap_err();

    match error {
        Error::Command {
            status,
            message,
            code,
        } => {
            assert_eq!(status, CommandStatus::No);
            assert_eq!(message, "bad mailbox");
            assert_eq!(code.as_deref(), Some("ALERT"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn precheck_inserts_priority_command_ahead() {
    let (connection, mut server) = start(CollectingObserver::new());

    let server_task = tokio::spawn(async move {
        server.write_all(b"* OK ready\r\n").await.unwrap();
        let mut lines = Vec::new();
        for _ in 0..2 {
            let line = read_line(&mut server).await;
            let tag = line.split(' ').next().unwrap().to_string();
            server
                .write_all(format!("{tag} OK done\r\n").as_bytes())
                .await
                .unwrap();
            lines.push(line);
        }
        lines
    });

    let precheck: mailwire::Precheck = Box::new(
        |handle: PrecheckHandle| -> Pin<Box<dyn Future<Output = mailwire::Result<()>> + Send>> {
            Box::pin(async move {
                handle.enqueue_before(Request::new("PREP"), &[]).await?;
                Ok(())
            })
        },
    );

    let response = connection
        .enqueue_command(
            Request::new("MAIN"),
            &[],
            CommandOptions {
                precheck: Some(precheck),
                ..CommandOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(response.tag, "W1.p");

    let lines = server_task.await.unwrap();
    assert_eq!(lines, vec!["W2.p PREP\r\n", "W1.p MAIN\r\n"]);
}

#[tokio::test]
async fn failed_precheck_rejects_only_its_command() {
    let (connection, mut server) = start(CollectingObserver::new());

    let server_task = tokio::spawn(async move {
        server.write_all(b"* OK ready\r\n").await.unwrap();
        let line = read_line(&mut server).await;
        server.write_all(b"W2 OK done\r\n").await.unwrap();
        line
    });

    let precheck: mailwire::Precheck = Box::new(
        |_handle: PrecheckHandle| -> Pin<Box<dyn Future<Output = mailwire::Result<()>> + Send>> {
            Box::pin(async move { Err(Error::Protocol("not prepared".to_string())) })
        },
    );

    let error = connection
        .enqueue_command(
            Request::new("MAIN"),
            &[],
            CommandOptions {
                precheck: Some(precheck),
                ..CommandOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(error, Error::Protocol(_)), "got {error}");

    // The guarded command never reached the wire; follow-ups still go
    // through.
    let response = connection
        .enqueue_command(Request::new("NOOP"), &[], CommandOptions::default())
        .await
        .unwrap();
    assert_eq!(response.tag, "W2");
    assert_eq!(server_task.await.unwrap(), "W2 NOOP\r\n");
}

#[tokio::test]
async fn stray_untagged_during_precheck_does_not_bypass_it() {
    let (connection, mut server) = start(CollectingObserver::new());

    let (exists_tx, mut exists_rx) = tokio::sync::mpsc::unbounded_channel();
    connection
        .set_handler("EXISTS", move |response| {
            let _ = exists_tx.send(response.nr);
        })
        .unwrap();

    let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
    let (go_tx, go_rx) = tokio::sync::oneshot::channel::<()>();
    let (send_exists_tx, send_exists_rx) = tokio::sync::oneshot::channel::<()>();

    let server_task = tokio::spawn(async move {
        server.write_all(b"* OK ready\r\n").await.unwrap();
        send_exists_rx.await.unwrap();
        server.write_all(b"* 5 EXISTS\r\n").await.unwrap();
        let mut lines = Vec::new();
        for _ in 0..2 {
            let line = read_line(&mut server).await;
            let tag = line.split(' ').next().unwrap().to_string();
            server
                .write_all(format!("{tag} OK done\r\n").as_bytes())
                .await
                .unwrap();
            lines.push(line);
        }
        lines
    });

    let precheck: mailwire::Precheck = Box::new(
        move |handle: PrecheckHandle| -> Pin<Box<dyn Future<Output = mailwire::Result<()>> + Send>> {
            Box::pin(async move {
                let _ = started_tx.send(());
                // Hold the queue head until the stray response has been
                // routed.
                let _ = go_rx.await;
                handle.enqueue_before(Request::new("PREP"), &[]).await?;
                Ok(())
            })
        },
    );

    let main_connection = connection.clone();
    let main_task = tokio::spawn(async move {
        main_connection
            .enqueue_command(
                Request::new("MAIN"),
                &[],
                CommandOptions {
                    precheck: Some(precheck),
                    ..CommandOptions::default()
                },
            )
            .await
    });

    // With the precheck running (and its command still queued), feed a
    // spontaneous EXISTS through the global handler. It must not push
    // the guarded command onto the wire.
    started_rx.await.unwrap();
    send_exists_tx.send(()).unwrap();
    assert_eq!(exists_rx.recv().await.unwrap(), Some(5));
    go_tx.send(()).unwrap();

    let response = main_task.await.unwrap().unwrap();
    assert_eq!(response.tag, "W1.p");
    assert_eq!(
        server_task.await.unwrap(),
        vec!["W2.p PREP\r\n", "W1.p MAIN\r\n"]
    );
}

#[tokio::test]
async fn unclaimed_untagged_responses_reach_global_handlers() {
    let (connection, mut server) = start(CollectingObserver::new());

    let seen: Arc<Mutex<Vec<Option<u32>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    connection
        .set_handler("EXISTS", move |response| {
            sink.lock().unwrap().push(response.nr);
        })
        .unwrap();

    let server_task = tokio::spawn(async move {
        server.write_all(b"* OK ready\r\n").await.unwrap();
        let line = read_line(&mut server).await;
        server
            .write_all(b"* 5 EXISTS\r\nW1 OK done\r\n")
            .await
            .unwrap();
        line
    });

    connection
        .enqueue_command(Request::new("NOOP"), &[], CommandOptions::default())
        .await
        .unwrap();
    server_task.await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![Some(5)]);
}

#[tokio::test]
async fn close_rejects_outstanding_commands() {
    let (connection, mut server) = start(CollectingObserver::new());

    let server_task = tokio::spawn(async move {
        server.write_all(b"* OK ready\r\n").await.unwrap();
        let line = read_line(&mut server).await;
        // Never respond; hold the stream open.
        tokio::time::sleep(Duration::from_secs(3600)).await;
        drop(server);
        line
    });

    let pending_connection = connection.clone();
    let pending = tokio::spawn(async move {
        pending_connection
            .enqueue_command(Request::new("NOOP"), &[], CommandOptions::default())
            .await
    });

    // Let the command reach the wire before closing.
    tokio::time::sleep(Duration::from_millis(50)).await;
    connection.close().await;
    connection.close().await; // idempotent

    let error = pending.await.unwrap().unwrap_err();
    assert!(matches!(error, Error::ConnectionClosed), "got {error}");

    // Enqueueing after close fails immediately.
    let error = connection
        .enqueue_command(Request::new("NOOP"), &[], CommandOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(error, Error::ConnectionClosed), "got {error}");

    server_task.abort();
}

#[tokio::test(start_paused = true)]
async fn drained_queue_reports_idle() {
    let observer = CollectingObserver::new();
    let (_connection, mut server) = start(observer.clone());

    tokio::spawn(async move {
        server.write_all(b"* OK ready\r\n").await.unwrap();
        std::mem::forget(server);
    });

    wait_for_event(&observer, &ConnectionEvent::Ready).await;
    wait_for_event(&observer, &ConnectionEvent::Idle).await;
}

#[tokio::test(start_paused = true)]
async fn missing_response_times_out_fatally() {
    let observer = CollectingObserver::new();
    let (connection, mut server) = start(observer.clone());

    tokio::spawn(async move {
        server.write_all(b"* OK ready\r\n").await.unwrap();
        let _ = read_line(&mut server).await;
        // Never respond.
        std::mem::forget(server);
    });

    let error = connection
        .enqueue_command(Request::new("NOOP"), &[], CommandOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(error, Error::ConnectionClosed), "got {error}");

    let events = observer.events();
    assert!(
        events
            .iter()
            .any(|event| matches!(event, ConnectionEvent::Error(text) if text.contains("timed out"))),
        "no timeout error in {events:?}"
    );
}

#[tokio::test]
async fn logout_completes_when_server_closes() {
    let observer = CollectingObserver::new();
    let (connection, mut server) = start(observer.clone());

    let server_task = tokio::spawn(async move {
        server.write_all(b"* OK ready\r\n").await.unwrap();
        let line = read_line(&mut server).await;
        server
            .write_all(b"* BYE logging out\r\nW1 OK done\r\n")
            .await
            .unwrap();
        drop(server);
        line
    });

    connection.logout().await.unwrap();
    assert_eq!(server_task.await.unwrap(), "W1 LOGOUT\r\n");

    // A clean logout is not an error.
    assert!(
        !observer
            .events()
            .iter()
            .any(|event| matches!(event, ConnectionEvent::Error(_))),
        "unexpected error event: {:?}",
        observer.events()
    );
}

#[tokio::test]
async fn compression_splice_is_transparent() {
    let observer = CollectingObserver::new();
    let (connection, mut server) = start(observer.clone());

    let payload = "A".repeat(200);
    let expected_line = format!("W1 ID {payload}\r\n");

    let server_task = tokio::spawn(async move {
        server.write_all(b"* OK ready\r\n").await.unwrap();

        let mut deflater = DeflateEngine::new();
        let mut inflater = DeflateEngine::new();

        // Read until the inflated stream holds the whole command line.
        let mut raw_seen = Vec::new();
        let mut plain = Vec::new();
        let mut chunk = [0u8; 4096];
        while !plain.windows(2).any(|window| window == b"\r\n") {
            let n = server.read(&mut chunk).await.unwrap();
            assert!(n > 0, "server side closed early");
            raw_seen.extend_from_slice(&chunk[..n]);
            plain.extend_from_slice(&inflater.inflate(&chunk[..n]).unwrap());
        }
        assert_eq!(plain, expected_line.as_bytes());
        // No cleartext on the wire once the splice is active.
        assert!(!raw_seen.windows(10).any(|window| window == b"AAAAAAAAAA"));

        let reply = deflater.deflate(b"W1 OK done\r\n").unwrap();
        server.write_all(&reply).await.unwrap();
        std::mem::forget(server);
    });

    // The greeting travels in cleartext; only enable the splice once it
    // has been processed.
    wait_for_event(&observer, &ConnectionEvent::Ready).await;
    connection.enable_compression().await.unwrap();
    let response = connection
        .enqueue_command(
            Request::new("ID").atom(payload.clone()),
            &[],
            CommandOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(response.human_readable.as_deref(), Some("done"));
    server_task.await.unwrap();
}

#[tokio::test]
async fn upgrade_keeps_connection_usable() {
    let (connection, mut server) = start(CollectingObserver::new());

    let server_task = tokio::spawn(async move {
        server.write_all(b"* OK ready\r\n").await.unwrap();
        let line = read_line(&mut server).await;
        server.write_all(b"W1 OK done\r\n").await.unwrap();
        line
    });

    // The test transport upgrades in place without a handshake.
    connection.upgrade().await.unwrap();

    let response = connection
        .enqueue_command(Request::new("NOOP"), &[], CommandOptions::default())
        .await
        .unwrap();
    assert_eq!(response.human_readable.as_deref(), Some("done"));
    assert_eq!(server_task.await.unwrap(), "W1 NOOP\r\n");
}
