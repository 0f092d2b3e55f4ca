//! Full lifecycle against a real shell: create, attach, drive input, observe
//! output, close, observe teardown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use libttyhub::{ConnectionHub, SessionRegistry};
use ttyhub_protocol::ServerMessage;

#[tokio::test]
async fn shell_session_lifecycle() {
    let hub = Arc::new(ConnectionHub::new());
    let (tx, mut rx) = mpsc::channel(256);
    let conn = hub.register(tx);
    let registry = SessionRegistry::new(Arc::clone(&hub));

    let info = registry.create("bash", None).await.expect("create bash");
    assert!(info.pid > 0);

    let outcome = registry.attach(info.id, conn).await.expect("attach");
    assert!(!outcome.rejoined);

    registry
        .write_input(info.id, conn, b"echo hi\n")
        .await
        .expect("write input");

    // Output arrives chunked and interleaved with the echoed input; collect
    // until the command's result shows up.
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("no output containing 'hi' before timeout");
        let msg = timeout(remaining, rx.recv())
            .await
            .expect("timed out waiting for output")
            .expect("connection channel closed");
        if let ServerMessage::Output { id, data } = msg {
            assert_eq!(id, info.id);
            seen.extend_from_slice(&data);
            if String::from_utf8_lossy(&seen).contains("hi") {
                break;
            }
        }
    }

    registry.close(info.id).await.expect("close");

    let mut exited = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !exited {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("no terminal_exited before timeout");
        match timeout(remaining, rx.recv()).await {
            Ok(Some(ServerMessage::TerminalExited { id })) => {
                assert_eq!(id, info.id);
                exited = true;
            }
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => panic!("terminal_exited never arrived"),
        }
    }

    assert!(registry.list().await.iter().all(|s| s.id != info.id));
}

#[tokio::test]
async fn spawn_failure_leaves_registry_unchanged() {
    let hub = Arc::new(ConnectionHub::new());
    let registry = SessionRegistry::new(hub);

    let result = registry
        .create("/nonexistent/binary/for/sure", None)
        .await;
    assert!(result.is_err());
    assert_eq!(registry.session_count().await, 0);
}
