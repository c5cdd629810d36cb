#![cfg(unix)]

use std::os::unix::process::ExitStatusExt;
use std::time::Duration;

use pages_core::{LogItem, LogKind};
use pages_spawn::{CommandSpec, ProcessExit, ProcessRegistry, Supervisor};

#[tokio::test]
async fn cancel_after_first_line_terminates_process_and_ends_stream() {
    let registry = ProcessRegistry::new();
    let supervisor = Supervisor::new(registry.clone());

    let mut stream = supervisor
        .run(CommandSpec::shell("echo ready && sleep 100"))
        .unwrap();
    let pid = stream.pid();
    assert!(registry.contains(pid));

    let first = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("first line in time");
    assert_eq!(first, Some(LogItem::stdout("ready")));

    tokio::time::sleep(Duration::from_millis(50)).await;
    stream.cancel();

    assert_eq!(stream.next().await, None);

    let exit = tokio::time::timeout(Duration::from_secs(5), stream.wait())
        .await
        .expect("process terminated in time")
        .unwrap();
    let ProcessExit::Cancelled(Some(status)) = exit else {
        panic!("expected cancelled exit, got {exit:?}");
    };
    // The shell leader was signalled rather than exiting on its own.
    assert!(status.signal().is_some(), "unexpected status: {status}");
    assert!(!registry.contains(pid));
}

#[tokio::test]
async fn dropping_stream_terminates_process() {
    let registry = ProcessRegistry::new();
    let supervisor = Supervisor::new(registry.clone());

    let stream = supervisor.run(CommandSpec::shell("sleep 100")).unwrap();
    let pid = stream.pid();
    drop(stream);

    assert!(registry.wait_until_empty(Duration::from_secs(5)).await);
    assert!(!registry.contains(pid));
}

#[tokio::test]
async fn cancelling_after_natural_exit_only_forgets_pid() {
    let registry = ProcessRegistry::new();
    let supervisor = Supervisor::new(registry.clone());

    let mut stream = supervisor.run(CommandSpec::shell("echo done")).unwrap();
    assert_eq!(stream.next().await.map(|l| l.text), Some("done".to_string()));
    let exit = stream.wait().await.unwrap();
    assert!(matches!(exit, ProcessExit::Exited(s) if s.success()));

    // Cancelling an exited stream is a no-op beyond bookkeeping.
    stream.cancel();
    assert_eq!(stream.wait().await.unwrap(), exit);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn stderr_lines_keep_their_order() {
    let supervisor = Supervisor::default();
    let mut stream = supervisor
        .run(CommandSpec::shell("for i in 1 2 3 4 5; do echo line$i 1>&2; done"))
        .unwrap();

    let mut lines = Vec::new();
    while let Some(item) = stream.next().await {
        assert_eq!(item.kind, LogKind::Stderr);
        lines.push(item.text);
    }
    assert_eq!(lines, vec!["line1", "line2", "line3", "line4", "line5"]);
}

#[tokio::test]
async fn registry_shutdown_terminates_every_process() {
    let registry = ProcessRegistry::new();
    let supervisor = Supervisor::new(registry.clone());

    let a = supervisor.run(CommandSpec::shell("sleep 100")).unwrap();
    let b = supervisor.run(CommandSpec::shell("sleep 100")).unwrap();
    assert_eq!(registry.len(), 2);

    assert!(registry.shutdown(Duration::from_secs(5)).await);
    assert!(matches!(a.wait().await.unwrap(), ProcessExit::Cancelled(_)));
    assert!(matches!(b.wait().await.unwrap(), ProcessExit::Cancelled(_)));
}
