pub mod build;
pub mod certs;
pub mod dev;

use tokio::sync::watch;

/// Flips to `true` on Ctrl-C (and SIGTERM on unix).
pub(crate) fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    {
        let tx = tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(true);
            }
        });
    }
    #[cfg(unix)]
    tokio::spawn(async move {
        if let Ok(mut sigterm) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            let _ = sigterm.recv().await;
            let _ = tx.send(true);
        }
    });

    rx
}

/// Resolves once a shutdown was requested. Never resolves if the signal
/// tasks went away without one.
pub(crate) async fn requested(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
