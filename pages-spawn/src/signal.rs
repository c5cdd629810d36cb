//! Termination signals for supervised process trees.

/// Ask the process tree rooted at `pid` to terminate.
#[cfg(unix)]
pub(crate) async fn terminate_tree(pid: u32) -> std::io::Result<()> {
    signal_group(pid, libc::SIGTERM)
}

/// Forcefully kill the process tree rooted at `pid`.
#[cfg(unix)]
pub(crate) async fn kill_tree(pid: u32) -> std::io::Result<()> {
    signal_group(pid, libc::SIGKILL)
}

/// Children are spawned as process group leaders, so the group id equals
/// the leader's pid. Callers must only pass pids that have not been reaped.
#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub(crate) async fn terminate_tree(pid: u32) -> std::io::Result<()> {
    let status = tokio::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::other(format!("failed to terminate pid {pid}")))
    }
}

#[cfg(not(unix))]
pub(crate) async fn kill_tree(pid: u32) -> std::io::Result<()> {
    terminate_tree(pid).await
}
