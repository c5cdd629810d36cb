use std::time::Duration;

/// Upper bound for a single probe request.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

/// One HTTP request to `localhost:<port>`. Any response, whatever its
/// status, means something is listening.
pub async fn http_reachable(client: &reqwest::Client, port: u16) -> Result<(), String> {
    client
        .get(format!("http://localhost:{port}/"))
        .send()
        .await
        .map(|_| ())
        .map_err(|e| e.to_string())
}

/// Retry [`http_reachable`] up to `attempts` times, `retry_delay` apart.
///
/// Returns the last error when the port never answered.
pub async fn wait_for_http(port: u16, attempts: u32, retry_delay: Duration) -> Result<(), String> {
    let client = reqwest::Client::builder()
        .no_proxy()
        .connect_timeout(ATTEMPT_TIMEOUT)
        .timeout(ATTEMPT_TIMEOUT)
        .build()
        .map_err(|e| format!("failed to build probe client: {e}"))?;

    let mut last_error = "probe did not run".to_string();
    for attempt in 0..attempts {
        match http_reachable(&client, port).await {
            Ok(()) => {
                tracing::debug!(port, attempt, "dev server answered probe");
                return Ok(());
            }
            Err(e) => last_error = e,
        }
        if attempt + 1 < attempts {
            tokio::time::sleep(retry_delay).await;
        }
    }
    Err(last_error)
}
