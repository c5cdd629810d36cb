use std::sync::Arc;
use std::time::Duration;

use pages_core::{DevSessionStart, DevSessionStop};
use tokio::time::{Interval, MissedTickBehavior};

use crate::api::{ApiError, DevSessionApi};

/// Upper bound on the final deregistration call during cleanup.
pub const DEREGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Remote registration of one tunnel URL.
///
/// `register` is both the initial call and the heartbeat; the payload never
/// changes for the lifetime of the session.
#[derive(Clone)]
pub struct Registration {
    api: Arc<dyn DevSessionApi>,
    payload: DevSessionStart,
}

impl Registration {
    pub fn new(api: Arc<dyn DevSessionApi>, payload: DevSessionStart) -> Self {
        Self { api, payload }
    }

    pub fn url(&self) -> &str {
        &self.payload.url
    }

    pub async fn register(&self) -> Result<(), ApiError> {
        self.api.start_session(&self.payload).await
    }

    /// Issue the stop call. Errors and timeouts are logged, never returned.
    pub async fn deregister(&self) {
        let stop = DevSessionStop {
            url: self.payload.url.clone(),
        };
        match tokio::time::timeout(DEREGISTER_TIMEOUT, self.api.stop_session(&stop)).await {
            Ok(Ok(())) => tracing::info!(url = %stop.url, "dev session deregistered"),
            Ok(Err(e)) => {
                tracing::warn!(url = %stop.url, error = %e, "failed to deregister dev session")
            }
            Err(_) => tracing::warn!(url = %stop.url, "dev session deregistration timed out"),
        }
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("payload", &self.payload)
            .finish()
    }
}

/// Registration schedule: the first tick fires immediately, later ticks one
/// `period` apart. A slow call pushes the next tick back instead of bursting.
pub fn schedule(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockApi;
    use pages_core::ProjectType;

    fn payload() -> DevSessionStart {
        DevSessionStart {
            url: "https://abc.ngrok.io".to_string(),
            name: "demo".to_string(),
            project_type: ProjectType::WebPage,
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn register_repeats_the_same_payload() {
        let api = MockApi::with_start_outcomes(&[true, false]);
        let registration = Registration::new(Arc::new(api.clone()), payload());

        assert!(registration.register().await.is_ok());
        assert!(registration.register().await.is_err());
        assert!(registration.register().await.is_ok());

        let starts = api.starts();
        assert_eq!(starts.len(), 3);
        assert!(starts.iter().all(|s| *s == payload()));
    }

    #[tokio::test]
    async fn deregister_sends_stop_with_the_tunnel_url() {
        let api = MockApi::new();
        let registration = Registration::new(Arc::new(api.clone()), payload());
        registration.deregister().await;
        assert_eq!(api.stops().len(), 1);
        assert_eq!(api.stops()[0].url, registration.url());
    }

    #[tokio::test]
    async fn schedule_fires_immediately_then_on_period() {
        let mut ticker = schedule(Duration::from_millis(50));
        let start = tokio::time::Instant::now();
        ticker.tick().await;
        assert!(start.elapsed() < Duration::from_millis(40));
        ticker.tick().await;
        assert!(start.elapsed() >= Duration::from_millis(45));
    }
}
