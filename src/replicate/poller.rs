use super::config::ReplicateConfig;
use super::predictions::{self, Prediction, PredictionInput, PredictionStatus};
use crate::retry::ApiError;
use reqwest::Client;
use std::future::Future;
use thiserror::Error;
use tokio::time::{Duration, Instant, sleep};
use tracing::debug;

/// Polling cadence and the wall-clock budget for one job.
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    pub budget: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            budget: Duration::from_secs(120),
        }
    }
}

impl PollSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let interval = std::env::var("POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.interval);
        let budget = std::env::var("POLL_BUDGET_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.budget);
        Self { interval, budget }
    }
}

#[derive(Debug, Error)]
pub enum PredictionError {
    #[error("generation request failed: {0}")]
    Api(#[from] ApiError),
    #[error("generation timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("generation job failed: {0}")]
    JobFailed(String),
}

/// Drives a submitted prediction to a terminal status.
///
/// The budget is wall clock measured from entry, so slow status fetches eat
/// into it instead of extending the wait. Fetches are not retried here; a
/// dropped poll fails the whole wait.
pub async fn poll_until_terminal<F, Fut>(
    settings: PollSettings,
    initial: Prediction,
    mut fetch: F,
) -> Result<Prediction, PredictionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Prediction, ApiError>>,
{
    let deadline = Instant::now() + settings.budget;
    let mut current = initial;
    loop {
        match current.status {
            PredictionStatus::Succeeded => return Ok(current),
            PredictionStatus::Queued | PredictionStatus::Running => {}
            _ => {
                let detail = current
                    .error
                    .clone()
                    .unwrap_or_else(|| "image generation failed".to_string());
                return Err(PredictionError::JobFailed(detail));
            }
        }
        if Instant::now() >= deadline {
            return Err(PredictionError::Timeout(settings.budget));
        }
        sleep(settings.interval).await;
        current = fetch().await?;
    }
}

/// Submits `input` and waits for the finished job.
pub async fn submit_and_await(
    http: &Client,
    config: &ReplicateConfig,
    api_token: &str,
    input: &PredictionInput,
    settings: PollSettings,
) -> Result<Prediction, PredictionError> {
    let submitted = predictions::create_prediction(http, config, api_token, input).await?;
    debug!(
        target = "restage.replicate",
        id = %submitted.id,
        status = ?submitted.status,
        "prediction_submitted"
    );
    let id = submitted.id.clone();
    poll_until_terminal(settings, submitted, || {
        predictions::get_prediction(http, config, api_token, &id)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn in_flight(status: PredictionStatus) -> Prediction {
        Prediction {
            id: "pred-test".to_string(),
            status,
            output: None,
            error: None,
        }
    }

    fn finished(output: &str) -> Prediction {
        Prediction {
            id: "pred-test".to_string(),
            status: PredictionStatus::Succeeded,
            output: Some(predictions::PredictionOutput::Single(output.to_string())),
            error: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn polls_on_a_steady_cadence_until_success() {
        let polls = AtomicU32::new(0);
        let start = Instant::now();
        let result = poll_until_terminal(
            PollSettings::default(),
            in_flight(PredictionStatus::Queued),
            || {
                let n = polls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 120 {
                        Ok(in_flight(PredictionStatus::Running))
                    } else {
                        Ok(finished("https://cdn.example/out.jpg"))
                    }
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(result.output_reference(), Some("https://cdn.example/out.jpg"));
        assert_eq!(polls.load(Ordering::SeqCst), 120);
        assert_eq!(start.elapsed(), Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn an_exhausted_budget_times_out() {
        let polls = AtomicU32::new(0);
        let err = poll_until_terminal(
            PollSettings::default(),
            in_flight(PredictionStatus::Queued),
            || {
                polls.fetch_add(1, Ordering::SeqCst);
                async { Ok(in_flight(PredictionStatus::Running)) }
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PredictionError::Timeout(_)));
        assert_eq!(err.to_string(), "generation timed out after 120s");
        // The budget admits exactly 120 one-second polls.
        assert_eq!(polls.load(Ordering::SeqCst), 120);
    }

    #[tokio::test(start_paused = true)]
    async fn an_already_finished_job_needs_no_polls() {
        let polls = AtomicU32::new(0);
        let result = poll_until_terminal(PollSettings::default(), finished("out.jpg"), || {
            polls.fetch_add(1, Ordering::SeqCst);
            async { Ok(in_flight(PredictionStatus::Running)) }
        })
        .await
        .unwrap();
        assert_eq!(result.output_reference(), Some("out.jpg"));
        assert_eq!(polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_jobs_surface_the_upstream_detail() {
        let failed = Prediction {
            id: "pred-test".to_string(),
            status: PredictionStatus::Failed,
            output: None,
            error: Some("NSFW content detected".to_string()),
        };
        let err = poll_until_terminal(PollSettings::default(), failed, || async {
            Ok(in_flight(PredictionStatus::Running))
        })
        .await
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "generation job failed: NSFW content detected"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_states_without_detail_get_a_generic_message() {
        let err = poll_until_terminal(
            PollSettings::default(),
            in_flight(PredictionStatus::Canceled),
            || async { Ok(in_flight(PredictionStatus::Running)) },
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "generation job failed: image generation failed");
    }

    #[tokio::test(start_paused = true)]
    async fn a_dropped_poll_fails_the_wait() {
        let polls = AtomicU32::new(0);
        let err = poll_until_terminal(
            PollSettings::default(),
            in_flight(PredictionStatus::Running),
            || {
                polls.fetch_add(1, Ordering::SeqCst);
                async { Err(ApiError::transport("connection reset by peer")) }
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PredictionError::Api(_)));
        assert_eq!(polls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn default_settings_are_one_second_and_two_minutes() {
        let defaults = PollSettings::default();
        assert_eq!(defaults.interval, Duration::from_secs(1));
        assert_eq!(defaults.budget, Duration::from_secs(120));
    }
}
