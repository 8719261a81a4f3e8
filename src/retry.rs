use reqwest::{Response, StatusCode};
use std::future::Future;
use thiserror::Error;
use tokio::time::{Duration, sleep, timeout};
use tracing::warn;

/// Attempt budget shared by every outbound model call.
pub const MAX_ATTEMPTS: u32 = 3;

/// Ceiling for a single attempt. A hung upstream connection counts as a
/// failed attempt rather than stalling the caller.
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(60);

/// Failure of one upstream HTTP call, carrying the status when a response
/// was received at all.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ApiError {
    pub status: Option<u16>,
    pub message: String,
}

impl ApiError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    /// Builds an error from a non-success response, digging the most
    /// specific message out of the body the upstream gave us.
    pub fn from_response(status: StatusCode, body: &str) -> Self {
        Self {
            status: Some(status.as_u16()),
            message: extract_message(status, body),
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status == Some(StatusCode::TOO_MANY_REQUESTS.as_u16())
    }
}

/// Error payloads differ per upstream, so probe the common shapes in order
/// of specificity before falling back to the raw status line.
fn extract_message(status: StatusCode, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for pointer in ["/error/message", "/error/code", "/message"] {
            if let Some(text) = value.pointer(pointer).and_then(|v| v.as_str()) {
                if !text.trim().is_empty() {
                    return text.to_string();
                }
            }
        }
    }
    format!(
        "HTTP {}: {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("unknown status")
    )
}

/// Reads the body of a response, mapping non-2xx statuses to [`ApiError`].
pub async fn require_success(response: Response) -> Result<String, ApiError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|err| ApiError::transport(format!("failed to read response body: {err}")))?;
    if status.is_success() {
        Ok(body)
    } else {
        Err(ApiError::from_response(status, &body))
    }
}

fn rate_limit_backoff(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    Duration::from_millis((2_000u64 << exp).min(10_000))
}

fn generic_backoff(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    Duration::from_millis((1_000u64 << exp).min(5_000))
}

/// Runs `attempt` up to `max_attempts` times.
///
/// Rate limiting (429) gets the longer backoff and never consumes the
/// generic failure budget, though the total attempt count still bounds it.
/// Any other failure waits on the shorter curve and, on the final attempt,
/// is returned wrapped with the call name and attempt count so callers see
/// what was exhausted.
pub async fn call_with_retry<T, F, Fut>(
    what: &'static str,
    max_attempts: u32,
    mut attempt: F,
) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut rate_limited: Option<ApiError> = None;
    for n in 1..=max_attempts {
        let outcome = match timeout(ATTEMPT_TIMEOUT, attempt()).await {
            Ok(result) => result,
            Err(_) => Err(ApiError::transport(format!(
                "attempt timed out after {}s",
                ATTEMPT_TIMEOUT.as_secs()
            ))),
        };

        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if err.is_rate_limited() {
            warn!(
                target = "restage.retry",
                call = what,
                attempt = n,
                "upstream rate limited"
            );
            rate_limited = Some(err);
            if n < max_attempts {
                sleep(rate_limit_backoff(n)).await;
            }
            continue;
        }

        if n == max_attempts {
            return Err(ApiError {
                status: err.status,
                message: format!("{what} failed after {max_attempts} attempts: {}", err.message),
            });
        }

        warn!(
            target = "restage.retry",
            call = what,
            attempt = n,
            error = %err,
            "attempt failed, retrying"
        );
        sleep(generic_backoff(n)).await;
    }

    Err(match rate_limited {
        Some(err) => ApiError {
            status: err.status,
            message: format!("{what} rate limited after {max_attempts} attempts"),
        },
        None => ApiError::transport(format!("{what} failed after {max_attempts} attempts")),
    })
}
