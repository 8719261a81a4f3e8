use super::config::ReplicateConfig;
use crate::retry::{self, ApiError, MAX_ATTEMPTS};
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Input payload for one staging job.
#[derive(Debug, Clone, Serialize)]
pub struct PredictionInput {
    pub prompt: String,
    pub input_image: String,
    pub seed: u64,
    pub num_outputs: u32,
    pub aspect_ratio: String,
    pub output_format: String,
    pub output_quality: u32,
}

impl PredictionInput {
    /// Fixed listing-photo parameters: a single square jpg at quality 80.
    pub fn staged(prompt: impl Into<String>, input_image: impl Into<String>, seed: u64) -> Self {
        Self {
            prompt: prompt.into(),
            input_image: input_image.into(),
            seed,
            num_outputs: 1,
            aspect_ratio: "1:1".to_string(),
            output_format: "jpg".to_string(),
            output_quality: 80,
        }
    }
}

#[derive(Serialize)]
struct CreatePrediction<'a> {
    version: &'a str,
    input: &'a PredictionInput,
}

/// Lifecycle states as the upstream reports them. `starting` and
/// `processing` are the wire names for the two in-flight states; anything
/// this enum does not know is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionStatus {
    #[serde(alias = "starting")]
    Queued,
    #[serde(alias = "processing")]
    Running,
    Succeeded,
    Failed,
    Canceled,
    #[serde(other)]
    Unknown,
}

impl PredictionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Prediction {
    pub id: String,
    pub status: PredictionStatus,
    #[serde(default)]
    pub output: Option<PredictionOutput>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Prediction {
    /// First output reference, when the job produced one.
    pub fn output_reference(&self) -> Option<&str> {
        self.output.as_ref().and_then(PredictionOutput::first)
    }
}

/// The upstream returns either a bare URL or a list of them depending on
/// `num_outputs`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PredictionOutput {
    Single(String),
    Many(Vec<String>),
}

impl PredictionOutput {
    pub fn first(&self) -> Option<&str> {
        match self {
            Self::Single(url) => Some(url.as_str()),
            Self::Many(urls) => urls.first().map(String::as_str),
        }
    }
}

/// Submits a generation job. Submission goes through the shared retry
/// policy; the returned prediction is usually still in flight.
pub async fn create_prediction(
    http: &Client,
    config: &ReplicateConfig,
    api_token: &str,
    input: &PredictionInput,
) -> Result<Prediction, ApiError> {
    let url = format!("{}/predictions", config.base_url.trim_end_matches('/'));
    let body = CreatePrediction {
        version: &config.model_version,
        input,
    };
    let raw = retry::call_with_retry("prediction submit", MAX_ATTEMPTS, || {
        let request = http
            .post(&url)
            .header(reqwest::header::AUTHORIZATION, format!("Token {api_token}"))
            .json(&body);
        async move {
            let response = request
                .send()
                .await
                .map_err(|err| ApiError::transport(err.to_string()))?;
            retry::require_success(response).await
        }
    })
    .await?;
    parse_prediction(&raw)
}

/// One status fetch. Deliberately unretried, a dropped poll is cheaper to
/// surface than to paper over inside the polling budget.
pub async fn get_prediction(
    http: &Client,
    config: &ReplicateConfig,
    api_token: &str,
    id: &str,
) -> Result<Prediction, ApiError> {
    let url = format!(
        "{}/predictions/{}",
        config.base_url.trim_end_matches('/'),
        urlencoding::encode(id)
    );
    let response = http
        .get(&url)
        .header(reqwest::header::AUTHORIZATION, format!("Token {api_token}"))
        .send()
        .await
        .map_err(|err| ApiError::transport(err.to_string()))?;
    let raw = retry::require_success(response).await?;
    parse_prediction(&raw)
}

fn parse_prediction(raw: &str) -> Result<Prediction, ApiError> {
    serde_json::from_str(raw)
        .map_err(|err| ApiError::transport(format!("unreadable prediction payload: {err}")))
}
