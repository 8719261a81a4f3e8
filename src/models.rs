use crate::garment::{Classification, ListingSource, ViewHint};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-request upstream credentials. They ride in the request body, are
/// checked for presence where a stage needs them, and are never persisted
/// or logged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub openrouter_api_key: Option<String>,
    #[serde(default)]
    pub replicate_api_token: Option<String>,
}

/// What the garment in the photo is being sold as.
#[derive(Debug, Clone, Deserialize)]
pub struct ProductContext {
    pub name: String,
    #[serde(default)]
    pub link: Option<String>,
}

/// Full vision pipeline request: one garment photo in, one staged photo out.
#[derive(Debug, Clone, Deserialize)]
pub struct TransformRequest {
    pub image_url: String,
    #[serde(default)]
    pub view: Option<ViewHint>,
    #[serde(default)]
    pub card_text: Option<String>,
    pub product: ProductContext,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub credentials: Credentials,
}

/// Direct staging request: skip analysis and restage one photo as-is.
#[derive(Debug, Clone, Deserialize)]
pub struct StagingRequest {
    pub image_url: String,
    #[serde(default)]
    pub instruction: Option<String>,
    #[serde(default)]
    pub product_description: Option<String>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub credentials: Credentials,
}

/// How seeds are assigned across a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedPolicy {
    /// Every image draws its own seed, giving varied staging.
    #[default]
    PerImage,
    /// One seed for the whole batch, keeping the scene consistent
    /// across photos of the same product.
    Shared,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchStagingRequest {
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub instruction: Option<String>,
    #[serde(default)]
    pub product_description: Option<String>,
    #[serde(default)]
    pub seed_policy: SeedPolicy,
    #[serde(default)]
    pub credentials: Credentials,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformResponse {
    pub final_image: String,
    pub description: String,
    pub seed: u64,
    pub stages: Vec<StageReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingResponse {
    pub final_image: String,
    pub seed: u64,
    pub stages: Vec<StageReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchStagingResponse {
    pub items: Vec<BatchItem>,
    pub succeeded: usize,
    pub failed: usize,
    pub seed_policy: SeedPolicy,
    pub stages: Vec<StageReport>,
}

/// One image's outcome within a batch. A failed item keeps the original
/// reference as its final image so the caller's photo set stays complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub index: usize,
    pub source_url: String,
    pub final_image: String,
    pub seed: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassifyStageRequest {
    pub image_url: String,
    pub view: ViewHint,
    pub product: ProductContext,
    #[serde(default)]
    pub credentials: Credentials,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DescribeStageRequest {
    pub classification: Classification,
    pub product: ProductContext,
    #[serde(default)]
    pub credentials: Credentials,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnhanceStageRequest {
    pub listing: ListingSource,
    #[serde(default)]
    pub credentials: Credentials,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CategoryStageRequest {
    pub product_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub credentials: Credentials,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

/// JSON body every error response carries.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
