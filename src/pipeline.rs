use crate::garment::{self, CategoryChoice, Classification, EnhancedListing, ViewHint};
use crate::http::build_client;
use crate::llm::{LlmClient, LlmConfig};
use crate::media;
use crate::models::{
    BatchItem, BatchStagingRequest, BatchStagingResponse, CategoryStageRequest,
    ClassifyStageRequest, DescribeStageRequest, EnhanceStageRequest, SeedPolicy, StageReport,
    StagingRequest, StagingResponse, TransformRequest, TransformResponse,
};
use crate::replicate::{self, PollSettings, PredictionError, PredictionInput, ReplicateConfig};
use crate::templates;
use rand::Rng;
use reqwest::Client;
use serde_json::{Value, json};
use std::{env, future::Future, sync::Arc, time::Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

#[derive(Clone)]
pub struct Pipeline {
    pub config: Arc<PipelineConfig>,
    pub llm: Arc<LlmClient>,
    http: Client,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let llm = LlmClient::new(config.llm.clone());
        Self {
            llm: Arc::new(llm),
            http: build_client(),
            config: Arc::new(config),
        }
    }

    pub fn from_env() -> Self {
        Self::new(PipelineConfig::from_env())
    }

    /// Full vision pipeline: classify and describe the garment, then restage
    /// it. Fails on the first stage that cannot produce its output; nothing
    /// is cached or replayed across runs.
    pub async fn run_vision(
        &self,
        request: TransformRequest,
    ) -> Result<TransformResponse, PipelineError> {
        let mut stages = Vec::new();

        let validated = self
            .capture_stage("validate", &mut stages, stages::validate(&request))
            .await?;

        let classification = self
            .capture_stage(
                "classification",
                &mut stages,
                stages::classify(&self.llm, &self.http, &validated),
            )
            .await?;

        let description = self
            .capture_stage(
                "description",
                &mut stages,
                stages::describe(&self.llm, &validated, &classification),
            )
            .await?;

        let final_image = self
            .capture_stage(
                "synthesis",
                &mut stages,
                stages::synthesize(&self.http, &self.config, &validated, &description),
            )
            .await?;

        Ok(TransformResponse {
            final_image,
            description,
            seed: validated.seed,
            stages,
        })
    }

    /// Direct staging: no analysis pass, the photo is restaged with the
    /// caller's instruction or the default scene.
    pub async fn run_staging(
        &self,
        request: StagingRequest,
    ) -> Result<StagingResponse, PipelineError> {
        let mut stages = Vec::new();

        let prepared = self
            .capture_stage("validate", &mut stages, stages::validate_staging(&request))
            .await?;

        let final_image = self
            .capture_stage(
                "staging",
                &mut stages,
                stages::stage_single(&self.http, &self.config, &prepared),
            )
            .await?;

        Ok(StagingResponse {
            final_image,
            seed: prepared.seed,
            stages,
        })
    }

    /// Batch staging. Items run independently: one failed image keeps its
    /// original reference and the rest of the batch continues.
    pub async fn run_staging_batch(
        &self,
        request: BatchStagingRequest,
    ) -> Result<BatchStagingResponse, PipelineError> {
        let mut stages = Vec::new();

        let plan = self
            .capture_stage(
                "validate",
                &mut stages,
                stages::validate_batch(&request, self.config.max_batch_images),
            )
            .await?;

        let concurrency = self.config.batch_concurrency.max(1);
        let items = self
            .capture_stage("staging", &mut stages, async {
                let items = if concurrency > 1 {
                    self.stage_batch_concurrent(&plan, concurrency).await
                } else {
                    self.stage_batch_sequential(&plan).await
                };
                let succeeded = items.iter().filter(|item| item.ok).count();
                let output = json!({
                    "count": items.len(),
                    "succeeded": succeeded,
                    "failed": items.len() - succeeded,
                    "seed_policy": plan.seed_policy,
                    "concurrency": concurrency,
                });
                Ok(StageOutcome::new(items, output))
            })
            .await?;

        let succeeded = items.iter().filter(|item| item.ok).count();
        let failed = items.len() - succeeded;
        Ok(BatchStagingResponse {
            items,
            succeeded,
            failed,
            seed_policy: plan.seed_policy,
            stages,
        })
    }

    async fn stage_batch_sequential(&self, plan: &BatchPlan) -> Vec<BatchItem> {
        let mut items = Vec::with_capacity(plan.image_urls.len());
        for (index, url) in plan.image_urls.iter().enumerate() {
            let seed = plan.seeds[index];
            let outcome = stages::stage_image(
                &self.http,
                &self.config.replicate,
                self.config.poll,
                &plan.replicate_token,
                &plan.prompt,
                url,
                seed,
            )
            .await;
            items.push(batch_item(index, url, seed, outcome));
        }
        items
    }

    async fn stage_batch_concurrent(&self, plan: &BatchPlan, concurrency: usize) -> Vec<BatchItem> {
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut set = JoinSet::new();
        for (index, url) in plan.image_urls.iter().enumerate() {
            let semaphore = semaphore.clone();
            let http = self.http.clone();
            let replicate = self.config.replicate.clone();
            let poll = self.config.poll;
            let token = plan.replicate_token.clone();
            let prompt = plan.prompt.clone();
            let url = url.clone();
            let seed = plan.seeds[index];
            set.spawn(async move {
                let outcome = match semaphore.acquire_owned().await {
                    Ok(_permit) => {
                        stages::stage_image(&http, &replicate, poll, &token, &prompt, &url, seed)
                            .await
                    }
                    Err(_) => Err(PredictionError::JobFailed("staging pool closed".into())),
                };
                (index, url, seed, outcome)
            });
        }

        let mut slots: Vec<Option<BatchItem>> = Vec::new();
        slots.resize_with(plan.image_urls.len(), || None);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, url, seed, outcome)) => {
                    slots[index] = Some(batch_item(index, &url, seed, outcome));
                }
                Err(err) => {
                    warn!(target = "restage.pipeline", error = %err, "batch task aborted");
                }
            }
        }
        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    let url = plan.image_urls[index].clone();
                    BatchItem {
                        index,
                        source_url: url.clone(),
                        final_image: url,
                        seed: plan.seeds[index],
                        ok: false,
                        error: Some("staging task aborted".to_string()),
                    }
                })
            })
            .collect()
    }

    // Wrappers for the granular stage endpoints.

    pub async fn stage_classify(
        &self,
        request: &ClassifyStageRequest,
    ) -> Result<Classification, PipelineError> {
        let key = require_credential(
            "classification",
            request.credentials.openrouter_api_key.as_deref(),
            "openrouter_api_key",
        )?;
        check_image_reference("classification", &request.image_url)?;
        let image = media::fetch_image(&self.http, &request.image_url)
            .await
            .map_err(|err| PipelineError::internal("classification", err.to_string()))?;
        garment::classify(
            &self.llm,
            key,
            &image,
            &request.product.name,
            request.product.link.as_deref(),
            request.view,
        )
        .await
        .map_err(|err| PipelineError::internal("classification", err.to_string()))
    }

    pub async fn stage_describe(
        &self,
        request: &DescribeStageRequest,
    ) -> Result<String, PipelineError> {
        let key = require_credential(
            "description",
            request.credentials.openrouter_api_key.as_deref(),
            "openrouter_api_key",
        )?;
        garment::describe(&self.llm, key, &request.classification, &request.product.name)
            .await
            .map_err(|err| PipelineError::internal("description", err.to_string()))
    }

    pub async fn stage_enhance(
        &self,
        request: &EnhanceStageRequest,
    ) -> Result<EnhancedListing, PipelineError> {
        let key = require_credential(
            "enhancement",
            request.credentials.openrouter_api_key.as_deref(),
            "openrouter_api_key",
        )?;
        if request.listing.name.trim().is_empty() {
            return Err(PipelineError::invalid_input(
                "enhancement",
                "missing product name",
            ));
        }
        garment::enhance(&self.llm, key, &request.listing)
            .await
            .map_err(|err| PipelineError::internal("enhancement", err.to_string()))
    }

    pub async fn stage_category(
        &self,
        request: &CategoryStageRequest,
    ) -> Result<CategoryChoice, PipelineError> {
        let key = require_credential(
            "category",
            request.credentials.openrouter_api_key.as_deref(),
            "openrouter_api_key",
        )?;
        if request.product_name.trim().is_empty() {
            return Err(PipelineError::invalid_input(
                "category",
                "missing product name",
            ));
        }
        garment::suggest_category(&self.llm, key, &request.product_name, &request.description)
            .await
            .map_err(|err| PipelineError::internal("category", err.to_string()))
    }

    async fn capture_stage<T, Fut>(
        &self,
        name: &'static str,
        stages: &mut Vec<StageReport>,
        fut: Fut,
    ) -> Result<T, PipelineError>
    where
        Fut: Future<Output = Result<StageOutcome<T>, PipelineError>>,
    {
        let started = Instant::now();
        let outcome = fut.await?;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        stages.push(StageReport::new(name, elapsed_ms, outcome.output));
        Ok(outcome.value)
    }
}

#[derive(Clone)]
pub struct PipelineConfig {
    pub llm: LlmConfig,
    pub replicate: ReplicateConfig,
    pub poll: PollSettings,
    pub batch_concurrency: usize,
    pub max_batch_images: usize,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            llm: LlmConfig::from_env(),
            replicate: ReplicateConfig::from_env(),
            poll: PollSettings::from_env(),
            batch_concurrency: env_usize("BATCH_CONCURRENCY", 1),
            max_batch_images: env_usize("MAX_BATCH_IMAGES", 12),
        }
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    Timeout,
    Internal,
}

impl PipelineError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::InvalidInput,
        }
    }

    pub fn timeout(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Timeout,
        }
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Internal,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

/// A transform request after the validate stage: credentials present, view
/// confirmed, exactly one seed fixed for the rest of the run.
#[derive(Debug, Clone)]
pub struct ValidatedTransform {
    image_url: String,
    view: ViewHint,
    card_text: Option<String>,
    product_name: String,
    product_link: Option<String>,
    seed: u64,
    openrouter_key: String,
    replicate_token: String,
}

#[derive(Debug, Clone)]
pub struct PreparedStaging {
    image_url: String,
    prompt: String,
    seed: u64,
    replicate_token: String,
}

#[derive(Debug, Clone)]
pub struct BatchPlan {
    image_urls: Vec<String>,
    prompt: String,
    seed_policy: SeedPolicy,
    seeds: Vec<u64>,
    replicate_token: String,
}

pub fn draw_seed() -> u64 {
    rand::rng().random_range(0..1_000_000)
}

fn require_credential<'a>(
    stage: &'static str,
    value: Option<&'a str>,
    name: &str,
) -> Result<&'a str, PipelineError> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| PipelineError::invalid_input(stage, format!("missing {name}")))
}

fn check_image_reference(stage: &'static str, reference: &str) -> Result<(), PipelineError> {
    if reference.starts_with("data:") {
        return Ok(());
    }
    match reqwest::Url::parse(reference) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        Ok(parsed) => Err(PipelineError::invalid_input(
            stage,
            format!("unsupported url scheme `{}`", parsed.scheme()),
        )),
        Err(_) => Err(PipelineError::invalid_input(
            stage,
            format!("invalid image url: {reference}"),
        )),
    }
}

fn batch_item(
    index: usize,
    url: &str,
    seed: u64,
    outcome: Result<String, PredictionError>,
) -> BatchItem {
    match outcome {
        Ok(final_image) => BatchItem {
            index,
            source_url: url.to_string(),
            final_image,
            seed,
            ok: true,
            error: None,
        },
        Err(err) => {
            warn!(
                target = "restage.pipeline",
                index,
                error = %err,
                "batch item failed, keeping the original image"
            );
            BatchItem {
                index,
                source_url: url.to_string(),
                final_image: url.to_string(),
                seed,
                ok: false,
                error: Some(err.to_string()),
            }
        }
    }
}

pub mod stages {
    use super::*;

    pub async fn validate(
        request: &TransformRequest,
    ) -> Result<StageOutcome<ValidatedTransform>, PipelineError> {
        let image_url = request.image_url.trim().to_string();
        if image_url.is_empty() {
            return Err(PipelineError::invalid_input(
                "validate",
                "no source image provided",
            ));
        }
        check_image_reference("validate", &image_url)?;

        let Some(view) = request.view else {
            return Err(PipelineError::invalid_input(
                "validate",
                "missing view hint (front or back)",
            ));
        };
        if request.product.name.trim().is_empty() {
            return Err(PipelineError::invalid_input(
                "validate",
                "missing product name",
            ));
        }

        let openrouter_key = require_credential(
            "validate",
            request.credentials.openrouter_api_key.as_deref(),
            "openrouter_api_key",
        )?
        .to_string();
        let replicate_token = require_credential(
            "validate",
            request.credentials.replicate_api_token.as_deref(),
            "replicate_api_token",
        )?
        .to_string();

        let card_text = request
            .card_text
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string);
        let seed = request.seed.unwrap_or_else(draw_seed);

        let validated = ValidatedTransform {
            image_url,
            view,
            card_text,
            product_name: request.product.name.trim().to_string(),
            product_link: request.product.link.clone(),
            seed,
            openrouter_key,
            replicate_token,
        };
        let output = json!({
            "view": validated.view,
            "seed": validated.seed,
            "card_text_present": validated.card_text.is_some(),
            "product": validated.product_name,
        });
        Ok(StageOutcome::new(validated, output))
    }

    pub async fn classify(
        llm: &LlmClient,
        http: &Client,
        validated: &ValidatedTransform,
    ) -> Result<StageOutcome<Classification>, PipelineError> {
        let image = media::fetch_image(http, &validated.image_url)
            .await
            .map_err(|err| PipelineError::internal("classification", err.to_string()))?;
        let classification = garment::classify(
            llm,
            &validated.openrouter_key,
            &image,
            &validated.product_name,
            validated.product_link.as_deref(),
            validated.view,
        )
        .await
        .map_err(|err| PipelineError::internal("classification", err.to_string()))?;

        let output = serde_json::to_value(&classification).unwrap_or_else(|_| json!({}));
        Ok(StageOutcome::new(classification, output))
    }

    pub async fn describe(
        llm: &LlmClient,
        validated: &ValidatedTransform,
        classification: &Classification,
    ) -> Result<StageOutcome<String>, PipelineError> {
        let description = garment::describe(
            llm,
            &validated.openrouter_key,
            classification,
            &validated.product_name,
        )
        .await
        .map_err(|err| PipelineError::internal("description", err.to_string()))?;

        let output = json!({
            "description": description,
            "words": description.split(' ').count(),
        });
        Ok(StageOutcome::new(description, output))
    }

    pub async fn synthesize(
        http: &Client,
        config: &PipelineConfig,
        validated: &ValidatedTransform,
        description: &str,
    ) -> Result<StageOutcome<String>, PipelineError> {
        let prompt =
            templates::vision_staging_prompt(description, validated.card_text.as_deref());
        let final_image = stage_image(
            http,
            &config.replicate,
            config.poll,
            &validated.replicate_token,
            &prompt,
            &validated.image_url,
            validated.seed,
        )
        .await
        .map_err(|err| prediction_failure("synthesis", err))?;

        let output = json!({
            "seed": validated.seed,
            "bytes": final_image.len(),
        });
        Ok(StageOutcome::new(final_image, output))
    }

    pub async fn validate_staging(
        request: &StagingRequest,
    ) -> Result<StageOutcome<PreparedStaging>, PipelineError> {
        let image_url = request.image_url.trim().to_string();
        if image_url.is_empty() {
            return Err(PipelineError::invalid_input(
                "validate",
                "no source image provided",
            ));
        }
        check_image_reference("validate", &image_url)?;
        let replicate_token = require_credential(
            "validate",
            request.credentials.replicate_api_token.as_deref(),
            "replicate_api_token",
        )?
        .to_string();

        let prompt = templates::staging_prompt(
            request.instruction.as_deref(),
            request.product_description.as_deref(),
        );
        let seed = request.seed.unwrap_or_else(draw_seed);

        let prepared = PreparedStaging {
            image_url,
            prompt,
            seed,
            replicate_token,
        };
        let output = json!({
            "seed": prepared.seed,
            "custom_instruction": request.instruction.is_some(),
            "has_description": request.product_description.is_some(),
        });
        Ok(StageOutcome::new(prepared, output))
    }

    pub async fn stage_single(
        http: &Client,
        config: &PipelineConfig,
        prepared: &PreparedStaging,
    ) -> Result<StageOutcome<String>, PipelineError> {
        let final_image = stage_image(
            http,
            &config.replicate,
            config.poll,
            &prepared.replicate_token,
            &prepared.prompt,
            &prepared.image_url,
            prepared.seed,
        )
        .await
        .map_err(|err| prediction_failure("staging", err))?;

        let output = json!({
            "seed": prepared.seed,
            "bytes": final_image.len(),
        });
        Ok(StageOutcome::new(final_image, output))
    }

    pub async fn validate_batch(
        request: &BatchStagingRequest,
        max_images: usize,
    ) -> Result<StageOutcome<BatchPlan>, PipelineError> {
        if request.image_urls.is_empty() {
            return Err(PipelineError::invalid_input(
                "validate",
                "no images provided",
            ));
        }
        if request.image_urls.len() > max_images {
            return Err(PipelineError::invalid_input(
                "validate",
                format!("too many images, the batch limit is {max_images}"),
            ));
        }
        for url in &request.image_urls {
            check_image_reference("validate", url)?;
        }
        let replicate_token = require_credential(
            "validate",
            request.credentials.replicate_api_token.as_deref(),
            "replicate_api_token",
        )?
        .to_string();

        let prompt = templates::staging_prompt(
            request.instruction.as_deref(),
            request.product_description.as_deref(),
        );
        let seeds = match request.seed_policy {
            SeedPolicy::Shared => {
                let shared = draw_seed();
                vec![shared; request.image_urls.len()]
            }
            SeedPolicy::PerImage => request.image_urls.iter().map(|_| draw_seed()).collect(),
        };

        let plan = BatchPlan {
            image_urls: request.image_urls.clone(),
            prompt,
            seed_policy: request.seed_policy,
            seeds,
            replicate_token,
        };
        let output = json!({
            "count": plan.image_urls.len(),
            "seed_policy": plan.seed_policy,
        });
        Ok(StageOutcome::new(plan, output))
    }

    /// Shared tail of every staging path: submit and poll to terminal, then
    /// fetch the produced image and inline it as a data URL.
    pub(super) async fn stage_image(
        http: &Client,
        config: &ReplicateConfig,
        poll: PollSettings,
        token: &str,
        prompt: &str,
        image_url: &str,
        seed: u64,
    ) -> Result<String, PredictionError> {
        let input = PredictionInput::staged(prompt, image_url, seed);
        let finished = replicate::submit_and_await(http, config, token, &input, poll).await?;
        let output = finished.output_reference().ok_or_else(|| {
            PredictionError::JobFailed("job succeeded without an output".to_string())
        })?;
        let image = media::fetch_image(http, output)
            .await
            .map_err(|err| PredictionError::Api(crate::retry::ApiError::transport(err.to_string())))?;
        Ok(image.data_url())
    }

    fn prediction_failure(stage: &'static str, err: PredictionError) -> PipelineError {
        match err {
            PredictionError::Timeout(_) => PipelineError::timeout(stage, err.to_string()),
            _ => PipelineError::internal(stage, err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Credentials, ProductContext};
    use axum::extract::{Path, State};
    use axum::http::header;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Duration;

    #[derive(Clone)]
    struct Upstream {
        base: String,
        chat_replies: Arc<Mutex<Vec<String>>>,
        chat_calls: Arc<AtomicUsize>,
        submissions: Arc<Mutex<Vec<Value>>>,
        polls: Arc<AtomicUsize>,
        pending_polls: Arc<AtomicUsize>,
    }

    async fn chat_handler(State(upstream): State<Upstream>, Json(_body): Json<Value>) -> Json<Value> {
        upstream.chat_calls.fetch_add(1, Ordering::SeqCst);
        let reply = {
            let mut replies = upstream.chat_replies.lock().unwrap();
            if replies.is_empty() {
                String::new()
            } else {
                replies.remove(0)
            }
        };
        Json(json!({
            "choices": [{"message": {"role": "assistant", "content": reply}}]
        }))
    }

    async fn create_handler(State(upstream): State<Upstream>, Json(body): Json<Value>) -> Json<Value> {
        upstream.submissions.lock().unwrap().push(body.clone());
        let input_image = body["input"]["input_image"].as_str().unwrap_or_default();
        if input_image.contains("always-fails") {
            return Json(json!({
                "id": "pred-bad",
                "status": "failed",
                "error": "generation crashed"
            }));
        }
        if upstream.pending_polls.load(Ordering::SeqCst) > 0 {
            Json(json!({"id": "pred-1", "status": "starting"}))
        } else {
            Json(json!({
                "id": "pred-1",
                "status": "succeeded",
                "output": [format!("{}/img/staged.jpg", upstream.base)]
            }))
        }
    }

    async fn poll_handler(
        State(upstream): State<Upstream>,
        Path(_id): Path<String>,
    ) -> Json<Value> {
        upstream.polls.fetch_add(1, Ordering::SeqCst);
        let left = upstream.pending_polls.load(Ordering::SeqCst);
        if left > 0 {
            upstream.pending_polls.store(left - 1, Ordering::SeqCst);
            Json(json!({"id": "pred-1", "status": "processing"}))
        } else {
            Json(json!({
                "id": "pred-1",
                "status": "succeeded",
                "output": [format!("{}/img/staged.jpg", upstream.base)]
            }))
        }
    }

    async fn image_handler(Path(_name): Path<String>) -> impl axum::response::IntoResponse {
        (
            [(header::CONTENT_TYPE, "image/jpeg")],
            &b"\xff\xd8\xff\xe0fakejpegbytes"[..],
        )
    }

    async fn start_stub(pending_polls: usize, chat_replies: Vec<&str>) -> Upstream {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub");
        let addr = listener.local_addr().expect("stub addr");
        let upstream = Upstream {
            base: format!("http://{addr}"),
            chat_replies: Arc::new(Mutex::new(
                chat_replies.into_iter().map(str::to_string).collect(),
            )),
            chat_calls: Arc::new(AtomicUsize::new(0)),
            submissions: Arc::new(Mutex::new(Vec::new())),
            polls: Arc::new(AtomicUsize::new(0)),
            pending_polls: Arc::new(AtomicUsize::new(pending_polls)),
        };
        let app = Router::new()
            .route("/api/chat/completions", post(chat_handler))
            .route("/v1/predictions", post(create_handler))
            .route("/v1/predictions/{id}", get(poll_handler))
            .route("/img/{name}", get(image_handler))
            .with_state(upstream.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        upstream
    }

    fn test_config(upstream: &Upstream) -> PipelineConfig {
        PipelineConfig {
            llm: LlmConfig {
                base_url: format!("{}/api", upstream.base),
                vision_model: "stub/vision".into(),
                text_model: "stub/text".into(),
                listing_model: "stub/listing".into(),
                referer: None,
                title: None,
            },
            replicate: ReplicateConfig {
                base_url: format!("{}/v1", upstream.base),
                model_version: "version-under-test".into(),
            },
            poll: PollSettings {
                interval: Duration::from_millis(10),
                budget: Duration::from_secs(5),
            },
            batch_concurrency: 1,
            max_batch_images: 6,
        }
    }

    fn pipeline_against(upstream: &Upstream) -> Pipeline {
        Pipeline::new(test_config(upstream))
    }

    fn credentials() -> Credentials {
        Credentials {
            openrouter_api_key: Some("or-test-key".into()),
            replicate_api_token: Some("rep-test-token".into()),
        }
    }

    fn transform_request(upstream: &Upstream) -> TransformRequest {
        TransformRequest {
            image_url: format!("{}/img/source.jpg", upstream.base),
            view: Some(ViewHint::Front),
            card_text: Some("From Kate".into()),
            product: ProductContext {
                name: "Cozy Hoodie".into(),
                link: Some("https://shop.example/hoodie".into()),
            },
            seed: Some(4242),
            credentials: credentials(),
        }
    }

    const CLASSIFICATION_REPLY: &str = "```json\n{\"item_type\": \"hoodie\", \"category\": \"sweaters\", \"view\": \"back\", \"confidence\": 0.92, \"details\": {\"pattern\": \"solid\", \"style\": \"casual\", \"notable_features\": [\"kangaroo pocket\"]}}\n```";
    const DESCRIPTION_REPLY: &str =
        "\"This is the front side of a hoodie with plain design.\"";

    #[tokio::test]
    async fn the_vision_pipeline_runs_all_four_stages() {
        let upstream = start_stub(2, vec![CLASSIFICATION_REPLY, DESCRIPTION_REPLY]).await;
        let pipeline = pipeline_against(&upstream);

        let response = pipeline
            .run_vision(transform_request(&upstream))
            .await
            .expect("pipeline run");

        assert!(response.final_image.starts_with("data:image/jpeg;base64,"));
        assert_eq!(
            response.description,
            "This is the front side of a hoodie with plain design."
        );
        assert_eq!(response.seed, 4242);
        let names: Vec<&str> = response.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["validate", "classification", "description", "synthesis"]
        );

        assert_eq!(upstream.chat_calls.load(Ordering::SeqCst), 2);
        // Submission returned `starting`, then two in-flight polls.
        assert_eq!(upstream.polls.load(Ordering::SeqCst), 3);

        let submissions = upstream.submissions.lock().unwrap();
        assert_eq!(submissions.len(), 1);
        let submission = &submissions[0];
        assert_eq!(submission["version"], "version-under-test");
        assert_eq!(submission["input"]["seed"], 4242);
        assert_eq!(
            submission["input"]["input_image"],
            format!("{}/img/source.jpg", upstream.base)
        );
        let prompt = submission["input"]["prompt"].as_str().unwrap();
        assert!(prompt.contains(
            "Make these changes on: This is the front side of a hoodie with plain design."
        ));
        assert!(prompt.contains("index card with \"From Kate\""));
    }

    #[tokio::test]
    async fn the_classification_echo_never_overrides_the_caller_view() {
        // The stub reply above claims `back`; the request says front.
        let upstream = start_stub(0, vec![CLASSIFICATION_REPLY]).await;
        let pipeline = pipeline_against(&upstream);

        let classification = pipeline
            .stage_classify(&ClassifyStageRequest {
                image_url: format!("{}/img/source.jpg", upstream.base),
                view: ViewHint::Front,
                product: ProductContext {
                    name: "Cozy Hoodie".into(),
                    link: None,
                },
                credentials: credentials(),
            })
            .await
            .expect("classification");
        assert_eq!(classification.view, "front");
        assert_eq!(classification.item_type, "hoodie");
    }

    #[tokio::test]
    async fn an_unparseable_classification_fails_fast() {
        let upstream = start_stub(0, vec!["the model rambled with no json"]).await;
        let pipeline = pipeline_against(&upstream);

        let err = pipeline
            .run_vision(transform_request(&upstream))
            .await
            .expect_err("should fail");
        assert_eq!(err.stage(), "classification");
        assert_eq!(err.kind(), PipelineErrorKind::Internal);
        // Later stages never ran.
        assert_eq!(upstream.chat_calls.load(Ordering::SeqCst), 1);
        assert!(upstream.submissions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn validation_rejects_requests_before_any_network_call() {
        let mut request = TransformRequest {
            image_url: "https://img.example/tee.jpg".into(),
            view: None,
            card_text: None,
            product: ProductContext {
                name: "Tee".into(),
                link: None,
            },
            seed: None,
            credentials: credentials(),
        };
        let err = stages::validate(&request).await.unwrap_err();
        assert_eq!(err.stage(), "validate");
        assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);
        assert!(err.detail().contains("view hint"));

        request.view = Some(ViewHint::Front);
        request.image_url = "ftp://img.example/tee.jpg".into();
        let err = stages::validate(&request).await.unwrap_err();
        assert!(err.detail().contains("unsupported url scheme"));

        request.image_url = "https://img.example/tee.jpg".into();
        request.credentials.replicate_api_token = None;
        let err = stages::validate(&request).await.unwrap_err();
        assert!(err.detail().contains("replicate_api_token"));

        request.credentials = credentials();
        request.product.name = "  ".into();
        let err = stages::validate(&request).await.unwrap_err();
        assert!(err.detail().contains("product name"));
    }

    #[tokio::test]
    async fn a_missing_seed_is_drawn_and_reported() {
        let upstream = start_stub(0, vec![]).await;
        let pipeline = pipeline_against(&upstream);

        let response = pipeline
            .run_staging(StagingRequest {
                image_url: format!("{}/img/source.jpg", upstream.base),
                instruction: None,
                product_description: Some("a denim jacket".into()),
                seed: None,
                credentials: credentials(),
            })
            .await
            .expect("staging run");

        assert!(response.seed < 1_000_000);
        let names: Vec<&str> = response.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["validate", "staging"]);

        let submissions = upstream.submissions.lock().unwrap();
        assert_eq!(submissions[0]["input"]["seed"], response.seed);
        let prompt = submissions[0]["input"]["prompt"].as_str().unwrap();
        assert!(prompt.starts_with("This item is a denim jacket."));
        assert!(prompt.contains("unmade white bed"));
        assert!(prompt.ends_with("identical to the original."));
    }

    #[tokio::test]
    async fn a_shared_seed_batch_reuses_one_seed() {
        let upstream = start_stub(0, vec![]).await;
        let pipeline = pipeline_against(&upstream);

        let response = pipeline
            .run_staging_batch(BatchStagingRequest {
                image_urls: vec![
                    format!("{}/img/a.jpg", upstream.base),
                    format!("{}/img/b.jpg", upstream.base),
                    format!("{}/img/c.jpg", upstream.base),
                ],
                instruction: None,
                product_description: None,
                seed_policy: SeedPolicy::Shared,
                credentials: credentials(),
            })
            .await
            .expect("batch run");

        assert_eq!(response.succeeded, 3);
        assert_eq!(response.failed, 0);
        assert_eq!(response.seed_policy, SeedPolicy::Shared);

        let submissions = upstream.submissions.lock().unwrap();
        let seeds: HashSet<u64> = submissions
            .iter()
            .map(|s| s["input"]["seed"].as_u64().unwrap())
            .collect();
        assert_eq!(seeds.len(), 1, "every submission must share the seed");
        assert!(response.items.iter().all(|item| item.ok));
        assert!(response.items.iter().all(|item| Some(item.seed) == seeds.iter().next().copied()));
    }

    #[tokio::test]
    async fn a_per_image_batch_draws_distinct_seeds() {
        let upstream = start_stub(0, vec![]).await;
        let pipeline = pipeline_against(&upstream);

        let response = pipeline
            .run_staging_batch(BatchStagingRequest {
                image_urls: vec![
                    format!("{}/img/a.jpg", upstream.base),
                    format!("{}/img/b.jpg", upstream.base),
                    format!("{}/img/c.jpg", upstream.base),
                ],
                instruction: None,
                product_description: None,
                seed_policy: SeedPolicy::PerImage,
                credentials: credentials(),
            })
            .await
            .expect("batch run");

        let seeds: HashSet<u64> = response.items.iter().map(|item| item.seed).collect();
        assert_eq!(seeds.len(), 3, "per-image seeds should differ");
    }

    #[tokio::test]
    async fn a_failed_batch_item_keeps_the_original_image() {
        let upstream = start_stub(0, vec![]).await;
        let pipeline = pipeline_against(&upstream);
        let failing = format!("{}/img/always-fails.jpg", upstream.base);

        let response = pipeline
            .run_staging_batch(BatchStagingRequest {
                image_urls: vec![
                    format!("{}/img/a.jpg", upstream.base),
                    failing.clone(),
                    format!("{}/img/c.jpg", upstream.base),
                ],
                instruction: Some("Hang it on a rack".into()),
                product_description: None,
                seed_policy: SeedPolicy::PerImage,
                credentials: credentials(),
            })
            .await
            .expect("batch run");

        assert_eq!(response.succeeded, 2);
        assert_eq!(response.failed, 1);
        assert_eq!(response.items.len(), 3);

        let failed = &response.items[1];
        assert!(!failed.ok);
        assert_eq!(failed.index, 1);
        assert_eq!(failed.final_image, failing);
        assert!(failed.error.as_deref().unwrap().contains("generation crashed"));

        assert!(response.items[0].ok);
        assert!(response.items[2].ok);
        assert!(response.items[0].final_image.starts_with("data:image/jpeg;base64,"));
    }

    #[tokio::test]
    async fn a_bounded_worker_pool_preserves_item_order() {
        let upstream = start_stub(0, vec![]).await;
        let mut config = test_config(&upstream);
        config.batch_concurrency = 3;
        let pipeline = Pipeline::new(config);

        let response = pipeline
            .run_staging_batch(BatchStagingRequest {
                image_urls: vec![
                    format!("{}/img/a.jpg", upstream.base),
                    format!("{}/img/b.jpg", upstream.base),
                    format!("{}/img/c.jpg", upstream.base),
                    format!("{}/img/d.jpg", upstream.base),
                ],
                instruction: None,
                product_description: None,
                seed_policy: SeedPolicy::PerImage,
                credentials: credentials(),
            })
            .await
            .expect("batch run");

        assert_eq!(response.succeeded, 4);
        let indices: Vec<usize> = response.items.iter().map(|item| item.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert!(
            response
                .items
                .iter()
                .enumerate()
                .all(|(position, item)| item.index == position)
        );
    }

    #[tokio::test]
    async fn oversized_batches_are_rejected_up_front() {
        let request = BatchStagingRequest {
            image_urls: (0..7)
                .map(|n| format!("https://img.example/{n}.jpg"))
                .collect(),
            instruction: None,
            product_description: None,
            seed_policy: SeedPolicy::PerImage,
            credentials: credentials(),
        };
        let err = stages::validate_batch(&request, 6).await.unwrap_err();
        assert_eq!(err.stage(), "validate");
        assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);
        assert!(err.detail().contains("batch limit is 6"));
    }

    #[tokio::test]
    async fn staging_requires_the_replicate_token_only() {
        let request = StagingRequest {
            image_url: "https://img.example/tee.jpg".into(),
            instruction: None,
            product_description: None,
            seed: None,
            credentials: Credentials {
                openrouter_api_key: None,
                replicate_api_token: Some("rep-test-token".into()),
            },
        };
        assert!(stages::validate_staging(&request).await.is_ok());

        let request = StagingRequest {
            credentials: Credentials::default(),
            ..request
        };
        let err = stages::validate_staging(&request).await.unwrap_err();
        assert!(err.detail().contains("replicate_api_token"));
    }
}
