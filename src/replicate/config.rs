/// Pinned image-to-image model build. Staging output is tuned against this
/// exact version, so upgrades go through config rather than code.
pub const DEFAULT_MODEL_VERSION: &str =
    "0f1178f5a27e9aa2d2d39c8a43c110f7fa7cbf64062ff04a04cd40899e546065";

#[derive(Debug, Clone)]
pub struct ReplicateConfig {
    pub base_url: String,
    pub model_version: String,
}

impl ReplicateConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: env_or("REPLICATE_API_BASE", "https://api.replicate.com/v1"),
            model_version: env_or("REPLICATE_MODEL_VERSION", DEFAULT_MODEL_VERSION),
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}
