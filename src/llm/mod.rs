pub mod openrouter;

pub use openrouter::{
    ChatMessage, ChatParams, ImageRef, LlmClient, LlmConfig, LlmError, MessageContent, MessagePart,
};

use serde::de::DeserializeOwned;

/// Pulls the JSON document out of a model reply. Handles a leading markdown
/// fence and prose wrapped around the first object, both of which show up in
/// practice even when the prompt demands bare JSON.
pub fn extract_json(input: &str) -> String {
    let trimmed = input.trim();
    let unfenced = if trimmed.starts_with("```") {
        let without_first = trimmed.lines().skip(1).collect::<Vec<_>>().join("\n");
        match without_first.rfind("```") {
            Some(idx) => without_first[..idx].trim().to_string(),
            None => without_first.trim().to_string(),
        }
    } else {
        trimmed.to_string()
    };
    if unfenced.starts_with('{') || unfenced.starts_with('[') {
        return unfenced;
    }
    match (unfenced.find('{'), unfenced.rfind('}')) {
        (Some(open), Some(close)) if open < close => unfenced[open..=close].to_string(),
        _ => unfenced,
    }
}

pub fn parse_model_json<T: DeserializeOwned>(input: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(&extract_json(input))
}
