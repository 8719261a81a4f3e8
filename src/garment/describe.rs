use super::models::Classification;
use crate::llm::{ChatMessage, ChatParams, LlmClient, LlmError, MessageContent};
use thiserror::Error;
use tracing::debug;

const MAX_DESCRIPTION_WORDS: usize = 25;

#[derive(Debug, Error)]
pub enum DescribeError {
    #[error("description request failed: {0}")]
    Api(#[from] LlmError),
    #[error("model returned an empty description")]
    Empty,
}

/// Turns a classification into the one-sentence garment description the
/// synthesis prompt embeds. The model is asked for a single short sentence
/// and the reply is clamped to that shape regardless, so a chatty model
/// cannot bloat the downstream prompt.
pub async fn describe(
    llm: &LlmClient,
    api_key: &str,
    classification: &Classification,
    product_name: &str,
) -> Result<String, DescribeError> {
    let prompt = description_prompt(classification, product_name);
    let params = ChatParams {
        model: llm.config().text_model.clone(),
        messages: vec![ChatMessage::user(MessageContent::Text(prompt))],
        max_tokens: Some(100),
        temperature: Some(0.3),
        json_output: false,
    };

    let content = llm.chat(api_key, &params).await?;
    let description = tidy_sentence(&content);
    if description.is_empty() {
        return Err(DescribeError::Empty);
    }
    debug!(
        target = "restage.garment",
        words = description.split(' ').count(),
        "description_generated"
    );
    Ok(description)
}

fn description_prompt(classification: &Classification, product_name: &str) -> String {
    let analysis = serde_json::to_string_pretty(classification)
        .unwrap_or_else(|_| String::from("{}"));
    format!(
        r#"Based on the detailed analysis below, generate ONE concise sentence describing this clothing item.

**PRODUCT NAME:** {product_name}

**DETAILED ANALYSIS:**
{analysis}

**YOUR TASK:**
Write ONE SINGLE SENTENCE in this exact format:
"This is the [front/back] side of a [item type] [with key features]."

**REQUIREMENTS:**
- MUST be ONE sentence only (no multiple sentences)
- MUST start with "This is the front side of" or "This is the back side of"
- Include 1-2 key distinguishing features (patterns, prints, style elements - NOT colors)
- DO NOT mention any colors
- Keep it under 25 words
- Be natural and conversational

**EXAMPLES:**
- "This is the front side of a striped one-shoulder long-sleeved t-shirt with angel heart print."
- "This is the back side of a hoodie with plain design."
- "This is the front side of denim jeans with distressed detailing and rhinestone embellishments."

Output ONLY the single sentence, nothing else:"#
    )
}

/// Normalizes a model reply into one clean sentence. Strips wrapping quotes
/// and extra whitespace, then cuts at the first sentence break and clamps to
/// [`MAX_DESCRIPTION_WORDS`] words.
pub fn tidy_sentence(input: &str) -> String {
    let unquoted = input.trim().trim_matches(|ch| ch == '"' || ch == '\'');
    let collapsed = unquoted.split_whitespace().collect::<Vec<_>>().join(" ");

    let sentence = match collapsed.find(['.', '!', '?']) {
        Some(pos) => collapsed[..=pos].to_string(),
        None => collapsed,
    };

    let words: Vec<&str> = sentence.split(' ').filter(|w| !w.is_empty()).collect();
    if words.len() <= MAX_DESCRIPTION_WORDS {
        return sentence;
    }
    let mut clamped = words[..MAX_DESCRIPTION_WORDS].join(" ");
    if !clamped.ends_with(['.', '!', '?']) {
        clamped.push('.');
    }
    clamped
}
