use super::models::{Classification, ViewHint};
use super::taxonomy;
use crate::llm::{self, ChatMessage, ChatParams, LlmClient, LlmError, MessageContent, MessagePart};
use crate::media::EncodedImage;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("vision request failed: {0}")]
    Api(#[from] LlmError),
    #[error("unable to parse classification json")]
    Parse,
}

/// Reads one garment photo into a [`Classification`].
///
/// The image goes inline as a data URL; passing the source URL through to
/// the model is not reliable because listing CDNs reject its fetches. The
/// caller's view hint always wins over the model's echo of it.
pub async fn classify(
    llm: &LlmClient,
    api_key: &str,
    image: &EncodedImage,
    product_name: &str,
    product_link: Option<&str>,
    view: ViewHint,
) -> Result<Classification, ClassifyError> {
    let prompt = classification_prompt(product_name, product_link, view);
    let params = ChatParams {
        model: llm.config().vision_model.clone(),
        messages: vec![ChatMessage::user(MessageContent::Parts(vec![
            MessagePart::image(image.data_url()),
            MessagePart::text(prompt),
        ]))],
        max_tokens: Some(2000),
        temperature: Some(0.2),
        json_output: false,
    };

    let content = llm.chat(api_key, &params).await?;
    let mut classification: Classification =
        llm::parse_model_json(&content).map_err(|_| ClassifyError::Parse)?;
    classification.view = view.as_str().to_string();

    debug!(
        target = "restage.garment",
        item_type = %classification.item_type,
        category = %classification.category,
        confidence = classification.confidence,
        "garment_classified"
    );
    Ok(classification)
}

fn classification_prompt(product_name: &str, product_link: Option<&str>, view: ViewHint) -> String {
    let categories = serde_json::to_string_pretty(&taxonomy::garment_categories_json())
        .unwrap_or_else(|_| String::from("{}"));
    let link = product_link.unwrap_or("not provided");
    let view_upper = view.as_str().to_uppercase();
    format!(
        r#"You are an expert clothing analyzer. Analyze this image with HIGH REASONING capability.

**PRODUCT INFORMATION:**
- Product Name: {product_name}
- Product Link: {link}
- View: {view} (confirmed by user)

**CLOTHING CATEGORIES:**
{categories}

**YOUR ANALYSIS TASK:**
Use deep reasoning to:
1. Carefully examine the image and identify the exact clothing item
2. Compare with the product name to verify accuracy
3. The user has confirmed this is the {view_upper} view of the garment
4. Analyze patterns, style, and features in detail
5. Cross-reference with product name to ensure accuracy
6. Provide reasoning for your conclusions

**CRITICAL OUTPUT REQUIREMENTS:**
- Output ONLY valid JSON, nothing else
- No markdown, no code blocks, no backticks
- Be precise and confident in your analysis
- Use "{view}" as the view in your output

**JSON OUTPUT FORMAT:**
{{
  "item_type": "specific type (e.g., t-shirt, hoodie, dress, pants)",
  "category": "main category from the list above",
  "view": "{view}",
  "confidence": 0.0 to 1.0,
  "details": {{
    "pattern": "solid/striped/printed/graphic/etc",
    "style": "casual/formal/sporty/streetwear/etc",
    "sleeve_length": "sleeveless/short/long/three-quarter" (if applicable),
    "fit_type": "regular/slim/oversized/loose" (if visible),
    "notable_features": ["feature1", "feature2", "feature3"],
    "material_appearance": "cotton/denim/synthetic/knit/etc" (if visible)
  }},
  "reasoning": {{
    "item_identification": "why you classified it as this specific item type",
    "confidence_factors": "what makes you confident or uncertain",
    "view_note": "observations consistent with {view} view"
  }},
  "product_name_match": "does the image match the product name? explain briefly"
}}

USE HIGH REASONING. BE THOROUGH. OUTPUT ONLY JSON."#
    )
}
