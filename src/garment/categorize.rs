use super::taxonomy::{
    self, DEFAULT_LISTING_CATEGORY, DEFAULT_LISTING_SUBCATEGORY,
};
use crate::llm::{self, ChatMessage, ChatParams, LlmClient, LlmError, MessageContent};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// A validated marketplace category pick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryChoice {
    pub category: String,
    pub subcategory: String,
}

#[derive(Debug, Deserialize)]
struct CategoryReply {
    #[serde(default)]
    category: String,
    #[serde(default)]
    subcategory: String,
}

#[derive(Debug, Error)]
pub enum CategorizeError {
    #[error("category request failed: {0}")]
    Api(#[from] LlmError),
    #[error("unable to parse category json")]
    Parse,
}

/// Picks the listing category for a product. The model chooses from the
/// closed taxonomy and the pick is validated against it afterwards, so an
/// off-list suggestion degrades to a sane default instead of leaking into
/// the listing form.
pub async fn suggest_category(
    llm: &LlmClient,
    api_key: &str,
    product_name: &str,
    description: &str,
) -> Result<CategoryChoice, CategorizeError> {
    let prompt = category_prompt(product_name, description);
    let params = ChatParams {
        model: llm.config().text_model.clone(),
        messages: vec![ChatMessage::user(MessageContent::Text(prompt))],
        max_tokens: None,
        temperature: None,
        json_output: true,
    };

    let content = llm.chat(api_key, &params).await?;
    let reply: CategoryReply =
        llm::parse_model_json(&content).map_err(|_| CategorizeError::Parse)?;
    Ok(validate_choice(reply.category, reply.subcategory))
}

fn category_prompt(product_name: &str, description: &str) -> String {
    let taxonomy_text = taxonomy::listing_categories_text();
    format!(
        r#"You are an expert at categorizing clothing and fashion products for marketplace listings.

Based on the product name and description below, select:
1. The MOST APPROPRIATE category
2. The MOST APPROPRIATE subcategory for that category

**PRODUCT NAME:** {product_name}

**DESCRIPTION:** {description}

**AVAILABLE CATEGORIES AND SUBCATEGORIES:**
{taxonomy_text}

**INSTRUCTIONS:**
- Analyze the product name and description carefully
- Choose ONE category and ONE subcategory that best fits the product
- Return ONLY a JSON object with both values
- Example response: {{"category": "Women - Tops", "subcategory": "T-shirts"}}

**IMPORTANT:**
- You MUST select from the categories and subcategories listed above (do not make up categories)
- Use exact names (case-sensitive)
- Choose the most specific subcategory that matches the product
- Default to "Women - " categories if gender is unclear (women's fashion is most common)"#
    )
}

fn validate_choice(category: String, subcategory: String) -> CategoryChoice {
    let Some(listing) = taxonomy::find_listing_category(&category) else {
        warn!(
            target = "restage.garment",
            suggested = %category,
            "invalid category suggestion, using the default"
        );
        return CategoryChoice {
            category: DEFAULT_LISTING_CATEGORY.to_string(),
            subcategory: DEFAULT_LISTING_SUBCATEGORY.to_string(),
        };
    };
    if listing.subcategories.iter().any(|s| *s == subcategory) {
        CategoryChoice {
            category,
            subcategory,
        }
    } else {
        warn!(
            target = "restage.garment",
            category = %category,
            suggested = %subcategory,
            "invalid subcategory suggestion, using the first for the category"
        );
        CategoryChoice {
            subcategory: listing
                .subcategories
                .first()
                .copied()
                .unwrap_or("Other")
                .to_string(),
            category,
        }
    }
}
