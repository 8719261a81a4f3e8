use crate::llm::{self, ChatMessage, ChatParams, LlmClient, LlmError, MessageContent, MessagePart};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Most images sent along for selection in one call.
const MAX_LISTING_IMAGES: usize = 10;

/// Images kept when the model's selection is unusable.
const FALLBACK_IMAGE_COUNT: usize = 6;

/// Hosts the scraped listing photos are expected to live on. Selection maps
/// model-chosen IDs back to these URLs, so anything outside the allowlist is
/// dropped rather than echoed into the listing.
const DEFAULT_IMAGE_HOSTS: &[&str] = &[
    "img.ltwebstatic.com",
    "sheimg.com",
    "shein.com",
    "aliexpress-media.com",
    "alicdn.com",
    "media-assets.grailed.com",
];

/// Raw listing data scraped from a marketplace page.
#[derive(Debug, Clone, Deserialize)]
pub struct ListingSource {
    pub name: String,
    #[serde(default)]
    pub colors: Vec<String>,
    #[serde(default)]
    pub sizes: Vec<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
}

/// A cleaned-up listing: curated images plus rewritten copy and keywords.
#[derive(Debug, Clone, Serialize)]
pub struct EnhancedListing {
    pub selected_images: Vec<String>,
    pub description: String,
    pub keywords: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnhanceReply {
    #[serde(default)]
    selected_image_ids: Vec<i64>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    keywords: String,
}

#[derive(Debug, Error)]
pub enum EnhanceError {
    #[error("enhancement request failed: {0}")]
    Api(#[from] LlmError),
    #[error("unable to parse enhancement json")]
    Parse,
}

/// Rewrites a scraped listing: the model sees the product data plus up to
/// [`MAX_LISTING_IMAGES`] photos and returns curated image picks, a short
/// description, and search keywords. Bad image picks degrade to the first
/// few originals instead of failing the call.
pub async fn enhance(
    llm: &LlmClient,
    api_key: &str,
    source: &ListingSource,
) -> Result<EnhancedListing, EnhanceError> {
    let images: Vec<&String> = source.images.iter().take(MAX_LISTING_IMAGES).collect();
    let prompt = enhancement_prompt(source, images.len());

    let mut parts = vec![MessagePart::text(prompt)];
    for url in &images {
        parts.push(MessagePart::image((*url).clone()));
    }
    let params = ChatParams {
        model: llm.config().listing_model.clone(),
        messages: vec![ChatMessage::user(MessageContent::Parts(parts))],
        max_tokens: Some(2000),
        temperature: Some(0.7),
        json_output: false,
    };

    let content = llm.chat(api_key, &params).await?;
    let reply: EnhanceReply = llm::parse_model_json(&content).map_err(|_| EnhanceError::Parse)?;

    let allowlist = image_host_allowlist();
    let mut selected = select_images(&reply.selected_image_ids, &source.images, &allowlist);
    if selected.is_empty() {
        warn!(
            target = "restage.garment",
            "no usable image picks, falling back to the first scraped images"
        );
        selected = source
            .images
            .iter()
            .take(FALLBACK_IMAGE_COUNT)
            .cloned()
            .collect();
    }

    debug!(
        target = "restage.garment",
        images = selected.len(),
        "listing_enhanced"
    );
    Ok(EnhancedListing {
        selected_images: selected,
        description: reply.description,
        keywords: reply.keywords,
    })
}

fn enhancement_prompt(source: &ListingSource, image_count: usize) -> String {
    let image_list = (1..=image_count)
        .map(|n| format!("Image {n}"))
        .collect::<Vec<_>>()
        .join(", ");
    let colors = join_or_na(&source.colors);
    let sizes = join_or_na(&source.sizes);
    let price = source.price.as_deref().unwrap_or("N/A");
    let description = source.description.as_deref().unwrap_or("N/A");
    format!(
        r#"You are an e-commerce product listing expert. Analyze the provided images and data to enhance this product listing.

PRODUCT DATA:
- Name: {name}
- Colors: {colors}
- Sizes: {sizes}
- Price: {price}
- Current Description: {description}

TASKS:
1. IMAGE SELECTION: I will show you {image_count} product images numbered as: {image_list}

   Select the best 3-6 images that clearly show the product:
   - REMOVE DUPLICATES: If multiple images look identical or nearly identical, choose only ONE
   - Different angles/views are good, but exact duplicates must be excluded
   - High quality, clear product visibility
   - No blurry or low-quality images

   IMPORTANT: Return ONLY the image numbers (e.g., [1, 3, 5, 7]). Do NOT return URLs or any other text.

2. DESCRIPTION: Write a simple, direct product description:
   - DO NOT mention any brand names
   - Rephrase the product name in a natural, simple way (1 sentence max)
   - Keep it straightforward - just describe what the item is without flowery language
   - End with: "🖤 All sizes available on request"
   - Then add exactly 5 hashtags at the very end (e.g., #streetwear #goth #y2k #grunge #fashion)

3. KEYWORDS: Generate 8-12 SEO-friendly comma-separated keywords (e.g., "graphic tee, streetwear, round neck, short sleeve, urban style")

RESPOND ONLY WITH VALID JSON IN THIS EXACT FORMAT (no markdown, no code blocks):
{{
  "selectedImageIds": [1, 3, 5],
  "description": "Your description with hashtags at the end",
  "keywords": "keyword1, keyword2, keyword3, keyword4"
}}

CRITICAL: For selectedImageIds, return an array of numbers only (the image numbers I show you)."#,
        name = source.name,
    )
}

fn join_or_na(values: &[String]) -> String {
    if values.is_empty() {
        "N/A".to_string()
    } else {
        values.join(", ")
    }
}

/// Maps 1-based image IDs back to URLs, dropping out-of-range picks and
/// URLs whose host is off the allowlist.
fn select_images(ids: &[i64], images: &[String], allowlist: &[String]) -> Vec<String> {
    let mut selected = Vec::new();
    for &id in ids {
        let Some(index) = id
            .checked_sub(1)
            .and_then(|zero_based| usize::try_from(zero_based).ok())
            .filter(|index| *index < images.len())
        else {
            warn!(target = "restage.garment", id, "image pick out of range");
            continue;
        };
        let url = &images[index];
        if url_host_allowed(url, allowlist) {
            selected.push(url.clone());
        } else {
            warn!(target = "restage.garment", url = %url, "image pick host not allowed");
        }
    }
    selected
}

fn image_host_allowlist() -> Vec<String> {
    std::env::var("IMAGE_HOST_ALLOWLIST")
        .ok()
        .map(|v| {
            v.split([',', ' ', '\n', '\t'])
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
        })
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_IMAGE_HOSTS.iter().map(|s| s.to_string()).collect())
}

fn url_host_allowed(url: &str, allowed: &[String]) -> bool {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let host = host.to_lowercase();
    allowed
        .iter()
        .any(|d| host == *d || host.ends_with(&format!(".{d}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shein_images() -> Vec<String> {
        vec![
            "https://img.ltwebstatic.com/a.jpg".to_string(),
            "https://img.ltwebstatic.com/b.jpg".to_string(),
            "https://img.ltwebstatic.com/c.jpg".to_string(),
            "https://img.ltwebstatic.com/d.jpg".to_string(),
        ]
    }

    fn default_allowlist() -> Vec<String> {
        DEFAULT_IMAGE_HOSTS.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn ids_are_one_based_and_bounds_checked() {
        let images = shein_images();
        let selected = select_images(&[1, 3, 99, -2, 0], &images, &default_allowlist());
        assert_eq!(
            selected,
            vec![
                "https://img.ltwebstatic.com/a.jpg".to_string(),
                "https://img.ltwebstatic.com/c.jpg".to_string(),
            ]
        );
    }

    #[test]
    fn off_allowlist_hosts_are_dropped() {
        let images = vec![
            "https://img.ltwebstatic.com/a.jpg".to_string(),
            "https://evil.example/steal.jpg".to_string(),
            "https://cdn.shein.com/b.jpg".to_string(),
        ];
        let selected = select_images(&[1, 2, 3], &images, &default_allowlist());
        assert_eq!(
            selected,
            vec![
                "https://img.ltwebstatic.com/a.jpg".to_string(),
                "https://cdn.shein.com/b.jpg".to_string(),
            ]
        );
    }

    #[test]
    fn subdomains_of_allowed_hosts_pass() {
        let allowlist = default_allowlist();
        assert!(url_host_allowed(
            "https://ae-pic-a1.aliexpress-media.com/kf/x.jpg",
            &allowlist
        ));
        assert!(url_host_allowed("https://shein.com/y.jpg", &allowlist));
        assert!(!url_host_allowed("https://notshein.com/z.jpg", &allowlist));
        assert!(!url_host_allowed("not a url", &allowlist));
    }

    #[test]
    fn the_prompt_numbers_images_and_carries_product_data() {
        let source = ListingSource {
            name: "Rhinestone Graphic Tee".into(),
            colors: vec!["Black".into(), "White".into()],
            sizes: vec!["S".into(), "M".into()],
            price: Some("12.99".into()),
            description: None,
            images: shein_images(),
        };
        let prompt = enhancement_prompt(&source, 4);
        assert!(prompt.contains("- Name: Rhinestone Graphic Tee"));
        assert!(prompt.contains("- Colors: Black, White"));
        assert!(prompt.contains("- Current Description: N/A"));
        assert!(prompt.contains("Image 1, Image 2, Image 3, Image 4"));
        assert!(prompt.contains("selectedImageIds"));
    }

    #[test]
    fn replies_use_camel_case_field_names() {
        let reply: EnhanceReply = serde_json::from_str(
            r#"{"selectedImageIds": [2, 1], "description": "desc", "keywords": "a, b"}"#,
        )
        .unwrap();
        assert_eq!(reply.selected_image_ids, vec![2, 1]);
        assert_eq!(reply.description, "desc");
    }
}
