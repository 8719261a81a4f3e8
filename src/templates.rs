use once_cell::sync::Lazy;

/// Scene instruction used whenever the caller does not supply one. The bed
/// scene is what the staging model was tuned against.
const DEFAULT_STAGING_SCENE: &str = "Keep the clothing item exactly as it is without any changes. \
Place it on a soft, unmade white bed with natural wrinkles in the sheets. \
Add natural warm daylight from a window, realistic shadows and folds. \
Casual phone photo aesthetic. \
Only change the background and staging, preserve the clothing completely.";

pub static STAGING_SCENE: Lazy<String> = Lazy::new(|| {
    std::env::var("STAGING_SCENE_PROMPT")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_STAGING_SCENE.to_string())
});

const PRESERVE_SUFFIX: &str =
    "keeping the exact clothing design, colors, patterns, and text identical to the original";

/// Prompt for the vision pipeline's synthesis stage. The garment description
/// anchors the edit so the model restyles the scene rather than the item, and
/// the optional card text becomes a handwritten index card prop.
pub fn vision_staging_prompt(description: &str, card_text: Option<&str>) -> String {
    let mut prompt = format!(
        "Keep the clothing item exactly as it is without any changes - this is the same product \
shown from different angles. Make these changes on: {description}. Place it on a soft, unmade \
white bed with natural wrinkles in the sheets. Add natural warm daylight from a window, \
realistic shadows and folds. Casual phone photo aesthetic."
    );
    if let Some(card) = card_text.map(str::trim).filter(|text| !text.is_empty()) {
        prompt.push_str(&format!(
            " Include a standard 3x5 inch (3 inches by 5 inches) white index card with \
\"{card}\" written clearly in black sharpie marker. The card should have distinct edges \
and the handwriting should be neat and fully legible."
        ));
    }
    prompt.push_str(
        " Only change the background and staging, preserve the clothing completely. \
Maintain consistent lighting and bed styling across all photos.",
    );
    prompt
}

/// Prompt for direct staging. A caller instruction replaces the default
/// scene; a product description wraps either one so the model knows what it
/// must leave untouched.
pub fn staging_prompt(instruction: Option<&str>, product_description: Option<&str>) -> String {
    let base = instruction
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| STAGING_SCENE.clone());
    match product_description.map(str::trim).filter(|text| !text.is_empty()) {
        Some(description) => {
            format!("This item is {description}. {base}, {PRESERVE_SUFFIX}.")
        }
        None => base,
    }
}
