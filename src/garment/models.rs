use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

/// Which side of the garment a photo shows. Callers confirm this by hand,
/// so it outranks whatever the vision model believes it sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewHint {
    Front,
    Back,
}

impl ViewHint {
    pub fn as_str(self) -> &'static str {
        match self {
            ViewHint::Front => "front",
            ViewHint::Back => "back",
        }
    }
}

impl std::fmt::Display for ViewHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured read of one garment photo. Field names match the JSON the
/// vision prompt demands; everything beyond the item type and category
/// tolerates absence because models trim detail under token pressure.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub item_type: String,
    pub category: String,
    #[serde(default)]
    pub view: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub details: GarmentDetails,
    #[serde(default)]
    pub reasoning: Option<GarmentReasoning>,
    #[serde(default)]
    pub product_name_match: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GarmentDetails {
    pub pattern: Option<String>,
    pub style: Option<String>,
    pub sleeve_length: Option<String>,
    pub fit_type: Option<String>,
    #[serde(default)]
    pub notable_features: Vec<String>,
    pub material_appearance: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GarmentReasoning {
    pub item_identification: Option<String>,
    pub confidence_factors: Option<String>,
    pub view_note: Option<String>,
}
