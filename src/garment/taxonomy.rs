use serde_json::{Map, Value, json};

/// A family of garment types the vision stage may classify into.
pub struct GarmentCategory {
    pub name: &'static str,
    pub items: &'static [&'static str],
}

/// Classification vocabulary given to the vision model. The categories are
/// closed so downstream consumers can rely on the names.
pub const GARMENT_CATEGORIES: &[GarmentCategory] = &[
    GarmentCategory {
        name: "tops",
        items: &[
            "t-shirt", "shirt", "blouse", "tank_top", "crop_top", "polo_shirt", "henley",
            "tunic", "camisole", "bodysuit",
        ],
    },
    GarmentCategory {
        name: "sweaters",
        items: &[
            "sweater", "pullover", "cardigan", "hoodie", "sweatshirt", "turtleneck", "knit_top",
            "fleece",
        ],
    },
    GarmentCategory {
        name: "outerwear",
        items: &[
            "jacket", "coat", "blazer", "suit_jacket", "parka", "bomber_jacket", "denim_jacket",
            "leather_jacket", "trench_coat", "peacoat", "windbreaker", "puffer_jacket",
            "raincoat", "vest",
        ],
    },
    GarmentCategory {
        name: "dresses",
        items: &[
            "dress", "maxi_dress", "midi_dress", "mini_dress", "cocktail_dress", "evening_gown",
            "sundress", "shirt_dress", "wrap_dress", "bodycon_dress", "a-line_dress",
        ],
    },
    GarmentCategory {
        name: "bottoms",
        items: &[
            "pants", "jeans", "trousers", "chinos", "leggings", "joggers", "cargo_pants",
            "dress_pants", "sweatpants", "culottes", "palazzo_pants",
        ],
    },
    GarmentCategory {
        name: "skirts",
        items: &[
            "skirt", "mini_skirt", "midi_skirt", "maxi_skirt", "pencil_skirt", "a-line_skirt",
            "pleated_skirt", "wrap_skirt",
        ],
    },
    GarmentCategory {
        name: "shorts",
        items: &[
            "shorts", "bermuda_shorts", "denim_shorts", "athletic_shorts", "cargo_shorts",
            "dress_shorts",
        ],
    },
    GarmentCategory {
        name: "activewear",
        items: &[
            "sports_bra", "athletic_top", "gym_shorts", "yoga_pants", "tracksuit",
            "athletic_leggings", "sports_jacket",
        ],
    },
    GarmentCategory {
        name: "swimwear",
        items: &[
            "swimsuit", "bikini", "one_piece_swimsuit", "swim_trunks", "boardshorts",
            "rash_guard",
        ],
    },
    GarmentCategory {
        name: "suits",
        items: &["suit", "two_piece_suit", "three_piece_suit", "tuxedo"],
    },
    GarmentCategory {
        name: "jumpsuits",
        items: &["jumpsuit", "romper", "playsuit", "overalls"],
    },
];

/// Categories as a JSON object, the shape the classification prompt embeds.
pub fn garment_categories_json() -> Value {
    let mut map = Map::new();
    for category in GARMENT_CATEGORIES {
        map.insert(category.name.to_string(), json!(category.items));
    }
    Value::Object(map)
}

/// A marketplace listing category with its allowed subcategories.
pub struct ListingCategory {
    pub name: &'static str,
    pub subcategories: &'static [&'static str],
}

pub const LISTING_CATEGORIES: &[ListingCategory] = &[
    ListingCategory {
        name: "Men - Tops",
        subcategories: &["T-shirts", "Hoodies", "Sweatshirts"],
    },
    ListingCategory {
        name: "Men - Bottoms",
        subcategories: &["Jeans", "Sweatpants", "Trousers", "Shorts", "Leggings", "Skirts"],
    },
    ListingCategory {
        name: "Women - Tops",
        subcategories: &["T-shirts", "Hoodies", "Sweatshirts", "Jumpers"],
    },
    ListingCategory {
        name: "Women - Bottoms",
        subcategories: &["Jeans", "Sweatpants", "Trousers", "Shorts", "Leggings", "Skirts"],
    },
];

pub const DEFAULT_LISTING_CATEGORY: &str = "Women - Tops";
pub const DEFAULT_LISTING_SUBCATEGORY: &str = "T-shirts";

pub fn find_listing_category(name: &str) -> Option<&'static ListingCategory> {
    LISTING_CATEGORIES
        .iter()
        .find(|category| category.name == name)
}

/// One line per category, the shape the category prompt embeds.
pub fn listing_categories_text() -> String {
    LISTING_CATEGORIES
        .iter()
        .map(|category| format!("{}: [{}]", category.name, category.subcategories.join(", ")))
        .collect::<Vec<_>>()
        .join("\n")
}
