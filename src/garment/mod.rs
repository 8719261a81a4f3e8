pub mod categorize;
pub mod classify;
pub mod describe;
pub mod enhance;
pub mod models;
pub mod taxonomy;

pub use categorize::{CategorizeError, CategoryChoice, suggest_category};
pub use classify::{ClassifyError, classify};
pub use describe::{DescribeError, describe};
pub use enhance::{EnhanceError, EnhancedListing, ListingSource, enhance};
pub use models::{Classification, ViewHint};
