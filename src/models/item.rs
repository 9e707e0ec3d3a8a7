use garde::Validate;
use serde::{Deserialize, Serialize};

/// Upper bound on the image count fed to the classifier.
const MAX_IMAGES: i32 = 10;

/// An item listing as stored by the request layer. Read-only for the worker.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Item {
    #[garde(skip)]
    pub id: i64,

    #[garde(length(min = 1))]
    pub name: String,

    #[garde(length(min = 1))]
    pub description: String,

    #[garde(range(min = 0))]
    pub category: i32,

    #[garde(range(min = 0))]
    pub images_qty: i32,

    /// Resolved from the seller reference; `false` when the item has none.
    #[garde(skip)]
    pub is_verified_seller: bool,
}

/// Classifier input, in model column order:
/// `[is_verified, images_ratio, description_len_ratio, category_ratio]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Features(pub [f64; 4]);

impl Features {
    pub fn from_item(item: &Item) -> Self {
        let is_verified = if item.is_verified_seller { 1.0 } else { 0.0 };
        let images_ratio = f64::from(item.images_qty.min(MAX_IMAGES)) / 10.0;
        let description_len_ratio = item.description.chars().count() as f64 / 1000.0;
        let category_ratio = f64::from(item.category) / 100.0;
        Self([is_verified, images_ratio, description_len_ratio, category_ratio])
    }

    pub fn as_slice(&self) -> &[f64; 4] {
        &self.0
    }
}
