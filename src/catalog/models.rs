//! Catalog row types and the scraped records that feed them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A top-level taxonomy entry discovered by the navigation handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigationRecord {
    pub title: String,
    pub source_url: String,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
}

/// A category discovered by the category handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryRecord {
    #[serde(default)]
    pub navigation_id: Option<Uuid>,
    pub title: String,
    pub source_url: String,
    #[serde(default)]
    pub product_count: i32,
}

/// A full product record extracted from a product detail page.
///
/// `image_urls` holds origin URLs when emitted by a handler; the image stage
/// replaces them with canonical object-store URLs before persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductRecord {
    pub title: String,
    pub source_url: String,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default = "default_specs")]
    pub specs: Value,
    #[serde(default = "default_available")]
    pub available: bool,
    #[serde(default)]
    pub category_id: Option<Uuid>,
}

fn default_currency() -> String {
    "GBP".to_string()
}

fn default_specs() -> Value {
    Value::Object(Default::default())
}

fn default_available() -> bool {
    true
}

/// A lightweight product reference found on a category listing page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductSummary {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
}

/// A persisted navigation row.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Navigation {
    pub id: Uuid,
    pub title: String,
    pub source_url: String,
    pub parent_id: Option<Uuid>,
    pub last_scraped_at: DateTime<Utc>,
}

/// A persisted category row. `product_count` is a derived cache.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Category {
    pub id: Uuid,
    pub navigation_id: Option<Uuid>,
    pub title: String,
    pub source_url: String,
    pub product_count: i32,
    pub last_scraped_at: DateTime<Utc>,
}

/// A persisted product row.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Product {
    pub id: Uuid,
    pub category_id: Option<Uuid>,
    pub title: String,
    pub source_url: String,
    pub source_id: Option<String>,
    pub price: Option<f64>,
    pub currency: String,
    pub image_urls: Vec<String>,
    pub summary: Option<String>,
    pub specs: Value,
    pub available: bool,
    pub last_scraped_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything one pipeline run wants persisted, in dependency order.
#[derive(Debug, Clone, Default)]
pub struct ScrapeResult {
    pub navigations: Vec<NavigationRecord>,
    pub categories: Vec<CategoryRecord>,
    pub products: Vec<ProductRecord>,
}

/// Rows written per entity kind by an aggregate upsert.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct UpsertCounts {
    pub navigations: i64,
    pub categories: i64,
    pub products: i64,
}

impl UpsertCounts {
    pub fn total(&self) -> i64 {
        self.navigations + self.categories + self.products
    }
}
