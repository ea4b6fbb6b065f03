//! Validated, idempotent persistence of navigation, categories and products.
//!
//! All upserts are keyed by `source_url`: re-scraping the same page replaces
//! the row in place (preserving `created_at`), which is what makes the
//! queue's at-least-once delivery safe.

pub mod models;

use crate::error::{Result, ScrapeError};
use sqlx::PgPool;
use url::Url;
use uuid::Uuid;

pub use models::{
    Category, CategoryRecord, Navigation, NavigationRecord, Product, ProductRecord,
    ProductSummary, ScrapeResult, UpsertCounts,
};

fn require_title(kind: &str, title: &str) -> Result<()> {
    if title.trim().is_empty() {
        return Err(ScrapeError::validation(format!("{kind}.title"), "must not be empty").into());
    }
    Ok(())
}

fn require_absolute_url(field: &str, value: &str) -> Result<()> {
    let parsed = Url::parse(value).map_err(|e| ScrapeError::validation(field, e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(
            ScrapeError::validation(field, format!("unsupported scheme: {}", parsed.scheme()))
                .into(),
        );
    }
    Ok(())
}

/// Validate a navigation record against its schema.
pub fn validate_navigation(record: &NavigationRecord) -> Result<()> {
    require_title("navigation", &record.title)?;
    require_absolute_url("navigation.source_url", &record.source_url)?;
    Ok(())
}

/// Validate a category record against its schema.
pub fn validate_category(record: &CategoryRecord) -> Result<()> {
    require_title("category", &record.title)?;
    require_absolute_url("category.source_url", &record.source_url)?;
    if record.product_count < 0 {
        return Err(
            ScrapeError::validation("category.product_count", "must be non-negative").into(),
        );
    }
    Ok(())
}

/// Validate a product record against its schema.
pub fn validate_product(record: &ProductRecord) -> Result<()> {
    require_title("product", &record.title)?;
    require_absolute_url("product.source_url", &record.source_url)?;
    if let Some(price) = record.price
        && price <= 0.0
    {
        return Err(ScrapeError::validation(
            "product.price",
            format!("must be positive, got {price}"),
        )
        .into());
    }
    if record.currency.len() != 3 || !record.currency.bytes().all(|b| b.is_ascii_uppercase()) {
        return Err(ScrapeError::validation(
            "product.currency",
            format!("expected 3-letter ISO code, got {:?}", record.currency),
        )
        .into());
    }
    for image_url in &record.image_urls {
        require_absolute_url("product.image_urls", image_url)?;
    }
    Ok(())
}

/// Validate a whole scrape result as a set.
///
/// Runs before any write; one bad record rejects the entire batch.
pub fn validate_result(result: &ScrapeResult) -> Result<()> {
    for record in &result.navigations {
        validate_navigation(record)?;
    }
    for record in &result.categories {
        validate_category(record)?;
    }
    for record in &result.products {
        validate_product(record)?;
    }
    Ok(())
}

/// Upsert a navigation entry keyed by `source_url`, returning its id.
pub async fn upsert_navigation(record: &NavigationRecord, db_pool: &PgPool) -> Result<Uuid> {
    validate_navigation(record)?;

    let (id,): (Uuid,) = sqlx::query_as(
        "INSERT INTO navigation (title, source_url, parent_id, last_scraped_at)
         VALUES ($1, $2, $3, NOW())
         ON CONFLICT (source_url) DO UPDATE SET
             title = EXCLUDED.title,
             parent_id = EXCLUDED.parent_id,
             last_scraped_at = EXCLUDED.last_scraped_at
         RETURNING id",
    )
    .bind(&record.title)
    .bind(&record.source_url)
    .bind(record.parent_id)
    .fetch_one(db_pool)
    .await
    .map_err(|e| ScrapeError::Persistence(e.to_string()))?;

    Ok(id)
}

/// Upsert a category keyed by `source_url`, returning its id.
pub async fn upsert_category(record: &CategoryRecord, db_pool: &PgPool) -> Result<Uuid> {
    validate_category(record)?;

    let (id,): (Uuid,) = sqlx::query_as(
        "INSERT INTO category (navigation_id, title, source_url, product_count, last_scraped_at)
         VALUES ($1, $2, $3, $4, NOW())
         ON CONFLICT (source_url) DO UPDATE SET
             navigation_id = EXCLUDED.navigation_id,
             title = EXCLUDED.title,
             product_count = EXCLUDED.product_count,
             last_scraped_at = EXCLUDED.last_scraped_at
         RETURNING id",
    )
    .bind(record.navigation_id)
    .bind(&record.title)
    .bind(&record.source_url)
    .bind(record.product_count)
    .fetch_one(db_pool)
    .await
    .map_err(|e| ScrapeError::Persistence(e.to_string()))?;

    Ok(id)
}

/// Upsert a product keyed by `source_url`, returning its id.
///
/// Fields are replaced, not merged; `created_at` is the one column the
/// conflict arm leaves untouched.
pub async fn upsert_product(record: &ProductRecord, db_pool: &PgPool) -> Result<Uuid> {
    validate_product(record)?;

    let (id,): (Uuid,) = sqlx::query_as(
        "INSERT INTO product (
             category_id, title, source_url, source_id, price, currency,
             image_urls, summary, specs, available, last_scraped_at
         )
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
         ON CONFLICT (source_url) DO UPDATE SET
             category_id = EXCLUDED.category_id,
             title = EXCLUDED.title,
             source_id = EXCLUDED.source_id,
             price = EXCLUDED.price,
             currency = EXCLUDED.currency,
             image_urls = EXCLUDED.image_urls,
             summary = EXCLUDED.summary,
             specs = EXCLUDED.specs,
             available = EXCLUDED.available,
             last_scraped_at = EXCLUDED.last_scraped_at,
             updated_at = NOW()
         RETURNING id",
    )
    .bind(record.category_id)
    .bind(&record.title)
    .bind(&record.source_url)
    .bind(&record.source_id)
    .bind(record.price)
    .bind(&record.currency)
    .bind(&record.image_urls)
    .bind(&record.summary)
    .bind(&record.specs)
    .bind(record.available)
    .fetch_one(db_pool)
    .await
    .map_err(|e| ScrapeError::Persistence(e.to_string()))?;

    Ok(id)
}

/// Recompute `category.product_count` from the actual product rows.
///
/// Categories with no products are zeroed. Run after product batches;
/// eventual consistency is acceptable, so there is no per-upsert bookkeeping.
pub async fn recompute_product_counts(db_pool: &PgPool) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE category c
         SET product_count = COALESCE(
             (SELECT COUNT(*)::INT FROM product p WHERE p.category_id = c.id), 0)",
    )
    .execute(db_pool)
    .await
    .map_err(|e| ScrapeError::Persistence(e.to_string()))?;

    Ok(result.rows_affected())
}

/// Persist a whole scrape result in dependency order.
///
/// Validates the full set first, then writes navigations, categories and
/// products, then refreshes the derived counts. On failure the writes made
/// so far stand; the idempotent upserts make the next attempt converge.
pub async fn upsert_scrape_result(result: &ScrapeResult, db_pool: &PgPool) -> Result<UpsertCounts> {
    validate_result(result)?;

    let mut counts = UpsertCounts::default();

    for record in &result.navigations {
        upsert_navigation(record, db_pool).await?;
        counts.navigations += 1;
    }
    for record in &result.categories {
        upsert_category(record, db_pool).await?;
        counts.categories += 1;
    }
    for record in &result.products {
        upsert_product(record, db_pool).await?;
        counts.products += 1;
    }

    if counts.products > 0 || counts.categories > 0 {
        recompute_product_counts(db_pool).await?;
    }

    Ok(counts)
}

/// Fetch a product by its `source_url` idempotency key.
pub async fn get_product_by_source_url(
    source_url: &str,
    db_pool: &PgPool,
) -> Result<Option<Product>> {
    let product = sqlx::query_as::<_, Product>("SELECT * FROM product WHERE source_url = $1")
        .bind(source_url)
        .fetch_optional(db_pool)
        .await?;

    Ok(product)
}
