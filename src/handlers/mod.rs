//! Pluggable page handlers.
//!
//! The worker dispatches a leased job to the handler matching its type and
//! gets back typed records; everything site-specific (selectors, pagination
//! shape, price formats) stays behind this trait. [`site::StorefrontHandlers`]
//! is the built-in implementation for the configured merchant storefront.

pub mod site;

use crate::catalog::{CategoryRecord, NavigationRecord, ProductRecord, ProductSummary};
use crate::error::Result;
use crate::queue::ScrapeJob;

/// One handler per job type. Implementations must emit absolute URLs and
/// respect the URL policy; extraction failures propagate as job failures.
#[async_trait::async_trait]
pub trait PageHandlers: Send + Sync {
    /// Discover top-level taxonomy entries from a navigation page.
    async fn handle_navigation(&self, job: &ScrapeJob) -> Result<Vec<NavigationRecord>>;

    /// Scrape a category page (paginating through its listings), returning
    /// the category plus lightweight summaries of the products found.
    async fn handle_category(&self, job: &ScrapeJob)
    -> Result<(CategoryRecord, Vec<ProductSummary>)>;

    /// Extract a full product record from a product detail page.
    async fn handle_product(&self, job: &ScrapeJob) -> Result<ProductRecord>;
}
