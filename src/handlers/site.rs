//! Storefront page handlers backed by CSS-selector extraction.
//!
//! The selectors target the conventional storefront layout (collection
//! grids, product detail pages with a spec table). They are deliberately
//! permissive; a page that matches nothing produces a handler error rather
//! than an empty success, so broken extraction counts against the job's
//! retry budget instead of silently writing nothing.

use crate::catalog::{CategoryRecord, NavigationRecord, ProductRecord, ProductSummary};
use crate::error::{Result, ScrapeError};
use crate::policy;
use crate::queue::ScrapeJob;
use anyhow::Context;
use governor::{Quota, RateLimiter};
use scraper::{Html, Selector};
use serde_json::{Map, Value};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, trace};
use url::Url;

/// Pagination safety stop for runaway category listings.
const MAX_CATEGORY_PAGES: usize = 50;

type DirectRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Shared HTTP client for the merchant storefront.
///
/// All workers funnel their page fetches through one instance, so the
/// governor limiter enforces the per-domain minimum request delay across
/// the whole process. Every fetch is policy-checked after normalization.
pub struct SiteClient {
    client: reqwest::Client,
    limiter: DirectRateLimiter,
    base_url: Url,
}

impl SiteClient {
    pub fn new(base_url: Url, user_agent: &str, min_delay: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent.to_owned())
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        // The configured delay may be tightened by the policy's per-agent
        // minimum (heavyweight crawler identities get a longer one).
        let delay = min_delay.max(policy::crawl_delay(user_agent));
        let quota = Quota::with_period(delay).expect("site delay must be non-zero");

        Ok(Self {
            client,
            limiter: RateLimiter::direct(quota),
            base_url,
        })
    }

    /// Resolve an href against the base URL and normalize it, discarding
    /// anything the policy denies.
    pub fn resolve(&self, href: &str) -> Option<Url> {
        let joined = self.base_url.join(href).ok()?;
        if !matches!(joined.scheme(), "http" | "https") {
            return None;
        }
        let normalized = policy::normalize(&joined);
        policy::evaluate(&normalized)
            .is_allowed()
            .then_some(normalized)
    }

    /// Fetch a page as HTML text, waiting for the rate limiter first.
    pub async fn fetch_html(&self, url: &Url) -> Result<String> {
        if let policy::PolicyDecision::Deny(reason) = policy::evaluate(url) {
            return Err(ScrapeError::Handler {
                url: url.to_string(),
                message: format!("denied by URL policy: {reason}"),
            }
            .into());
        }

        self.limiter.until_ready().await;
        trace!(url = %url, "fetching page");

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| ScrapeError::TransientFetch {
                url: url.to_string(),
                message: e.to_string(),
            })?
            .error_for_status()
            .map_err(|e| ScrapeError::TransientFetch {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        response.text().await.map_err(|e| {
            ScrapeError::TransientFetch {
                url: url.to_string(),
                message: e.to_string(),
            }
            .into()
        })
    }
}

macro_rules! selector {
    ($name:ident, $css:expr) => {
        static $name: LazyLock<Selector> =
            LazyLock::new(|| Selector::parse($css).expect("static selector is valid"));
    };
}

selector!(NAV_LINKS, "nav a[href], header a[href^='/collections']");
selector!(PAGE_TITLE, "h1");
selector!(PRODUCT_CARDS, "[class*='product-card'], [class*='product-item'], li[class*='grid__item']");
selector!(CARD_LINK, "a[href*='/products/']");
selector!(CARD_TITLE, "[class*='title'], [class*='heading'], h2, h3");
selector!(CARD_PRICE, "[class*='price']");
selector!(CARD_IMAGE, "img[src], img[data-src]");
selector!(NEXT_PAGE, "a[rel='next'], [class*='pagination'] a[class*='next']");
selector!(PRODUCT_PRICE, "[itemprop='price'], [class*='price__current'], [class*='product-price']");
selector!(PRODUCT_CURRENCY, "[itemprop='priceCurrency']");
selector!(PRODUCT_SKU, "[itemprop='sku']");
selector!(PRODUCT_IMAGES, "[class*='product'] img[src], [class*='gallery'] img[src]");
selector!(PRODUCT_SUMMARY, "[itemprop='description'], [class*='product-description']");
selector!(META_DESCRIPTION, "meta[name='description']");
selector!(META_OG_IMAGE, "meta[property='og:image']");
selector!(META_AVAILABILITY, "meta[property='og:availability'], link[itemprop='availability']");
selector!(SPEC_ROWS, "[class*='spec'] tr, [class*='product-details'] tr");

/// [`crate::handlers::PageHandlers`] implementation for the storefront.
pub struct StorefrontHandlers {
    site: SiteClient,
}

impl StorefrontHandlers {
    pub fn new(site: SiteClient) -> Self {
        Self { site }
    }

    fn target_url(job: &ScrapeJob) -> Result<Url> {
        let url = Url::parse(&job.target_url)
            .map_err(|e| ScrapeError::validation("target_url", e.to_string()))?;
        Ok(policy::normalize(&url))
    }
}

#[async_trait::async_trait]
impl super::PageHandlers for StorefrontHandlers {
    async fn handle_navigation(&self, job: &ScrapeJob) -> Result<Vec<NavigationRecord>> {
        let url = Self::target_url(job)?;
        let html = self.site.fetch_html(&url).await?;
        let records = extract_navigation(&html, &self.site);

        if records.is_empty() {
            return Err(ScrapeError::Handler {
                url: url.to_string(),
                message: "no navigation entries found".to_string(),
            }
            .into());
        }

        debug!(url = %url, count = records.len(), "navigation extracted");
        Ok(records)
    }

    async fn handle_category(
        &self,
        job: &ScrapeJob,
    ) -> Result<(CategoryRecord, Vec<ProductSummary>)> {
        let first_page = Self::target_url(job)?;
        let mut page_url = first_page.clone();
        let mut title: Option<String> = None;
        let mut summaries: Vec<ProductSummary> = Vec::new();

        for page in 1..=MAX_CATEGORY_PAGES {
            let html = self.site.fetch_html(&page_url).await?;
            let extracted = extract_category_page(&html, &self.site);

            if title.is_none() {
                title = extracted.title;
            }
            summaries.extend(extracted.products);

            match extracted.next_page {
                Some(next) if next != page_url => {
                    trace!(page, next = %next, "following category pagination");
                    page_url = next;
                }
                _ => break,
            }
        }

        let title = title.ok_or_else(|| ScrapeError::Handler {
            url: first_page.to_string(),
            message: "category page has no title".to_string(),
        })?;

        // The same product can appear on multiple pages (e.g. pinned
        // bestsellers); keep the first occurrence.
        let mut seen = std::collections::HashSet::new();
        summaries.retain(|summary| seen.insert(summary.url.clone()));

        debug!(url = %first_page, products = summaries.len(), "category extracted");
        Ok((
            CategoryRecord {
                navigation_id: None,
                title,
                source_url: first_page.to_string(),
                product_count: summaries.len() as i32,
            },
            summaries,
        ))
    }

    async fn handle_product(&self, job: &ScrapeJob) -> Result<ProductRecord> {
        let url = Self::target_url(job)?;
        let html = self.site.fetch_html(&url).await?;
        let record = extract_product(&html, &url)?;

        debug!(url = %url, images = record.image_urls.len(), "product extracted");
        Ok(record)
    }
}

fn element_text(element: scraper::ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// Pull a numeric price out of display text like "£12.99" or "12,99 €".
fn parse_price(text: &str) -> Option<f64> {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();
    // Continental decimal commas only; thousands separators are dropped.
    let cleaned = if cleaned.contains('.') {
        cleaned.replace(',', "")
    } else {
        cleaned.replace(',', ".")
    };
    cleaned.parse::<f64>().ok().filter(|price| *price > 0.0)
}

/// Infer an ISO currency code from a price's display text.
fn infer_currency(text: &str) -> Option<String> {
    if text.contains('£') {
        Some("GBP".to_string())
    } else if text.contains('€') {
        Some("EUR".to_string())
    } else if text.contains('$') {
        Some("USD".to_string())
    } else {
        None
    }
}

fn extract_navigation(html: &str, site: &SiteClient) -> Vec<NavigationRecord> {
    let document = Html::parse_document(html);
    let mut seen = std::collections::HashSet::new();
    let mut records = Vec::new();

    for link in document.select(&NAV_LINKS) {
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        let Some(url) = site.resolve(href) else {
            continue;
        };
        if !url.path().starts_with("/collections") {
            continue;
        }
        let title = element_text(link);
        if title.is_empty() || !seen.insert(url.to_string()) {
            continue;
        }
        records.push(NavigationRecord {
            title,
            source_url: url.to_string(),
            parent_id: None,
        });
    }

    records
}

struct CategoryPage {
    title: Option<String>,
    products: Vec<ProductSummary>,
    next_page: Option<Url>,
}

fn extract_category_page(html: &str, site: &SiteClient) -> CategoryPage {
    let document = Html::parse_document(html);

    let title = document
        .select(&PAGE_TITLE)
        .next()
        .map(element_text)
        .filter(|t| !t.is_empty());

    let mut products = Vec::new();
    for card in document.select(&PRODUCT_CARDS) {
        let Some(link) = card.select(&CARD_LINK).next() else {
            continue;
        };
        let Some(url) = link.value().attr("href").and_then(|href| site.resolve(href)) else {
            continue;
        };

        let title = card
            .select(&CARD_TITLE)
            .next()
            .map(element_text)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| element_text(link));
        if title.is_empty() {
            continue;
        }

        let price_text = card.select(&CARD_PRICE).next().map(element_text);
        let thumbnail = card.select(&CARD_IMAGE).next().and_then(|img| {
            img.value()
                .attr("src")
                .or_else(|| img.value().attr("data-src"))
                .map(|s| s.to_string())
        });

        products.push(ProductSummary {
            title,
            url: url.to_string(),
            price: price_text.as_deref().and_then(parse_price),
            currency: price_text.as_deref().and_then(infer_currency),
            thumbnail,
        });
    }

    let next_page = document
        .select(&NEXT_PAGE)
        .next()
        .and_then(|a| a.value().attr("href"))
        .and_then(|href| site.resolve(href));

    CategoryPage {
        title,
        products,
        next_page,
    }
}

fn extract_product(html: &str, url: &Url) -> Result<ProductRecord> {
    let document = Html::parse_document(html);

    let title = document
        .select(&PAGE_TITLE)
        .next()
        .map(element_text)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ScrapeError::Handler {
            url: url.to_string(),
            message: "product page has no title".to_string(),
        })?;

    let price_element = document.select(&PRODUCT_PRICE).next();
    let price_text = price_element.map(|el| {
        el.value()
            .attr("content")
            .map(|s| s.to_string())
            .unwrap_or_else(|| element_text(el))
    });
    let price = price_text.as_deref().and_then(parse_price);

    let currency = document
        .select(&PRODUCT_CURRENCY)
        .next()
        .and_then(|el| el.value().attr("content").map(|s| s.to_string()))
        .or_else(|| price_text.as_deref().and_then(infer_currency))
        .unwrap_or_else(|| "GBP".to_string());

    let source_id = document
        .select(&PRODUCT_SKU)
        .next()
        .map(|el| {
            el.value()
                .attr("content")
                .map(|s| s.to_string())
                .unwrap_or_else(|| element_text(el))
        })
        .filter(|s| !s.is_empty());

    // Gallery images first, og:image as fallback; keep document order.
    let mut image_urls = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for img in document.select(&PRODUCT_IMAGES) {
        if let Some(src) = img.value().attr("src")
            && let Ok(resolved) = url.join(src)
            && seen.insert(resolved.to_string())
        {
            image_urls.push(resolved.to_string());
        }
    }
    if image_urls.is_empty()
        && let Some(og) = document
            .select(&META_OG_IMAGE)
            .next()
            .and_then(|el| el.value().attr("content"))
        && let Ok(resolved) = url.join(og)
    {
        image_urls.push(resolved.to_string());
    }

    let summary = document
        .select(&PRODUCT_SUMMARY)
        .next()
        .map(element_text)
        .filter(|s| !s.is_empty())
        .or_else(|| {
            document
                .select(&META_DESCRIPTION)
                .next()
                .and_then(|el| el.value().attr("content").map(|s| s.to_string()))
        });

    let mut specs = Map::new();
    for row in document.select(&SPEC_ROWS) {
        let cells: Vec<String> = row
            .child_elements()
            .map(|cell| element_text(cell))
            .filter(|text| !text.is_empty())
            .collect();
        if let [key, value] = cells.as_slice() {
            specs.insert(key.clone(), Value::String(value.clone()));
        }
    }

    let available = document
        .select(&META_AVAILABILITY)
        .next()
        .and_then(|el| {
            el.value()
                .attr("content")
                .or_else(|| el.value().attr("href"))
        })
        .map(|value| !value.to_lowercase().contains("outofstock"))
        .unwrap_or(true);

    Ok(ProductRecord {
        title,
        source_url: url.to_string(),
        source_id,
        price,
        currency,
        image_urls,
        summary,
        specs: Value::Object(specs),
        available,
        category_id: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_price_handles_symbols_and_commas() {
        assert_eq!(parse_price("£12.99"), Some(12.99));
        assert_eq!(parse_price("12,99 €"), Some(12.99));
        assert_eq!(parse_price("$1,299.00"), Some(1299.0));
        assert_eq!(parse_price("Sold out"), None);
        assert_eq!(parse_price("£0.00"), None);
    }

    #[test]
    fn infer_currency_from_symbol() {
        assert_eq!(infer_currency("£4.50").as_deref(), Some("GBP"));
        assert_eq!(infer_currency("4,50 €").as_deref(), Some("EUR"));
        assert_eq!(infer_currency("4.50").as_deref(), None);
    }

    fn test_site() -> SiteClient {
        SiteClient::new(
            Url::parse("https://shop.example.com").unwrap(),
            "bindery-test/0",
            Duration::from_millis(1),
        )
        .unwrap()
    }

    #[test]
    fn extract_product_from_detail_page() {
        let html = r#"
            <html><head>
                <meta name="description" content="A classic epic.">
                <meta property="og:availability" content="instock">
            </head><body>
                <h1>The Iliad</h1>
                <span itemprop="price" content="12.99"></span>
                <span itemprop="priceCurrency" content="GBP"></span>
                <span itemprop="sku">HOM-001</span>
                <div class="product-gallery">
                    <img src="/images/iliad-front.jpg">
                    <img src="/images/iliad-back.jpg">
                </div>
                <table class="product-specs">
                    <tr><th>Author</th><td>Homer</td></tr>
                    <tr><th>Pages</th><td>704</td></tr>
                </table>
            </body></html>
        "#;
        let url = Url::parse("https://shop.example.com/products/the-iliad").unwrap();
        let record = extract_product(html, &url).unwrap();

        assert_eq!(record.title, "The Iliad");
        assert_eq!(record.price, Some(12.99));
        assert_eq!(record.currency, "GBP");
        assert_eq!(record.source_id.as_deref(), Some("HOM-001"));
        assert_eq!(
            record.image_urls,
            vec![
                "https://shop.example.com/images/iliad-front.jpg",
                "https://shop.example.com/images/iliad-back.jpg",
            ]
        );
        assert_eq!(record.summary.as_deref(), Some("A classic epic."));
        assert_eq!(record.specs["Author"], "Homer");
        assert!(record.available);
    }

    #[test]
    fn extract_product_requires_title() {
        let url = Url::parse("https://shop.example.com/products/x").unwrap();
        assert!(extract_product("<html><body></body></html>", &url).is_err());
    }

    #[test]
    fn extract_category_page_with_pagination() {
        let html = r#"
            <html><body>
                <h1>Classics</h1>
                <ul>
                    <li class="grid__item">
                        <a href="/products/the-iliad?utm_source=grid">
                            <h3 class="card__heading">The Iliad</h3>
                        </a>
                        <span class="price">£12.99</span>
                        <img src="/images/iliad-thumb.jpg">
                    </li>
                    <li class="grid__item">
                        <a href="/products/the-odyssey">
                            <h3 class="card__heading">The Odyssey</h3>
                        </a>
                        <span class="price">£14.99</span>
                    </li>
                </ul>
                <a rel="next" href="/collections/classics?page=2">Next</a>
            </body></html>
        "#;
        let page = extract_category_page(html, &test_site());

        assert_eq!(page.title.as_deref(), Some("Classics"));
        assert_eq!(page.products.len(), 2);
        assert_eq!(
            page.products[0].url,
            "https://shop.example.com/products/the-iliad"
        );
        assert_eq!(page.products[0].price, Some(12.99));
        assert_eq!(page.products[0].currency.as_deref(), Some("GBP"));
        assert_eq!(
            page.next_page.as_ref().map(|u| u.as_str()),
            Some("https://shop.example.com/collections/classics?page=2")
        );
    }

    #[test]
    fn extract_navigation_keeps_collection_links() {
        let html = r#"
            <html><body><nav>
                <a href="/collections/classics">Classics</a>
                <a href="/collections/poetry?utm_source=nav">Poetry</a>
                <a href="/cart">Cart</a>
                <a href="/pages/about">About</a>
            </nav></body></html>
        "#;
        let records = extract_navigation(html, &test_site());
        let titles: Vec<_> = records.iter().map(|r| r.title.as_str()).collect();

        assert_eq!(titles, vec!["Classics", "Poetry"]);
        assert_eq!(
            records[1].source_url,
            "https://shop.example.com/collections/poetry"
        );
    }
}
