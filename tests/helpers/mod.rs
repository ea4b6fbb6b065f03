use bindery::catalog::{CategoryRecord, NavigationRecord, ProductRecord, ProductSummary};
use bindery::error::Result;
use bindery::handlers::PageHandlers;
use bindery::queue::{JobStatus, JobType, ScrapeJob};
use bindery::store::ObjectStore;
use serde_json::json;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// Insert a scrape job row directly via SQL, returning the generated ID.
#[allow(clippy::too_many_arguments)]
pub async fn insert_job(
    pool: &PgPool,
    job_type: JobType,
    target_url: &str,
    priority: i32,
    status: JobStatus,
    attempts: i32,
    max_attempts: i32,
    locked_by: Option<&str>,
    locked_secs_ago: Option<i64>,
) -> Uuid {
    let (id,): (Uuid,) = sqlx::query_as(
        "INSERT INTO scrape_job
             (job_type, target_url, priority, status, attempts, max_attempts, locked_by, locked_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7,
                 CASE WHEN $8::BIGINT IS NULL THEN NULL
                      ELSE NOW() - make_interval(secs => $8::double precision) END)
         RETURNING id",
    )
    .bind(job_type)
    .bind(target_url)
    .bind(priority)
    .bind(status)
    .bind(attempts)
    .bind(max_attempts)
    .bind(locked_by)
    .bind(locked_secs_ago)
    .fetch_one(pool)
    .await
    .expect("insert_job failed");

    id
}

/// Fetch a job row for assertions.
pub async fn fetch_job(pool: &PgPool, id: Uuid) -> ScrapeJob {
    bindery::queue::get_job(id, pool)
        .await
        .expect("fetch_job failed")
        .expect("job should exist")
}

/// Build a test `ProductRecord` with sensible defaults.
pub fn make_product(title: &str, source_url: &str) -> ProductRecord {
    ProductRecord {
        title: title.to_owned(),
        source_url: source_url.to_owned(),
        source_id: None,
        price: Some(12.99),
        currency: "GBP".to_owned(),
        image_urls: vec![],
        summary: Some("A test product.".to_owned()),
        specs: json!({"Binding": "Hardcover"}),
        available: true,
        category_id: None,
    }
}

/// In-memory `ObjectStore` double capturing uploaded objects.
#[derive(Default)]
pub struct MemoryObjectStore {
    pub objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
}

impl MemoryObjectStore {
    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        _metadata: &[(&str, &str)],
    ) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_owned(), (bytes, content_type.to_owned()));
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    async fn presign_get(&self, key: &str, _expires_in: Duration) -> Result<String> {
        Ok(format!("{}?signature=test", self.public_url(key)))
    }

    fn public_url(&self, key: &str) -> String {
        format!("https://cdn.test/{key}")
    }
}

type NavigationFn = dyn Fn(&ScrapeJob) -> Result<Vec<NavigationRecord>> + Send + Sync;
type CategoryFn =
    dyn Fn(&ScrapeJob) -> Result<(CategoryRecord, Vec<ProductSummary>)> + Send + Sync;
type ProductFn = dyn Fn(&ScrapeJob) -> Result<ProductRecord> + Send + Sync;

/// `PageHandlers` double driven by per-type closures.
///
/// Records the target URL of every handler invocation (in call order) so
/// tests can assert dequeue ordering and retry counts.
pub struct ScriptedHandlers {
    pub calls: Mutex<Vec<String>>,
    pub delay: Duration,
    on_navigation: Option<Box<NavigationFn>>,
    on_category: Option<Box<CategoryFn>>,
    on_product: Option<Box<ProductFn>>,
}

impl Default for ScriptedHandlers {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            on_navigation: None,
            on_category: None,
            on_product: None,
        }
    }
}

impl ScriptedHandlers {
    pub fn products(f: impl Fn(&ScrapeJob) -> Result<ProductRecord> + Send + Sync + 'static) -> Self {
        Self {
            on_product: Some(Box::new(f)),
            ..Default::default()
        }
    }

    pub fn categories(
        f: impl Fn(&ScrapeJob) -> Result<(CategoryRecord, Vec<ProductSummary>)> + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_category: Some(Box::new(f)),
            ..Default::default()
        }
    }

    pub fn navigations(
        f: impl Fn(&ScrapeJob) -> Result<Vec<NavigationRecord>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_navigation: Some(Box::new(f)),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_order(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    async fn enter(&self, job: &ScrapeJob) {
        self.calls.lock().unwrap().push(job.target_url.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[async_trait::async_trait]
impl PageHandlers for ScriptedHandlers {
    async fn handle_navigation(&self, job: &ScrapeJob) -> Result<Vec<NavigationRecord>> {
        self.enter(job).await;
        match &self.on_navigation {
            Some(f) => f(job),
            None => anyhow::bail!("navigation handler not scripted"),
        }
    }

    async fn handle_category(
        &self,
        job: &ScrapeJob,
    ) -> Result<(CategoryRecord, Vec<ProductSummary>)> {
        self.enter(job).await;
        match &self.on_category {
            Some(f) => f(job),
            None => anyhow::bail!("category handler not scripted"),
        }
    }

    async fn handle_product(&self, job: &ScrapeJob) -> Result<ProductRecord> {
        self.enter(job).await;
        match &self.on_product {
            Some(f) => f(job),
            None => anyhow::bail!("product handler not scripted"),
        }
    }
}

/// Encode a small solid-color PNG for image pipeline fixtures.
pub fn png_fixture(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([200, 60, 30]));
    let mut out = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut out, image::ImageFormat::Png)
        .expect("png encode failed");
    out.into_inner()
}
