#[allow(dead_code)]
mod helpers;

use bindery::alerts::Alerter;
use bindery::catalog;
use bindery::images::ImagePipeline;
use bindery::queue::{self, JobStatus, JobType, ScrapeJob};
use bindery::worker::{WorkerContext, WorkerMetrics, WorkerPool};
use helpers::{MemoryObjectStore, ScriptedHandlers};
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use url::Url;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

fn spawn_pool(
    db_pool: &PgPool,
    handlers: Arc<ScriptedHandlers>,
    store: Arc<MemoryObjectStore>,
    image_base: &str,
    concurrency: usize,
) -> Arc<WorkerPool> {
    let images = Arc::new(
        ImagePipeline::new(
            "bindery-test/0",
            Url::parse(image_base).unwrap(),
            store,
        )
        .unwrap(),
    );

    Arc::new(WorkerPool::new(
        WorkerContext {
            db_pool: db_pool.clone(),
            handlers,
            images,
            metrics: Arc::new(WorkerMetrics::new()),
            alerter: Arc::new(Alerter::new(None)),
            lock_ttl: Duration::from_secs(10 * 60),
            poll_interval: Duration::from_millis(50),
        },
        concurrency,
    ))
}

async fn wait_for_status(
    pool: &PgPool,
    id: Uuid,
    status: JobStatus,
    timeout: Duration,
) -> ScrapeJob {
    let deadline = Instant::now() + timeout;
    loop {
        let job = helpers::fetch_job(pool, id).await;
        if job.status == status {
            return job;
        }
        assert!(
            Instant::now() < deadline,
            "job {id} stuck in {:?}, wanted {status:?}",
            job.status
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

// ── end-to-end scenarios ────────────────────────────────────────────

#[sqlx::test]
async fn happy_path_product_with_images(pool: PgPool) {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/img/front.png"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(helpers::png_fixture(64, 64), "image/png"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/img/back.png"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(helpers::png_fixture(32, 32), "image/png"),
        )
        .mount(&server)
        .await;

    let base = server.uri();
    let handlers = Arc::new(ScriptedHandlers::products({
        let base = base.clone();
        move |job| {
            let mut record = helpers::make_product("The Iliad", &job.target_url);
            record.image_urls = vec![format!("{base}/img/front.png"), format!("{base}/img/back.png")];
            Ok(record)
        }
    }));
    let store = Arc::new(MemoryObjectStore::default());

    let job_id = queue::enqueue(
        JobType::Product,
        "https://shop.example.com/products/the-iliad",
        5,
        json!({}),
        3,
        &pool,
    )
    .await
    .unwrap();

    let worker_pool = spawn_pool(&pool, handlers, store.clone(), &base, 1);
    worker_pool.start().await;

    let job = wait_for_status(&pool, job_id, JobStatus::Completed, Duration::from_secs(10)).await;
    worker_pool.stop(STOP_TIMEOUT).await;

    assert_eq!(job.attempts, 1);
    assert!(job.locked_at.is_none());
    assert!(job.locked_by.is_none());
    assert_eq!(job.metadata["items_processed"], 1);

    // Two uploads, and the product row references their canonical URLs
    assert_eq!(store.object_count(), 2);
    let product =
        catalog::get_product_by_source_url("https://shop.example.com/products/the-iliad", &pool)
            .await
            .unwrap()
            .expect("product should be upserted");
    assert_eq!(product.image_urls.len(), 2);
    for url in &product.image_urls {
        assert!(
            url.starts_with("https://cdn.test/products/"),
            "expected canonical URL, got {url}"
        );
        assert!(url.ends_with(".jpeg"));
    }

    let metrics = worker_pool.metrics();
    assert_eq!(metrics.succeeded, 1);
    assert_eq!(metrics.failed, 0);
}

#[sqlx::test]
async fn transient_failure_retries_and_converges(pool: PgPool) {
    let attempts_seen = Arc::new(AtomicU32::new(0));
    let handlers = Arc::new(ScriptedHandlers::products({
        let attempts_seen = attempts_seen.clone();
        move |job| {
            if attempts_seen.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("storefront returned 502");
            }
            Ok(helpers::make_product("The Odyssey", &job.target_url))
        }
    }));
    let store = Arc::new(MemoryObjectStore::default());

    let job_id = queue::enqueue(
        JobType::Product,
        "https://shop.example.com/products/the-odyssey",
        0,
        json!({}),
        3,
        &pool,
    )
    .await
    .unwrap();

    let worker_pool = spawn_pool(&pool, handlers.clone(), store, "https://shop.example.com", 1);
    worker_pool.start().await;

    let job = wait_for_status(&pool, job_id, JobStatus::Completed, Duration::from_secs(10)).await;
    worker_pool.stop(STOP_TIMEOUT).await;

    assert_eq!(job.attempts, 2, "one failed lease plus one successful lease");
    assert_eq!(job.last_error.as_deref(), Some("storefront returned 502"));
    assert_eq!(handlers.call_order().len(), 2);

    // No duplicate rows: the second attempt upserted over the same key
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM product WHERE source_url = $1")
        .bind("https://shop.example.com/products/the-odyssey")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[sqlx::test]
async fn terminal_failure_exhausts_attempts(pool: PgPool) {
    let handlers = Arc::new(ScriptedHandlers::products(|_job| {
        anyhow::bail!("selector matched nothing")
    }));
    let store = Arc::new(MemoryObjectStore::default());

    let job_id = queue::enqueue(
        JobType::Product,
        "https://shop.example.com/products/lost-book",
        0,
        json!({}),
        2, // max_attempts
        &pool,
    )
    .await
    .unwrap();

    let worker_pool = spawn_pool(&pool, handlers, store, "https://shop.example.com", 1);
    worker_pool.start().await;

    let job = wait_for_status(&pool, job_id, JobStatus::Failed, Duration::from_secs(10)).await;
    worker_pool.stop(STOP_TIMEOUT).await;

    assert_eq!(job.attempts, 2);
    assert!(job.completed_at.is_some());
    assert!(
        job.last_error
            .as_deref()
            .is_some_and(|e| e.contains("selector matched nothing"))
    );

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM product")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 0, "no catalog write on handler failure");
}

#[sqlx::test]
async fn expired_lease_is_recovered_by_another_worker(pool: PgPool) {
    // Worker A leased this job and died; the lock is past its TTL.
    let job_id = helpers::insert_job(
        &pool,
        JobType::Product,
        "https://shop.example.com/products/orphaned",
        0,
        JobStatus::Running,
        1,
        3,
        Some("dead-worker"),
        Some(11 * 60),
    )
    .await;

    let handlers = Arc::new(ScriptedHandlers::products(|job| {
        Ok(helpers::make_product("Orphaned Book", &job.target_url))
    }));
    let store = Arc::new(MemoryObjectStore::default());

    let worker_pool = spawn_pool(&pool, handlers, store, "https://shop.example.com", 1);
    worker_pool.start().await;

    let job = wait_for_status(&pool, job_id, JobStatus::Completed, Duration::from_secs(10)).await;
    worker_pool.stop(STOP_TIMEOUT).await;

    assert_eq!(job.attempts, 2, "the reclaim counted a fresh attempt");
    assert_ne!(job.metadata["completed_by"], "dead-worker");
}

#[sqlx::test]
async fn concurrent_workers_drain_queue_by_priority(pool: PgPool) {
    let handlers = Arc::new(
        ScriptedHandlers::products(|job| Ok(helpers::make_product("Book", &job.target_url)))
            .with_delay(Duration::from_millis(150)),
    );
    let store = Arc::new(MemoryObjectStore::default());

    for priority in 1..=10 {
        queue::enqueue(
            JobType::Product,
            &format!("https://shop.example.com/products/p{priority}"),
            priority,
            json!({}),
            3,
            &pool,
        )
        .await
        .unwrap();
    }

    let worker_pool = spawn_pool(&pool, handlers.clone(), store, "https://shop.example.com", 3);
    worker_pool.start().await;

    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let stats = queue::get_stats(&pool).await.unwrap();
        if stats.completed == 10 {
            break;
        }
        assert!(Instant::now() < deadline, "queue did not drain: {stats:?}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    worker_pool.stop(STOP_TIMEOUT).await;

    let calls = handlers.call_order();
    assert_eq!(calls.len(), 10, "every job processed exactly once");

    // The three workers grab the three highest-priority jobs first.
    let mut first_wave: Vec<_> = calls[..3].to_vec();
    first_wave.sort();
    assert_eq!(
        first_wave,
        vec![
            "https://shop.example.com/products/p10",
            "https://shop.example.com/products/p8",
            "https://shop.example.com/products/p9",
        ]
    );
}

#[sqlx::test]
async fn image_partial_failure_still_completes(pool: PgPool) {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/img/first.png"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(helpers::png_fixture(40, 40), "image/png"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/img/missing.png"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/img/third.png"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(helpers::png_fixture(48, 48), "image/png"),
        )
        .mount(&server)
        .await;

    let base = server.uri();
    let handlers = Arc::new(ScriptedHandlers::products({
        let base = base.clone();
        move |job| {
            let mut record = helpers::make_product("Illustrated Iliad", &job.target_url);
            record.image_urls = vec![
                format!("{base}/img/first.png"),
                format!("{base}/img/missing.png"),
                format!("{base}/img/third.png"),
            ];
            Ok(record)
        }
    }));
    let store = Arc::new(MemoryObjectStore::default());

    let job_id = queue::enqueue(
        JobType::Product,
        "https://shop.example.com/products/illustrated-iliad",
        0,
        json!({}),
        3,
        &pool,
    )
    .await
    .unwrap();

    let worker_pool = spawn_pool(&pool, handlers, store.clone(), &base, 1);
    worker_pool.start().await;

    let job = wait_for_status(&pool, job_id, JobStatus::Completed, Duration::from_secs(10)).await;
    worker_pool.stop(STOP_TIMEOUT).await;

    assert_eq!(job.attempts, 1, "image failures never fail the job");
    let errors = job.metadata["errors"].as_array().expect("errors recorded");
    assert_eq!(errors.len(), 1);
    assert!(errors[0].as_str().unwrap().contains("missing.png"));

    assert_eq!(store.object_count(), 2);
    let product = catalog::get_product_by_source_url(
        "https://shop.example.com/products/illustrated-iliad",
        &pool,
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(
        product.image_urls.len(),
        2,
        "the two successes survive, in order"
    );
}

// ── follow-up discovery ─────────────────────────────────────────────

#[sqlx::test]
async fn category_job_enqueues_discovered_products(pool: PgPool) {
    let handlers = Arc::new(ScriptedHandlers::categories(|job| {
        Ok((
            bindery::catalog::CategoryRecord {
                navigation_id: None,
                title: "Classics".to_owned(),
                source_url: job.target_url.clone(),
                product_count: 2,
            },
            vec![
                bindery::catalog::ProductSummary {
                    title: "The Iliad".to_owned(),
                    url: "https://shop.example.com/products/the-iliad".to_owned(),
                    price: Some(12.99),
                    currency: Some("GBP".to_owned()),
                    thumbnail: None,
                },
                bindery::catalog::ProductSummary {
                    title: "The Odyssey".to_owned(),
                    url: "https://shop.example.com/products/the-odyssey".to_owned(),
                    price: None,
                    currency: None,
                    thumbnail: None,
                },
            ],
        ))
    }));
    let store = Arc::new(MemoryObjectStore::default());

    // One of the two discovered products already has a queued job.
    helpers::insert_job(
        &pool,
        JobType::Product,
        "https://shop.example.com/products/the-iliad",
        0,
        JobStatus::Queued,
        0,
        3,
        None,
        None,
    )
    .await;

    let job_id = queue::enqueue(
        JobType::Category,
        "https://shop.example.com/collections/classics",
        3,
        json!({}),
        3,
        &pool,
    )
    .await
    .unwrap();

    let worker_pool = spawn_pool(&pool, handlers, store, "https://shop.example.com", 1);
    worker_pool.start().await;
    wait_for_status(&pool, job_id, JobStatus::Completed, Duration::from_secs(10)).await;
    worker_pool.stop(STOP_TIMEOUT).await;

    let (product_jobs,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM scrape_job WHERE job_type = 'product'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(
        product_jobs, 2,
        "only the undiscovered product gets a new job"
    );

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM category")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

// ── lifecycle ───────────────────────────────────────────────────────

#[sqlx::test]
async fn start_and_stop_report_current_state(pool: PgPool) {
    let handlers = Arc::new(ScriptedHandlers::default());
    let store = Arc::new(MemoryObjectStore::default());
    let worker_pool = spawn_pool(&pool, handlers, store, "https://shop.example.com", 1);

    assert!(worker_pool.start().await);
    assert!(!worker_pool.start().await, "second start is a no-op");
    assert!(worker_pool.is_running());

    assert!(worker_pool.stop(STOP_TIMEOUT).await);
    assert!(!worker_pool.stop(STOP_TIMEOUT).await, "second stop is a no-op");
    assert!(!worker_pool.is_running());
}

#[sqlx::test]
async fn shutdown_releases_lease_of_overrunning_job(pool: PgPool) {
    let handlers = Arc::new(
        ScriptedHandlers::products(|job| Ok(helpers::make_product("Slow Book", &job.target_url)))
            .with_delay(Duration::from_secs(30)),
    );
    let store = Arc::new(MemoryObjectStore::default());

    let job_id = queue::enqueue(
        JobType::Product,
        "https://shop.example.com/products/slow-book",
        0,
        json!({}),
        3,
        &pool,
    )
    .await
    .unwrap();

    let worker_pool = spawn_pool(&pool, handlers, store, "https://shop.example.com", 1);
    worker_pool.start().await;
    wait_for_status(&pool, job_id, JobStatus::Running, Duration::from_secs(10)).await;

    // The in-flight job far exceeds this deadline; the pool must hard-kill
    // the worker and put the lease back.
    assert!(worker_pool.stop(Duration::from_millis(200)).await);

    let job = helpers::fetch_job(&pool, job_id).await;
    assert_eq!(job.status, JobStatus::Queued, "lease released at shutdown");
    assert!(job.locked_by.is_none());
}
