//! Webhook alerting for pipeline incidents.
//!
//! Alerts are best-effort: delivery happens on a detached task and failures
//! are logged, never propagated. With no webhook configured every call is a
//! no-op.

use serde_json::json;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Rolling window size for the error-rate check.
const ERROR_WINDOW: usize = 20;

/// Minimum outcomes before the error rate is meaningful.
const ERROR_MIN_SAMPLES: usize = 10;

/// Failure ratio over the window that triggers an alert.
const ERROR_RATE_THRESHOLD: f64 = 0.5;

/// Minimum spacing between error-rate alerts.
const ERROR_ALERT_COOLDOWN: Duration = Duration::from_secs(5 * 60);

/// Resident-set high-water mark that triggers a memory alert.
const MEMORY_HIGH_WATER_BYTES: u64 = 1024 * 1024 * 1024;

/// Minimum spacing between memory alerts.
const MEMORY_ALERT_COOLDOWN: Duration = Duration::from_secs(15 * 60);

pub struct Alerter {
    client: reqwest::Client,
    webhook_url: Option<String>,
    window: Mutex<ErrorWindow>,
    last_memory_alert: Mutex<Option<Instant>>,
}

#[derive(Default)]
struct ErrorWindow {
    outcomes: VecDeque<bool>,
    last_alert: Option<Instant>,
}

/// Resident set size of this process, where the platform exposes it.
fn read_rss_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * 4096)
}

impl Alerter {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url,
            window: Mutex::new(ErrorWindow::default()),
            last_memory_alert: Mutex::new(None),
        }
    }

    /// Compare current RSS against the high-water mark, alerting at most
    /// once per cooldown. A no-op on platforms without /proc.
    pub fn check_memory(&self) {
        let Some(rss) = read_rss_bytes() else {
            return;
        };
        if rss < MEMORY_HIGH_WATER_BYTES {
            return;
        }

        let mut last = self.last_memory_alert.lock().expect("memory alert lock poisoned");
        if last.is_none_or(|at| at.elapsed() >= MEMORY_ALERT_COOLDOWN) {
            *last = Some(Instant::now());
            drop(last);
            warn!(rss_bytes = rss, "process memory above high-water mark");
            self.post(json!({
                "kind": "memory_high_water",
                "rss_bytes": rss,
                "high_water_bytes": MEMORY_HIGH_WATER_BYTES,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }));
        }
    }

    /// A job exhausted its attempts and is now terminal.
    pub fn job_dead(&self, job_id: Uuid, job_type: &str, error: &str) {
        self.post(json!({
            "kind": "job_failed_terminally",
            "job_id": job_id,
            "job_type": job_type,
            "error": error,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }));
    }

    /// Record one pipeline outcome; fires an alert when the rolling failure
    /// rate crosses the threshold.
    pub fn record_outcome(&self, success: bool) {
        let breach = {
            let mut window = self.window.lock().expect("alert window lock poisoned");
            window.outcomes.push_back(success);
            if window.outcomes.len() > ERROR_WINDOW {
                window.outcomes.pop_front();
            }

            let samples = window.outcomes.len();
            if samples < ERROR_MIN_SAMPLES {
                None
            } else {
                let failures = window.outcomes.iter().filter(|ok| !**ok).count();
                let rate = failures as f64 / samples as f64;
                let cooled_down = window
                    .last_alert
                    .is_none_or(|at| at.elapsed() >= ERROR_ALERT_COOLDOWN);
                if rate >= ERROR_RATE_THRESHOLD && cooled_down {
                    window.last_alert = Some(Instant::now());
                    Some(rate)
                } else {
                    None
                }
            }
        };

        if let Some(rate) = breach {
            self.post(json!({
                "kind": "error_rate_high",
                "error_rate": rate,
                "window": ERROR_WINDOW,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }));
        }
    }

    fn post(&self, payload: serde_json::Value) {
        let Some(url) = self.webhook_url.clone() else {
            debug!(kind = %payload["kind"], "alert suppressed, no webhook configured");
            return;
        };

        let client = self.client.clone();
        tokio::spawn(async move {
            let result = client
                .post(&url)
                .json(&payload)
                .timeout(Duration::from_secs(10))
                .send()
                .await
                .and_then(|response| response.error_for_status());
            if let Err(e) = result {
                warn!(error = %e, "alert webhook delivery failed");
            }
        });
    }
}
