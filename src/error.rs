//! Error classification for the scraping pipeline.

/// Convenience alias used throughout the crate.
pub type Result<T> = anyhow::Result<T>;

/// Classified failures produced inside the job pipeline.
///
/// The worker decides what to do with a failed stage by downcasting the
/// propagated `anyhow::Error` to this type: validation, handler and
/// persistence failures consume a retry attempt, a lost lease aborts the
/// pipeline silently, and image errors never surface here at all (they are
/// collected into the job's result summary instead).
#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    /// Input violated a schema before any write was attempted.
    #[error("validation failed for {field}: {message}")]
    Validation { field: String, message: String },

    /// A page or image download failed in a way that is worth retrying.
    #[error("fetch failed for {url}: {message}")]
    TransientFetch { url: String, message: String },

    /// A page handler could not extract the expected records.
    #[error("handler failed for {url}: {message}")]
    Handler { url: String, message: String },

    /// A single image could not be materialized. Localized to that image.
    #[error("image rejected ({url}): {message}")]
    Image { url: String, message: String },

    /// The catalog store rejected a write after validation passed.
    #[error("persistence failed: {0}")]
    Persistence(String),

    /// An ownership-checked update matched no rows. Another claimant
    /// (usually the expiry sweep) owns the job now.
    #[error("lease lost for job {job_id}")]
    LostLease { job_id: uuid::Uuid },
}

impl ScrapeError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn image(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Image {
            url: url.into(),
            message: message.into(),
        }
    }
}
