//! Materializes remote images into the object store.
//!
//! Every image that survives validation is re-encoded to JPEG and written
//! under a random `products/` key, so persisted records only ever reference
//! canonical object-store URLs. Failures are localized to the single image;
//! batch callers treat them as warnings.

use crate::error::{Result, ScrapeError};
use crate::store::ObjectStore;
use anyhow::Context;
use futures::StreamExt;
use image::imageops::FilterType;
use image::{ImageFormat, codecs::jpeg::JpegEncoder};
use reqwest::header::CONTENT_TYPE;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;
use uuid::Uuid;

/// Hard cap on a single image download.
const MAX_DOWNLOAD_BYTES: usize = 5 * 1024 * 1024;

/// Images wider than this are downscaled; narrower ones are left alone.
const MAX_WIDTH: u32 = 1200;

const JPEG_QUALITY: u8 = 85;

/// How many images of one batch are in flight at once.
const BATCH_CONCURRENCY: usize = 3;

/// A successfully materialized image.
#[derive(Debug, Clone)]
pub struct StoredImage {
    pub canonical_url: String,
    pub byte_size: usize,
    /// Format of the origin image (the stored object is always JPEG).
    pub original_format: &'static str,
}

/// Fetch → validate → transcode → upload pipeline for product images.
pub struct ImagePipeline {
    client: reqwest::Client,
    store: Arc<dyn ObjectStore>,
    base_url: Url,
}

impl ImagePipeline {
    pub fn new(user_agent: &str, base_url: Url, store: Arc<dyn ObjectStore>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent.to_owned())
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            store,
            base_url,
        })
    }

    /// Resolve a scraped image reference to an absolute fetchable URL.
    ///
    /// Protocol-relative `//host/…` references are rewritten to https;
    /// relative paths resolve against the configured base. Anything that is
    /// not http(s) afterwards is rejected.
    pub fn resolve_url(&self, raw: &str) -> Result<Url> {
        let candidate = if let Some(rest) = raw.strip_prefix("//") {
            format!("https://{rest}")
        } else {
            raw.to_owned()
        };

        let resolved = match Url::parse(&candidate) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => self
                .base_url
                .join(&candidate)
                .map_err(|e| ScrapeError::image(raw, e.to_string()))?,
            Err(e) => return Err(ScrapeError::image(raw, e.to_string()).into()),
        };

        if !matches!(resolved.scheme(), "http" | "https") {
            return Err(ScrapeError::image(
                raw,
                format!("unsupported scheme: {}", resolved.scheme()),
            )
            .into());
        }

        Ok(resolved)
    }

    /// Materialize a single image, returning its canonical URL.
    pub async fn process(&self, raw_url: &str) -> Result<StoredImage> {
        let url = self.resolve_url(raw_url)?;
        let bytes = self.download(&url).await?;
        let (jpeg, original_format) =
            tokio::task::spawn_blocking(move || transcode(&bytes))
                .await
                .context("image transcode task panicked")??;

        let key = format!("products/{}.jpeg", Uuid::new_v4());
        let byte_size = jpeg.len();
        self.store
            .put(
                &key,
                jpeg,
                "image/jpeg",
                &[("source-url", url.as_str()), ("original-format", original_format)],
            )
            .await?;

        let canonical_url = self.store.public_url(&key);
        debug!(source = %url, canonical = %canonical_url, byte_size, "image stored");

        Ok(StoredImage {
            canonical_url,
            byte_size,
            original_format,
        })
    }

    /// Materialize a batch of images with bounded concurrency.
    ///
    /// The returned outcomes match the input order; a failed image never
    /// aborts the rest of the batch.
    pub async fn process_batch(&self, urls: &[String]) -> Vec<Result<StoredImage>> {
        futures::stream::iter(urls.iter().map(|url| self.process(url)))
            .buffered(BATCH_CONCURRENCY)
            .collect()
            .await
    }

    /// Download with content-type and size enforcement.
    async fn download(&self, url: &Url) -> Result<Vec<u8>> {
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

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !content_type.starts_with("image/") {
            return Err(ScrapeError::image(
                url.as_str(),
                format!("unexpected content type: {content_type:?}"),
            )
            .into());
        }

        if let Some(length) = response.content_length()
            && length as usize > MAX_DOWNLOAD_BYTES
        {
            return Err(ScrapeError::image(
                url.as_str(),
                format!("image too large: {length} bytes"),
            )
            .into());
        }

        // Content-Length can lie (or be absent); enforce the cap on the
        // actual stream as well.
        let mut bytes = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ScrapeError::TransientFetch {
                url: url.to_string(),
                message: e.to_string(),
            })?;
            if bytes.len() + chunk.len() > MAX_DOWNLOAD_BYTES {
                return Err(ScrapeError::image(url.as_str(), "image too large").into());
            }
            bytes.extend_from_slice(&chunk);
        }

        if bytes.is_empty() {
            return Err(ScrapeError::image(url.as_str(), "empty response body").into());
        }

        Ok(bytes)
    }
}

/// Decode, validate and re-encode an image to capped-width JPEG.
fn transcode(bytes: &[u8]) -> Result<(Vec<u8>, &'static str)> {
    let format = image::guess_format(bytes)
        .map_err(|e| ScrapeError::image("<body>", format!("undecodable image: {e}")))?;

    let format_name = match format {
        ImageFormat::Jpeg => "jpeg",
        ImageFormat::Png => "png",
        ImageFormat::WebP => "webp",
        ImageFormat::Gif => "gif",
        other => {
            return Err(ScrapeError::image(
                "<body>",
                format!("unsupported image format: {other:?}"),
            )
            .into());
        }
    };

    let decoded = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| ScrapeError::image("<body>", format!("decode failed: {e}")))?;

    // Downscale wide images, never enlarge.
    let image = if decoded.width() > MAX_WIDTH {
        let height = ((decoded.height() as f64) * (MAX_WIDTH as f64) / (decoded.width() as f64))
            .round()
            .max(1.0) as u32;
        decoded.resize(MAX_WIDTH, height, FilterType::Lanczos3)
    } else {
        decoded
    };

    let rgb = image.to_rgb8();
    let mut out = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
    rgb.write_with_encoder(encoder)
        .map_err(|e| ScrapeError::image("<body>", format!("encode failed: {e}")))?;

    Ok((out.into_inner(), format_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb([120, 20, 200]));
        let mut out = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn transcode_reencodes_to_jpeg() {
        let (jpeg, original) = transcode(&png_bytes(64, 48)).unwrap();
        assert_eq!(original, "png");
        assert_eq!(image::guess_format(&jpeg).unwrap(), ImageFormat::Jpeg);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 48));
    }

    #[test]
    fn transcode_downscales_wide_images() {
        let (jpeg, _) = transcode(&png_bytes(2400, 1200)).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.width(), MAX_WIDTH);
        assert_eq!(decoded.height(), 600);
    }

    #[test]
    fn transcode_never_enlarges() {
        let (jpeg, _) = transcode(&png_bytes(300, 500)).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (300, 500));
    }

    #[test]
    fn transcode_rejects_non_image_bytes() {
        assert!(transcode(b"<html>not an image</html>").is_err());
    }
}
