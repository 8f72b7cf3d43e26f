//! In-memory cache for uploaded images.
//!
//! Uploads are validated (size, content type, decodability), normalized
//! to a consistent encoding, and stored under a fresh opaque identifier
//! until they are referenced in a chat turn or reaped after the TTL.

use chrono::{DateTime, Utc};
use parley_common::config::ImageConfig;
use parley_common::{Error, Result};
use std::collections::HashMap;
use std::io::Cursor;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::session::ImageAttachment;

/// Accepted upload content types.
const ACCEPTED_TYPES: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/webp"];

/// A cached upload.
#[derive(Debug, Clone)]
struct StoredImage {
    bytes: Vec<u8>,
    content_type: String,
    uploaded_at: DateTime<Utc>,
    consumed: bool,
}

/// A fetched image, ready to attach to a chat turn.
#[derive(Debug, Clone)]
pub struct ImageRef {
    pub id: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

impl ImageRef {
    /// Convert into a turn attachment.
    pub fn into_attachment(self) -> ImageAttachment {
        ImageAttachment {
            content_type: self.content_type,
            data: self.data,
        }
    }
}

/// In-memory store mapping upload identifiers to image payloads.
///
/// Same locking discipline as the session store: the directory lock is
/// held only for lookup, insert, and removal.
pub struct ImageCache {
    config: ImageConfig,
    entries: RwLock<HashMap<String, StoredImage>>,
}

impl ImageCache {
    pub fn new(config: ImageConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Validate, normalize, and store an upload. Returns the fresh
    /// opaque identifier.
    ///
    /// Rejects empty payloads, payloads over the configured maximum
    /// (exactly at the limit is accepted), content types outside the
    /// allow-list, and bytes that do not decode as an image. Nothing is
    /// retained on failure.
    pub async fn store(&self, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        if bytes.is_empty() {
            return Err(Error::InvalidInput("empty upload".to_string()));
        }
        if bytes.len() > self.config.max_bytes {
            return Err(Error::PayloadTooLarge {
                limit: self.config.max_bytes,
            });
        }

        let declared = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if !ACCEPTED_TYPES.contains(&declared.as_str()) {
            return Err(Error::UnsupportedMediaType(declared));
        }

        let (bytes, content_type) = normalize(bytes, declared)?;

        let id = Uuid::new_v4().simple().to_string();
        let mut entries = self.entries.write().await;
        entries.insert(
            id.clone(),
            StoredImage {
                bytes,
                content_type,
                uploaded_at: Utc::now(),
                consumed: false,
            },
        );
        tracing::debug!(image = %id, "Stored upload");
        Ok(id)
    }

    /// Return the payload and content type if present and not expired.
    /// Does not mark the entry consumed.
    pub async fn fetch(&self, id: &str) -> Option<ImageRef> {
        let entries = self.entries.read().await;
        entries.get(id).map(|stored| ImageRef {
            id: id.to_string(),
            content_type: stored.content_type.clone(),
            data: stored.bytes.clone(),
        })
    }

    /// Mark an entry used after it has been included in a chat turn.
    ///
    /// With `consume_on_use` configured the entry is removed immediately;
    /// otherwise it stays available until the TTL sweep.
    pub async fn consume(&self, id: &str) {
        let mut entries = self.entries.write().await;
        if self.config.consume_on_use {
            entries.remove(id);
        } else if let Some(stored) = entries.get_mut(id) {
            stored.consumed = true;
        }
    }

    /// Remove an entry immediately (reaper support).
    pub async fn remove(&self, id: &str) -> bool {
        self.entries.write().await.remove(id).is_some()
    }

    /// Snapshot the identifiers of uploads older than `ttl`.
    pub async fn expired_ids(&self, ttl: Duration) -> Vec<String> {
        let now = Utc::now();
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|(_, stored)| {
                let age = now.signed_duration_since(stored.uploaded_at);
                age.to_std().map(|age| age > ttl).unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Number of cached uploads.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    #[cfg(test)]
    pub(crate) async fn backdate(&self, id: &str, uploaded_at: DateTime<Utc>) {
        if let Some(stored) = self.entries.write().await.get_mut(id) {
            stored.uploaded_at = uploaded_at;
        }
    }

    #[cfg(test)]
    pub(crate) async fn is_consumed(&self, id: &str) -> Option<bool> {
        self.entries.read().await.get(id).map(|s| s.consumed)
    }
}

/// Decode the upload and flatten any alpha channel onto an opaque white
/// background, re-encoding as PNG, so the upstream API always receives a
/// consistent encoding. Fully opaque images pass through unchanged.
fn normalize(bytes: Vec<u8>, content_type: String) -> Result<(Vec<u8>, String)> {
    let decoded = image::load_from_memory(&bytes)
        .map_err(|e| Error::InvalidInput(format!("malformed image: {e}")))?;

    if !decoded.color().has_alpha() {
        return Ok((bytes, content_type));
    }

    let rgba = decoded.to_rgba8();
    let (width, height) = rgba.dimensions();
    let mut flattened = image::RgbImage::new(width, height);
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u32::from(pixel[3]);
        let blend = |channel: u8| -> u8 {
            ((u32::from(channel) * alpha + 255 * (255 - alpha)) / 255) as u8
        };
        flattened.put_pixel(
            x,
            y,
            image::Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]),
        );
    }

    let mut out = Vec::new();
    image::DynamicImage::ImageRgb8(flattened)
        .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
        .map_err(|e| Error::Internal(format!("failed to re-encode image: {e}")))?;
    Ok((out, "image/png".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use image::{Rgb, Rgba};

    fn opaque_png() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(4, 4, Rgb([200, 10, 10]));
        let mut out = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        out
    }

    fn transparent_png() -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(4, 4, Rgba([0, 0, 0, 0]));
        let mut out = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        out
    }

    fn cache_with_limit(max_bytes: usize) -> ImageCache {
        ImageCache::new(ImageConfig {
            max_bytes,
            consume_on_use: false,
        })
    }

    #[tokio::test]
    async fn test_store_and_fetch_roundtrip() {
        let cache = cache_with_limit(1024 * 1024);
        let bytes = opaque_png();
        let id = cache.store(bytes.clone(), "image/png").await.unwrap();

        let fetched = cache.fetch(&id).await.unwrap();
        assert_eq!(fetched.content_type, "image/png");
        assert_eq!(fetched.data, bytes);
        // fetch does not consume
        assert_eq!(cache.is_consumed(&id).await, Some(false));
    }

    #[tokio::test]
    async fn test_payload_exactly_at_limit_succeeds() {
        let bytes = opaque_png();
        let cache = cache_with_limit(bytes.len());
        assert!(cache.store(bytes, "image/png").await.is_ok());
    }

    #[tokio::test]
    async fn test_payload_one_byte_over_limit_fails() {
        let bytes = opaque_png();
        let cache = cache_with_limit(bytes.len() - 1);
        let err = cache.store(bytes, "image/png").await.unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { .. }));
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_empty_upload_rejected() {
        let cache = cache_with_limit(1024);
        let err = cache.store(Vec::new(), "image/png").await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_unsupported_content_type_rejected() {
        let cache = cache_with_limit(1024 * 1024);
        let err = cache
            .store(opaque_png(), "application/pdf")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedMediaType(_)));
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_content_type_parameters_are_ignored() {
        let cache = cache_with_limit(1024 * 1024);
        let id = cache
            .store(opaque_png(), "image/PNG; charset=binary")
            .await
            .unwrap();
        assert!(cache.fetch(&id).await.is_some());
    }

    #[tokio::test]
    async fn test_malformed_image_rejected_without_state() {
        let cache = cache_with_limit(1024 * 1024);
        let err = cache
            .store(vec![0xde, 0xad, 0xbe, 0xef], "image/png")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_transparent_image_is_flattened_to_opaque_png() {
        let cache = cache_with_limit(1024 * 1024);
        let id = cache.store(transparent_png(), "image/png").await.unwrap();
        let fetched = cache.fetch(&id).await.unwrap();
        assert_eq!(fetched.content_type, "image/png");

        let decoded = image::load_from_memory(&fetched.data).unwrap();
        assert!(!decoded.color().has_alpha());
        // Fully transparent black composited on white becomes white.
        let rgb = decoded.to_rgb8();
        assert_eq!(rgb.get_pixel(0, 0), &Rgb([255, 255, 255]));
    }

    #[tokio::test]
    async fn test_consume_marks_entry_used() {
        let cache = cache_with_limit(1024 * 1024);
        let id = cache.store(opaque_png(), "image/png").await.unwrap();
        cache.consume(&id).await;
        assert_eq!(cache.is_consumed(&id).await, Some(true));
        // Used entries remain available for TTL purposes.
        assert!(cache.fetch(&id).await.is_some());
    }

    #[tokio::test]
    async fn test_consume_on_use_removes_entry() {
        let cache = ImageCache::new(ImageConfig {
            max_bytes: 1024 * 1024,
            consume_on_use: true,
        });
        let id = cache.store(opaque_png(), "image/png").await.unwrap();
        cache.consume(&id).await;
        assert!(cache.fetch(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_expired_ids_respects_ttl() {
        let cache = cache_with_limit(1024 * 1024);
        let stale = cache.store(opaque_png(), "image/png").await.unwrap();
        let fresh = cache.store(opaque_png(), "image/png").await.unwrap();
        cache
            .backdate(&stale, Utc::now() - ChronoDuration::seconds(7000))
            .await;

        let expired = cache.expired_ids(Duration::from_secs(3600)).await;
        assert_eq!(expired, vec![stale]);
        assert!(cache.fetch(&fresh).await.is_some());
    }
}
