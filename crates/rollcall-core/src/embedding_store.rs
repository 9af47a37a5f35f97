//! In-memory reference gallery, rebuilt wholesale from the reference source.

use crate::encoder::FaceEncoder;
use crate::types::KnownIdentity;
use crate::BackendError;
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// One row of the reference set, before its image has been encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceEntry {
    pub id: String,
    pub name: String,
    pub image_uri: String,
}

/// Where reference identities come from.
pub trait ReferenceSource: Send + Sync {
    fn fetch_identities(&self) -> Result<Vec<ReferenceEntry>, BackendError>;

    /// Cheap connectivity check for health reporting.
    fn is_connected(&self) -> bool;
}

/// Resolves a reference image URI to its encoded bytes.
pub trait ImageFetcher: Send + Sync {
    fn fetch(&self, uri: &str) -> Result<Vec<u8>, BackendError>;
}

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("failed to fetch reference identities: {0}")]
    Fetch(#[from] BackendError),
    #[error("no usable reference identities ({attempted} attempted)")]
    NoUsableIdentities { attempted: usize },
}

#[derive(Error, Debug)]
enum EntryError {
    #[error("{0}")]
    Fetch(#[from] BackendError),
    #[error("undecodable image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("encoding failed: {0}")]
    Encode(#[from] crate::encoder::EncodeError),
    #[error("no face found in reference image")]
    NoFace,
}

/// Snapshot-based store of [`KnownIdentity`] entries.
///
/// Readers get an `Arc` to an immutable collection; `reload` swaps in a new
/// collection only once it is fully built, so a reader never sees a
/// partially rebuilt gallery.
pub struct EmbeddingStore {
    identities: RwLock<Arc<Vec<KnownIdentity>>>,
    /// Downscale factor applied to reference images before encoding.
    reference_scale: f32,
}

impl EmbeddingStore {
    pub fn new(reference_scale: f32) -> Self {
        Self {
            identities: RwLock::new(Arc::new(Vec::new())),
            reference_scale,
        }
    }

    /// Current snapshot, in load order.
    pub fn identities(&self) -> Arc<Vec<KnownIdentity>> {
        let guard = self.identities.read().unwrap_or_else(|p| p.into_inner());
        Arc::clone(&guard)
    }

    pub fn len(&self) -> usize {
        self.identities().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rebuild the gallery from `source`.
    ///
    /// Entries whose image cannot be fetched, decoded, or yields no face are
    /// skipped. Fails only if the source itself fails or nothing usable
    /// loads; on failure the previous snapshot is kept.
    pub fn reload(
        &self,
        source: &dyn ReferenceSource,
        fetcher: &dyn ImageFetcher,
        encoder: &mut dyn FaceEncoder,
    ) -> Result<usize, LoadError> {
        let entries = source.fetch_identities()?;
        let attempted = entries.len();
        let mut loaded = Vec::with_capacity(attempted);

        for entry in entries {
            match self.load_entry(&entry, fetcher, encoder) {
                Ok(identity) => loaded.push(identity),
                Err(e) => {
                    tracing::warn!(id = %entry.id, name = %entry.name, error = %e, "skipping reference identity");
                }
            }
        }

        if loaded.is_empty() {
            return Err(LoadError::NoUsableIdentities { attempted });
        }

        let count = loaded.len();
        *self.identities.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(loaded);
        tracing::info!(loaded = count, skipped = attempted - count, "reference gallery reloaded");
        Ok(count)
    }

    fn load_entry(
        &self,
        entry: &ReferenceEntry,
        fetcher: &dyn ImageFetcher,
        encoder: &mut dyn FaceEncoder,
    ) -> Result<KnownIdentity, EntryError> {
        let bytes = fetcher.fetch(&entry.image_uri)?;
        let image = image::load_from_memory(&bytes)?.to_rgb8();
        let image = downscale(image, self.reference_scale);

        let face = encoder.encode(&image)?.into_iter().next().ok_or(EntryError::NoFace)?;

        Ok(KnownIdentity {
            id: entry.id.clone(),
            display_name: entry.name.clone(),
            embedding: face.embedding,
            reference_image_uri: entry.image_uri.clone(),
        })
    }
}

fn downscale(image: RgbImage, scale: f32) -> RgbImage {
    if !(scale > 0.0 && scale < 1.0) {
        return image;
    }
    let w = ((image.width() as f32 * scale).round() as u32).max(1);
    let h = ((image.height() as f32 * scale).round() as u32).max(1);
    imageops::resize(&image, w, h, FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{DetectedFace, EncodeError};
    use crate::types::{BoundingBox, Embedding};
    use std::io::Cursor;

    struct FakeSource(Result<Vec<ReferenceEntry>, String>);

    impl ReferenceSource for FakeSource {
        fn fetch_identities(&self) -> Result<Vec<ReferenceEntry>, BackendError> {
            self.0.clone().map_err(BackendError::Store)
        }
        fn is_connected(&self) -> bool {
            self.0.is_ok()
        }
    }

    /// Serves a small PNG for every URI except those listed as failing.
    struct FakeFetcher {
        failing: Vec<&'static str>,
    }

    impl ImageFetcher for FakeFetcher {
        fn fetch(&self, uri: &str) -> Result<Vec<u8>, BackendError> {
            if self.failing.contains(&uri) {
                return Err(BackendError::Fetch {
                    uri: uri.to_string(),
                    reason: "404".into(),
                });
            }
            let mut png = Vec::new();
            RgbImage::from_pixel(8, 8, image::Rgb([uri.len() as u8, 0, 0]))
                .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
                .unwrap();
            Ok(png)
        }
    }

    /// Encodes the red channel of the top-left pixel; black images have no face.
    struct FakeEncoder;

    impl FaceEncoder for FakeEncoder {
        fn encode(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, EncodeError> {
            let red = image.get_pixel(0, 0)[0];
            if red == 0 {
                return Ok(Vec::new());
            }
            Ok(vec![DetectedFace {
                location: BoundingBox { x: 0.0, y: 0.0, width: 1.0, height: 1.0, confidence: 1.0 },
                embedding: Embedding::new(vec![red as f32, 0.0]),
            }])
        }
    }

    fn entry(id: &str, uri: &str) -> ReferenceEntry {
        ReferenceEntry { id: id.into(), name: format!("Student {id}"), image_uri: uri.into() }
    }

    #[test]
    fn test_reload_skips_unfetchable_identity() {
        let store = EmbeddingStore::new(0.5);
        let source = FakeSource(Ok(vec![
            entry("1", "http://img/1.jpg"),
            entry("2", "http://img/2.jpg"),
            entry("3", "http://img/3.jpg"),
        ]));
        let fetcher = FakeFetcher { failing: vec!["http://img/2.jpg"] };

        let count = store.reload(&source, &fetcher, &mut FakeEncoder).unwrap();
        assert_eq!(count, 2);

        let ids: Vec<_> = store.identities().iter().map(|i| i.id.clone()).collect();
        assert_eq!(ids, vec!["1", "3"]);
        assert_eq!(store.identities()[1].reference_image_uri, "http://img/3.jpg");
    }

    #[test]
    fn test_reload_empty_source_is_load_failure() {
        let store = EmbeddingStore::new(0.5);
        let err = store
            .reload(&FakeSource(Ok(vec![])), &FakeFetcher { failing: vec![] }, &mut FakeEncoder)
            .unwrap_err();
        assert!(matches!(err, LoadError::NoUsableIdentities { attempted: 0 }));
        assert!(store.is_empty());
    }

    #[test]
    fn test_reload_source_error_is_load_failure() {
        let store = EmbeddingStore::new(0.5);
        let err = store
            .reload(&FakeSource(Err("offline".into())), &FakeFetcher { failing: vec![] }, &mut FakeEncoder)
            .unwrap_err();
        assert!(matches!(err, LoadError::Fetch(_)));
    }

    #[test]
    fn test_failed_reload_keeps_previous_snapshot() {
        let store = EmbeddingStore::new(1.0);
        let fetcher = FakeFetcher { failing: vec![] };
        store
            .reload(&FakeSource(Ok(vec![entry("1", "a://x")])), &fetcher, &mut FakeEncoder)
            .unwrap();
        let before = store.identities();

        let all_failing = FakeFetcher { failing: vec!["a://y"] };
        assert!(store
            .reload(&FakeSource(Ok(vec![entry("2", "a://y")])), &all_failing, &mut FakeEncoder)
            .is_err());
        assert!(Arc::ptr_eq(&before, &store.identities()));
    }

    #[test]
    fn test_reload_replaces_snapshot_without_touching_held_one() {
        let store = EmbeddingStore::new(1.0);
        let fetcher = FakeFetcher { failing: vec![] };
        store
            .reload(&FakeSource(Ok(vec![entry("1", "a://x")])), &fetcher, &mut FakeEncoder)
            .unwrap();
        let held = store.identities();

        store
            .reload(
                &FakeSource(Ok(vec![entry("2", "a://yy"), entry("3", "a://zzz")])),
                &fetcher,
                &mut FakeEncoder,
            )
            .unwrap();

        assert_eq!(held.len(), 1);
        assert_eq!(held[0].id, "1");
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_downscale_halves_dimensions() {
        let image = RgbImage::new(320, 240);
        assert_eq!(downscale(image, 0.5).dimensions(), (160, 120));
        let image = RgbImage::new(10, 10);
        assert_eq!(downscale(image, 1.0).dimensions(), (10, 10));
    }
}
