use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ImageReader, RgbImage};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::models::photo_job::LocationSnapshot;
use crate::services::geocode::ReverseGeocoder;
use crate::services::overlay;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_width: u32,
    pub quality: u8,
    pub overlay_enabled: bool,
    /// App-local directory for upload-ready files.
    pub output_dir: PathBuf,
    pub gallery_dir: Option<PathBuf>,
}

/// What to do with the raw capture once the processed copy is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceDisposal {
    Delete,
    Keep,
}

#[derive(Debug, Clone)]
pub struct ProcessedPhoto {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub annotated: bool,
    pub size_bytes: u64,
}

/// Raw capture -> resized, re-encoded, optionally captioned JPEG.
pub struct PhotoPipeline {
    config: PipelineConfig,
    geocoder: Option<Arc<ReverseGeocoder>>,
}

impl PhotoPipeline {
    pub fn new(config: PipelineConfig, geocoder: Option<Arc<ReverseGeocoder>>) -> Self {
        Self { config, geocoder }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn process(
        &self,
        source: &Path,
        target_name: &str,
        captured_at: DateTime<Utc>,
        location: Option<&LocationSnapshot>,
        disposal: SourceDisposal,
    ) -> Result<ProcessedPhoto, PipelineError> {
        let raw = source.to_path_buf();
        let max_width = self.config.max_width;
        let image = tokio::task::spawn_blocking(move || load_resized(&raw, max_width)).await??;

        let caption = self.caption(captured_at, location).await;
        let quality = self.config.quality;
        let (bytes, width, height, annotated) =
            tokio::task::spawn_blocking(move || render(image, caption, quality)).await??;

        tokio::fs::create_dir_all(&self.config.output_dir).await?;
        let path = self.config.output_dir.join(target_name);
        tokio::fs::write(&path, &bytes).await?;

        self.copy_to_gallery(&path, target_name).await;

        if disposal == SourceDisposal::Delete {
            remove_if_exists(source).await?;
        }

        tracing::debug!(
            source = %source.display(),
            output = %path.display(),
            width,
            height,
            annotated,
            size_bytes = bytes.len(),
            "Photo processed"
        );

        Ok(ProcessedPhoto {
            path,
            width,
            height,
            annotated,
            size_bytes: bytes.len() as u64,
        })
    }

    /// Caption lines, or `None` when the photo should stay unannotated.
    async fn caption(
        &self,
        captured_at: DateTime<Utc>,
        location: Option<&LocationSnapshot>,
    ) -> Option<Vec<String>> {
        if !self.config.overlay_enabled {
            return None;
        }
        let location = location?;
        let geocoder = self.geocoder.as_ref()?;

        let Some(address) = geocoder
            .lookup_with_retry(location.latitude, location.longitude)
            .await
        else {
            tracing::warn!("Address lookup exhausted, keeping photo unannotated");
            return None;
        };

        Some(vec![
            captured_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            address,
            format!("{:.5}, {:.5}", location.latitude, location.longitude),
        ])
    }

    async fn copy_to_gallery(&self, processed: &Path, target_name: &str) {
        let Some(gallery) = &self.config.gallery_dir else {
            return;
        };
        let result = async {
            tokio::fs::create_dir_all(gallery).await?;
            tokio::fs::copy(processed, gallery.join(target_name)).await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(gallery = %gallery.display(), error = %e, "Gallery copy failed");
        }
    }
}

fn load_resized(path: &Path, max_width: u32) -> Result<RgbImage, PipelineError> {
    let decoded = ImageReader::open(path)?.with_guessed_format()?.decode()?;
    let rgb = decoded.to_rgb8();
    let (width, height) = rgb.dimensions();
    if width <= max_width {
        return Ok(rgb);
    }

    let scaled_height = ((height as u64 * max_width as u64) / width as u64).max(1) as u32;
    Ok(imageops::resize(&rgb, max_width, scaled_height, FilterType::Triangle))
}

fn render(
    mut image: RgbImage,
    caption: Option<Vec<String>>,
    quality: u8,
) -> Result<(Vec<u8>, u32, u32, bool), PipelineError> {
    let annotated = match caption {
        Some(lines) => overlay::stamp(&mut image, &lines),
        None => false,
    };

    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, quality).encode_image(&image)?;
    let (width, height) = image.dimensions();
    Ok((bytes, width, height, annotated))
}

/// Remove a file, treating an already-missing file as done.
pub async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("File error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image decode/encode failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("Image task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn write_png(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
        let image = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        let path = dir.join(name);
        image.save(&path).unwrap();
        path
    }

    fn config(dir: &Path, overlay_enabled: bool) -> PipelineConfig {
        PipelineConfig {
            max_width: 800,
            quality: 70,
            overlay_enabled,
            output_dir: dir.join("processed"),
            gallery_dir: None,
        }
    }

    fn location() -> LocationSnapshot {
        LocationSnapshot {
            latitude: 39.7817,
            longitude: -89.6501,
            accuracy_m: Some(5.0),
        }
    }

    #[tokio::test]
    async fn resizes_to_bounded_width_and_deletes_raw() {
        let dir = tempfile::tempdir().unwrap();
        let raw = write_png(dir.path(), "raw.png", 2000, 1000);
        let pipeline = PhotoPipeline::new(config(dir.path(), false), None);

        let processed = pipeline
            .process(&raw, "T-1_0.jpg", Utc::now(), None, SourceDisposal::Delete)
            .await
            .unwrap();

        assert_eq!((processed.width, processed.height), (800, 400));
        assert!(!processed.annotated);
        let bytes = std::fs::read(&processed.path).unwrap();
        assert_eq!(image::guess_format(&bytes).unwrap(), image::ImageFormat::Jpeg);
        assert!(!raw.exists());
    }

    #[tokio::test]
    async fn small_images_are_not_upscaled_and_raw_can_be_kept() {
        let dir = tempfile::tempdir().unwrap();
        let raw = write_png(dir.path(), "raw.png", 300, 200);
        let pipeline = PhotoPipeline::new(config(dir.path(), false), None);

        let processed = pipeline
            .process(&raw, "T-1_0.jpg", Utc::now(), None, SourceDisposal::Keep)
            .await
            .unwrap();

        assert_eq!((processed.width, processed.height), (300, 200));
        assert!(raw.exists());
    }

    #[tokio::test]
    async fn geocoding_exhaustion_falls_back_to_unannotated_output() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/reverse"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let raw = write_png(dir.path(), "raw.png", 1000, 600);
        let captured_at = Utc::now();

        let geocoder =
            ReverseGeocoder::new(&server.uri(), 3, Duration::from_millis(10)).unwrap();
        let with_overlay = PhotoPipeline::new(config(dir.path(), true), Some(Arc::new(geocoder)));
        let fallback = with_overlay
            .process(&raw, "a.jpg", captured_at, Some(&location()), SourceDisposal::Keep)
            .await
            .unwrap();

        let without_overlay = PhotoPipeline::new(config(dir.path(), false), None);
        let plain = without_overlay
            .process(&raw, "b.jpg", captured_at, Some(&location()), SourceDisposal::Keep)
            .await
            .unwrap();

        assert!(!fallback.annotated);
        assert_eq!(
            std::fs::read(&fallback.path).unwrap(),
            std::fs::read(&plain.path).unwrap()
        );
    }

    #[tokio::test]
    async fn resolved_address_is_stamped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/reverse"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "display_name": "12 Main Street" })),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let raw = write_png(dir.path(), "raw.png", 1000, 600);
        let geocoder =
            ReverseGeocoder::new(&server.uri(), 3, Duration::from_millis(10)).unwrap();
        let pipeline = PhotoPipeline::new(config(dir.path(), true), Some(Arc::new(geocoder)));

        let processed = pipeline
            .process(&raw, "T-1_0.jpg", Utc::now(), Some(&location()), SourceDisposal::Keep)
            .await
            .unwrap();
        assert!(processed.annotated);
    }

    #[tokio::test]
    async fn undecodable_input_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw.jpg");
        std::fs::write(&raw, b"definitely not an image").unwrap();
        let pipeline = PhotoPipeline::new(config(dir.path(), false), None);

        let err = pipeline
            .process(&raw, "T-1_0.jpg", Utc::now(), None, SourceDisposal::Delete)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Image(_)));
        assert!(raw.exists());
    }

    #[tokio::test]
    async fn gallery_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let raw = write_png(dir.path(), "raw.png", 100, 100);
        let blocker = dir.path().join("gallery");
        std::fs::write(&blocker, b"a file, not a directory").unwrap();

        let mut cfg = config(dir.path(), false);
        cfg.gallery_dir = Some(blocker);
        let pipeline = PhotoPipeline::new(cfg, None);

        assert!(pipeline
            .process(&raw, "T-1_0.jpg", Utc::now(), None, SourceDisposal::Delete)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn removing_a_missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        remove_if_exists(&dir.path().join("gone.jpg")).await.unwrap();
    }
}
