//! Turns the query photograph into one canonical RGB face.

use crate::detector::{
    ChannelOrder, DetectionMode, DetectorError, FaceCrop, FaceDetector, FacePixels,
};
use crate::outcome::ErrorCode;
use crate::types::QueryFace;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

const PREVIEW_JPEG_QUALITY: u8 = 90;

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("Image file not found: {0}")]
    FileNotFound(String),
    #[error("No face detected in the image")]
    NoFaceDetected,
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error(
        "face crop holds {actual} samples, expected {expected} for {width}x{height} {order:?}"
    )]
    MalformedCrop {
        width: u32,
        height: u32,
        order: ChannelOrder,
        expected: usize,
        actual: usize,
    },
    #[error("detector: {0}")]
    Detector(DetectorError),
}

impl From<DetectorError> for NormalizeError {
    fn from(e: DetectorError) -> Self {
        match e {
            DetectorError::NoFaceDetected => NormalizeError::NoFaceDetected,
            other => NormalizeError::Detector(other),
        }
    }
}

impl NormalizeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            NormalizeError::FileNotFound(_) => ErrorCode::FileNotFound,
            NormalizeError::NoFaceDetected => ErrorCode::NoFaceDetected,
            _ => ErrorCode::ProcessingError,
        }
    }
}

/// Preview copy of the query face.
///
/// The file is removed when the preview is dropped, unless [`Preview::retain`]
/// handed its path to a result.
#[derive(Debug)]
pub struct Preview {
    /// Path reported to the caller, relative to the served scratch root.
    pub relative_path: String,
    pub saved: bool,
    path: PathBuf,
    retained: bool,
}

impl Preview {
    /// Keep the file on disk and return the path to report.
    pub fn retain(mut self) -> String {
        self.retained = true;
        std::mem::take(&mut self.relative_path)
    }

    /// Remove the file now. Equivalent to dropping the preview.
    pub fn discard(self) {}
}

impl Drop for Preview {
    fn drop(&mut self) {
        if self.retained || !self.saved {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "face preview discarded"),
            Err(e) => tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "failed to remove face preview"
            ),
        }
    }
}

/// Writes preview JPEGs into a scratch directory shared between concurrent runs.
///
/// File names are random UUIDs created with `create_new`, so two runs never
/// write the same file.
#[derive(Debug, Clone)]
pub struct PreviewWriter {
    dir: PathBuf,
    prefix: String,
}

impl PreviewWriter {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    /// Save `face`. Failures are logged and reported through `saved`, never returned.
    pub fn write(&self, face: &RgbImage) -> Preview {
        let file_name = format!("user_face_{}.jpg", Uuid::new_v4().simple());
        let relative_path = if self.prefix.is_empty() {
            file_name.clone()
        } else {
            format!("{}/{file_name}", self.prefix.trim_end_matches('/'))
        };
        let path = self.dir.join(&file_name);

        let saved = match write_jpeg(&path, face) {
            Ok(()) => path.is_file(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to save face preview");
                false
            }
        };
        if saved {
            tracing::debug!(path = %path.display(), "face preview saved");
        }

        Preview {
            relative_path,
            saved,
            path,
            retained: false,
        }
    }
}

fn write_jpeg(path: &Path, face: &RgbImage) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let mut writer = BufWriter::new(file);
    JpegEncoder::new_with_quality(&mut writer, PREVIEW_JPEG_QUALITY).encode_image(face)?;
    writer.flush()?;
    Ok(())
}

/// Canonical face plus the preview written for it.
#[derive(Debug)]
pub struct NormalizedFace {
    pub face: QueryFace,
    pub preview: Preview,
}

/// Detects the query face with a strict detector and canonicalizes it.
pub struct FaceNormalizer<D> {
    detector: D,
    preview: PreviewWriter,
}

impl<D: FaceDetector> FaceNormalizer<D> {
    pub fn new(detector: D, preview: PreviewWriter) -> Self {
        Self { detector, preview }
    }

    pub fn normalize(&mut self, image_path: &Path) -> Result<NormalizedFace, NormalizeError> {
        if !image_path.is_file() {
            return Err(NormalizeError::FileNotFound(image_path.display().to_string()));
        }

        let image = image::open(image_path)?.to_rgb8();
        tracing::debug!(
            path = %image_path.display(),
            width = image.width(),
            height = image.height(),
            "query image decoded"
        );

        let faces = self.detector.detect(&image, DetectionMode::Strict)?;
        if faces.len() > 1 {
            tracing::info!(faces = faces.len(), "multiple faces detected, using the first");
        }
        let crop = faces.into_iter().next().ok_or(NormalizeError::NoFaceDetected)?;

        let face = canonicalize(crop)?;
        let preview = self.preview.write(&face.image);

        Ok(NormalizedFace { face, preview })
    }
}

/// Produce an 8-bit RGB face from whatever layout the detector returned.
///
/// Float buffers within [0, 1] are rescaled to [0, 255]; other float buffers
/// are taken as already being on the 8-bit scale.
pub fn canonicalize(crop: FaceCrop) -> Result<QueryFace, NormalizeError> {
    let FaceCrop {
        width,
        height,
        order,
        pixels,
        ..
    } = crop;

    let channels = order.channels();
    let expected = width as usize * height as usize * channels;
    if pixels.len() != expected || expected == 0 {
        return Err(NormalizeError::MalformedCrop {
            width,
            height,
            order,
            expected,
            actual: pixels.len(),
        });
    }

    let samples: Vec<u8> = match pixels {
        FacePixels::U8(v) => v,
        FacePixels::F32(v) => {
            let unit_range = v.iter().all(|s| (0.0..=1.0).contains(s));
            let scale = if unit_range { 255.0 } else { 1.0 };
            v.iter()
                .map(|s| (s * scale).round().clamp(0.0, 255.0) as u8)
                .collect()
        }
    };

    let rgb: Vec<u8> = match order {
        ChannelOrder::Rgb => samples,
        ChannelOrder::Bgr => samples
            .chunks_exact(3)
            .flat_map(|p| [p[2], p[1], p[0]])
            .collect(),
        ChannelOrder::Gray => samples.iter().flat_map(|&g| [g, g, g]).collect(),
    };

    let image = RgbImage::from_raw(width, height, rgb).ok_or(NormalizeError::MalformedCrop {
        width,
        height,
        order,
        expected,
        actual: 0,
    })?;

    Ok(QueryFace { image })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    struct FixedDetector(Vec<FaceCrop>);

    impl FaceDetector for FixedDetector {
        fn detect(
            &mut self,
            _image: &RgbImage,
            mode: DetectionMode,
        ) -> Result<Vec<FaceCrop>, DetectorError> {
            assert_eq!(mode, DetectionMode::Strict);
            Ok(self.0.clone())
        }
    }

    struct FailingDetector;

    impl FaceDetector for FailingDetector {
        fn detect(
            &mut self,
            _: &RgbImage,
            _: DetectionMode,
        ) -> Result<Vec<FaceCrop>, DetectorError> {
            Err(DetectorError::NoFaceDetected)
        }
    }

    fn write_photo(dir: &Path) -> PathBuf {
        let path = dir.join("photo.png");
        RgbImage::from_pixel(32, 24, Rgb([90, 60, 30])).save(&path).unwrap();
        path
    }

    fn solid(width: u32, height: u32, rgb: [u8; 3]) -> FaceCrop {
        FaceCrop::from_rgb(RgbImage::from_pixel(width, height, Rgb(rgb)), Some(0.9))
    }

    #[test]
    fn test_canonicalize_float_unit_range() {
        let crop = FaceCrop {
            width: 1,
            height: 1,
            order: ChannelOrder::Rgb,
            pixels: FacePixels::F32(vec![1.0, 0.5, 0.0]),
            confidence: None,
        };
        let face = canonicalize(crop).unwrap();
        assert_eq!(*face.image.get_pixel(0, 0), Rgb([255, 128, 0]));
    }

    #[test]
    fn test_canonicalize_float_byte_range_is_not_rescaled() {
        let crop = FaceCrop {
            width: 1,
            height: 1,
            order: ChannelOrder::Rgb,
            pixels: FacePixels::F32(vec![200.0, 3.0, 300.0]),
            confidence: None,
        };
        let face = canonicalize(crop).unwrap();
        assert_eq!(*face.image.get_pixel(0, 0), Rgb([200, 3, 255]));
    }

    #[test]
    fn test_canonicalize_bgr_is_reordered() {
        let crop = FaceCrop {
            width: 2,
            height: 1,
            order: ChannelOrder::Bgr,
            pixels: FacePixels::U8(vec![1, 2, 3, 4, 5, 6]),
            confidence: None,
        };
        let face = canonicalize(crop).unwrap();
        assert_eq!(*face.image.get_pixel(0, 0), Rgb([3, 2, 1]));
        assert_eq!(*face.image.get_pixel(1, 0), Rgb([6, 5, 4]));
    }

    #[test]
    fn test_canonicalize_gray_is_expanded() {
        let crop = FaceCrop {
            width: 1,
            height: 2,
            order: ChannelOrder::Gray,
            pixels: FacePixels::F32(vec![0.0, 1.0]),
            confidence: None,
        };
        let face = canonicalize(crop).unwrap();
        assert_eq!(*face.image.get_pixel(0, 1), Rgb([255, 255, 255]));
    }

    #[test]
    fn test_canonicalize_rejects_short_buffer() {
        let crop = FaceCrop {
            width: 4,
            height: 4,
            order: ChannelOrder::Rgb,
            pixels: FacePixels::U8(vec![0; 10]),
            confidence: None,
        };
        let err = canonicalize(crop).unwrap_err();
        assert!(matches!(err, NormalizeError::MalformedCrop { expected: 48, actual: 10, .. }));
        assert_eq!(err.code(), ErrorCode::ProcessingError);
    }

    #[test]
    fn test_normalize_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut normalizer = FaceNormalizer::new(
            FixedDetector(vec![]),
            PreviewWriter::new(dir.path(), "static"),
        );
        let err = normalizer.normalize(&dir.path().join("missing.jpg")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::FileNotFound);
    }

    #[test]
    fn test_normalize_no_faces() {
        let dir = tempfile::tempdir().unwrap();
        let photo = write_photo(dir.path());
        let mut normalizer = FaceNormalizer::new(
            FixedDetector(vec![]),
            PreviewWriter::new(dir.path().join("static"), "static"),
        );
        let err = normalizer.normalize(&photo).unwrap_err();
        assert!(matches!(err, NormalizeError::NoFaceDetected));
        assert_eq!(err.to_string(), "No face detected in the image");
    }

    #[test]
    fn test_normalize_strict_detector_failure_is_no_face() {
        let dir = tempfile::tempdir().unwrap();
        let photo = write_photo(dir.path());
        let mut normalizer =
            FaceNormalizer::new(FailingDetector, PreviewWriter::new(dir.path(), "static"));
        let err = normalizer.normalize(&photo).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoFaceDetected);
    }

    #[test]
    fn test_normalize_undecodable_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.jpg");
        std::fs::write(&path, b"not an image").unwrap();
        let mut normalizer = FaceNormalizer::new(
            FixedDetector(vec![solid(4, 4, [0, 0, 0])]),
            PreviewWriter::new(dir.path(), "static"),
        );
        let err = normalizer.normalize(&path).unwrap_err();
        assert!(matches!(err, NormalizeError::Decode(_)));
        assert_eq!(err.code(), ErrorCode::ProcessingError);
    }

    #[test]
    fn test_normalize_first_face_wins_and_preview_saved() {
        let dir = tempfile::tempdir().unwrap();
        let photo = write_photo(dir.path());
        let static_dir = dir.path().join("static");
        let mut normalizer = FaceNormalizer::new(
            FixedDetector(vec![solid(8, 8, [10, 200, 10]), solid(64, 64, [200, 10, 10])]),
            PreviewWriter::new(&static_dir, "static"),
        );

        let normalized = normalizer.normalize(&photo).unwrap();
        assert_eq!(normalized.face.image.dimensions(), (8, 8));
        assert_eq!(*normalized.face.image.get_pixel(3, 3), Rgb([10, 200, 10]));

        assert!(normalized.preview.saved);
        let file_name = normalized.preview.relative_path.strip_prefix("static/").unwrap();
        assert!(file_name.starts_with("user_face_") && file_name.ends_with(".jpg"));
        assert!(static_dir.join(file_name).is_file());
    }

    #[test]
    fn test_preview_names_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let writer = PreviewWriter::new(dir.path(), "static/");
        let face = RgbImage::from_pixel(4, 4, Rgb([1, 2, 3]));
        let a = writer.write(&face);
        let b = writer.write(&face);
        assert!(a.saved && b.saved);
        assert_ne!(a.relative_path, b.relative_path);
        assert!(a.relative_path.starts_with("static/user_face_"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn test_preview_write_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the scratch directory should be
        let blocker = dir.path().join("static");
        std::fs::write(&blocker, b"").unwrap();
        let writer = PreviewWriter::new(&blocker, "static");
        let preview = writer.write(&RgbImage::new(2, 2));
        assert!(!preview.saved);
        assert!(preview.relative_path.starts_with("static/user_face_"));
    }

    #[test]
    fn test_dropped_preview_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let writer = PreviewWriter::new(dir.path(), "static");
        let preview = writer.write(&RgbImage::new(4, 4));
        assert!(preview.saved);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        preview.discard();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_retained_preview_stays_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let writer = PreviewWriter::new(dir.path(), "static");
        let relative = writer.write(&RgbImage::new(4, 4)).retain();

        let file_name = relative.strip_prefix("static/").unwrap();
        assert!(dir.path().join(file_name).is_file());
    }
}
