//! Pipeline controller. Sequences validation, reference loading, detection,
//! embedding and matching, and maps every failure onto exactly one outcome.
//!
//! Stages run strictly in order:
//! `ValidateInputs → LoadReference → DetectFace → EmbedFace → Match`.
//! Any stage may end the run early with an error outcome. Panics raised
//! by a backend are caught here and reported as `PROCESSING_ERROR`.

use crate::detector::FaceDetector;
use crate::matcher::{decide, CosineMatcher, Decision, Matcher};
use crate::normalizer::{FaceNormalizer, NormalizeError, NormalizedFace, PreviewWriter};
use crate::outcome::{ErrorCode, MatchReport, Outcome, PREVIEW_WARNING, USAGE};
use crate::recognizer::{Embedder, EmbedderError};
use crate::store::{self, StoreError};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_DATASET_ROOT_MARKER: &str = "Bollywood_data/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    ValidateInputs,
    LoadReference,
    DetectFace,
    EmbedFace,
    Match,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("{0}")]
    InvalidArguments(String),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Failed to generate face embedding")]
    EmbeddingFailed,
    #[error("embedder: {0}")]
    Embedder(#[from] EmbedderError),
    #[error("embedding dimension mismatch: query has {query} values, references have {reference}")]
    DimensionMismatch { query: usize, reference: usize },
    #[error("no reference embedding produced a comparable similarity")]
    NoCandidate,
}

impl PipelineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PipelineError::InvalidArguments(_) => ErrorCode::InvalidArguments,
            PipelineError::Normalize(e) => e.code(),
            PipelineError::Store(e) => e.code(),
            PipelineError::EmbeddingFailed => ErrorCode::EmbeddingFailed,
            PipelineError::Embedder(_)
            | PipelineError::DimensionMismatch { .. }
            | PipelineError::NoCandidate => ErrorCode::ProcessingError,
        }
    }

    fn into_outcome(self) -> Outcome {
        let code = self.code();
        let trace = (code == ErrorCode::ProcessingError).then(|| trace_excerpt(&self));
        Outcome::error(code, self.to_string(), trace)
    }
}

/// One-line excerpt of the innermost cause of `err`.
fn trace_excerpt(err: &(dyn std::error::Error + 'static)) -> String {
    let mut innermost = err;
    while let Some(source) = innermost.source() {
        innermost = source;
    }
    let debug = format!("{innermost:?}");
    debug.lines().next().unwrap_or_default().to_string()
}

/// Text of a panic payload raised with a string message.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Marker stripped from reference image paths of a confirmed match.
    pub dataset_root_marker: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            dataset_root_marker: DEFAULT_DATASET_ROOT_MARKER.to_string(),
        }
    }
}

/// Single-shot matching pipeline over a detector and an embedder backend.
pub struct Pipeline<D, E> {
    normalizer: FaceNormalizer<D>,
    embedder: E,
    settings: PipelineSettings,
}

impl<D: FaceDetector, E: Embedder> Pipeline<D, E> {
    pub fn new(
        detector: D,
        embedder: E,
        preview: PreviewWriter,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            normalizer: FaceNormalizer::new(detector, preview),
            embedder,
            settings,
        }
    }

    /// Run every stage once and produce the terminal outcome. Never panics.
    pub fn run(&mut self, image_path: &Path, dataset_path: &Path) -> Outcome {
        let mut stage = Stage::ValidateInputs;
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.execute(image_path, dataset_path, &mut stage)
        }));

        match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                if err.code() == ErrorCode::ProcessingError {
                    tracing::error!(?stage, error = %err, detail = ?err, "pipeline failed");
                } else {
                    tracing::warn!(?stage, error = %err, "pipeline stopped");
                }
                err.into_outcome()
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(?stage, panic = %message, "pipeline panicked");
                Outcome::error(
                    ErrorCode::ProcessingError,
                    message,
                    Some(format!("panic during {stage:?}")),
                )
            }
        }
    }

    fn execute(
        &mut self,
        image_path: &Path,
        dataset_path: &Path,
        stage: &mut Stage,
    ) -> Result<Outcome, PipelineError> {
        tracing::info!(path = %image_path.display(), "processing image");
        tracing::info!(path = %dataset_path.display(), "using embeddings");

        validate_inputs(image_path, dataset_path)?;

        enter(stage, Stage::LoadReference);
        let dataset = store::load(dataset_path)?;

        enter(stage, Stage::DetectFace);
        // Dropping `preview` on any early return removes the file.
        let NormalizedFace { face, preview } = self.normalizer.normalize(image_path)?;

        enter(stage, Stage::EmbedFace);
        let embedding = self
            .embedder
            .embed(&face)?
            .ok_or(PipelineError::EmbeddingFailed)?;
        if embedding.len() != dataset.dimension() {
            return Err(PipelineError::DimensionMismatch {
                query: embedding.len(),
                reference: dataset.dimension(),
            });
        }

        enter(stage, Stage::Match);
        let candidate = CosineMatcher
            .best_match(&embedding, dataset.entries())
            .ok_or(PipelineError::NoCandidate)?;
        let entry = dataset
            .get(candidate.index)
            .ok_or(PipelineError::NoCandidate)?;

        let outcome = match decide(candidate, entry, &self.settings.dataset_root_marker) {
            Decision::Confirmed {
                actor,
                image,
                similarity,
            } => {
                tracing::info!(%actor, similarity, "confident match");
                let warning = (!preview.saved).then(|| PREVIEW_WARNING.to_string());
                Outcome::Matched(MatchReport {
                    actor,
                    image,
                    similarity,
                    user_face: preview.retain(),
                    warning,
                })
            }
            Decision::LowConfidence {
                best_guess,
                similarity,
            } => {
                tracing::info!(%best_guess, similarity, "best candidate below threshold");
                preview.discard();
                Outcome::low_confidence(best_guess, similarity)
            }
        };

        Ok(outcome)
    }
}

fn enter(stage: &mut Stage, next: Stage) {
    *stage = next;
    tracing::debug!(stage = ?next, "entering pipeline stage");
}

/// Cheap checks before any model or dataset is touched. The image is checked first.
fn validate_inputs(image_path: &Path, dataset_path: &Path) -> Result<(), PipelineError> {
    if image_path.as_os_str().is_empty() || dataset_path.as_os_str().is_empty() {
        return Err(PipelineError::InvalidArguments(USAGE.to_string()));
    }
    if !image_path.is_file() {
        return Err(NormalizeError::FileNotFound(image_path.display().to_string()).into());
    }
    if !dataset_path.exists() {
        return Err(StoreError::not_found(dataset_path, None).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{DetectionMode, DetectorError, FaceCrop};
    use crate::types::{Embedding, QueryFace, EMBEDDING_DIM};
    use image::{Rgb, RgbImage};
    use serde_json::{json, Value};
    use std::cell::Cell;
    use std::path::PathBuf;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct StubDetector {
        calls: Rc<Cell<usize>>,
        faces: usize,
    }

    impl FaceDetector for StubDetector {
        fn detect(
            &mut self,
            _: &RgbImage,
            _: DetectionMode,
        ) -> Result<Vec<FaceCrop>, DetectorError> {
            self.calls.set(self.calls.get() + 1);
            let face = RgbImage::from_pixel(16, 16, Rgb([120, 90, 60]));
            Ok((0..self.faces)
                .map(|_| FaceCrop::from_rgb(face.clone(), Some(0.99)))
                .collect())
        }
    }

    struct PanickingDetector;

    impl FaceDetector for PanickingDetector {
        fn detect(
            &mut self,
            _: &RgbImage,
            _: DetectionMode,
        ) -> Result<Vec<FaceCrop>, DetectorError> {
            panic!("detector exploded");
        }
    }

    struct StubEmbedder(Option<Vec<f32>>);

    impl Embedder for StubEmbedder {
        fn embed(&mut self, _: &QueryFace) -> Result<Option<Embedding>, EmbedderError> {
            Ok(self.0.clone().map(Embedding::new))
        }
    }

    struct BrokenEmbedder;

    impl Embedder for BrokenEmbedder {
        fn embed(&mut self, _: &QueryFace) -> Result<Option<Embedding>, EmbedderError> {
            Err(EmbedderError::InferenceFailed("output tensor missing".into()))
        }
    }

    struct PanickingEmbedder;

    impl Embedder for PanickingEmbedder {
        fn embed(&mut self, _: &QueryFace) -> Result<Option<Embedding>, EmbedderError> {
            panic!("embedder exploded");
        }
    }

    fn basis(i: usize) -> Vec<f32> {
        let mut v = vec![0.0; EMBEDDING_DIM];
        v[i] = 1.0;
        v
    }

    /// Unit vector whose cosine with `basis(0)` is `similarity`.
    fn at_similarity(similarity: f32) -> Vec<f32> {
        let mut v = vec![0.0; EMBEDDING_DIM];
        v[0] = similarity;
        v[1] = (1.0 - similarity * similarity).sqrt();
        v
    }

    struct Fixture {
        dir: tempfile::TempDir,
        image: PathBuf,
        dataset: PathBuf,
    }

    impl Fixture {
        fn new(records: Value) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let image = dir.path().join("upload.png");
            RgbImage::from_pixel(48, 48, Rgb([200, 180, 160])).save(&image).unwrap();
            let dataset = dir.path().join("embeddings.json");
            std::fs::write(&dataset, records.to_string()).unwrap();
            Self { dir, image, dataset }
        }

        fn standard() -> Self {
            Self::new(json!([
                {"actor": "Y", "image_path": "Bollywood_data/Y/3.jpg", "embedding": basis(2)},
                {
                    "actor": "X",
                    "image_path": "Bollywood_data/X/1.jpg",
                    "embedding": at_similarity(0.73),
                },
                {"actor": "Z", "image_path": "Bollywood_data/Z/9.jpg", "embedding": basis(3)},
            ]))
        }

        fn preview_dir(&self) -> PathBuf {
            self.dir.path().join("static")
        }

        fn preview_count(&self) -> usize {
            std::fs::read_dir(self.preview_dir()).map_or(0, |entries| entries.count())
        }

        fn pipeline<D, E>(&self, detector: D, embedder: E) -> Pipeline<D, E>
        where
            D: FaceDetector,
            E: Embedder,
        {
            Pipeline::new(
                detector,
                embedder,
                PreviewWriter::new(self.preview_dir(), "static"),
                PipelineSettings::default(),
            )
        }

        fn run<D: FaceDetector, E: Embedder>(&self, detector: D, embedder: E) -> Outcome {
            self.pipeline(detector, embedder).run(&self.image, &self.dataset)
        }
    }

    fn json_of(outcome: &Outcome) -> Value {
        serde_json::from_str(&outcome.to_json().unwrap()).unwrap()
    }

    fn one_face() -> StubDetector {
        StubDetector { faces: 1, ..Default::default() }
    }

    #[test]
    fn test_confident_match() {
        let fx = Fixture::standard();
        let outcome = fx.run(one_face(), StubEmbedder(Some(basis(0))));

        assert_eq!(outcome.exit_code(), 0);
        let v = json_of(&outcome);
        assert_eq!(v["actor"], "X");
        assert_eq!(v["image"], "X/1.jpg");
        assert!((v["similarity"].as_f64().unwrap() - 0.73).abs() < 1e-5);
        assert!(v.get("warning").is_none());
        assert!(v.get("code").is_none());

        let user_face = v["userFace"].as_str().unwrap();
        let file_name = user_face.strip_prefix("static/").unwrap();
        assert!(file_name.ends_with(".jpg"));
        assert!(fx.preview_dir().join(file_name).is_file());
    }

    #[test]
    fn test_concurrent_runs_get_distinct_previews() {
        let fx = Fixture::standard();
        let a = json_of(&fx.run(one_face(), StubEmbedder(Some(basis(0)))));
        let b = json_of(&fx.run(one_face(), StubEmbedder(Some(basis(0)))));
        assert_ne!(a["userFace"], b["userFace"]);
    }

    #[test]
    fn test_low_confidence() {
        let fx = Fixture::standard();
        // Orthogonal to every reference: all score 0, the first entry wins the tie
        let outcome = fx.run(one_face(), StubEmbedder(Some(basis(4))));

        assert_eq!(outcome.code(), Some(ErrorCode::LowConfidence));
        assert_eq!(outcome.exit_code(), 2);
        assert_eq!(
            json_of(&outcome),
            json!({
                "error": "No confident match found",
                "code": "LOW_CONFIDENCE",
                "best_guess": "Y",
                "similarity": 0.0,
            })
        );
    }

    #[test]
    fn test_low_confidence_reports_best_guess() {
        let fx = Fixture::new(json!([
            {"actor": "A", "image_path": "a.jpg", "embedding": basis(5)},
            {"actor": "B", "image_path": "b.jpg", "embedding": at_similarity(0.4)},
        ]));
        let v = json_of(&fx.run(one_face(), StubEmbedder(Some(basis(0)))));
        assert_eq!(v["best_guess"], "B");
        assert!((v["similarity"].as_f64().unwrap() - 0.4).abs() < 1e-5);
    }

    #[test]
    fn test_missing_image_skips_all_stages() {
        let fx = Fixture::standard();
        let detector = one_face();
        let calls = detector.calls.clone();
        let outcome = fx
            .pipeline(detector, StubEmbedder(Some(basis(0))))
            .run(&fx.dir.path().join("missing.jpg"), &fx.dataset);

        assert_eq!(outcome.code(), Some(ErrorCode::FileNotFound));
        assert_eq!(outcome.exit_code(), 2);
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_missing_image_reported_before_missing_dataset() {
        let fx = Fixture::standard();
        let outcome = fx
            .pipeline(one_face(), StubEmbedder(None))
            .run(&fx.dir.path().join("missing.jpg"), &fx.dir.path().join("missing.pkl"));
        assert_eq!(outcome.code(), Some(ErrorCode::FileNotFound));
    }

    #[test]
    fn test_missing_dataset() {
        let fx = Fixture::standard();
        let detector = one_face();
        let calls = detector.calls.clone();
        let outcome = fx
            .pipeline(detector, StubEmbedder(Some(basis(0))))
            .run(&fx.image, &fx.dir.path().join("missing.pkl"));

        assert_eq!(outcome.code(), Some(ErrorCode::EmbeddingsNotFound));
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_dataset_with_wrong_dimension() {
        let fx = Fixture::new(json!([
            {"actor": "X", "image_path": "x.jpg", "embedding": [1.0, 2.0]},
        ]));
        let outcome = fx.run(one_face(), StubEmbedder(Some(basis(0))));
        assert_eq!(outcome.code(), Some(ErrorCode::InvalidEmbeddings));
    }

    #[test]
    fn test_dataset_missing_field() {
        let fx = Fixture::new(json!([{"actor": "X", "embedding": basis(0)}]));
        let outcome = fx.run(one_face(), StubEmbedder(Some(basis(0))));
        assert_eq!(outcome.code(), Some(ErrorCode::InvalidEmbeddings));
        assert!(json_of(&outcome).get("trace").is_none());
    }

    #[test]
    fn test_no_face_detected() {
        let fx = Fixture::standard();
        let outcome = fx.run(StubDetector::default(), StubEmbedder(Some(basis(0))));
        assert_eq!(
            outcome.to_json().unwrap(),
            r#"{"error":"No face detected in the image","code":"NO_FACE_DETECTED"}"#
        );
        assert_eq!(outcome.exit_code(), 2);
    }

    #[test]
    fn test_embedding_failed() {
        let fx = Fixture::standard();
        let outcome = fx.run(one_face(), StubEmbedder(None));
        assert_eq!(outcome.code(), Some(ErrorCode::EmbeddingFailed));
        assert_eq!(json_of(&outcome)["error"], "Failed to generate face embedding");
    }

    #[test]
    fn test_dimension_mismatch_is_processing_error() {
        let fx = Fixture::standard();
        let outcome = fx.run(one_face(), StubEmbedder(Some(vec![0.5; 512])));
        assert_eq!(outcome.code(), Some(ErrorCode::ProcessingError));
        let v = json_of(&outcome);
        assert!(v["error"].as_str().unwrap().contains("512"));
        assert!(v["trace"].is_string());
    }

    #[test]
    fn test_embedder_error_is_processing_error() {
        let fx = Fixture::standard();
        let outcome = fx.run(one_face(), BrokenEmbedder);
        assert_eq!(outcome.code(), Some(ErrorCode::ProcessingError));
        let v = json_of(&outcome);
        assert!(v["error"].as_str().unwrap().contains("output tensor missing"));
        assert!(v["trace"].as_str().unwrap().contains("InferenceFailed"));
    }

    #[test]
    fn test_backend_panic_is_processing_error() {
        let fx = Fixture::standard();
        let outcome = fx.run(PanickingDetector, StubEmbedder(Some(basis(0))));
        assert_eq!(outcome.code(), Some(ErrorCode::ProcessingError));
        let v = json_of(&outcome);
        assert_eq!(v["error"], "detector exploded");
        assert_eq!(v["trace"], "panic during DetectFace");
    }

    #[test]
    fn test_preview_failure_downgrades_to_warning() {
        let fx = Fixture::standard();
        std::fs::write(fx.preview_dir(), b"not a directory").unwrap();
        let outcome = fx.run(one_face(), StubEmbedder(Some(basis(0))));

        assert_eq!(outcome.exit_code(), 0);
        let v = json_of(&outcome);
        assert_eq!(v["actor"], "X");
        assert_eq!(v["warning"], PREVIEW_WARNING);
    }

    #[test]
    fn test_empty_path_is_invalid_arguments() {
        let fx = Fixture::standard();
        let detector = one_face();
        let calls = detector.calls.clone();
        let outcome = fx
            .pipeline(detector, StubEmbedder(Some(basis(0))))
            .run(Path::new(""), &fx.dataset);
        assert_eq!(outcome.code(), Some(ErrorCode::InvalidArguments));
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_undecodable_image_is_processing_error() {
        let fx = Fixture::standard();
        std::fs::write(&fx.image, b"\x89PNG truncated").unwrap();
        let outcome = fx.run(one_face(), StubEmbedder(Some(basis(0))));
        assert_eq!(outcome.code(), Some(ErrorCode::ProcessingError));
        assert!(json_of(&outcome)["trace"].is_string());
    }

    #[test]
    fn test_only_confirmed_matches_keep_their_preview() {
        let fx = Fixture::standard();

        fx.run(one_face(), StubEmbedder(Some(basis(4))));
        assert_eq!(fx.preview_count(), 0, "low confidence");

        fx.run(one_face(), StubEmbedder(None));
        assert_eq!(fx.preview_count(), 0, "embedding failed");

        fx.run(one_face(), BrokenEmbedder);
        assert_eq!(fx.preview_count(), 0, "embedder error");

        fx.run(one_face(), StubEmbedder(Some(vec![0.5; 512])));
        assert_eq!(fx.preview_count(), 0, "dimension mismatch");

        fx.run(one_face(), PanickingEmbedder);
        assert_eq!(fx.preview_count(), 0, "embedder panic");

        fx.run(one_face(), StubEmbedder(Some(basis(0))));
        assert_eq!(fx.preview_count(), 1, "confirmed match");
    }

    #[test]
    fn test_embedder_panic_is_processing_error() {
        let fx = Fixture::standard();
        let outcome = fx.run(one_face(), PanickingEmbedder);
        assert_eq!(outcome.code(), Some(ErrorCode::ProcessingError));
        assert_eq!(json_of(&outcome)["trace"], "panic during EmbedFace");
    }
}
