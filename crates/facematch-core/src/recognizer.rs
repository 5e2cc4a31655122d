//! Embedding port and the FaceNet-128 ONNX backend.
//!
//! The face handed to an [`Embedder`] is already detected and aligned, so
//! backends never re-run detection and never enforce it.

use crate::types::{Embedding, QueryFace};
use image::imageops::{self, FilterType};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::{Path, PathBuf};
use thiserror::Error;

// --- Named constants (different from SCRFD!) ---
const FACENET_INPUT_SIZE: usize = 160;
const FACENET_MEAN: f32 = 127.5;
const FACENET_STD: f32 = 128.0;
const FACENET_MODEL_VERSION: &str = "facenet128";

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0}; place the FaceNet-128 model in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Face embedding capability.
///
/// `Ok(None)` means the model produced no embedding for this face.
pub trait Embedder {
    fn embed(&mut self, face: &QueryFace) -> Result<Option<Embedding>, EmbedderError>;
}

/// FaceNet embedder (NHWC 160×160×3 input). The session is loaded on first use.
pub struct FacenetEmbedder {
    model_path: PathBuf,
    session: Option<Session>,
}

impl FacenetEmbedder {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            session: None,
        }
    }

    fn session(&mut self) -> Result<&mut Session, EmbedderError> {
        if self.session.is_none() {
            self.session = Some(load_facenet(&self.model_path)?);
        }
        self.session
            .as_mut()
            .ok_or_else(|| EmbedderError::InferenceFailed("FaceNet session unavailable".into()))
    }

    /// Resize an aligned RGB face to 160×160 and normalize into a NHWC tensor.
    fn preprocess(face: &QueryFace) -> Array4<f32> {
        let size = FACENET_INPUT_SIZE as u32;
        let resized;
        let image = if face.image.dimensions() == (size, size) {
            &face.image
        } else {
            resized = imageops::resize(&face.image, size, size, FilterType::Triangle);
            &resized
        };

        let mut tensor = Array4::<f32>::zeros((1, FACENET_INPUT_SIZE, FACENET_INPUT_SIZE, 3));
        for (x, y, pixel) in image.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, y as usize, x as usize, c]] =
                    (pixel[c] as f32 - FACENET_MEAN) / FACENET_STD;
            }
        }
        tensor
    }
}

impl Embedder for FacenetEmbedder {
    fn embed(&mut self, face: &QueryFace) -> Result<Option<Embedding>, EmbedderError> {
        let input = Self::preprocess(face);
        let session = self.session()?;

        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let raw: Vec<f32> = raw_data.to_vec();
        if raw.is_empty() {
            return Ok(None);
        }

        // Dimension is checked by the caller against the reference set.
        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            raw.iter().map(|x| x / norm).collect()
        } else {
            raw
        };

        Ok(Some(Embedding {
            values,
            model_version: Some(FACENET_MODEL_VERSION.to_string()),
        }))
    }
}

fn load_facenet(model_path: &Path) -> Result<Session, EmbedderError> {
    if !model_path.exists() {
        return Err(EmbedderError::ModelNotFound(model_path.display().to_string()));
    }

    let session = Session::builder()?
        .with_intra_threads(2)?
        .commit_from_file(model_path)?;

    tracing::info!(
        path = %model_path.display(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "loaded FaceNet model"
    );

    Ok(session)
}
