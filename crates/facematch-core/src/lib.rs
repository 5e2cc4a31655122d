//! Face identity matching against a labeled reference set.
//!
//! Uses SCRFD for face detection and FaceNet-128 for embeddings, both
//! running via ONNX Runtime, and cosine nearest-neighbor search for matching.

pub mod alignment;
pub mod detector;
pub mod matcher;
pub mod normalizer;
pub mod outcome;
pub mod pipeline;
pub mod recognizer;
pub mod store;
pub mod types;

pub use detector::{DetectionMode, FaceDetector, ScrfdDetector};
pub use matcher::{CosineMatcher, Matcher, SIMILARITY_THRESHOLD};
pub use normalizer::{FaceNormalizer, PreviewWriter};
pub use outcome::{ErrorCode, Outcome};
pub use pipeline::{Pipeline, PipelineSettings};
pub use recognizer::{Embedder, FacenetEmbedder};
pub use store::ReferenceDataset;
pub use types::{Embedding, QueryFace, ReferenceEntry, EMBEDDING_DIM};
