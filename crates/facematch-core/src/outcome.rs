//! Terminal results of one matching run and their JSON wire shapes.

use serde::Serialize;

/// Process exit code for a confirmed match.
pub const EXIT_SUCCESS: u8 = 0;
/// Process exit code for every handled error, `LOW_CONFIDENCE` included.
pub const EXIT_HANDLED_ERROR: u8 = 2;
/// Process exit code for failures outside the pipeline.
pub const EXIT_UNHANDLED_ERROR: u8 = 3;

pub const LOW_CONFIDENCE_MESSAGE: &str = "No confident match found";
pub const PREVIEW_WARNING: &str = "User face image was not saved correctly";
pub const USAGE: &str = "Usage: match_face <image_path> <embeddings_path>";

/// Closed set of error codes reported on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    FileNotFound,
    EmbeddingsNotFound,
    InvalidEmbeddings,
    NoFaceDetected,
    EmbeddingFailed,
    LowConfidence,
    ProcessingError,
    InvalidArguments,
    UnhandledError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::FileNotFound => "FILE_NOT_FOUND",
            ErrorCode::EmbeddingsNotFound => "EMBEDDINGS_NOT_FOUND",
            ErrorCode::InvalidEmbeddings => "INVALID_EMBEDDINGS",
            ErrorCode::NoFaceDetected => "NO_FACE_DETECTED",
            ErrorCode::EmbeddingFailed => "EMBEDDING_FAILED",
            ErrorCode::LowConfidence => "LOW_CONFIDENCE",
            ErrorCode::ProcessingError => "PROCESSING_ERROR",
            ErrorCode::InvalidArguments => "INVALID_ARGUMENTS",
            ErrorCode::UnhandledError => "UNHANDLED_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A confirmed match.
#[derive(Debug, Clone, Serialize)]
pub struct MatchReport {
    pub actor: String,
    /// Reference image path with the dataset-root marker stripped.
    pub image: String,
    pub similarity: f32,
    /// Relative path of the saved preview of the query face.
    #[serde(rename = "userFace")]
    pub user_face: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Best candidate scored below the confidence threshold.
#[derive(Debug, Clone, Serialize)]
pub struct LowConfidenceReport {
    pub error: &'static str,
    pub code: ErrorCode,
    pub best_guess: String,
    pub similarity: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub error: String,
    pub code: ErrorCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

/// Exactly one of these is emitted per invocation.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Outcome {
    Matched(MatchReport),
    LowConfidence(LowConfidenceReport),
    Failed(ErrorReport),
}

impl Outcome {
    pub fn low_confidence(best_guess: String, similarity: f32) -> Self {
        Outcome::LowConfidence(LowConfidenceReport {
            error: LOW_CONFIDENCE_MESSAGE,
            code: ErrorCode::LowConfidence,
            best_guess,
            similarity,
        })
    }

    pub fn error(code: ErrorCode, message: impl Into<String>, trace: Option<String>) -> Self {
        Outcome::Failed(ErrorReport {
            error: message.into(),
            code,
            trace,
        })
    }

    pub fn invalid_arguments() -> Self {
        Self::error(ErrorCode::InvalidArguments, USAGE, None)
    }

    pub fn unhandled(message: impl std::fmt::Display, trace: Option<String>) -> Self {
        Self::error(
            ErrorCode::UnhandledError,
            format!("Unexpected error: {message}"),
            trace,
        )
    }

    /// Wire code, `None` for a confirmed match.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Outcome::Matched(_) => None,
            Outcome::LowConfidence(r) => Some(r.code),
            Outcome::Failed(r) => Some(r.code),
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self.code() {
            None => EXIT_SUCCESS,
            Some(ErrorCode::UnhandledError) => EXIT_UNHANDLED_ERROR,
            Some(_) => EXIT_HANDLED_ERROR,
        }
    }

    /// Compact single-line JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
