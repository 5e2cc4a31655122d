use facematch_core::detector::DEFAULT_CONFIDENCE_THRESHOLD;
use facematch_core::pipeline::DEFAULT_DATASET_ROOT_MARKER;
use std::path::PathBuf;

/// Runtime configuration, loaded from environment variables.
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// File name of the SCRFD detection model inside `model_dir`.
    pub detector_model: String,
    /// File name of the FaceNet-128 embedding model inside `model_dir`.
    pub embedder_model: String,
    /// Minimum detector score for a face to count.
    pub detection_confidence: f32,
    /// Directory that receives the aligned face preview.
    pub preview_dir: PathBuf,
    /// Prefix prepended to the preview file name in the result.
    pub preview_prefix: String,
    /// Stored image paths are reported relative to the last occurrence of this marker.
    pub dataset_root_marker: String,
}

impl Config {
    /// Load configuration from `FACEMATCH_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("FACEMATCH_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_model_dir());

        Self {
            model_dir,
            detector_model: env_string("FACEMATCH_DETECTOR_MODEL", "det_10g.onnx"),
            embedder_model: env_string("FACEMATCH_EMBEDDER_MODEL", "facenet128.onnx"),
            detection_confidence: env_f32(
                "FACEMATCH_DETECTION_CONFIDENCE",
                DEFAULT_CONFIDENCE_THRESHOLD,
            ),
            preview_dir: std::env::var("FACEMATCH_PREVIEW_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("static")),
            preview_prefix: env_string("FACEMATCH_PREVIEW_PREFIX", "static"),
            dataset_root_marker: env_string("FACEMATCH_DATASET_ROOT", DEFAULT_DATASET_ROOT_MARKER),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.detector_model)
    }

    /// Path to the FaceNet-128 embedding model.
    pub fn embedder_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.embedder_model)
    }
}

/// `$XDG_DATA_HOME/facematch/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facematch")
        .join("models")
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_f32_parses_and_falls_back() {
        std::env::set_var("FACEMATCH_TEST_F32_VALID", "0.75");
        std::env::set_var("FACEMATCH_TEST_F32_GARBAGE", "high");
        assert_eq!(env_f32("FACEMATCH_TEST_F32_VALID", 0.5), 0.75);
        assert_eq!(env_f32("FACEMATCH_TEST_F32_GARBAGE", 0.5), 0.5);
        assert_eq!(env_f32("FACEMATCH_TEST_F32_UNSET", 0.5), 0.5);
    }

    #[test]
    fn test_env_string_falls_back() {
        std::env::set_var("FACEMATCH_TEST_STRING_SET", "faces/");
        assert_eq!(env_string("FACEMATCH_TEST_STRING_SET", "x"), "faces/");
        assert_eq!(env_string("FACEMATCH_TEST_STRING_UNSET", "x"), "x");
    }

    #[test]
    fn test_model_paths_join_model_dir() {
        let config = Config {
            model_dir: PathBuf::from("/opt/models"),
            detector_model: "det_10g.onnx".into(),
            embedder_model: "facenet128.onnx".into(),
            detection_confidence: 0.5,
            preview_dir: PathBuf::from("static"),
            preview_prefix: "static".into(),
            dataset_root_marker: "Bollywood_data/".into(),
        };
        assert_eq!(config.detector_model_path(), PathBuf::from("/opt/models/det_10g.onnx"));
        assert_eq!(config.embedder_model_path(), PathBuf::from("/opt/models/facenet128.onnx"));
    }

    #[test]
    fn test_default_model_dir_ends_in_facematch_models() {
        assert!(default_model_dir().ends_with("facematch/models"));
    }
}
