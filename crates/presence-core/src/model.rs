//! ONNX embedding model asset: integrity check and inference session.

use crate::embedding::{EmbeddingError, EmbeddingModel, ModelOutput};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

/// Default file name of the bundled embedding model.
pub const DEFAULT_MODEL_FILE: &str = "mobile_face_net.onnx";

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("failed to read model file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("model checksum mismatch for {path}\n  expected: {expected}\n  got:      {got}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        got: String,
    },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Compute the SHA-256 hex digest of a file.
pub fn sha256_file_hex(path: &Path) -> Result<String, ModelError> {
    let read_err = |source| ModelError::Read {
        path: path.display().to_string(),
        source,
    };
    let mut file = std::fs::File::open(path).map_err(read_err)?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf).map_err(read_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Embedding network served by ONNX Runtime.
///
/// `Session::run` needs `&mut`, so concurrent callers serialise on a mutex;
/// the loaded weights themselves are never modified.
pub struct OnnxEmbeddingModel {
    session: Mutex<Session>,
}

impl OnnxEmbeddingModel {
    /// Load the model, optionally verifying its SHA-256 digest first.
    pub fn load(model_path: &Path, expected_sha256: Option<&str>) -> Result<Self, ModelError> {
        if !model_path.exists() {
            return Err(ModelError::ModelNotFound(model_path.display().to_string()));
        }

        if let Some(expected) = expected_sha256 {
            let got = sha256_file_hex(model_path)?;
            if !got.eq_ignore_ascii_case(expected) {
                return Err(ModelError::ChecksumMismatch {
                    path: model_path.display().to_string(),
                    expected: expected.to_string(),
                    got,
                });
            }
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded embedding model"
        );

        Ok(Self {
            session: Mutex::new(session),
        })
    }

    fn run(session: &mut Session, input: &Array4<f32>) -> Result<ModelOutput, ort::Error> {
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;
        Ok(ModelOutput {
            shape: shape.iter().map(|&d| d.max(0) as usize).collect(),
            data: data.to_vec(),
        })
    }
}

impl EmbeddingModel for OnnxEmbeddingModel {
    fn infer(&self, input: &Array4<f32>) -> Result<ModelOutput, EmbeddingError> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| EmbeddingError::Inference("model session lock poisoned".into()))?;
        Self::run(&mut session, input).map_err(|e| EmbeddingError::Inference(e.to_string()))
    }
}
