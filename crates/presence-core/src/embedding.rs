//! Face embedding generation.
//!
//! The crop is resized to 112×112 with bilinear filtering, normalised to
//! `(p - 127.5) / 127.5` and fed to the model as a `[1, 112, 112, 3]`
//! NHWC tensor. The model must answer with a `[1, 128]` float tensor.

use crate::acquire::{FetchError, ImageSource};
use crate::model::OnnxEmbeddingModel;
use crate::types::{EmbeddingVector, EMBEDDING_DIM};
use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::Array4;
use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

pub const EMBEDDING_INPUT_SIZE: u32 = 112;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_SCALE: f32 = 127.5;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("embedding engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("model output shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("reference image acquisition failed: {0}")]
    AcquisitionFailed(#[from] FetchError),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("image error: {0}")]
    Image(String),
}

/// Raw tensor returned by a model run.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOutput {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// A loaded embedding network. Must be safe to call from several threads.
pub trait EmbeddingModel: Send + Sync {
    fn infer(&self, input: &Array4<f32>) -> Result<ModelOutput, EmbeddingError>;
}

type Loader = Box<dyn Fn() -> Result<Arc<dyn EmbeddingModel>, EmbeddingError> + Send + Sync>;

/// Process-wide lazily loaded embedding model.
///
/// The first caller loads the model; concurrent callers wait for that load
/// instead of starting their own. A failed load leaves the engine empty so
/// the next call tries again.
pub struct EmbeddingEngine {
    model: OnceCell<Arc<dyn EmbeddingModel>>,
    loader: Loader,
    loads: AtomicUsize,
}

impl EmbeddingEngine {
    pub fn with_loader<F>(loader: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn EmbeddingModel>, EmbeddingError> + Send + Sync + 'static,
    {
        Self {
            model: OnceCell::new(),
            loader: Box::new(loader),
            loads: AtomicUsize::new(0),
        }
    }

    /// Engine backed by an ONNX file, loaded on first use.
    pub fn onnx(path: PathBuf, expected_sha256: Option<String>) -> Self {
        Self::with_loader(move || {
            OnnxEmbeddingModel::load(&path, expected_sha256.as_deref())
                .map(|m| Arc::new(m) as Arc<dyn EmbeddingModel>)
                .map_err(|e| EmbeddingError::EngineUnavailable(e.to_string()))
        })
    }

    /// Engine around an already loaded model.
    pub fn preloaded(model: Arc<dyn EmbeddingModel>) -> Self {
        let engine = Self::with_loader(|| {
            Err(EmbeddingError::EngineUnavailable("no loader configured".into()))
        });
        let _ = engine.model.set(model);
        engine
    }

    pub fn model(&self) -> Result<Arc<dyn EmbeddingModel>, EmbeddingError> {
        self.model
            .get_or_try_init(|| {
                let attempt = self.loads.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::debug!(attempt, "loading embedding model");
                (self.loader)().map_err(|e| {
                    tracing::warn!(attempt, error = %e, "embedding model load failed");
                    e
                })
            })
            .cloned()
    }

    pub fn is_loaded(&self) -> bool {
        self.model.get().is_some()
    }

    /// Number of load attempts made so far.
    pub fn load_attempts(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

/// Resize and normalise an image into the model's NHWC input tensor.
pub fn preprocess(image: &DynamicImage) -> Array4<f32> {
    let size = EMBEDDING_INPUT_SIZE;
    let resized = image::imageops::resize(&image.to_rgb8(), size, size, FilterType::Triangle);

    let mut tensor = Array4::<f32>::zeros((1, size as usize, size as usize, 3));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, y as usize, x as usize, c]] = (pixel[c] as f32 - PIXEL_MEAN) / PIXEL_SCALE;
        }
    }
    tensor
}

/// Turns face images into [`EmbeddingVector`]s using a shared engine.
#[derive(Clone)]
pub struct EmbeddingGenerator {
    engine: Arc<EmbeddingEngine>,
}

impl EmbeddingGenerator {
    pub fn new(engine: Arc<EmbeddingEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<EmbeddingEngine> {
        &self.engine
    }

    /// Blocking: runs inference on the calling thread.
    pub fn generate(&self, image: &DynamicImage) -> Result<EmbeddingVector, EmbeddingError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(EmbeddingError::InvalidInput("image has zero size".into()));
        }

        let input = preprocess(image);
        let model = self.engine.model()?;
        let output = model.infer(&input)?;

        let expected = vec![1, EMBEDDING_DIM];
        if output.shape != expected {
            return Err(EmbeddingError::ShapeMismatch {
                expected,
                actual: output.shape,
            });
        }
        // Shape matches but the buffer length does not.
        if output.data.len() != EMBEDDING_DIM {
            return Err(EmbeddingError::ShapeMismatch {
                expected: vec![EMBEDDING_DIM],
                actual: vec![output.data.len()],
            });
        }

        let embedding = EmbeddingVector::try_from(output.data)
            .map_err(|e| EmbeddingError::Inference(e.to_string()))?;
        tracing::debug!(
            width = image.width(),
            height = image.height(),
            "generated embedding"
        );
        Ok(embedding)
    }

    /// Same as [`generate`](Self::generate), returning the 512-byte encoding.
    pub fn generate_bytes(&self, image: &DynamicImage) -> Result<Vec<u8>, EmbeddingError> {
        Ok(self.generate(image)?.encode())
    }

    /// Run [`generate`](Self::generate) on the blocking pool.
    pub async fn generate_blocking(
        &self,
        image: DynamicImage,
    ) -> Result<EmbeddingVector, EmbeddingError> {
        let generator = self.clone();
        tokio::task::spawn_blocking(move || generator.generate(&image))
            .await
            .map_err(|e| EmbeddingError::Inference(format!("embedding task failed: {e}")))?
    }

    /// Fetch a reference image and embed it. A blank URL is rejected
    /// before any request is made.
    pub async fn generate_from_url<S: ImageSource>(
        &self,
        source: &S,
        url: &str,
    ) -> Result<EmbeddingVector, EmbeddingError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(EmbeddingError::InvalidInput("image URL is empty".into()));
        }
        let image = source.fetch(url).await?;
        self.generate_blocking(image).await
    }

    /// Embed an image file from disk.
    pub fn generate_from_path(&self, path: &Path) -> Result<EmbeddingVector, EmbeddingError> {
        let image = image::open(path)
            .map_err(|e| EmbeddingError::Image(format!("{}: {e}", path.display())))?;
        self.generate(&image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::future::Future;
    use std::sync::Mutex;

    /// Returns a constant embedding, or a wrong shape for the first `bad` calls.
    struct FakeModel {
        bad: AtomicUsize,
        calls: AtomicUsize,
    }

    impl FakeModel {
        fn new(bad: usize) -> Self {
            Self {
                bad: AtomicUsize::new(bad),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl EmbeddingModel for FakeModel {
        fn infer(&self, input: &Array4<f32>) -> Result<ModelOutput, EmbeddingError> {
            assert_eq!(input.shape(), &[1, 112, 112, 3]);
            self.calls.fetch_add(1, Ordering::SeqCst);
            let bad = self
                .bad
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if bad {
                return Ok(ModelOutput {
                    shape: vec![1, 512],
                    data: vec![0.0; 512],
                });
            }
            Ok(ModelOutput {
                shape: vec![1, EMBEDDING_DIM],
                data: (0..EMBEDDING_DIM).map(|i| i as f32 / 100.0).collect(),
            })
        }
    }

    struct CountingSource {
        calls: AtomicUsize,
        result: Mutex<Option<Result<DynamicImage, FetchError>>>,
    }

    impl CountingSource {
        fn new(result: Result<DynamicImage, FetchError>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                result: Mutex::new(Some(result)),
            }
        }
    }

    impl ImageSource for CountingSource {
        fn fetch(&self, _url: &str) -> impl Future<Output = Result<DynamicImage, FetchError>> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result = self
                .result
                .lock()
                .unwrap()
                .take()
                .unwrap_or(Err(FetchError::Transport("already fetched".into())));
            async move { result }
        }
    }

    fn face_image() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(64, 80, |x, y| {
            Rgb([(x * 3) as u8, (y * 3) as u8, 128])
        }))
    }

    fn generator_with(model: Arc<FakeModel>) -> EmbeddingGenerator {
        let engine = EmbeddingEngine::with_loader(move || Ok(model.clone() as Arc<dyn EmbeddingModel>));
        EmbeddingGenerator::new(Arc::new(engine))
    }

    #[test]
    fn test_preprocess_shape_and_range() {
        let tensor = preprocess(&face_image());
        assert_eq!(tensor.shape(), &[1, 112, 112, 3]);
        assert!(tensor.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn test_preprocess_normalisation_and_channel_order() {
        let red = DynamicImage::ImageRgb8(RgbImage::from_pixel(20, 20, Rgb([255, 0, 0])));
        let tensor = preprocess(&red);
        assert_eq!(tensor[[0, 50, 50, 0]], 1.0);
        assert_eq!(tensor[[0, 50, 50, 1]], -1.0);
        assert_eq!(tensor[[0, 50, 50, 2]], -1.0);
    }

    #[test]
    fn test_generate_produces_128_values() {
        let generator = generator_with(Arc::new(FakeModel::new(0)));
        let embedding = generator.generate(&face_image()).unwrap();
        assert_eq!(embedding.values().len(), EMBEDDING_DIM);
        assert_eq!(generator.generate_bytes(&face_image()).unwrap().len(), 512);
    }

    #[test]
    fn test_model_loaded_once() {
        let generator = generator_with(Arc::new(FakeModel::new(0)));
        for _ in 0..3 {
            generator.generate(&face_image()).unwrap();
        }
        assert_eq!(generator.engine().load_attempts(), 1);
    }

    #[test]
    fn test_concurrent_first_use_loads_once() {
        let generator = generator_with(Arc::new(FakeModel::new(0)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let g = generator.clone();
                std::thread::spawn(move || g.generate(&face_image()).is_ok())
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }
        assert_eq!(generator.engine().load_attempts(), 1);
    }

    #[test]
    fn test_failed_load_is_retried() {
        let failures = Arc::new(AtomicUsize::new(1));
        let model = Arc::new(FakeModel::new(0));
        let engine = EmbeddingEngine::with_loader(move || {
            if failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(EmbeddingError::EngineUnavailable("model file missing".into()));
            }
            Ok(model.clone() as Arc<dyn EmbeddingModel>)
        });
        let generator = EmbeddingGenerator::new(Arc::new(engine));

        assert!(matches!(
            generator.generate(&face_image()),
            Err(EmbeddingError::EngineUnavailable(_))
        ));
        assert!(!generator.engine().is_loaded());
        assert!(generator.generate(&face_image()).is_ok());
        assert_eq!(generator.engine().load_attempts(), 2);
    }

    #[test]
    fn test_shape_mismatch_keeps_engine_usable() {
        let model = Arc::new(FakeModel::new(1));
        let generator = generator_with(model.clone());

        assert_eq!(
            generator.generate(&face_image()),
            Err(EmbeddingError::ShapeMismatch {
                expected: vec![1, 128],
                actual: vec![1, 512],
            })
        );
        assert!(generator.generate(&face_image()).is_ok());
        assert_eq!(generator.engine().load_attempts(), 1);
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_short_buffer_reports_element_count() {
        struct ShortBuffer;

        impl EmbeddingModel for ShortBuffer {
            fn infer(&self, _input: &Array4<f32>) -> Result<ModelOutput, EmbeddingError> {
                Ok(ModelOutput {
                    shape: vec![1, EMBEDDING_DIM],
                    data: vec![0.0; 64],
                })
            }
        }

        let engine = EmbeddingEngine::preloaded(Arc::new(ShortBuffer));
        let generator = EmbeddingGenerator::new(Arc::new(engine));
        assert_eq!(
            generator.generate(&face_image()),
            Err(EmbeddingError::ShapeMismatch {
                expected: vec![128],
                actual: vec![64],
            })
        );
    }

    #[test]
    fn test_zero_sized_image_rejected() {
        let model = Arc::new(FakeModel::new(0));
        let generator = generator_with(model.clone());
        let empty = DynamicImage::ImageRgb8(RgbImage::new(0, 0));
        assert!(matches!(
            generator.generate(&empty),
            Err(EmbeddingError::InvalidInput(_))
        ));
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_preloaded_engine() {
        let engine = EmbeddingEngine::preloaded(Arc::new(FakeModel::new(0)));
        assert!(engine.is_loaded());
        assert!(engine.model().is_ok());
        assert_eq!(engine.load_attempts(), 0);
    }

    #[test]
    fn test_generate_from_missing_path() {
        let generator = generator_with(Arc::new(FakeModel::new(0)));
        assert!(matches!(
            generator.generate_from_path(Path::new("/nonexistent/presence/face.png")),
            Err(EmbeddingError::Image(_))
        ));
    }

    #[tokio::test]
    async fn test_blank_url_rejected_without_fetch() {
        let generator = generator_with(Arc::new(FakeModel::new(0)));
        let source = CountingSource::new(Ok(face_image()));
        for url in ["", "   "] {
            assert!(matches!(
                generator.generate_from_url(&source, url).await,
                Err(EmbeddingError::InvalidInput(_))
            ));
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_generate_from_url() {
        let generator = generator_with(Arc::new(FakeModel::new(0)));
        let source = CountingSource::new(Ok(face_image()));
        let embedding = generator
            .generate_from_url(&source, "https://example.test/ref.jpg")
            .await
            .unwrap();
        assert_eq!(embedding.values().len(), EMBEDDING_DIM);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_acquisition_error() {
        let generator = generator_with(Arc::new(FakeModel::new(0)));
        let source = CountingSource::new(Err(FetchError::HttpError(404)));
        assert_eq!(
            generator
                .generate_from_url(&source, "https://example.test/ref.jpg")
                .await,
            Err(EmbeddingError::AcquisitionFailed(FetchError::HttpError(404)))
        );
    }
}
