use crate::config::Config;
use crate::session::{spawn_session, SessionConfig, SessionHandle};
use presence_core::acquire::{FetchError, ImageAcquirer, ImageSource, ReqwestTransport};
use presence_core::detector::{FaceDetectionService, FaceDetector};
use presence_core::embedding::{EmbeddingEngine, EmbeddingError, EmbeddingGenerator};
use presence_core::types::EmbeddingVector;
use presence_frame::FramePool;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to build HTTP client: {0}")]
    Http(#[from] FetchError),
}

/// Composition root: owns the shared embedding engine and the reference
/// image acquirer, and starts verification sessions.
///
/// The embedding model is not loaded until the first embedding is requested.
pub struct Engine<A = ImageAcquirer<ReqwestTransport>> {
    config: Config,
    generator: EmbeddingGenerator,
    acquirer: A,
}

impl Engine {
    /// Build the production engine: ONNX model from `config`, `reqwest` transport.
    pub fn from_config(config: Config) -> Result<Self, EngineError> {
        let embedding = EmbeddingEngine::onnx(config.model_path(), config.model_sha256.clone());
        let acquirer = ImageAcquirer::with_reqwest()?;
        tracing::info!(
            model = %config.model_path().display(),
            checksum = config.model_sha256.is_some(),
            "engine configured"
        );
        Ok(Self::new(config, Arc::new(embedding), acquirer))
    }
}

impl<A: ImageSource> Engine<A> {
    pub fn new(config: Config, embedding: Arc<EmbeddingEngine>, acquirer: A) -> Self {
        Self {
            config,
            generator: EmbeddingGenerator::new(embedding),
            acquirer,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn generator(&self) -> &EmbeddingGenerator {
        &self.generator
    }

    pub fn acquirer(&self) -> &A {
        &self.acquirer
    }

    /// A frame pool sized for one camera feed.
    pub fn frame_pool(&self) -> FramePool {
        FramePool::new(self.config.frame_pool_size.max(1))
    }

    /// Start a verification session. Must be called inside a tokio runtime.
    pub fn start_session<S>(&self, detector: Arc<FaceDetector<S>>) -> SessionHandle
    where
        S: FaceDetectionService + 'static,
    {
        spawn_session(
            detector,
            self.generator.clone(),
            SessionConfig {
                liveness: self.config.liveness(),
                tick_interval: self.config.tick_interval(),
            },
        )
    }

    /// Fetch the reference photo at `url` and embed it.
    pub async fn embed_reference(&self, url: &str) -> Result<EmbeddingVector, EmbeddingError> {
        self.generator.generate_from_url(&self.acquirer, url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionOutcome;
    use image::{DynamicImage, Rgb, RgbImage};
    use ndarray::Array4;
    use presence_core::detector::ReplayDetector;
    use presence_core::embedding::{EmbeddingModel, ModelOutput};
    use presence_core::types::EMBEDDING_DIM;
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ConstantModel;

    impl EmbeddingModel for ConstantModel {
        fn infer(&self, _input: &Array4<f32>) -> Result<ModelOutput, EmbeddingError> {
            Ok(ModelOutput {
                shape: vec![1, EMBEDDING_DIM],
                data: vec![0.25; EMBEDDING_DIM],
            })
        }
    }

    struct StaticSource {
        calls: AtomicUsize,
    }

    impl ImageSource for StaticSource {
        fn fetch(&self, _url: &str) -> impl Future<Output = Result<DynamicImage, FetchError>> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(50, 60, Rgb([90, 80, 70])))) }
        }
    }

    fn engine(loads: Arc<AtomicUsize>) -> Engine<StaticSource> {
        let embedding = EmbeddingEngine::with_loader(move || {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(ConstantModel) as Arc<dyn EmbeddingModel>)
        });
        let config = Config {
            tick_interval_ms: 10,
            ..Config::default()
        };
        Engine::new(config, Arc::new(embedding), StaticSource { calls: AtomicUsize::new(0) })
    }

    #[tokio::test]
    async fn test_embed_reference() {
        let loads = Arc::new(AtomicUsize::new(0));
        let engine = engine(loads.clone());
        assert_eq!(loads.load(Ordering::SeqCst), 0);

        let first = engine.embed_reference("https://example.test/ref.jpg").await.unwrap();
        let second = engine.embed_reference("https://example.test/ref.jpg").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(engine.acquirer().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_blank_reference_url() {
        let engine = engine(Arc::new(AtomicUsize::new(0)));
        assert!(matches!(
            engine.embed_reference(" ").await,
            Err(EmbeddingError::InvalidInput(_))
        ));
        assert_eq!(engine.acquirer().calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sessions_share_the_engine() {
        let loads = Arc::new(AtomicUsize::new(0));
        let engine = engine(loads.clone());
        let pool = engine.frame_pool();

        let mut replay = ReplayDetector::default();
        let face = presence_core::types::DetectedFace::new(
            presence_core::types::BoundingBox::new(140.0, 220.0, 340.0, 420.0),
        );
        for seq in 0..3 {
            replay.insert(seq, vec![face.clone().with_eyes(0.9, 0.9)]);
        }
        replay.insert(3, vec![face.with_smile(0.95)]);
        let detector = Arc::new(FaceDetector::new(replay));

        for _ in 0..2 {
            let handle = engine.start_session(detector.clone());
            for seq in 0..4 {
                let lease = pool
                    .acquire(480, 640, presence_frame::Rotation::Deg0, seq)
                    .unwrap();
                assert!(handle.offer(lease));
                while handle.is_busy() {
                    tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                }
            }
            let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), handle.outcome())
                .await
                .unwrap();
            assert!(matches!(outcome, SessionOutcome::Success(_)));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(pool.outstanding(), 0);
    }
}
