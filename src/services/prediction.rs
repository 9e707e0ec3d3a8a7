use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::models::item::{Features, Item};
use crate::services::errors::ProcessingError;

/// Opaque two-class classifier: `features -> (p_nonviolation, p_violation)`.
pub trait Classifier: Send + Sync + fmt::Debug {
    fn predict_proba(&self, features: &Features) -> Result<(f64, f64), PredictionError>;
}

/// Immutable, shareable model handle. Reloading produces a new handle.
pub type ModelHandle = Arc<dyn Classifier>;

/// Logistic regression over the four moderation features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticModel {
    pub coefficients: [f64; 4],
    pub intercept: f64,
}

impl LogisticModel {
    /// Built-in coefficients. Flags unverified sellers with fewer than two
    /// images; description length and category carry no weight.
    pub fn reference() -> Self {
        Self {
            coefficients: [-10.0, -10.0, 0.0, 0.0],
            intercept: 1.5,
        }
    }
}

impl Classifier for LogisticModel {
    fn predict_proba(&self, features: &Features) -> Result<(f64, f64), PredictionError> {
        let z = self
            .coefficients
            .iter()
            .zip(features.as_slice())
            .fold(self.intercept, |acc, (w, x)| acc + w * x);
        let p_violation = 1.0 / (1.0 + (-z).exp());
        Ok((1.0 - p_violation, p_violation))
    }
}

/// Outcome of classifying one item.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Prediction {
    pub is_violation: bool,
    /// Probability of the violation class.
    pub probability: f64,
}

impl Prediction {
    pub fn from_probabilities(p_ok: f64, p_violation: f64) -> Result<Self, PredictionError> {
        for p in [p_ok, p_violation] {
            if !(0.0..=1.0).contains(&p) {
                return Err(PredictionError::OutOfRange(p));
            }
        }
        Ok(Self {
            is_violation: p_violation > p_ok,
            probability: p_violation,
        })
    }
}

/// Turns items into decisions using whatever model handle it was built with.
#[derive(Debug, Clone, Default)]
pub struct PredictionExecutor {
    model: Option<ModelHandle>,
}

impl PredictionExecutor {
    pub fn new(model: Option<ModelHandle>) -> Self {
        Self { model }
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    pub fn predict(&self, item: &Item) -> Result<Prediction, ProcessingError> {
        let model = self.model.as_ref().ok_or(ProcessingError::ModelUnavailable)?;
        let features = Features::from_item(item);
        let (p_ok, p_violation) = model.predict_proba(&features)?;
        Ok(Prediction::from_probabilities(p_ok, p_violation)?)
    }
}

/// Whether a model handle is currently in use, shared with the health check.
#[derive(Debug, Clone, Default)]
pub struct ModelStatus(Arc<AtomicBool>);

impl ModelStatus {
    pub fn new(loaded: bool) -> Self {
        Self(Arc::new(AtomicBool::new(loaded)))
    }

    pub fn set_loaded(&self, loaded: bool) {
        self.0.store(loaded, Ordering::Relaxed);
    }

    pub fn is_loaded(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Source of model handles.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self) -> Result<ModelHandle, PredictionError>;
}

/// Fetches logistic coefficients from the model backend (`GET {base}/model`).
pub struct HttpModelLoader {
    http: Client,
    base_url: String,
}

impl HttpModelLoader {
    /// `timeout` bounds the whole request, connect included.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, PredictionError> {
        let http = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    pub async fn fetch(&self) -> Result<LogisticModel, PredictionError> {
        let url = format!("{}/model", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(PredictionError::Http)?
            .error_for_status()
            .map_err(PredictionError::Http)?;

        response.json().await.map_err(PredictionError::Http)
    }
}

#[async_trait]
impl ModelLoader for HttpModelLoader {
    async fn load(&self) -> Result<ModelHandle, PredictionError> {
        let model = self.fetch().await?;
        Ok(Arc::new(model))
    }
}

/// Tries the backend first, then the reference coefficients when allowed.
pub struct FallbackModelLoader {
    backend: Option<HttpModelLoader>,
    use_reference: bool,
}

impl FallbackModelLoader {
    pub fn new(backend: Option<HttpModelLoader>, use_reference: bool) -> Self {
        Self {
            backend,
            use_reference,
        }
    }
}

#[async_trait]
impl ModelLoader for FallbackModelLoader {
    async fn load(&self) -> Result<ModelHandle, PredictionError> {
        let backend_error = match &self.backend {
            Some(backend) => match backend.load().await {
                Ok(handle) => {
                    tracing::info!(url = %backend.base_url, "Loaded model from backend");
                    return Ok(handle);
                }
                Err(e) => e,
            },
            None => PredictionError::NotConfigured,
        };

        if self.use_reference {
            tracing::warn!(error = %backend_error, "Model backend unavailable, using reference model");
            return Ok(Arc::new(LogisticModel::reference()));
        }
        Err(backend_error)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PredictionError {
    #[error("Model backend request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("No model backend configured")]
    NotConfigured,

    #[error("Model returned probability {0} outside [0, 1]")]
    OutOfRange(f64),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(images_qty: i32, verified: bool) -> Item {
        Item {
            id: 1,
            name: "Premium Headphones".to_string(),
            description: "High-quality wireless headphones with noise cancellation".to_string(),
            category: 5,
            images_qty,
            is_verified_seller: verified,
        }
    }

    fn reference_executor() -> PredictionExecutor {
        PredictionExecutor::new(Some(Arc::new(LogisticModel::reference())))
    }

    #[test]
    fn test_missing_model_is_unavailable() {
        let executor = PredictionExecutor::default();
        assert!(!executor.is_loaded());
        assert!(matches!(
            executor.predict(&item(5, true)),
            Err(ProcessingError::ModelUnavailable)
        ));
    }

    #[test]
    fn test_verified_seller_with_images_is_not_a_violation() {
        let prediction = reference_executor().predict(&item(7, true)).unwrap();
        assert!(!prediction.is_violation);
        assert!(prediction.probability < 0.5);
    }

    #[test]
    fn test_unverified_without_images_is_a_violation() {
        let prediction = reference_executor().predict(&item(0, false)).unwrap();
        assert!(prediction.is_violation);
        assert!(prediction.probability > 0.5);
    }

    #[test]
    fn test_unverified_with_one_image_is_a_violation() {
        assert!(reference_executor().predict(&item(1, false)).unwrap().is_violation);
    }

    #[test]
    fn test_probabilities_sum_to_one() {
        let model = LogisticModel::reference();
        let (p0, p1) = model
            .predict_proba(&Features([0.0, 0.3, 0.5, 0.1]))
            .unwrap();
        assert!((p0 + p1 - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_out_of_range_probability_is_rejected() {
        assert!(matches!(
            Prediction::from_probabilities(-0.1, 1.1),
            Err(PredictionError::OutOfRange(_))
        ));
        assert!(Prediction::from_probabilities(f64::NAN, 0.5).is_err());
    }

    #[test]
    fn test_tie_is_not_a_violation() {
        let prediction = Prediction::from_probabilities(0.5, 0.5).unwrap();
        assert!(!prediction.is_violation);
    }

    #[tokio::test]
    async fn test_fallback_loader_uses_reference_without_backend() {
        let loader = FallbackModelLoader::new(None, true);
        let handle = loader.load().await.unwrap();
        let (_, p_violation) = handle.predict_proba(&Features([0.0, 0.0, 0.0, 0.0])).unwrap();
        assert!(p_violation > 0.5);
    }

    #[test]
    fn test_model_status_is_shared_between_clones() {
        let status = ModelStatus::new(false);
        let seen_by_health = status.clone();
        status.set_loaded(true);
        assert!(seen_by_health.is_loaded());
    }

    #[tokio::test]
    async fn test_fallback_loader_without_reference_fails() {
        let loader = FallbackModelLoader::new(None, false);
        assert!(matches!(loader.load().await, Err(PredictionError::NotConfigured)));
    }
}
