//! Process-wide model handles and extractors, built once and shared by the
//! HTTP layer and both schedulers.

use std::sync::Arc;

use tracing::{info, warn};

use crate::artifact::ArtifactStore;
use crate::churn_features::ChurnFeatureExtractor;
use crate::classifier::{ChurnPredictionModel, PurchasePredictionModel};
use crate::model::{ModelError, ModelInfo, ModelKind, ModelWrapper};
use crate::purchase_features::PurchaseFeatureExtractor;
use crate::segmentation::SegmentationModel;
use crate::store::EventStore;
use crate::user_features::UserFeatureExtractor;

#[derive(Clone)]
pub struct ModelSet {
    pub segmentation: Arc<SegmentationModel>,
    pub purchase: Arc<PurchasePredictionModel>,
    pub churn: Arc<ChurnPredictionModel>,
}

impl ModelSet {
    pub fn new(artifacts: &ArtifactStore) -> Self {
        Self {
            segmentation: Arc::new(SegmentationModel::new(artifacts.clone())),
            purchase: Arc::new(PurchasePredictionModel::new(artifacts.clone())),
            churn: Arc::new(ChurnPredictionModel::new(artifacts.clone())),
        }
    }

    /// Loads every persisted model. A missing artifact only means that model
    /// needs training; other failures are returned.
    pub fn load_persisted(&self) -> Result<Vec<ModelKind>, ModelError> {
        let mut loaded = Vec::new();
        for kind in ModelKind::ALL {
            match self.load(kind) {
                Ok(()) => {
                    info!(
                        component = "services",
                        event = "model.loaded",
                        model = kind.as_str()
                    );
                    loaded.push(kind);
                }
                Err(err) if err.needs_training() => warn!(
                    component = "services",
                    event = "model.needs_training",
                    model = kind.as_str(),
                    reason = %err
                ),
                Err(err) => return Err(err),
            }
        }
        Ok(loaded)
    }

    pub fn load(&self, kind: ModelKind) -> Result<(), ModelError> {
        match kind {
            ModelKind::Segmentation => self.segmentation.load_model(),
            ModelKind::PurchasePrediction => self.purchase.load_model(),
            ModelKind::ChurnPrediction => self.churn.load_model(),
        }
    }

    pub fn info(&self, kind: ModelKind) -> Option<ModelInfo> {
        match kind {
            ModelKind::Segmentation => self.segmentation.info(),
            ModelKind::PurchasePrediction => self.purchase.info(),
            ModelKind::ChurnPrediction => self.churn.info(),
        }
    }

    pub fn is_loaded(&self, kind: ModelKind) -> bool {
        self.info(kind).is_some()
    }
}

#[derive(Clone)]
pub struct ExtractorSet {
    pub user: Arc<UserFeatureExtractor>,
    pub purchase: Arc<PurchaseFeatureExtractor>,
    pub churn: Arc<ChurnFeatureExtractor>,
}

impl ExtractorSet {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            user: Arc::new(UserFeatureExtractor::new(Arc::clone(&store))),
            purchase: Arc::new(PurchaseFeatureExtractor::new(Arc::clone(&store))),
            churn: Arc::new(ChurnFeatureExtractor::new(store)),
        }
    }
}
