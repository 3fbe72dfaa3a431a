use std::path::Path;

use serde::Serialize;

use crate::error::EngineResult;
use crate::model::{Activation, ModelList};
use crate::model_store::{self, ModelFormat};

#[derive(Debug, Clone, Serialize)]
pub struct LayerInfo {
    pub input_channels: usize,
    pub output_channels: usize,
    pub kernel_size: usize,
    pub activation: Activation,
    /// Weights plus biases.
    pub param_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelInspection {
    /// On-disk layout: "v1", "legacy" or "json".
    pub format: String,
    pub layers: Vec<LayerInfo>,
    pub param_count: usize,
    pub kernel_size: usize,
    /// Border each tile needs around its core.
    pub halo: usize,
}

impl ModelInspection {
    pub fn from_models(models: &ModelList, format: ModelFormat) -> Self {
        let layers = models
            .layers()
            .iter()
            .map(|layer| LayerInfo {
                input_channels: layer.input_channels(),
                output_channels: layer.output_channels(),
                kernel_size: layer.kernel_size(),
                activation: layer.activation(),
                param_count: layer.param_count(),
            })
            .collect();

        Self {
            format: format.to_string(),
            layers,
            param_count: models.param_count(),
            kernel_size: models.kernel_size(),
            halo: models.radius(),
        }
    }
}

/// Parse a weight file and summarize its cascade without running it.
pub fn inspect(path: &Path) -> EngineResult<ModelInspection> {
    let (models, format) = model_store::load_with_format(path)?;
    Ok(ModelInspection::from_models(&models, format))
}
