//! Convolution layer descriptions and the cascade that chains them.

use ndarray::{Array4, ArrayView3};
use serde::Serialize;

use crate::error::{EngineError, EngineResult};

/// Slope used by every layer of the legacy and JSON weight layouts.
pub const DEFAULT_LEAKY_SLOPE: f32 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Activation {
    Identity,
    LeakyRelu { slope: f32 },
}

impl Activation {
    #[inline]
    pub fn apply(self, v: f32) -> f32 {
        match self {
            Self::Identity => v,
            Self::LeakyRelu { slope } => {
                if v > 0.0 {
                    v
                } else {
                    slope * v
                }
            }
        }
    }
}

/// One convolution layer: `output_channels x input_channels` square kernels plus biases.
#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    weights: Array4<f32>,
    biases: Vec<f32>,
    activation: Activation,
}

impl Model {
    /// `weights` is laid out `[out][in][ky][kx]`.
    pub fn new(
        input_channels: usize,
        output_channels: usize,
        kernel_size: usize,
        weights: Vec<f32>,
        biases: Vec<f32>,
        activation: Activation,
    ) -> EngineResult<Self> {
        if input_channels == 0 || output_channels == 0 {
            return Err(EngineError::shape(format!(
                "layer needs at least one input and output channel, got {input_channels}->{output_channels}"
            )));
        }
        if kernel_size == 0 || kernel_size % 2 == 0 {
            return Err(EngineError::shape(format!(
                "kernel size must be odd, got {kernel_size}"
            )));
        }
        let expected = output_channels * input_channels * kernel_size * kernel_size;
        if weights.len() != expected {
            return Err(EngineError::shape(format!(
                "layer {input_channels}->{output_channels} k{kernel_size} expects {expected} weights, got {}",
                weights.len()
            )));
        }
        if biases.len() != output_channels {
            return Err(EngineError::shape(format!(
                "layer with {output_channels} outputs expects as many biases, got {}",
                biases.len()
            )));
        }

        let weights = Array4::from_shape_vec(
            (output_channels, input_channels, kernel_size, kernel_size),
            weights,
        )
        .map_err(|e| EngineError::shape(format!("weight reshape failed: {e}")))?;

        Ok(Self {
            weights,
            biases,
            activation,
        })
    }

    pub fn input_channels(&self) -> usize {
        self.weights.dim().1
    }

    pub fn output_channels(&self) -> usize {
        self.weights.dim().0
    }

    pub fn kernel_size(&self) -> usize {
        self.weights.dim().2
    }

    /// Pixels lost per side by one valid convolution.
    pub fn radius(&self) -> usize {
        (self.kernel_size() - 1) / 2
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn biases(&self) -> &[f32] {
        &self.biases
    }

    pub fn weights(&self) -> &Array4<f32> {
        &self.weights
    }

    /// Kernels feeding one output channel, `[in][ky][kx]`.
    pub fn kernels_for(&self, output_channel: usize) -> ArrayView3<'_, f32> {
        self.weights.index_axis(ndarray::Axis(0), output_channel)
    }

    pub fn param_count(&self) -> usize {
        self.weights.len() + self.biases.len()
    }
}

/// Ordered cascade mapping one luminance channel to one output channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelList {
    layers: Vec<Model>,
}

impl ModelList {
    pub fn new(layers: Vec<Model>) -> EngineResult<Self> {
        let Some(first) = layers.first() else {
            return Err(EngineError::shape("model cascade has no layers"));
        };
        if first.input_channels() != 1 {
            return Err(EngineError::shape(format!(
                "first layer must take 1 input channel, got {}",
                first.input_channels()
            )));
        }
        let kernel_size = first.kernel_size();

        for (index, pair) in layers.windows(2).enumerate() {
            let (current, next) = (&pair[0], &pair[1]);
            if current.output_channels() != next.input_channels() {
                return Err(EngineError::shape(format!(
                    "layer {index} produces {} channels but layer {} consumes {}",
                    current.output_channels(),
                    index + 1,
                    next.input_channels()
                )));
            }
        }

        if let Some((index, layer)) = layers
            .iter()
            .enumerate()
            .find(|(_, layer)| layer.kernel_size() != kernel_size)
        {
            return Err(EngineError::shape(format!(
                "layer {index} uses kernel size {} but the cascade uses {kernel_size}",
                layer.kernel_size()
            )));
        }

        let last = &layers[layers.len() - 1];
        if last.output_channels() != 1 {
            return Err(EngineError::shape(format!(
                "last layer must produce 1 output channel, got {}",
                last.output_channels()
            )));
        }

        Ok(Self { layers })
    }

    pub fn layers(&self) -> &[Model] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn kernel_size(&self) -> usize {
        self.layers[0].kernel_size()
    }

    /// Minimum halo: the cumulative kernel radius of the whole cascade.
    pub fn radius(&self) -> usize {
        self.layers.iter().map(Model::radius).sum()
    }

    pub fn param_count(&self) -> usize {
        self.layers.iter().map(Model::param_count).sum()
    }
}
