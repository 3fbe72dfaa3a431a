//! Tiled luminance CNN inference: weight loading, tile planning, convolution
//! backends and reassembly, plus the noise/scale pipeline built on them.

pub mod backend;
pub mod compositor;
pub mod config;
pub mod conv;
pub mod engine;
pub mod error;
pub mod logging;
pub mod model;
pub mod model_inspect;
pub mod model_registry;
pub mod model_store;
pub mod pipeline;
pub mod resize;
pub mod tile;
pub mod types;

pub use backend::{BackendKind, ConvolutionBackend};
pub use engine::{Engine, EngineConfig};
pub use error::{EngineError, EngineResult};
pub use model::{Activation, Model, ModelList};
pub use types::{FeatureMap, Plane};
