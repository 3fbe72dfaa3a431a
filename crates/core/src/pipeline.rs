//! Noise reduction and 2x scaling stages chained over one luminance plane.

use std::sync::Arc;

use tracing::info;

use crate::backend::{build_backend, build_backend_or_scalar};
use crate::engine::{Engine, EngineConfig};
use crate::error::{EngineError, EngineResult};
use crate::model_registry::{ModelKind, ModelRegistry};
use crate::resize::{resize, resize_nearest, ResizeAlgorithm};
use crate::types::Plane;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessMode {
    Noise,
    Scale,
    #[default]
    NoiseScale,
}

impl ProcessMode {
    pub fn parse(s: &str) -> EngineResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "noise" => Ok(Self::Noise),
            "scale" => Ok(Self::Scale),
            "noise_scale" | "noise-scale" => Ok(Self::NoiseScale),
            other => Err(EngineError::InvalidParameter(format!(
                "unknown mode '{other}', expected noise, scale or noise_scale"
            ))),
        }
    }

    pub fn denoises(self) -> bool {
        matches!(self, Self::Noise | Self::NoiseScale)
    }

    pub fn scales(self) -> bool {
        matches!(self, Self::Scale | Self::NoiseScale)
    }
}

impl std::fmt::Display for ProcessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Noise => write!(f, "noise"),
            Self::Scale => write!(f, "scale"),
            Self::NoiseScale => write!(f, "noise_scale"),
        }
    }
}

pub fn validate_noise_level(level: u8) -> EngineResult<u8> {
    match level {
        1 | 2 => Ok(level),
        other => Err(EngineError::InvalidParameter(format!(
            "noise level must be 1 or 2, got {other}"
        ))),
    }
}

/// Largest number of doublings a ratio may ask for (ratio 65536).
pub const MAX_SCALE_ITERATIONS: u32 = 16;

/// Number of model-driven doublings plus an optional final shrink.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalePlan {
    pub ratio: f64,
    pub iterations: u32,
    /// `None` when the doublings land exactly on the requested ratio.
    pub shrink: Option<f64>,
}

impl ScalePlan {
    /// Ratios that are not a power of two overshoot with doublings and shrink back,
    /// e.g. 2.5 becomes two doublings then a 0.625 bilinear shrink. The shrink is
    /// skipped when the integer part of `ratio` equals the doubled factor.
    pub fn from_ratio(ratio: f64) -> EngineResult<Self> {
        if !ratio.is_finite() || ratio < 1.0 {
            return Err(EngineError::InvalidParameter(format!(
                "scale ratio must be a finite value >= 1, got {ratio}"
            )));
        }
        let iterations = ratio.log2().ceil() as u32;
        if iterations > MAX_SCALE_ITERATIONS {
            return Err(EngineError::InvalidParameter(format!(
                "scale ratio {ratio} needs {iterations} doublings, at most {MAX_SCALE_ITERATIONS} are supported"
            )));
        }
        let factor = 2f64.powi(iterations as i32);
        let shrink = if ratio.trunc() == factor {
            None
        } else {
            Some(ratio / factor)
        };
        Ok(Self {
            ratio,
            iterations,
            shrink,
        })
    }

    pub fn upscale_factor(&self) -> EngineResult<usize> {
        1usize.checked_shl(self.iterations).ok_or_else(|| {
            EngineError::InvalidParameter(format!(
                "{} doublings overflow the scale factor",
                self.iterations
            ))
        })
    }

    /// Output dimensions for a `width x height` input.
    pub fn output_size(&self, width: usize, height: usize) -> EngineResult<(usize, usize)> {
        let (w, h) = scaled_size(width, height, self.upscale_factor()?)?;
        Ok(match self.shrink {
            Some(shrink) => shrink_size(w, h, shrink),
            None => (w, h),
        })
    }
}

fn scaled_size(width: usize, height: usize, factor: usize) -> EngineResult<(usize, usize)> {
    match (width.checked_mul(factor), height.checked_mul(factor)) {
        (Some(w), Some(h)) => Ok((w, h)),
        _ => Err(EngineError::InvalidParameter(format!(
            "{width}x{height} scaled by {factor} overflows"
        ))),
    }
}

fn shrink_size(width: usize, height: usize, shrink: f64) -> (usize, usize) {
    (
        (width as f64 * shrink) as usize,
        (height as f64 * shrink) as usize,
    )
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineOptions {
    pub mode: ProcessMode,
    pub noise_level: u8,
    pub scale_ratio: f64,
    /// Filter for the final shrink of non power-of-two ratios.
    pub shrink_filter: ResizeAlgorithm,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            mode: ProcessMode::default(),
            noise_level: 1,
            scale_ratio: 2.0,
            shrink_filter: ResizeAlgorithm::default(),
        }
    }
}

struct ScaleStage {
    engine: Engine,
    plan: ScalePlan,
}

pub struct Pipeline {
    mode: ProcessMode,
    noise: Option<Engine>,
    scale: Option<ScaleStage>,
    shrink_filter: ResizeAlgorithm,
}

impl Pipeline {
    pub fn new(
        mode: ProcessMode,
        noise: Option<Engine>,
        scale: Option<(Engine, ScalePlan)>,
    ) -> EngineResult<Self> {
        if mode.denoises() != noise.is_some() || mode.scales() != scale.is_some() {
            return Err(EngineError::InvalidParameter(format!(
                "mode {mode} does not match the supplied engines"
            )));
        }
        Ok(Self {
            mode,
            noise,
            scale: scale.map(|(engine, plan)| ScaleStage { engine, plan }),
            shrink_filter: ResizeAlgorithm::default(),
        })
    }

    pub fn with_shrink_filter(mut self, filter: ResizeAlgorithm) -> Self {
        self.shrink_filter = filter;
        self
    }

    /// Validate `options`, load the cascades the mode needs and share one backend
    /// between them.
    ///
    /// With `strict_backend` an unavailable backend is an error, otherwise the scalar
    /// backend is used.
    pub fn from_registry(
        registry: &ModelRegistry,
        options: PipelineOptions,
        config: EngineConfig,
        strict_backend: bool,
    ) -> EngineResult<Self> {
        let noise_level = validate_noise_level(options.noise_level)?;
        let plan = if options.mode.scales() {
            Some(ScalePlan::from_ratio(options.scale_ratio)?)
        } else {
            None
        };

        let backend = if strict_backend {
            build_backend(config.backend, config.backend_threads)?
        } else {
            build_backend_or_scalar(config.backend, config.backend_threads)
        };

        let noise = if options.mode.denoises() {
            let models = registry.load(ModelKind::Noise { level: noise_level })?;
            Some(Engine::with_backend(models, Arc::clone(&backend), config)?)
        } else {
            None
        };
        let scale = match plan {
            Some(plan) => {
                let models = registry.load(ModelKind::Scale2x)?;
                Some((Engine::with_backend(models, backend, config)?, plan))
            }
            None => None,
        };

        Ok(Self::new(options.mode, noise, scale)?.with_shrink_filter(options.shrink_filter))
    }

    pub fn mode(&self) -> ProcessMode {
        self.mode
    }

    pub fn scale_plan(&self) -> Option<&ScalePlan> {
        self.scale.as_ref().map(|stage| &stage.plan)
    }

    pub fn output_size(&self, width: usize, height: usize) -> EngineResult<(usize, usize)> {
        match self.scale_plan() {
            Some(plan) => plan.output_size(width, height),
            None => Ok((width, height)),
        }
    }

    pub fn process(&self, plane: Plane) -> EngineResult<Plane> {
        let mut plane = plane;

        if let Some(engine) = &self.noise {
            info!(
                width = plane.width(),
                height = plane.height(),
                "Noise reduction"
            );
            plane = engine.process(plane)?;
        }

        if let Some(stage) = &self.scale {
            for iteration in 0..stage.plan.iterations {
                info!(
                    iteration = iteration + 1,
                    of = stage.plan.iterations,
                    "2x scaling"
                );
                let (w, h) = scaled_size(plane.width(), plane.height(), 2)?;
                let doubled = resize_nearest(&plane, w, h);
                plane = stage.engine.process(doubled)?;
            }

            if let Some(shrink) = stage.plan.shrink {
                let (w, h) = shrink_size(plane.width(), plane.height(), shrink);
                info!(
                    shrink,
                    width = w,
                    height = h,
                    filter = ?self.shrink_filter,
                    "Shrinking to requested ratio"
                );
                plane = resize(&plane, w, h, self.shrink_filter);
            }
        }

        Ok(plane)
    }
}
