//! Convolution backends: a scalar reference path and a rayon worker-pool path.
//!
//! Both backends evaluate every output sample with the same accumulation order
//! (bias, then input channel, kernel row, kernel column), so swapping one for the
//! other never changes results. [`build_backend`] constructs the requested backend and
//! [`fallback_to_scalar`] turns an initialization failure into the scalar path.

use std::sync::Arc;

use ndarray::{s, ArrayView3, ArrayViewMut1, Axis, Zip};
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::model::Model;
use crate::types::FeatureMap;

/// Backend selection.
///
/// Default is `Parallel`. If its worker pool cannot be created, callers may fall back
/// to `Scalar` via [`build_backend_or_scalar`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackendKind {
    Scalar,
    #[default]
    Parallel,
}

impl BackendKind {
    /// Parse from string (case-insensitive). Returns `Parallel` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "scalar" | "cpu" | "reference" => Self::Scalar,
            _ => Self::Parallel,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scalar => write!(f, "scalar"),
            Self::Parallel => write!(f, "parallel"),
        }
    }
}

/// One layer of valid (unpadded) convolution followed by the layer's activation.
///
/// The output map is `kernel_size - 1` pixels smaller than the input in each dimension.
pub trait ConvolutionBackend: Send + Sync {
    fn name(&self) -> &str;

    fn convolve(&self, input: &FeatureMap, layer: &Model) -> EngineResult<FeatureMap>;
}

fn check_layer_input(input: &FeatureMap, layer: &Model) -> EngineResult<(usize, usize)> {
    if input.channels() != layer.input_channels() {
        return Err(EngineError::shape(format!(
            "layer expects {} input channels, feature map has {}",
            layer.input_channels(),
            input.channels()
        )));
    }
    let kernel = layer.kernel_size();
    if input.height() < kernel || input.width() < kernel {
        return Err(EngineError::shape(format!(
            "feature map {}x{} is smaller than the {kernel}x{kernel} kernel",
            input.width(),
            input.height()
        )));
    }
    Ok((input.height() - kernel + 1, input.width() - kernel + 1))
}

/// Compute output row `y` of channel `out_channel`.
fn convolve_row(
    input: &ArrayView3<'_, f32>,
    layer: &Model,
    out_channel: usize,
    y: usize,
    mut row: ArrayViewMut1<'_, f32>,
) {
    let width = row.len();
    let kernels = layer.kernels_for(out_channel);
    row.fill(layer.biases()[out_channel]);

    for (in_channel, kernel) in kernels.outer_iter().enumerate() {
        for (ky, taps) in kernel.outer_iter().enumerate() {
            let source = input.slice(s![in_channel, y + ky, ..]);
            for (kx, &weight) in taps.iter().enumerate() {
                Zip::from(&mut row)
                    .and(source.slice(s![kx..kx + width]))
                    .for_each(|acc, &sample| *acc += weight * sample);
            }
        }
    }

    let activation = layer.activation();
    row.mapv_inplace(|v| activation.apply(v));
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ScalarBackend;

impl ConvolutionBackend for ScalarBackend {
    fn name(&self) -> &str {
        "scalar"
    }

    fn convolve(&self, input: &FeatureMap, layer: &Model) -> EngineResult<FeatureMap> {
        let (out_h, out_w) = check_layer_input(input, layer)?;
        let mut output = FeatureMap::zeros(layer.output_channels(), out_h, out_w);
        let view = input.view();

        Zip::indexed(output.as_array_mut().lanes_mut(Axis(2))).for_each(
            |(out_channel, y), row| convolve_row(&view, layer, out_channel, y, row),
        );
        Ok(output)
    }
}

/// Computes output rows on a dedicated rayon pool.
pub struct ParallelBackend {
    pool: rayon::ThreadPool,
}

impl ParallelBackend {
    /// `threads == 0` sizes the pool to the number of logical CPUs.
    pub fn new(threads: usize) -> EngineResult<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("planescale-conv-{index}"))
            .build()
            .map_err(|e| EngineError::BackendUnavailable {
                backend: BackendKind::Parallel.to_string(),
                reason: e.to_string(),
            })?;
        let backend = Self { pool };
        debug!(
            threads = backend.threads(),
            "Parallel convolution backend ready"
        );
        Ok(backend)
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl ConvolutionBackend for ParallelBackend {
    fn name(&self) -> &str {
        "parallel"
    }

    fn convolve(&self, input: &FeatureMap, layer: &Model) -> EngineResult<FeatureMap> {
        let (out_h, out_w) = check_layer_input(input, layer)?;
        let mut output = FeatureMap::zeros(layer.output_channels(), out_h, out_w);
        let view = input.view();

        self.pool.install(|| {
            Zip::indexed(output.as_array_mut().lanes_mut(Axis(2))).par_for_each(
                |(out_channel, y), row| convolve_row(&view, layer, out_channel, y, row),
            );
        });
        Ok(output)
    }
}

/// Build the requested backend. Fails with `BackendUnavailable` instead of degrading.
pub fn build_backend(
    kind: BackendKind,
    threads: usize,
) -> EngineResult<Arc<dyn ConvolutionBackend>> {
    match kind {
        BackendKind::Scalar => Ok(Arc::new(ScalarBackend)),
        BackendKind::Parallel => Ok(Arc::new(ParallelBackend::new(threads)?)),
    }
}

/// Keep a successfully built backend, or log the failure and use the scalar path.
pub fn fallback_to_scalar(
    built: EngineResult<Arc<dyn ConvolutionBackend>>,
) -> Arc<dyn ConvolutionBackend> {
    match built {
        Ok(backend) => backend,
        Err(error) => {
            warn!(error = %error, "Requested backend unavailable, falling back to scalar");
            Arc::new(ScalarBackend)
        }
    }
}

pub fn build_backend_or_scalar(kind: BackendKind, threads: usize) -> Arc<dyn ConvolutionBackend> {
    fallback_to_scalar(build_backend(kind, threads))
}
