//! Weight file loading and writing.
//!
//! Three layouts are understood:
//!
//! - **v1** (`LCNN` magic): explicit per-layer header with kernel size, activation and
//!   sample type (f32 or f16), written by [`encode`] / [`save`].
//! - **legacy**: headerless stream of 3x3 f32 layers, every layer LeakyReLU(0.1).
//! - **JSON** (`.json` extension): waifu2x-style array of layer objects.
//!
//! Every layout is validated strictly. A byte stream that does not match its declared
//! shapes is rejected instead of being read past or truncated.

use std::fs;
use std::path::Path;

use half::f16;
use serde::Deserialize;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::model::{Activation, Model, ModelList, DEFAULT_LEAKY_SLOPE};

pub const MAGIC: [u8; 4] = *b"LCNN";
pub const FORMAT_VERSION: u32 = 1;

const LEGACY_KERNEL_SIZE: usize = 3;
const ACTIVATION_IDENTITY: u32 = 0;
const ACTIVATION_LEAKY_RELU: u32 = 1;
/// Upper bound on declared channel counts; guards multiplication overflow on hostile headers.
const MAX_CHANNELS: usize = 1 << 16;
const MAX_KERNEL_SIZE: usize = 63;

/// Sample encoding of weights and biases in a v1 file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeightDtype {
    #[default]
    F32,
    F16,
}

impl WeightDtype {
    fn tag(self) -> u32 {
        match self {
            Self::F32 => 0,
            Self::F16 => 1,
        }
    }

    fn from_tag(tag: u32) -> EngineResult<Self> {
        match tag {
            0 => Ok(Self::F32),
            1 => Ok(Self::F16),
            other => Err(EngineError::format(format!("unknown weight dtype tag {other}"))),
        }
    }

    fn width(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 => 2,
        }
    }
}

impl std::fmt::Display for WeightDtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::F32 => write!(f, "f32"),
            Self::F16 => write!(f, "f16"),
        }
    }
}

/// Which on-disk layout a model was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFormat {
    V1,
    Legacy,
    Json,
}

impl std::fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V1 => write!(f, "v1"),
            Self::Legacy => write!(f, "legacy"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Load a cascade from `path`, picking the layout from the extension and magic bytes.
pub fn load(path: &Path) -> EngineResult<ModelList> {
    load_with_format(path).map(|(models, _)| models)
}

pub fn load_with_format(path: &Path) -> EngineResult<(ModelList, ModelFormat)> {
    let bytes = fs::read(path).map_err(|source| EngineError::NotFound {
        path: path.to_path_buf(),
        source,
    })?;

    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let (models, format) = if is_json {
        (parse_json(&bytes)?, ModelFormat::Json)
    } else {
        parse_with_format(&bytes)?
    };

    debug!(
        path = %path.display(),
        format = %format,
        layers = models.len(),
        params = models.param_count(),
        "Loaded model cascade"
    );
    Ok((models, format))
}

/// Parse a binary weight stream (v1 or legacy).
pub fn parse(bytes: &[u8]) -> EngineResult<ModelList> {
    parse_with_format(bytes).map(|(models, _)| models)
}

fn parse_with_format(bytes: &[u8]) -> EngineResult<(ModelList, ModelFormat)> {
    if bytes.starts_with(&MAGIC) {
        Ok((parse_v1(bytes)?, ModelFormat::V1))
    } else {
        Ok((parse_legacy(bytes)?, ModelFormat::Legacy))
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, len: usize, what: &str) -> EngineResult<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| {
                EngineError::format(format!(
                    "truncated while reading {what}: need {len} bytes at offset {}, {} available",
                    self.offset,
                    self.bytes.len() - self.offset
                ))
            })?;
        let chunk = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(chunk)
    }

    fn u32(&mut self, what: &str) -> EngineResult<u32> {
        let chunk = self.take(4, what)?;
        Ok(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
    }

    fn f32(&mut self, what: &str) -> EngineResult<f32> {
        let chunk = self.take(4, what)?;
        Ok(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
    }

    fn samples(&mut self, count: usize, dtype: WeightDtype, what: &str) -> EngineResult<Vec<f32>> {
        let len = count
            .checked_mul(dtype.width())
            .ok_or_else(|| EngineError::format(format!("{what} size overflows")))?;
        let chunk = self.take(len, what)?;
        let values: Vec<f32> = match dtype {
            WeightDtype::F32 => chunk
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
            WeightDtype::F16 => chunk
                .chunks_exact(2)
                .map(|b| f16::from_bits(u16::from_le_bytes([b[0], b[1]])).to_f32())
                .collect(),
        };
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(EngineError::format(format!(
                "{what} contains a non-finite value at index {index}"
            )));
        }
        Ok(values)
    }

    fn finish(&self) -> EngineResult<()> {
        let trailing = self.bytes.len() - self.offset;
        if trailing != 0 {
            return Err(EngineError::format(format!(
                "{trailing} trailing bytes after the last declared layer"
            )));
        }
        Ok(())
    }
}

fn channel_count(value: u32, what: &str) -> EngineResult<usize> {
    let value = value as usize;
    if value == 0 || value > MAX_CHANNELS {
        return Err(EngineError::format(format!(
            "{what} channel count {value} out of range 1..={MAX_CHANNELS}"
        )));
    }
    Ok(value)
}

fn parse_v1(bytes: &[u8]) -> EngineResult<ModelList> {
    let mut reader = Reader::new(bytes);
    reader.take(MAGIC.len(), "magic")?;
    let version = reader.u32("version")?;
    if version != FORMAT_VERSION {
        return Err(EngineError::format(format!(
            "unsupported format version {version} (expected {FORMAT_VERSION})"
        )));
    }
    let layer_count = reader.u32("layer count")? as usize;
    if layer_count == 0 {
        return Err(EngineError::format("file declares zero layers"));
    }

    let mut layers = Vec::with_capacity(layer_count.min(64));
    for index in 0..layer_count {
        let inputs = channel_count(reader.u32("layer header")?, "input")?;
        let outputs = channel_count(reader.u32("layer header")?, "output")?;
        let kernel = reader.u32("layer header")? as usize;
        if kernel == 0 || kernel % 2 == 0 || kernel > MAX_KERNEL_SIZE {
            return Err(EngineError::format(format!(
                "layer {index}: kernel size {kernel} must be odd and at most {MAX_KERNEL_SIZE}"
            )));
        }
        let activation_tag = reader.u32("layer header")?;
        let slope = reader.f32("layer header")?;
        let activation = match activation_tag {
            ACTIVATION_IDENTITY => Activation::Identity,
            ACTIVATION_LEAKY_RELU if slope.is_finite() => Activation::LeakyRelu { slope },
            ACTIVATION_LEAKY_RELU => {
                return Err(EngineError::format(format!(
                    "layer {index}: non-finite leaky slope"
                )))
            }
            other => {
                return Err(EngineError::format(format!(
                    "layer {index}: unknown activation tag {other}"
                )))
            }
        };
        let dtype = WeightDtype::from_tag(reader.u32("layer header")?)?;

        let weights = reader.samples(
            outputs * inputs * kernel * kernel,
            dtype,
            &format!("layer {index} weights"),
        )?;
        let biases = reader.samples(outputs, dtype, &format!("layer {index} biases"))?;
        layers.push(build_layer(
            index, inputs, outputs, kernel, weights, biases, activation,
        )?);
    }
    reader.finish()?;
    chain(layers)
}

fn parse_legacy(bytes: &[u8]) -> EngineResult<ModelList> {
    let mut reader = Reader::new(bytes);
    let layer_count = reader.u32("layer count")? as usize;
    if layer_count == 0 {
        return Err(EngineError::format("file declares zero layers"));
    }

    let activation = Activation::LeakyRelu {
        slope: DEFAULT_LEAKY_SLOPE,
    };
    let taps = LEGACY_KERNEL_SIZE * LEGACY_KERNEL_SIZE;
    let mut layers = Vec::with_capacity(layer_count.min(64));
    for index in 0..layer_count {
        let inputs = channel_count(reader.u32("layer header")?, "input")?;
        let outputs = channel_count(reader.u32("layer header")?, "output")?;
        let weights = reader.samples(
            outputs * inputs * taps,
            WeightDtype::F32,
            &format!("layer {index} weights"),
        )?;
        let biases =
            reader.samples(outputs, WeightDtype::F32, &format!("layer {index} biases"))?;
        layers.push(build_layer(
            index,
            inputs,
            outputs,
            LEGACY_KERNEL_SIZE,
            weights,
            biases,
            activation,
        )?);
    }
    reader.finish()?;
    chain(layers)
}

#[derive(Deserialize)]
struct JsonLayer {
    #[serde(rename = "nInputPlane")]
    input_planes: usize,
    #[serde(rename = "nOutputPlane")]
    output_planes: usize,
    #[serde(rename = "kW")]
    kernel_width: usize,
    #[serde(rename = "kH")]
    kernel_height: usize,
    weight: Vec<Vec<Vec<Vec<f32>>>>,
    bias: Vec<f32>,
}

/// Parse the waifu2x JSON export: `[{nInputPlane, nOutputPlane, kW, kH, weight, bias}, ..]`.
pub fn parse_json(bytes: &[u8]) -> EngineResult<ModelList> {
    let raw: Vec<JsonLayer> = serde_json::from_slice(bytes)
        .map_err(|e| EngineError::format(format!("invalid JSON model: {e}")))?;
    if raw.is_empty() {
        return Err(EngineError::format("JSON model declares zero layers"));
    }

    let activation = Activation::LeakyRelu {
        slope: DEFAULT_LEAKY_SLOPE,
    };
    let mut layers = Vec::with_capacity(raw.len());
    for (index, layer) in raw.into_iter().enumerate() {
        if layer.kernel_width != layer.kernel_height {
            return Err(EngineError::format(format!(
                "layer {index}: non-square kernel {}x{}",
                layer.kernel_width, layer.kernel_height
            )));
        }
        let kernel = layer.kernel_width;
        if layer.weight.len() != layer.output_planes {
            return Err(EngineError::format(format!(
                "layer {index}: {} kernel groups for {} output planes",
                layer.weight.len(),
                layer.output_planes
            )));
        }

        let mut weights =
            Vec::with_capacity(layer.output_planes * layer.input_planes * kernel * kernel);
        for (out, group) in layer.weight.iter().enumerate() {
            if group.len() != layer.input_planes {
                return Err(EngineError::format(format!(
                    "layer {index}: output {out} has {} kernels for {} input planes",
                    group.len(),
                    layer.input_planes
                )));
            }
            for kernel_rows in group {
                if kernel_rows.len() != kernel || kernel_rows.iter().any(|r| r.len() != kernel) {
                    return Err(EngineError::format(format!(
                        "layer {index}: output {out} has a kernel that is not {kernel}x{kernel}"
                    )));
                }
                weights.extend(kernel_rows.iter().flatten().copied());
            }
        }
        if weights.iter().chain(layer.bias.iter()).any(|v| !v.is_finite()) {
            return Err(EngineError::format(format!(
                "layer {index}: non-finite weight or bias"
            )));
        }

        layers.push(build_layer(
            index,
            layer.input_planes,
            layer.output_planes,
            kernel,
            weights,
            layer.bias,
            activation,
        )?);
    }
    chain(layers)
}

fn build_layer(
    index: usize,
    inputs: usize,
    outputs: usize,
    kernel: usize,
    weights: Vec<f32>,
    biases: Vec<f32>,
    activation: Activation,
) -> EngineResult<Model> {
    Model::new(inputs, outputs, kernel, weights, biases, activation)
        .map_err(|e| EngineError::format(format!("layer {index}: {e}")))
}

/// Shape errors found while chaining a file's layers are format errors of that file.
fn chain(layers: Vec<Model>) -> EngineResult<ModelList> {
    ModelList::new(layers).map_err(|e| match e {
        EngineError::ShapeMismatch(detail) => {
            EngineError::format(format!("inconsistent layer chain: {detail}"))
        }
        other => other,
    })
}

/// Serialize a cascade in the v1 layout.
pub fn encode(models: &ModelList, dtype: WeightDtype) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + models.param_count() * dtype.width());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&(models.len() as u32).to_le_bytes());

    for layer in models.layers() {
        let (tag, slope) = match layer.activation() {
            Activation::Identity => (ACTIVATION_IDENTITY, 0.0f32),
            Activation::LeakyRelu { slope } => (ACTIVATION_LEAKY_RELU, slope),
        };
        for field in [
            layer.input_channels() as u32,
            layer.output_channels() as u32,
            layer.kernel_size() as u32,
            tag,
        ] {
            out.extend_from_slice(&field.to_le_bytes());
        }
        out.extend_from_slice(&slope.to_le_bytes());
        out.extend_from_slice(&dtype.tag().to_le_bytes());

        for value in layer.weights().iter().chain(layer.biases().iter()) {
            match dtype {
                WeightDtype::F32 => out.extend_from_slice(&value.to_le_bytes()),
                WeightDtype::F16 => {
                    out.extend_from_slice(&f16::from_f32(*value).to_bits().to_le_bytes())
                }
            }
        }
    }
    out
}

pub fn save(path: &Path, models: &ModelList, dtype: WeightDtype) -> EngineResult<()> {
    fs::write(path, encode(models, dtype)).map_err(|source| EngineError::Io {
        path: path.to_path_buf(),
        source,
    })
}
