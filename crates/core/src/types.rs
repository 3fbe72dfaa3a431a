use ndarray::{Array2, Array3, ArrayView2, ArrayView3};

use crate::error::{EngineError, EngineResult};

/// Single-channel sample grid, row-major, values nominally in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Plane {
    data: Array2<f32>,
}

impl Plane {
    /// Build a plane from row-major samples. Fails unless `data.len() == width * height`.
    pub fn from_vec(width: usize, height: usize, data: Vec<f32>) -> EngineResult<Self> {
        if data.len() != width * height {
            return Err(EngineError::shape(format!(
                "plane buffer holds {} samples, expected {width}x{height} = {}",
                data.len(),
                width * height
            )));
        }
        let data = Array2::from_shape_vec((height, width), data)
            .map_err(|e| EngineError::shape(format!("plane reshape failed: {e}")))?;
        Ok(Self { data })
    }

    pub fn filled(width: usize, height: usize, value: f32) -> Self {
        Self {
            data: Array2::from_elem((height, width), value),
        }
    }

    /// Build a plane from a generator called with `(x, y)`.
    pub fn from_fn(width: usize, height: usize, mut f: impl FnMut((usize, usize)) -> f32) -> Self {
        Self {
            data: Array2::from_shape_fn((height, width), |(y, x)| f((x, y))),
        }
    }

    pub fn from_array(data: Array2<f32>) -> Self {
        Self { data }
    }

    pub fn width(&self) -> usize {
        self.data.ncols()
    }

    pub fn height(&self) -> usize {
        self.data.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.data[[y, x]]
    }

    /// Sample with edge replication: out-of-range coordinates clamp to the nearest edge.
    pub fn get_clamped(&self, x: isize, y: isize) -> f32 {
        let cx = x.clamp(0, self.width() as isize - 1) as usize;
        let cy = y.clamp(0, self.height() as isize - 1) as usize;
        self.data[[cy, cx]]
    }

    pub fn view(&self) -> ArrayView2<'_, f32> {
        self.data.view()
    }

    pub fn as_array(&self) -> &Array2<f32> {
        &self.data
    }

    pub(crate) fn as_array_mut(&mut self) -> &mut Array2<f32> {
        &mut self.data
    }

    pub fn into_array(self) -> Array2<f32> {
        self.data
    }

    /// Row-major copy of the samples.
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.iter().copied().collect()
    }

    pub fn max_abs_diff(&self, other: &Plane) -> Option<f32> {
        if self.data.dim() != other.data.dim() {
            return None;
        }
        Some(
            self.data
                .iter()
                .zip(other.data.iter())
                .map(|(a, b)| (a - b).abs())
                .fold(0.0f32, f32::max),
        )
    }
}

/// Multi-channel activation volume laid out as `[channel][y][x]`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMap {
    data: Array3<f32>,
}

impl FeatureMap {
    pub fn zeros(channels: usize, height: usize, width: usize) -> Self {
        Self {
            data: Array3::zeros((channels, height, width)),
        }
    }

    pub fn from_array(data: Array3<f32>) -> Self {
        Self { data }
    }

    pub fn from_plane(plane: Plane) -> Self {
        Self {
            data: plane.into_array().insert_axis(ndarray::Axis(0)),
        }
    }

    pub fn channels(&self) -> usize {
        self.data.dim().0
    }

    pub fn height(&self) -> usize {
        self.data.dim().1
    }

    pub fn width(&self) -> usize {
        self.data.dim().2
    }

    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.data.view()
    }

    pub fn as_array_mut(&mut self) -> &mut Array3<f32> {
        &mut self.data
    }

    /// Take channel 0 as a plane. Fails unless the map has exactly one channel.
    pub fn into_plane(self) -> EngineResult<Plane> {
        if self.channels() != 1 {
            return Err(EngineError::shape(format!(
                "expected a single-channel feature map, got {} channels",
                self.channels()
            )));
        }
        Ok(Plane::from_array(
            self.data.index_axis_move(ndarray::Axis(0), 0),
        ))
    }
}
