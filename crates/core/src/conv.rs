//! Run a model cascade over one padded tile.

use tracing::trace;

use crate::backend::ConvolutionBackend;
use crate::error::{EngineError, EngineResult};
use crate::model::ModelList;
use crate::tile::TileDescriptor;
use crate::types::{FeatureMap, Plane};

/// Apply every layer of `models` to `padded` (core plus halo) and return the core.
///
/// Each layer shrinks the map by its kernel radius per side. Any halo beyond the
/// cascade's total radius is cropped away at the end.
pub fn run(
    padded: &Plane,
    tile: &TileDescriptor,
    models: &ModelList,
    backend: &dyn ConvolutionBackend,
) -> EngineResult<Plane> {
    let radius = models.radius();
    if tile.halo < radius {
        return Err(EngineError::shape(format!(
            "tile halo {} is smaller than the cascade radius {radius}",
            tile.halo
        )));
    }
    if padded.width() != tile.padded_width() || padded.height() != tile.padded_height() {
        return Err(EngineError::shape(format!(
            "padded tile is {}x{}, descriptor expects {}x{}",
            padded.width(),
            padded.height(),
            tile.padded_width(),
            tile.padded_height()
        )));
    }

    let mut map = FeatureMap::from_plane(padded.clone());
    for (index, layer) in models.layers().iter().enumerate() {
        map = backend.convolve(&map, layer)?;
        trace!(
            layer = index,
            channels = map.channels(),
            width = map.width(),
            height = map.height(),
            "Layer applied"
        );
    }

    let surplus = tile.halo - radius;
    let plane = map.into_plane()?;
    if surplus == 0 {
        return Ok(plane);
    }
    let cropped = plane
        .view()
        .slice(ndarray::s![
            surplus..surplus + tile.core_height,
            surplus..surplus + tile.core_width
        ])
        .to_owned();
    Ok(Plane::from_array(cropped))
}
