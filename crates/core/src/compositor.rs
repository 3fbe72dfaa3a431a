//! Reassemble processed tile cores into the output plane.

use ndarray::{s, Array2};

use crate::error::{EngineError, EngineResult};
use crate::tile::TileDescriptor;
use crate::types::Plane;

/// Write each processed core at its origin and verify that every output pixel was
/// written exactly once.
pub fn compose(
    width: usize,
    height: usize,
    tiles: Vec<(TileDescriptor, Plane)>,
) -> EngineResult<Plane> {
    let mut output = Plane::filled(width, height, 0.0);
    let mut coverage = Array2::<u32>::zeros((height, width));

    for (tile, core) in tiles {
        if core.width() != tile.core_width || core.height() != tile.core_height {
            return Err(EngineError::shape(format!(
                "tile at ({}, {}) produced {}x{}, expected {}x{}",
                tile.origin_x,
                tile.origin_y,
                core.width(),
                core.height(),
                tile.core_width,
                tile.core_height
            )));
        }
        let right = tile.origin_x + tile.core_width;
        let bottom = tile.origin_y + tile.core_height;
        if right > width || bottom > height {
            return Err(EngineError::IncompleteCoverage(format!(
                "tile at ({}, {}) extends to ({right}, {bottom}) outside {width}x{height}",
                tile.origin_x, tile.origin_y
            )));
        }

        let rows = tile.origin_y..bottom;
        let cols = tile.origin_x..right;
        output
            .as_array_mut()
            .slice_mut(s![rows.clone(), cols.clone()])
            .assign(core.as_array());
        coverage
            .slice_mut(s![rows, cols])
            .mapv_inplace(|hits| hits + 1);
    }

    if let Some(((y, x), hits)) = coverage.indexed_iter().find(|(_, hits)| **hits != 1) {
        let what = if *hits == 0 { "never written" } else { "written more than once" };
        return Err(EngineError::IncompleteCoverage(format!(
            "output pixel ({x}, {y}) {what}"
        )));
    }
    Ok(output)
}
