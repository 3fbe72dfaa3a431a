//! Tile planning: split a plane into cores that are processed independently.
//!
//! Each tile's input is its core grown by `halo` pixels per side. Where that border
//! falls outside the plane, samples are replicated from the nearest edge, so a tile at
//! the image border sees exactly what a whole-plane pass would see.

use ndarray::Array2;

use crate::types::Plane;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileDescriptor {
    pub origin_x: usize,
    pub origin_y: usize,
    pub core_width: usize,
    pub core_height: usize,
    pub halo: usize,
}

impl TileDescriptor {
    pub fn padded_width(&self) -> usize {
        self.core_width + 2 * self.halo
    }

    pub fn padded_height(&self) -> usize {
        self.core_height + 2 * self.halo
    }

    pub fn core_pixels(&self) -> usize {
        self.core_width * self.core_height
    }
}

/// Greedy row-major partition into cores of at most `max_tile_size` square.
///
/// `max_tile_size == 0` disables tiling and yields one whole-plane tile.
pub fn plan(
    plane_width: usize,
    plane_height: usize,
    halo: usize,
    max_tile_size: usize,
) -> Vec<TileDescriptor> {
    if plane_width == 0 || plane_height == 0 {
        return Vec::new();
    }

    let step_x = if max_tile_size == 0 {
        plane_width
    } else {
        max_tile_size.min(plane_width)
    };
    let step_y = if max_tile_size == 0 {
        plane_height
    } else {
        max_tile_size.min(plane_height)
    };

    let mut tiles =
        Vec::with_capacity(plane_width.div_ceil(step_x) * plane_height.div_ceil(step_y));
    for origin_y in (0..plane_height).step_by(step_y) {
        let core_height = step_y.min(plane_height - origin_y);
        for origin_x in (0..plane_width).step_by(step_x) {
            tiles.push(TileDescriptor {
                origin_x,
                origin_y,
                core_width: step_x.min(plane_width - origin_x),
                core_height,
                halo,
            });
        }
    }
    tiles
}

/// Copy the tile's core plus halo out of `plane`, replicating edge samples where the
/// halo extends past the plane border.
pub fn extract(plane: &Plane, tile: &TileDescriptor) -> Plane {
    if plane.is_empty() {
        return Plane::from_array(Array2::zeros((tile.padded_height(), tile.padded_width())));
    }
    let left = tile.origin_x as isize - tile.halo as isize;
    let top = tile.origin_y as isize - tile.halo as isize;
    let data = Array2::from_shape_fn((tile.padded_height(), tile.padded_width()), |(y, x)| {
        plane.get_clamped(left + x as isize, top + y as isize)
    });
    Plane::from_array(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_exact_cover(width: usize, height: usize, tiles: &[TileDescriptor]) {
        let mut hits = vec![0u8; width * height];
        for tile in tiles {
            for y in tile.origin_y..tile.origin_y + tile.core_height {
                for x in tile.origin_x..tile.origin_x + tile.core_width {
                    hits[y * width + x] += 1;
                }
            }
        }
        assert!(
            hits.iter().all(|&h| h == 1),
            "{width}x{height} not covered exactly once"
        );
        let core_total: usize = tiles.iter().map(TileDescriptor::core_pixels).sum();
        assert_eq!(core_total, width * height);
    }

    #[test]
    fn zero_tile_size_yields_whole_plane() {
        let tiles = plan(37, 21, 7, 0);
        assert_eq!(
            tiles,
            vec![TileDescriptor {
                origin_x: 0,
                origin_y: 0,
                core_width: 37,
                core_height: 21,
                halo: 7,
            }]
        );
    }

    #[test]
    fn large_tile_size_yields_whole_plane() {
        let tiles = plan(64, 48, 3, 512);
        assert_eq!(tiles.len(), 1);
        assert_eq!(tiles[0].core_width, 64);
        assert_eq!(tiles[0].core_height, 48);
    }

    #[test]
    fn tiles_are_row_major_with_clipped_edges() {
        let tiles = plan(10, 7, 2, 4);
        let origins: Vec<(usize, usize)> = tiles.iter().map(|t| (t.origin_x, t.origin_y)).collect();
        assert_eq!(
            origins,
            vec![(0, 0), (4, 0), (8, 0), (0, 4), (4, 4), (8, 4)]
        );
        assert_eq!(tiles[2].core_width, 2);
        assert_eq!(tiles[5].core_height, 3);
        assert_eq!(tiles[5].padded_width(), 6);
        assert_eq!(tiles[5].padded_height(), 7);
    }

    #[test]
    fn cores_cover_arbitrary_planes_exactly_once() {
        for width in [1, 2, 5, 16, 33] {
            for height in [1, 3, 8, 17] {
                for tile_size in [0, 1, 2, 3, 7, 16, 64] {
                    let tiles = plan(width, height, 1, tile_size);
                    assert_exact_cover(width, height, &tiles);
                }
            }
        }
    }

    #[test]
    fn empty_plane_has_no_tiles() {
        assert!(plan(0, 10, 2, 4).is_empty());
        assert!(plan(10, 0, 2, 4).is_empty());
    }

    #[test]
    fn extract_replicates_edges_instead_of_zero_padding() {
        let plane = Plane::from_fn(3, 2, |(x, y)| (10 * y + x) as f32 + 1.0);
        let tile = plan(3, 2, 1, 0)[0];
        let padded = extract(&plane, &tile);
        assert_eq!(padded.width(), 5);
        assert_eq!(padded.height(), 4);
        // corners replicate the corner samples
        assert_eq!(padded.get(0, 0), 1.0);
        assert_eq!(padded.get(4, 0), 3.0);
        assert_eq!(padded.get(0, 3), 11.0);
        assert_eq!(padded.get(4, 3), 13.0);
        // interior is the plane itself
        assert_eq!(padded.get(2, 1), 2.0);
        assert_eq!(padded.get(3, 2), 13.0);
    }

    #[test]
    fn extract_interior_tile_reads_real_neighbours() {
        let plane = Plane::from_fn(8, 8, |(x, y)| (y * 8 + x) as f32);
        let tile = TileDescriptor {
            origin_x: 4,
            origin_y: 4,
            core_width: 2,
            core_height: 2,
            halo: 1,
        };
        let padded = extract(&plane, &tile);
        assert_eq!(padded.get(0, 0), plane.get(3, 3));
        assert_eq!(padded.get(3, 3), plane.get(6, 6));
    }
}
