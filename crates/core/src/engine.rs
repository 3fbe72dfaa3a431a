//! Plane-level facade: plan tiles, run the cascade on each, compose the result.

use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};

use crate::backend::{
    build_backend, build_backend_or_scalar, BackendKind, ConvolutionBackend,
};
use crate::compositor::compose;
use crate::conv;
use crate::error::EngineResult;
use crate::model::ModelList;
use crate::tile::{self, TileDescriptor};
use crate::types::Plane;

pub const DEFAULT_TILE_SIZE: usize = 512;
pub const DEFAULT_JOBS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum tile core edge. `0` processes the plane as a single tile.
    pub tile_size: usize,
    #[serde(with = "backend_name")]
    pub backend: BackendKind,
    /// Tiles processed concurrently. `0` and `1` run tiles on the caller's thread.
    pub jobs: usize,
    /// Worker threads for the parallel backend, `0` = one per logical CPU.
    pub backend_threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
            backend: BackendKind::default(),
            jobs: DEFAULT_JOBS,
            backend_threads: 0,
        }
    }
}

mod backend_name {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::backend::BackendKind;

    pub fn serialize<S: Serializer>(kind: &BackendKind, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(kind)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BackendKind, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(BackendKind::from_str_lossy(&raw))
    }
}

/// Keep a built tile pool, or log the failure and process tiles on the caller's thread.
fn tile_pool_or_sequential<E: std::fmt::Display>(
    built: Result<rayon::ThreadPool, E>,
    jobs: usize,
) -> Option<rayon::ThreadPool> {
    match built {
        Ok(pool) => Some(pool),
        Err(error) => {
            warn!(jobs, error = %error, "Tile pool unavailable, processing tiles sequentially");
            None
        }
    }
}

pub struct Engine {
    models: Arc<ModelList>,
    backend: Arc<dyn ConvolutionBackend>,
    tile_size: usize,
    halo: usize,
    tile_pool: Option<rayon::ThreadPool>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("layers", &self.models.len())
            .field("backend", &self.backend.name())
            .field("tile_size", &self.tile_size)
            .field("halo", &self.halo)
            .field("jobs", &self.jobs())
            .finish()
    }
}

impl Engine {
    /// Fails with `BackendUnavailable` if the configured backend cannot start.
    pub fn new(models: Arc<ModelList>, config: EngineConfig) -> EngineResult<Self> {
        let backend = build_backend(config.backend, config.backend_threads)?;
        Self::with_backend(models, backend, config)
    }

    /// Like [`Engine::new`], but degrades to the scalar backend with a warning.
    pub fn with_fallback(models: Arc<ModelList>, config: EngineConfig) -> EngineResult<Self> {
        let backend = build_backend_or_scalar(config.backend, config.backend_threads);
        Self::with_backend(models, backend, config)
    }

    pub fn with_backend(
        models: Arc<ModelList>,
        backend: Arc<dyn ConvolutionBackend>,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        let tile_pool = if config.jobs > 1 {
            tile_pool_or_sequential(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(config.jobs)
                    .thread_name(|index| format!("planescale-tile-{index}"))
                    .build(),
                config.jobs,
            )
        } else {
            None
        };

        let halo = models.radius();
        debug!(
            layers = models.len(),
            halo,
            backend = backend.name(),
            tile_size = config.tile_size,
            jobs = config.jobs,
            "Engine created"
        );
        Ok(Self {
            models,
            backend,
            tile_size: config.tile_size,
            halo,
            tile_pool,
        })
    }

    pub fn models(&self) -> &ModelList {
        &self.models
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn halo(&self) -> usize {
        self.halo
    }

    pub fn tile_size(&self) -> usize {
        self.tile_size
    }

    pub fn jobs(&self) -> usize {
        self.tile_pool
            .as_ref()
            .map_or(1, rayon::ThreadPool::current_num_threads)
    }

    /// Run the cascade over `plane`. The output has the same dimensions.
    pub fn process(&self, plane: Plane) -> EngineResult<Plane> {
        let (width, height) = (plane.width(), plane.height());
        let span = info_span!("process", width, height, backend = self.backend.name());
        let _enter = span.enter();

        let started = Instant::now();
        let tiles = tile::plan(width, height, self.halo, self.tile_size);
        let tile_count = tiles.len();
        debug!(
            tiles = tile_count,
            core_pixels = tiles.iter().map(TileDescriptor::core_pixels).sum::<usize>(),
            jobs = self.jobs(),
            "Tiles planned"
        );

        let processed = match &self.tile_pool {
            Some(pool) => pool.install(|| {
                tiles
                    .into_par_iter()
                    .map(|tile| self.process_tile(&plane, tile))
                    .collect::<EngineResult<Vec<_>>>()
            })?,
            None => tiles
                .into_iter()
                .map(|tile| self.process_tile(&plane, tile))
                .collect::<EngineResult<Vec<_>>>()?,
        };

        let output = compose(width, height, processed)?;
        info!(
            tiles = tile_count,
            halo = self.halo,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Plane processed"
        );
        Ok(output)
    }

    fn process_tile(
        &self,
        plane: &Plane,
        tile: TileDescriptor,
    ) -> EngineResult<(TileDescriptor, Plane)> {
        let padded = tile::extract(plane, &tile);
        let core = conv::run(&padded, &tile, &self.models, self.backend.as_ref())?;
        Ok((tile, core))
    }
}
