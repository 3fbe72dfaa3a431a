use std::fs;
use std::sync::Arc;

use planescale_core::backend::{BackendKind, ParallelBackend, ScalarBackend};
use planescale_core::model_store::{self, ModelFormat, WeightDtype};
use planescale_core::tile;
use planescale_core::{
    Activation, Engine, EngineConfig, EngineError, Model, ModelList, Plane,
};

const LEAKY: Activation = Activation::LeakyRelu { slope: 0.1 };

/// Deterministic cascade `1 -> hidden -> hidden -> 1` with 3x3 kernels.
fn cascade(hidden: usize, seed: u32) -> ModelList {
    let mut state = seed.max(1);
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        (state % 1000) as f32 / 1000.0 - 0.5
    };
    let mut layer = |inputs: usize, outputs: usize, activation: Activation| {
        let weights = (0..inputs * outputs * 9).map(|_| next() * 0.4).collect();
        let biases = (0..outputs).map(|_| next() * 0.1).collect();
        Model::new(inputs, outputs, 3, weights, biases, activation).expect("layer")
    };
    ModelList::new(vec![
        layer(1, hidden, LEAKY),
        layer(hidden, hidden, LEAKY),
        layer(hidden, 1, Activation::Identity),
    ])
    .expect("cascade")
}

fn textured_plane(width: usize, height: usize) -> Plane {
    Plane::from_fn(width, height, |(x, y)| {
        (((x * 31 + y * 17) ^ (x * y)) % 97) as f32 / 96.0
    })
}

fn config(tile_size: usize, backend: BackendKind, jobs: usize) -> EngineConfig {
    EngineConfig {
        tile_size,
        backend,
        jobs,
        backend_threads: 2,
    }
}

#[test]
fn tiled_output_matches_whole_plane_output() {
    let models = Arc::new(cascade(4, 7));
    let plane = textured_plane(29, 23);
    let whole = Engine::new(models.clone(), config(0, BackendKind::Scalar, 1))
        .expect("engine")
        .process(plane.clone())
        .expect("whole-plane pass");

    for tile_size in [1, 2, 5, 8, 16, 64] {
        let tiled = Engine::new(models.clone(), config(tile_size, BackendKind::Scalar, 3))
            .expect("engine")
            .process(plane.clone())
            .expect("tiled pass");
        let diff = whole.max_abs_diff(&tiled).expect("same dimensions");
        assert!(diff <= 1e-4, "tile size {tile_size} differs by {diff}");
    }
}

#[test]
fn uniform_input_gives_uniform_output_at_borders() {
    let models = Arc::new(cascade(3, 11));
    let engine = Engine::new(models, config(6, BackendKind::Scalar, 1)).expect("engine");
    let out = engine.process(Plane::filled(17, 13, 0.4)).expect("process");

    let interior = out.get(8, 6);
    for (index, value) in out.to_vec().into_iter().enumerate() {
        assert!(
            (value - interior).abs() <= 1e-6,
            "sample {index} is {value}, interior is {interior}"
        );
    }
}

#[test]
fn identity_layer_reproduces_input() {
    let mut weights = vec![0.0; 9];
    weights[4] = 1.0;
    let layer = Model::new(1, 1, 3, weights, vec![0.0], Activation::Identity).expect("layer");
    let models = Arc::new(ModelList::new(vec![layer]).expect("cascade"));
    let plane = textured_plane(19, 11);

    for tile_size in [0, 3, 7] {
        let engine = Engine::new(models.clone(), config(tile_size, BackendKind::Parallel, 2))
            .expect("engine");
        assert_eq!(engine.process(plane.clone()).expect("process"), plane);
    }
}

#[test]
fn zero_kernel_with_bias_fills_plane_with_bias() {
    let layer = Model::new(1, 1, 3, vec![0.0; 9], vec![0.5], LEAKY).expect("layer");
    let models = Arc::new(ModelList::new(vec![layer]).expect("cascade"));
    let engine = Engine::new(models, config(512, BackendKind::Scalar, 1)).expect("engine");

    let out = engine.process(Plane::filled(4, 4, 0.0)).expect("process");
    assert_eq!((out.width(), out.height()), (4, 4));
    assert!(out.to_vec().iter().all(|v| *v == 0.5));
}

#[test]
fn planner_covers_every_pixel_exactly_once() {
    for (width, height) in [(1, 1), (7, 3), (64, 1), (33, 47), (100, 100)] {
        for max_tile in [0, 1, 4, 9, 32, 128] {
            let mut hits = vec![0u32; width * height];
            for t in tile::plan(width, height, 2, max_tile) {
                assert!(t.core_width >= 1 && t.core_height >= 1);
                if max_tile > 0 {
                    assert!(t.core_width <= max_tile && t.core_height <= max_tile);
                }
                for y in t.origin_y..t.origin_y + t.core_height {
                    for x in t.origin_x..t.origin_x + t.core_width {
                        hits[y * width + x] += 1;
                    }
                }
            }
            assert!(
                hits.iter().all(|&h| h == 1),
                "{width}x{height} with tile size {max_tile}"
            );
        }
    }
}

#[test]
fn scalar_and_parallel_backends_agree() {
    let models = Arc::new(cascade(8, 3));
    let plane = textured_plane(41, 27);

    let scalar = Engine::with_backend(
        models.clone(),
        Arc::new(ScalarBackend),
        config(16, BackendKind::Scalar, 1),
    )
    .expect("scalar engine")
    .process(plane.clone())
    .expect("scalar pass");
    let parallel = Engine::with_backend(
        models,
        Arc::new(ParallelBackend::new(4).expect("pool")),
        config(16, BackendKind::Parallel, 2),
    )
    .expect("parallel engine")
    .process(plane)
    .expect("parallel pass");

    let diff = scalar.max_abs_diff(&parallel).expect("same dimensions");
    assert!(diff <= 1e-5, "backends differ by {diff}");
}

#[test]
fn broken_layer_chain_in_file_is_format_error() {
    // legacy layout: layer 0 is 1->4, layer 1 claims 3 inputs
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&2u32.to_le_bytes());
    for (inputs, outputs) in [(1u32, 4u32), (3, 1)] {
        bytes.extend_from_slice(&inputs.to_le_bytes());
        bytes.extend_from_slice(&outputs.to_le_bytes());
        for _ in 0..(inputs * outputs * 9 + outputs) {
            bytes.extend_from_slice(&0.25f32.to_le_bytes());
        }
    }

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("broken.bin");
    fs::write(&path, &bytes).expect("write model");

    let err = model_store::load(&path).unwrap_err();
    assert!(matches!(err, EngineError::Format(_)), "got {err:?}");
}

#[test]
fn binary_legacy_and_json_layouts_load_identically() {
    let models = cascade(2, 5);
    let dir = tempfile::tempdir().expect("tempdir");

    let v1_path = dir.path().join("model.bin");
    model_store::save(&v1_path, &models, WeightDtype::F32).expect("save v1");

    let mut legacy = Vec::new();
    let mut json_layers = Vec::new();
    legacy.extend_from_slice(&(models.len() as u32).to_le_bytes());
    for layer in models.layers() {
        legacy.extend_from_slice(&(layer.input_channels() as u32).to_le_bytes());
        legacy.extend_from_slice(&(layer.output_channels() as u32).to_le_bytes());
        for v in layer.weights().iter().chain(layer.biases()) {
            legacy.extend_from_slice(&v.to_le_bytes());
        }

        let weight: Vec<Vec<Vec<Vec<f32>>>> = layer
            .weights()
            .outer_iter()
            .map(|per_out| {
                per_out
                    .outer_iter()
                    .map(|kernel| kernel.outer_iter().map(|row| row.to_vec()).collect())
                    .collect()
            })
            .collect();
        json_layers.push(serde_json::json!({
            "nInputPlane": layer.input_channels(),
            "nOutputPlane": layer.output_channels(),
            "kW": 3,
            "kH": 3,
            "weight": weight,
            "bias": layer.biases(),
        }));
    }
    let legacy_path = dir.path().join("legacy_model.bin");
    fs::write(&legacy_path, &legacy).expect("write legacy");
    let json_path = dir.path().join("model.json");
    fs::write(&json_path, serde_json::Value::Array(json_layers).to_string()).expect("write json");

    let (from_v1, v1_format) = model_store::load_with_format(&v1_path).expect("load v1");
    let (from_legacy, legacy_format) =
        model_store::load_with_format(&legacy_path).expect("load legacy");
    let (from_json, json_format) = model_store::load_with_format(&json_path).expect("load json");

    assert_eq!(
        (v1_format, legacy_format, json_format),
        (ModelFormat::V1, ModelFormat::Legacy, ModelFormat::Json)
    );
    // legacy and JSON carry no activation tags: every layer is LeakyReLU(0.1)
    for ((a, b), c) in from_legacy
        .layers()
        .iter()
        .zip(from_json.layers())
        .zip(from_v1.layers())
    {
        assert_eq!(a.weights(), b.weights());
        assert_eq!(a.biases(), b.biases());
        assert_eq!(a.weights(), c.weights());
        assert_eq!(a.biases(), c.biases());
        assert_eq!(a.activation(), LEAKY);
        assert_eq!(b.activation(), LEAKY);
    }
    assert_eq!(from_v1, models);
}

#[test]
fn fallback_engine_keeps_available_parallel_backend() {
    let models = Arc::new(cascade(2, 9));
    let engine = Engine::with_fallback(models, config(0, BackendKind::Parallel, 1))
        .expect("fallback engine");
    assert_eq!(engine.backend_name(), "parallel");
}
