use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{EngineError, EngineResult};
use crate::model::ModelList;
use crate::model_store;

/// The cascades a conversion can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    Noise { level: u8 },
    Scale2x,
}

impl ModelKind {
    pub fn file_name(&self) -> String {
        match self {
            Self::Noise { level } => format!("noise{level}_model.bin"),
            Self::Scale2x => "scale2.0x_model.bin".to_string(),
        }
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Noise { level } => write!(f, "noise{level}"),
            Self::Scale2x => write!(f, "scale2x"),
        }
    }
}

/// A weight file found in the models directory.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DiscoveredModel {
    pub filename: String,
    pub size_bytes: u64,
    pub sha256: String,
}

pub struct ModelRegistry {
    models_dir: PathBuf,
    /// Expected SHA-256 hex digests keyed by file name.
    checksums: BTreeMap<String, String>,
}

impl ModelRegistry {
    pub fn new(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            checksums: BTreeMap::new(),
        }
    }

    pub fn with_checksums(mut self, checksums: BTreeMap<String, String>) -> Self {
        self.checksums = checksums
            .into_iter()
            .map(|(name, digest)| (name, digest.trim().to_ascii_lowercase()))
            .collect();
        self
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn path_for(&self, kind: ModelKind) -> PathBuf {
        self.models_dir.join(kind.file_name())
    }

    /// Load the cascade for `kind`, verifying its digest when one is configured.
    pub fn load(&self, kind: ModelKind) -> EngineResult<Arc<ModelList>> {
        let path = self.path_for(kind);
        let filename = kind.file_name();

        match self.checksums.get(&filename) {
            Some(expected) => {
                let actual = sha256_file(&path).map_err(|source| EngineError::NotFound {
                    path: path.clone(),
                    source,
                })?;
                if actual != *expected {
                    return Err(EngineError::format(format!(
                        "SHA256 mismatch for {filename}: expected {expected}, got {actual}"
                    )));
                }
                info!(model = %kind, "Hash verified OK");
            }
            None => {
                warn!(model = %kind, "No SHA256 hash configured, skipping verification");
            }
        }

        let models = model_store::load(&path)?;
        info!(
            model = %kind,
            path = %path.display(),
            layers = models.len(),
            "Model loaded"
        );
        Ok(Arc::new(models))
    }

    /// List `.bin` and `.json` weight files, sorted by name. A missing directory is empty.
    pub fn discover(&self) -> Result<Vec<DiscoveredModel>> {
        let dir = &self.models_dir;
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let read_dir = fs::read_dir(dir)
            .with_context(|| format!("Failed to read models directory: {}", dir.display()))?;

        let mut found = Vec::new();
        for entry in read_dir {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            let is_weights = path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("bin") || ext.eq_ignore_ascii_case("json"))
                .unwrap_or(false);
            if !is_weights {
                continue;
            }

            let filename = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };

            let size_bytes = entry
                .metadata()
                .with_context(|| format!("Cannot stat {}", path.display()))?
                .len();
            let sha256 =
                sha256_file(&path).with_context(|| format!("Cannot hash {}", path.display()))?;

            found.push(DiscoveredModel {
                filename,
                size_bytes,
                sha256,
            });
        }

        found.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(found)
    }
}

pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.write_all(&buf[..n])?;
    }
    let hash = hasher.finalize();
    Ok(format!("{hash:x}"))
}
