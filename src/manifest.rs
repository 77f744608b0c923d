//! Reads back what the tensorflowjs converter wrote. The converter exiting cleanly isn't quite
//! enough to say the model is usable in the browser: `model.json` has to be there, be a graph
//! model and every weight shard it points to has to exist.
use crate::error::ConvertError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Name of the topology/manifest file in a tfjs model directory
pub const MANIFEST_FILE: &str = "model.json";

/// `model.json` as written by the tfjs converter. The topology is kept opaque, we only care it's
/// there.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelJson {
    pub format: Option<String>,
    pub generated_by: Option<String>,
    pub converted_by: Option<String>,
    pub model_topology: Option<serde_json::Value>,
    #[serde(default)]
    pub weights_manifest: Vec<WeightGroup>,
}

/// One group of weights, split across one or more shard files
#[derive(Debug, Clone, Deserialize)]
pub struct WeightGroup {
    pub paths: Vec<String>,
    #[serde(default)]
    pub weights: Vec<WeightEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeightEntry {
    pub name: String,
    #[serde(default)]
    pub shape: Vec<u64>,
    pub dtype: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestSummary {
    pub manifest: PathBuf,
    pub converted_by: Option<String>,
    pub shards: usize,
    pub shard_bytes: u64,
    pub weights: usize,
}

fn invalid(path: &Path, reason: impl Into<String>) -> ConvertError {
    ConvertError::InvalidOutput {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Checks `output_dir` holds a loadable tfjs graph model
pub fn verify(output_dir: impl AsRef<Path>) -> Result<ManifestSummary, ConvertError> {
    let output_dir = output_dir.as_ref();
    let manifest = output_dir.join(MANIFEST_FILE);

    let text = fs::read_to_string(&manifest)
        .map_err(|e| invalid(output_dir, format!("can't read {}: {}", MANIFEST_FILE, e)))?;
    let model: ModelJson = serde_json::from_str(&text)
        .map_err(|e| invalid(output_dir, format!("malformed {}: {}", MANIFEST_FILE, e)))?;

    match model.format.as_deref() {
        Some("graph-model") => {}
        Some(f) => return Err(invalid(output_dir, format!("expected a graph-model not '{}'", f))),
        None => return Err(invalid(output_dir, "manifest has no format")),
    }
    if model.model_topology.is_none() {
        return Err(invalid(output_dir, "manifest has no model topology"));
    }

    let mut shards = 0;
    let mut shard_bytes = 0;
    for path in model.weights_manifest.iter().flat_map(|x| x.paths.iter()) {
        let shard = output_dir.join(path);
        let meta = fs::metadata(&shard)
            .map_err(|_| invalid(output_dir, format!("missing weight shard {}", path)))?;
        debug!("{}: {} bytes", shard.display(), meta.len());
        shards += 1;
        shard_bytes += meta.len();
    }

    Ok(ManifestSummary {
        manifest,
        converted_by: model.converted_by,
        shards,
        shard_bytes,
        weights: model.weights_manifest.iter().map(|x| x.weights.len()).sum(),
    })
}
