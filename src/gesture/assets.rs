use std::collections::HashMap;
use std::path::{Path, PathBuf};
use log::info;
use serde::Deserialize;

use crate::error::GestureError;

/** Label of any class index the map does not know */
pub const UNKNOWN_LABEL: &str = "Unknown";

pub const LABEL_MAP_FILE: &str = "label_map.json";
pub const SCALER_STATS_FILE: &str = "scaler_stats.json";

/// Class labels ordered by the classifier's output index.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelMap {
    labels: Vec<String>,
}

impl LabelMap {
    /// Parses `{"<label>": <index>, ...}`.
    pub fn from_json(json: &str) -> Result<Self, GestureError> {
        let indexed: HashMap<String, i64> = serde_json::from_str(json)?;
        if indexed.is_empty() {
            return Err(GestureError::EmptyLabels);
        }

        let mut entries: Vec<(i64, String)> = indexed.into_iter().map(|(label, index)| (index, label)).collect();
        entries.sort();

        Ok(LabelMap {
            labels: entries.into_iter().map(|(_, label)| label).collect(),
        })
    }

    pub fn label(&self, index: usize) -> &str {
        self.labels.get(index).map(String::as_str).unwrap_or(UNKNOWN_LABEL)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Standardisation statistics of the training set.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Scaler {
    mean: Vec<f32>,
    std: Vec<f32>,
}

impl Scaler {
    /// Parses `{"mean": [...], "std": [...]}`.
    pub fn from_json(json: &str) -> Result<Self, GestureError> {
        let scaler: Scaler = serde_json::from_str(json)?;
        if scaler.mean.len() != scaler.std.len() {
            return Err(GestureError::FeatureLength { expected: scaler.mean.len(), actual: scaler.std.len() });
        }
        Ok(scaler)
    }

    pub fn features(&self) -> usize {
        self.mean.len()
    }

    /// `(x - mean) / std` per feature; features with zero deviation become 0.
    pub fn normalize(&self, input: &[f32]) -> Result<Vec<f32>, GestureError> {
        if input.len() != self.mean.len() {
            return Err(GestureError::FeatureLength { expected: self.mean.len(), actual: input.len() });
        }

        Ok(input
            .iter()
            .zip(self.mean.iter().zip(&self.std))
            .map(|(x, (mean, std))| if *std != 0.0 { (x - mean) / std } else { 0.0 })
            .collect())
    }
}

/// Everything the recognizer needs besides the classifier, loaded once and passed around.
#[derive(Debug, Clone, PartialEq)]
pub struct GestureAssets {
    pub labels: LabelMap,
    pub scaler: Scaler,
}

fn read_asset(path: PathBuf) -> Result<String, GestureError> {
    std::fs::read_to_string(&path).map_err(|source| GestureError::Asset { path, source })
}

impl GestureAssets {
    /// Reads [`LABEL_MAP_FILE`] and [`SCALER_STATS_FILE`] from `directory`.
    pub fn load(directory: &Path) -> Result<Self, GestureError> {
        let labels = LabelMap::from_json(&read_asset(directory.join(LABEL_MAP_FILE))?)?;
        let scaler = Scaler::from_json(&read_asset(directory.join(SCALER_STATS_FILE))?)?;

        info!("Loaded {} gesture labels and {} scaler features from {}", labels.len(), scaler.features(), directory.to_string_lossy());
        Ok(GestureAssets { labels, scaler })
    }
}
