//! Persisted form of a trained model.
//!
//! The engine itself keeps nothing between runs; a caller that wants the
//! final model kept hands the engine an [`ArtifactStore`].

use crate::data::Frequency;
use crate::error::{ForecastError, Result};
use crate::features::FeatureLayout;
use crate::models::{Algorithm, FittedModel};
use crate::request::Hyperparameters;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

/// Everything needed to forecast again from the end of the training data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub engine_version: String,
    pub algorithm: Algorithm,
    pub hyperparameters: Hyperparameters,
    pub layout: FeatureLayout,
    pub frequency: Frequency,
    pub last_timestamp: DateTime<Utc>,
    /// Observed target values, oldest first, from which lag, rolling and
    /// lookback inputs are rebuilt
    pub target_history: Vec<f64>,
    pub model: FittedModel,
}

impl ModelArtifact {
    pub fn file_name(&self) -> String {
        format!("{}.json", self.id)
    }
}

/// Where the outcome points the caller to find the stored model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactReference {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

pub trait ArtifactStore: Send + Sync {
    /// Persist `artifact`, returning where it went if that is a path
    fn save(&self, artifact: &ModelArtifact) -> Result<Option<PathBuf>>;

    fn load(&self, id: &Uuid) -> Result<ModelArtifact>;
}

/// One JSON file per artifact, named `<id>.json`
#[derive(Debug, Clone)]
pub struct FileArtifactStore {
    dir: PathBuf,
}

impl FileArtifactStore {
    /// Use `dir`, creating it if needed
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        info!("Opened artifact store at {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, id: &Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

impl ArtifactStore for FileArtifactStore {
    fn save(&self, artifact: &ModelArtifact) -> Result<Option<PathBuf>> {
        let path = self.dir.join(artifact.file_name());
        let body = serde_json::to_string(artifact)?;
        fs::write(&path, body)?;
        debug!("Saved artifact {} to {}", artifact.id, path.display());
        Ok(Some(path))
    }

    fn load(&self, id: &Uuid) -> Result<ModelArtifact> {
        let path = self.path_of(id);
        if !path.exists() {
            return Err(ForecastError::Validation {
                field: "artifact_id".to_string(),
                message: format!("no artifact {} in {}", id, self.dir.display()),
            });
        }
        let body = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&body)?)
    }
}
