pub mod events;
pub mod http;

pub use events::{EngineEvent, EngineEventHub, SseParser};
pub use http::{HttpBuildEngine, HttpEngineConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::CoreError;

pub type EngineResult<T> = Result<T, CoreError>;

pub const DEFAULT_BUILD_PRESET: &str = "PhotoMesh Default";
pub const DEFAULT_VIDEO_FOCAL_LENGTH_35: f64 = 24.0;

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct EngineHealth {
    pub alive: bool,
    pub version: Option<String>,
}

impl EngineHealth {
    pub fn alive(version: impl Into<String>) -> Self {
        Self {
            alive: true,
            version: Some(version.into()),
        }
    }

    pub fn unreachable() -> Self {
        Self::default()
    }
}

/// Snapshot of what the engine currently has loaded.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub project_path: Option<String>,
    pub build_status: Option<String>,
    pub build_name: Option<String>,
    pub build_progress: Option<f64>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BuildVersion {
    pub name: String,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum BuildStage {
    #[default]
    Auto,
    DataPreparation,
    Aerotriangulation,
    PointCloud,
    ModelCreation,
    Texturing,
    Output,
}

impl BuildStage {
    pub fn from_index(index: i64) -> Option<Self> {
        match index {
            0 => Some(BuildStage::Auto),
            1 => Some(BuildStage::DataPreparation),
            2 => Some(BuildStage::Aerotriangulation),
            3 => Some(BuildStage::PointCloud),
            4 => Some(BuildStage::ModelCreation),
            5 => Some(BuildStage::Texturing),
            6 => Some(BuildStage::Output),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BuildStage::Auto => "Auto",
            BuildStage::DataPreparation => "DataPreparation",
            BuildStage::Aerotriangulation => "Aerotriangulation",
            BuildStage::PointCloud => "PointCloud",
            BuildStage::ModelCreation => "ModelCreation",
            BuildStage::Texturing => "Texturing",
            BuildStage::Output => "Output",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BuildParams {
    pub preset: String,
    pub build_from: BuildStage,
    pub build_until: BuildStage,
    pub working_folder: String,
    pub clear_errors: bool,
}

impl Default for BuildParams {
    fn default() -> Self {
        Self {
            preset: DEFAULT_BUILD_PRESET.to_string(),
            build_from: BuildStage::Auto,
            build_until: BuildStage::Auto,
            working_folder: String::new(),
            clear_errors: false,
        }
    }
}

/// Terminal result reported by the engine once a build stops.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum BuildOutcome {
    Success,
    FinishedWithErrors,
    Cancelled,
    Failed(String),
}

impl BuildOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, BuildOutcome::Success | BuildOutcome::FinishedWithErrors)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PhotoFolder {
    #[serde(rename = "Folder")]
    pub folder: String,
    #[serde(rename = "Properties")]
    pub properties: String,
}

/// Remote capabilities of the photogrammetry build engine. Every call may fail or hang.
#[async_trait]
pub trait BuildEngine: Send + Sync {
    /// Liveness probe; never fails, an unreachable engine reports `alive == false`.
    async fn health(&self) -> EngineHealth;

    async fn queue_recovery_enabled(&self) -> EngineResult<bool>;

    async fn status(&self) -> EngineResult<EngineStatus>;

    async fn save_project(&self) -> EngineResult<()>;

    async fn close_project(&self) -> EngineResult<()>;

    async fn open_project(&self, path: &str) -> EngineResult<()>;

    async fn new_project(&self, path: &str) -> EngineResult<()>;

    async fn build_versions(&self) -> EngineResult<Vec<BuildVersion>>;

    async fn load_build_version(&self, name: &str) -> EngineResult<()>;

    async fn exit_review_mode(&self) -> EngineResult<()>;

    async fn create_build_version(&self, copy_at: bool) -> EngineResult<()>;

    async fn set_max_pool_fusers(&self, count: u32) -> EngineResult<()>;

    async fn set_max_aws_fusers(&self, count: u32) -> EngineResult<()>;

    async fn set_aws_build_configuration_name(&self, name: &str) -> EngineResult<()>;

    async fn set_aws_build_configuration_json_path(&self, path: &str) -> EngineResult<()>;

    async fn set_aws_fuser_startup_script(&self, script: &str) -> EngineResult<()>;

    /// Starts a build and waits until the engine reports it finished.
    async fn start_build(&self, params: &BuildParams) -> EngineResult<BuildOutcome>;

    async fn cancel_build(&self) -> EngineResult<()>;

    async fn set_at_area(&self, wkt: &str) -> EngineResult<()>;

    async fn set_reconstruction_area(&self, wkt: &str) -> EngineResult<()>;

    async fn set_reference_project(&self, path: &str) -> EngineResult<()>;

    async fn import_gcp(&self, gcp_file_list: &str) -> EngineResult<()>;

    async fn load_gcp_list(&self, path: &str, json_api: &str) -> EngineResult<()>;

    async fn load_photo_folders(&self, folders: &[PhotoFolder]) -> EngineResult<()>;

    async fn import_photos_from_video(
        &self,
        video_path: &str,
        properties: &str,
        focal_length_35: f64,
    ) -> EngineResult<()>;

    async fn load_photos_list(&self, path: &str) -> EngineResult<()>;

    async fn load_photos_list_csv(&self, path: &str, json_api: &str) -> EngineResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_indexes_follow_build_pipeline_order() {
        assert_eq!(BuildStage::from_index(0), Some(BuildStage::Auto));
        assert_eq!(BuildStage::from_index(2), Some(BuildStage::Aerotriangulation));
        assert_eq!(BuildStage::from_index(6), Some(BuildStage::Output));
        assert_eq!(BuildStage::from_index(7), None);
        assert_eq!(BuildStage::from_index(-1), None);
    }

    #[test]
    fn finished_with_errors_counts_as_success() {
        assert!(BuildOutcome::Success.is_success());
        assert!(BuildOutcome::FinishedWithErrors.is_success());
        assert!(!BuildOutcome::Cancelled.is_success());
        assert!(!BuildOutcome::Failed("tiles".to_string()).is_success());
    }
}
