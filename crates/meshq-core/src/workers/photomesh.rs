use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::engine::{
    BuildEngine, BuildOutcome, BuildParams, BuildStage, DEFAULT_BUILD_PRESET,
    DEFAULT_VIDEO_FOCAL_LENGTH_35, PhotoFolder,
};
use crate::models::{CoreError, CoreErrorKind, PROJECT_PATH_VAR, TaskLogLevel, TaskRecord};
use crate::notify::QueueEvent;
use crate::workers::params::{self, PhotoMeshParams, PhotoSource};
use crate::workers::{TaskWorker, WorkerContext, WorkerResult, unsupported_action};

pub const PHOTOMESH_TASK_TYPE: &str = "PhotoMesh";

const DEFAULT_PHOTO_LOAD_DELAY: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PhotoMeshAction {
    EmptyProject,
    CreateNewProject,
    NewBuildVersion,
    NewBuildVersionCopyAt,
    Build,
    Pause,
    BuildErrorTiles,
    LoadPhotosListCsv,
    LoadGcpList,
    ImportTrjt,
    LoadGcp,
    LoadPhotos,
    OpenProject,
}

impl PhotoMeshAction {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            -1 => Some(PhotoMeshAction::EmptyProject),
            0 => Some(PhotoMeshAction::CreateNewProject),
            1 => Some(PhotoMeshAction::NewBuildVersion),
            2 => Some(PhotoMeshAction::NewBuildVersionCopyAt),
            3 => Some(PhotoMeshAction::Build),
            4 => Some(PhotoMeshAction::Pause),
            6 => Some(PhotoMeshAction::BuildErrorTiles),
            7 => Some(PhotoMeshAction::LoadPhotosListCsv),
            8 => Some(PhotoMeshAction::LoadGcpList),
            9 => Some(PhotoMeshAction::ImportTrjt),
            10 => Some(PhotoMeshAction::LoadGcp),
            11 => Some(PhotoMeshAction::LoadPhotos),
            12 => Some(PhotoMeshAction::OpenProject),
            _ => None,
        }
    }

    pub fn is_build(self) -> bool {
        matches!(
            self,
            PhotoMeshAction::Build
                | PhotoMeshAction::BuildErrorTiles
                | PhotoMeshAction::NewBuildVersion
                | PhotoMeshAction::NewBuildVersionCopyAt
        )
    }

    fn is_new_build_version(self) -> bool {
        matches!(
            self,
            PhotoMeshAction::NewBuildVersion | PhotoMeshAction::NewBuildVersionCopyAt
        )
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ProjectOperation {
    New,
    Open,
}

/// Drives the photogrammetry engine for `PhotoMesh` tasks.
pub struct PhotoMeshWorker {
    engine: Arc<dyn BuildEngine>,
    photo_load_delay: Duration,
    current: Mutex<Option<PhotoMeshAction>>,
}

impl PhotoMeshWorker {
    pub fn new(engine: Arc<dyn BuildEngine>) -> Self {
        Self {
            engine,
            photo_load_delay: DEFAULT_PHOTO_LOAD_DELAY,
            current: Mutex::new(None),
        }
    }

    pub fn with_photo_load_delay(mut self, delay: Duration) -> Self {
        self.photo_load_delay = delay;
        self
    }

    fn set_current(&self, action: Option<PhotoMeshAction>) {
        let mut guard = self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = action;
    }

    fn current(&self) -> Option<PhotoMeshAction> {
        *self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn run(
        &self,
        ctx: &WorkerContext,
        task: &TaskRecord,
        action: PhotoMeshAction,
    ) -> WorkerResult<()> {
        let params: PhotoMeshParams = params::decode(task)?;

        match action {
            PhotoMeshAction::Pause => {
                ctx.control.pause();
                Ok(())
            }
            PhotoMeshAction::EmptyProject => {
                self.open_or_create(ctx, params.project_path.as_deref(), ProjectOperation::New)
                    .await
            }
            PhotoMeshAction::OpenProject => {
                self.open_or_create(ctx, params.project_path.as_deref(), ProjectOperation::Open)
                    .await
            }
            PhotoMeshAction::CreateNewProject => self.create_new_project(ctx, task, &params).await,
            other => {
                self.ensure_correct_project_open(ctx, task).await?;
                match other {
                    PhotoMeshAction::Build
                    | PhotoMeshAction::BuildErrorTiles
                    | PhotoMeshAction::NewBuildVersion
                    | PhotoMeshAction::NewBuildVersionCopyAt => {
                        self.run_build_action(ctx, task, other, &params).await
                    }
                    PhotoMeshAction::LoadPhotosListCsv => {
                        let path = require(params.file_path.as_deref(), "filePath")?;
                        self.engine
                            .load_photos_list_csv(path, &params.json_api_body())
                            .await
                    }
                    PhotoMeshAction::LoadGcpList => {
                        let path = require(params.file_path.as_deref(), "filePath")?;
                        self.engine
                            .load_gcp_list(path, &params.json_api_body())
                            .await
                    }
                    // trajectory import is accepted and has no engine counterpart
                    PhotoMeshAction::ImportTrjt => Ok(()),
                    PhotoMeshAction::LoadGcp => {
                        let path = require(params.gcp_file_path.as_deref(), "GcpFilePath")?;
                        self.engine.import_gcp(path).await
                    }
                    PhotoMeshAction::LoadPhotos if params.source_path.is_some() => {
                        self.load_photos(&params).await
                    }
                    PhotoMeshAction::LoadPhotos => Ok(()),
                    _ => Err(unsupported_action(PHOTOMESH_TASK_TYPE, task.action)),
                }
            }
        }
    }

    async fn open_or_create(
        &self,
        ctx: &WorkerContext,
        project_path: Option<&str>,
        operation: ProjectOperation,
    ) -> WorkerResult<()> {
        self.engine.save_project().await?;
        self.engine.close_project().await?;

        let target = match project_path {
            Some(path) => path.to_string(),
            None => stored_project_path(ctx).await?.ok_or_else(|| {
                CoreError::invalid_input("Project path not set in global variables")
            })?,
        };

        match operation {
            ProjectOperation::New => self.engine.new_project(&target).await?,
            ProjectOperation::Open => self.engine.open_project(&target).await?,
        }

        if let Some(path) = project_path {
            ctx.gateway
                .set_global_var(
                    ctx.project.id,
                    PROJECT_PATH_VAR,
                    serde_json::Value::String(path.to_string()),
                )
                .await?;
        }
        Ok(())
    }

    async fn create_new_project(
        &self,
        ctx: &WorkerContext,
        task: &TaskRecord,
        params: &PhotoMeshParams,
    ) -> WorkerResult<()> {
        self.open_or_create(ctx, params.project_path.as_deref(), ProjectOperation::New)
            .await?;

        if params.source_path.is_some() {
            self.load_photos(params).await?;
        }
        if let Some(gcp_path) = &params.gcp_path {
            self.engine.import_gcp(gcp_path).await?;
        }
        if let Some(wkt) = &params.at_area_wkt {
            self.engine.set_at_area(wkt).await?;
        }
        if let Some(reference) = &params.reference_project {
            self.engine.set_reference_project(reference).await?;
        }
        if let Some(wkt) = &params.reconstruction_area_wkt {
            self.engine.set_reconstruction_area(wkt).await?;
        }

        if params.build_from != Some(-1) {
            self.start_build(ctx, task, params).await?;
        }
        Ok(())
    }

    /// Reopens the project recorded in the globals when the engine has another one loaded.
    async fn ensure_correct_project_open(
        &self,
        ctx: &WorkerContext,
        task: &TaskRecord,
    ) -> WorkerResult<()> {
        let expected = stored_project_path(ctx)
            .await?
            .ok_or_else(|| CoreError::invalid_input("Project path not set in global variables"))?;

        let loaded = match self.engine.status().await {
            Ok(status) => status.project_path,
            Err(error) => {
                return Err(CoreError::new(
                    error.kind,
                    format!("Failed to ensure correct project is open: {}", error.message),
                ));
            }
        };

        if loaded.as_deref().map(str::trim) != Some(expected.trim()) {
            self.engine.open_project(&expected).await.map_err(|error| {
                CoreError::new(
                    error.kind,
                    format!("Failed to ensure correct project is open: {}", error.message),
                )
            })?;
            ctx.log(task, TaskLogLevel::Info, format!("Opened project: {expected}"))
                .await;
        }
        Ok(())
    }

    async fn run_build_action(
        &self,
        ctx: &WorkerContext,
        task: &TaskRecord,
        action: PhotoMeshAction,
        params: &PhotoMeshParams,
    ) -> WorkerResult<()> {
        self.open_or_create(ctx, params.project_path.as_deref(), ProjectOperation::Open)
            .await?;
        self.load_build_version(params).await?;

        if action == PhotoMeshAction::NewBuildVersion {
            self.engine.exit_review_mode().await?;
        }

        if action.is_new_build_version() {
            if let Some(wkt) = &params.at_area_wkt {
                self.engine.set_at_area(wkt).await?;
            }
            if let Some(reference) = &params.reference_project {
                self.engine.set_reference_project(reference).await?;
            }
        }

        if let Some(wkt) = &params.reconstruction_area_wkt {
            self.engine.set_reconstruction_area(wkt).await?;
        }
        if let Some(gcp_path) = &params.gcp_path {
            self.engine.import_gcp(gcp_path).await?;
        }

        if action.is_new_build_version() {
            self.engine
                .create_build_version(action == PhotoMeshAction::NewBuildVersionCopyAt)
                .await?;
        }

        if params.build_from == Some(-1) {
            return Ok(());
        }
        self.start_build(ctx, task, params).await
    }

    async fn load_build_version(&self, params: &PhotoMeshParams) -> WorkerResult<()> {
        let version = match &params.inherit_build {
            Some(name) => Some(name.clone()),
            None => self
                .engine
                .build_versions()
                .await?
                .pop()
                .map(|version| version.name),
        };

        match version {
            Some(name) => self.engine.load_build_version(&name).await,
            None => Ok(()),
        }
    }

    async fn start_build(
        &self,
        ctx: &WorkerContext,
        task: &TaskRecord,
        params: &PhotoMeshParams,
    ) -> WorkerResult<()> {
        let build = build_params(params)?;

        if let Some(count) = params.max_local_fusers.filter(|count| *count > 0) {
            self.engine.set_max_pool_fusers(fuser_count(count)?).await?;
        }
        if let Some(count) = params.max_aws_fusers.filter(|count| *count > 0) {
            self.engine.set_max_aws_fusers(fuser_count(count)?).await?;
        }
        if let Some(name) = &params.aws_build_configuration_name {
            self.engine.set_aws_build_configuration_name(name).await?;
        }
        if let Some(path) = &params.aws_build_configuration_json_path {
            self.engine
                .set_aws_build_configuration_json_path(path)
                .await?;
        }
        if let Some(script) = &params.aws_fuser_startup_script {
            self.engine.set_aws_fuser_startup_script(script).await?;
        }

        tracing::info!(
            project_id = ctx.project.id.0,
            task_id = task.id.0,
            preset = %build.preset,
            from = build.build_from.as_str(),
            until = build.build_until.as_str(),
            "starting engine build"
        );

        match self.engine.start_build(&build).await? {
            BuildOutcome::Success | BuildOutcome::FinishedWithErrors => Ok(()),
            BuildOutcome::Cancelled => Err(CoreError::cancelled("Build was cancelled")),
            BuildOutcome::Failed(message) => {
                ctx.notifier.broadcast(QueueEvent::BuildFailed {
                    project_id: Some(ctx.project.id),
                    task_id: Some(task.id),
                    message: message.clone(),
                });
                Err(CoreError::new(CoreErrorKind::EngineFailure, message))
            }
        }
    }

    async fn load_photos(&self, params: &PhotoMeshParams) -> WorkerResult<()> {
        let sources = params.source_path.as_deref().unwrap_or_default();

        match params.source_type.unwrap_or(0) {
            0 => {
                let folders = sources
                    .iter()
                    .filter_map(|source| {
                        source.path.as_ref().map(|path| PhotoFolder {
                            folder: path.clone(),
                            properties: source.properties.clone().unwrap_or_default(),
                        })
                    })
                    .collect::<Vec<_>>();
                self.engine
                    .load_photo_folders(&folders)
                    .await
                    .map_err(|error| {
                        CoreError::new(
                            error.kind,
                            format!("Failed to load photos from folders: {}", error.message),
                        )
                    })?;
            }
            1 => {
                let source = first_source(sources)?;
                self.engine
                    .import_photos_from_video(
                        require(source.path.as_deref(), "sourcePath[0].path")?,
                        source.properties.as_deref().unwrap_or_default(),
                        source.focal35.unwrap_or(DEFAULT_VIDEO_FOCAL_LENGTH_35),
                    )
                    .await?;
            }
            2 => {
                let source = first_source(sources)?;
                self.engine
                    .load_photos_list(require(source.path.as_deref(), "sourcePath[0].path")?)
                    .await?;
            }
            other => {
                return Err(CoreError::invalid_input(format!(
                    "Unsupported source type: {other}"
                )));
            }
        }

        tokio::time::sleep(self.photo_load_delay).await;
        Ok(())
    }
}

#[async_trait]
impl TaskWorker for PhotoMeshWorker {
    fn task_type(&self) -> &str {
        PHOTOMESH_TASK_TYPE
    }

    async fn start(&self, ctx: &WorkerContext, task: &TaskRecord) -> WorkerResult<bool> {
        let action = PhotoMeshAction::from_code(task.action)
            .ok_or_else(|| unsupported_action(PHOTOMESH_TASK_TYPE, task.action))?;
        self.set_current(Some(action));

        let result = self.run(ctx, task, action).await;
        if result.is_err() {
            self.set_current(None);
        }
        result.map(|()| true)
    }

    async fn stop(&self) -> WorkerResult<()> {
        self.engine.cancel_build().await
    }

    async fn abort(&self) -> WorkerResult<()> {
        let result = match self.current() {
            Some(action) if action.is_build() => self.engine.cancel_build().await,
            _ => self.engine.close_project().await,
        };
        self.set_current(None);
        result
    }

    fn reset(&self) {
        self.set_current(None);
    }
}

async fn stored_project_path(ctx: &WorkerContext) -> WorkerResult<Option<String>> {
    let globals = ctx.gateway.global_vars(ctx.project.id).await?;
    Ok(globals
        .get(PROJECT_PATH_VAR)
        .and_then(|value| value.as_str())
        .map(str::trim)
        .filter(|path| !path.is_empty())
        .map(str::to_string))
}

pub(crate) fn build_params(params: &PhotoMeshParams) -> WorkerResult<BuildParams> {
    let stage = |index: Option<i64>, field: &str| -> WorkerResult<BuildStage> {
        let index = index.unwrap_or(0);
        BuildStage::from_index(index).ok_or_else(|| {
            CoreError::invalid_input(format!("{field} must be between 0 and 6, got {index}"))
        })
    };

    Ok(BuildParams {
        preset: params
            .preset
            .clone()
            .unwrap_or_else(|| DEFAULT_BUILD_PRESET.to_string()),
        build_from: stage(params.build_from, "buildFrom")?,
        build_until: stage(params.build_until, "buildUntil")?,
        working_folder: params.working_folder.clone().unwrap_or_default(),
        clear_errors: params.clear_errors.unwrap_or(false),
    })
}

fn fuser_count(count: i64) -> WorkerResult<u32> {
    u32::try_from(count)
        .map_err(|_| CoreError::invalid_input(format!("invalid fuser count {count}")))
}

fn require<'a>(value: Option<&'a str>, field: &str) -> WorkerResult<&'a str> {
    value.ok_or_else(|| CoreError::invalid_input(format!("task_params.{field} is required")))
}

fn first_source(sources: &[PhotoSource]) -> WorkerResult<&PhotoSource> {
    sources
        .first()
        .ok_or_else(|| CoreError::invalid_input("task_params.sourcePath is empty"))
}
