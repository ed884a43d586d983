use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::engine::events::{EngineEventHub, next_event};
use crate::engine::{
    BuildEngine, BuildOutcome, BuildParams, BuildVersion, EngineHealth, EngineResult,
    EngineStatus, PhotoFolder,
};
use crate::models::{CoreError, CoreErrorKind};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HttpEngineConfig {
    pub base_url: String,
    /// Pause before every engine command.
    pub call_delay: Duration,
    /// Pause after commands the engine applies asynchronously without an event.
    pub settle_delay: Duration,
    pub request_timeout: Duration,
    /// Upper bound on waiting for a completion event; `None` waits indefinitely.
    pub event_timeout: Option<Duration>,
}

impl HttpEngineConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            call_delay: Duration::from_millis(500),
            settle_delay: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
            event_timeout: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
    #[serde(rename = "_Major")]
    major: i64,
    #[serde(rename = "_Minor")]
    minor: i64,
    #[serde(rename = "_Build")]
    build: i64,
    #[serde(rename = "_Revision")]
    revision: i64,
}

#[derive(Debug, Deserialize)]
struct SettingsResponse {
    #[serde(rename = "QueueRecoveryEnabled", default)]
    queue_recovery_enabled: bool,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(rename = "ProjectPath", default)]
    project_path: Option<String>,
    #[serde(rename = "BuildStatus", default)]
    build_status: Option<String>,
    #[serde(rename = "BuildName", default)]
    build_name: Option<String>,
    #[serde(rename = "BuildProgress", default)]
    build_progress: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct BuildVersionResponse {
    #[serde(rename = "Name")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct BuildFinishedPayload {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

enum Method {
    Get,
    Put,
    Post,
}

/// [`BuildEngine`] over the engine's local REST server and its event stream.
pub struct HttpBuildEngine {
    agent: ureq::Agent,
    config: HttpEngineConfig,
    events: EngineEventHub,
}

impl HttpBuildEngine {
    /// Creates the client and starts following the engine event stream.
    pub fn connect(config: HttpEngineConfig) -> EngineResult<Self> {
        let engine = Self::new(config);
        let stream_agent = ureq::AgentBuilder::new()
            .timeout_connect(engine.config.request_timeout)
            .build();
        engine
            .events
            .spawn_reader(stream_agent, engine.url("/Events/All"))
            .map_err(|error| {
                CoreError::internal(format!("failed to start engine event reader: {error}"))
            })?;
        Ok(engine)
    }

    /// Creates the client without an event reader; completion waits rely on events
    /// published to [`HttpBuildEngine::events`].
    pub fn new(config: HttpEngineConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(config.request_timeout)
            .timeout_read(config.request_timeout)
            .build();
        Self {
            agent,
            config,
            events: EngineEventHub::new(),
        }
    }

    pub fn events(&self) -> &EngineEventHub {
        &self.events
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    async fn send(&self, method: Method, path: String, body: Option<String>) -> EngineResult<String> {
        let agent = self.agent.clone();
        let url = self.url(&path);

        tokio::task::spawn_blocking(move || {
            let result = match (method, body) {
                (Method::Get, _) => agent.get(&url).call(),
                (Method::Put, None) => agent.put(&url).call(),
                (Method::Put, Some(body)) => agent
                    .put(&url)
                    .set("Content-Type", "application/json")
                    .send_string(&body),
                (Method::Post, None) => agent.post(&url).call(),
                (Method::Post, Some(body)) => agent
                    .post(&url)
                    .set("Content-Type", "application/json")
                    .send_string(&body),
            };

            let response = result.map_err(|error| request_error(&url, error))?;
            response.into_string().map_err(|error| {
                CoreError::new(
                    CoreErrorKind::EngineFailure,
                    format!("failed to read response from '{url}': {error}"),
                )
            })
        })
        .await
        .map_err(|error| CoreError::internal(format!("engine request task failed: {error}")))?
    }

    async fn command(&self, method: Method, path: String, body: Option<String>) -> EngineResult<String> {
        tokio::time::sleep(self.config.call_delay).await;
        self.send(method, path, body).await
    }

    /// Issues a command and waits for the named completion event.
    async fn command_and_wait(
        &self,
        path: String,
        event_name: &str,
    ) -> EngineResult<serde_json::Value> {
        let mut receiver = self.events.subscribe();
        self.command(Method::Get, path, None).await?;
        let event = next_event(&mut receiver, event_name, self.config.event_timeout).await?;
        event.completion()
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> EngineResult<T> {
        let body = self.command(Method::Get, path.to_string(), None).await?;
        serde_json::from_str(&body).map_err(|error| {
            CoreError::new(
                CoreErrorKind::ParseFailure,
                format!("unexpected engine response for '{path}': {error}"),
            )
        })
    }
}

impl Drop for HttpBuildEngine {
    fn drop(&mut self) {
        self.events.stop();
    }
}

#[async_trait]
impl BuildEngine for HttpBuildEngine {
    async fn health(&self) -> EngineHealth {
        let body = match self
            .send(Method::Get, "/Project/GetVersion".to_string(), None)
            .await
        {
            Ok(body) => body,
            Err(_) => return EngineHealth::unreachable(),
        };

        match serde_json::from_str::<VersionInfo>(&body) {
            Ok(version) => EngineHealth::alive(format!(
                "{}.{}.{}.{}",
                version.major, version.minor, version.build, version.revision
            )),
            Err(_) => EngineHealth {
                alive: true,
                version: None,
            },
        }
    }

    async fn queue_recovery_enabled(&self) -> EngineResult<bool> {
        let body = self.send(Method::Get, "/Settings".to_string(), None).await?;
        let settings: SettingsResponse = serde_json::from_str(&body).map_err(|error| {
            CoreError::new(
                CoreErrorKind::ParseFailure,
                format!("unexpected engine settings response: {error}"),
            )
        })?;
        Ok(settings.queue_recovery_enabled)
    }

    async fn status(&self) -> EngineResult<EngineStatus> {
        let status: StatusResponse = self.get_json("/Project/GetStatus").await?;
        Ok(EngineStatus {
            project_path: status.project_path,
            build_status: status.build_status,
            build_name: status.build_name,
            build_progress: status.build_progress,
        })
    }

    async fn save_project(&self) -> EngineResult<()> {
        self.command_and_wait("/Project/Save/".to_string(), "SaveFinished")
            .await
            .map(|_| ())
    }

    async fn close_project(&self) -> EngineResult<()> {
        self.command(Method::Get, "/Project/CloseProject".to_string(), None)
            .await?;
        tokio::time::sleep(self.config.settle_delay).await;
        Ok(())
    }

    async fn open_project(&self, path: &str) -> EngineResult<()> {
        self.command_and_wait(
            format!("/Project/Open/{}", path_segment(path)),
            "OpenFinished",
        )
        .await
        .map(|_| ())
    }

    async fn new_project(&self, path: &str) -> EngineResult<()> {
        self.command(
            Method::Get,
            format!("/Project/New/{}", path_segment(path)),
            None,
        )
        .await
        .map(|_| ())
    }

    async fn build_versions(&self) -> EngineResult<Vec<BuildVersion>> {
        let versions: Vec<BuildVersionResponse> = self.get_json("/Project/BuildVersions").await?;
        Ok(versions
            .into_iter()
            .map(|version| BuildVersion { name: version.name })
            .collect())
    }

    async fn load_build_version(&self, name: &str) -> EngineResult<()> {
        self.command_and_wait(
            format!(
                "/Project/LoadBuildVersion/{}?saveCurrentBuild=true&forceUpgrade=true",
                path_segment(name)
            ),
            "OpenFinished",
        )
        .await
        .map(|_| ())
    }

    async fn exit_review_mode(&self) -> EngineResult<()> {
        self.command(Method::Get, "/Project/ExitFromReviewMode".to_string(), None)
            .await?;
        tokio::time::sleep(self.config.settle_delay).await;
        Ok(())
    }

    async fn create_build_version(&self, copy_at: bool) -> EngineResult<()> {
        self.command_and_wait(
            format!("/Project/NewBuildVersion/?CopyAT={copy_at}"),
            "NewBuildVersionFinished",
        )
        .await
        .map(|_| ())
    }

    async fn set_max_pool_fusers(&self, count: u32) -> EngineResult<()> {
        self.command(Method::Put, format!("/Build/MaxPoolFusers/{count}"), None)
            .await
            .map(|_| ())
    }

    async fn set_max_aws_fusers(&self, count: u32) -> EngineResult<()> {
        self.command(Method::Put, format!("/Build/MaxAWSFusers/{count}"), None)
            .await
            .map(|_| ())
    }

    async fn set_aws_build_configuration_name(&self, name: &str) -> EngineResult<()> {
        self.command(
            Method::Get,
            format!("/Build/AWSBuildConfigurationName/{}", urlencoding::encode(name)),
            None,
        )
        .await
        .map(|_| ())
    }

    async fn set_aws_build_configuration_json_path(&self, path: &str) -> EngineResult<()> {
        self.command(
            Method::Get,
            format!(
                "/Build/AWSBuildConfigurationJsonPath/{}",
                urlencoding::encode(path)
            ),
            None,
        )
        .await
        .map(|_| ())
    }

    async fn set_aws_fuser_startup_script(&self, script: &str) -> EngineResult<()> {
        self.command(
            Method::Post,
            "/Build/AWSFuserStartupScript".to_string(),
            Some(json_string(script)?),
        )
        .await
        .map(|_| ())
    }

    async fn start_build(&self, params: &BuildParams) -> EngineResult<BuildOutcome> {
        let mut path = format!(
            "/Project/Build/{}?BuildFrom={}&BuildUntil={}",
            urlencoding::encode(&params.preset),
            params.build_from.as_str(),
            params.build_until.as_str()
        );
        if !params.working_folder.is_empty() {
            path.push_str(&format!(
                "&WorkingFolder={}",
                urlencoding::encode(&params.working_folder)
            ));
        }
        if params.clear_errors {
            path.push_str("&ClearErrors=true");
        }

        let mut receiver = self.events.subscribe();
        self.command(Method::Get, path, None).await?;
        let event = next_event(&mut receiver, "BuildFinished", self.config.event_timeout).await?;

        let finished: BuildFinishedPayload = serde_json::from_str(&event.data).map_err(|error| {
            CoreError::new(
                CoreErrorKind::ParseFailure,
                format!("malformed 'BuildFinished' event payload: {error}"),
            )
        })?;

        Ok(match finished.result.as_deref() {
            Some("Success") => BuildOutcome::Success,
            Some("FinishedWithErrors") => BuildOutcome::FinishedWithErrors,
            Some("Cancelled") => BuildOutcome::Cancelled,
            _ => BuildOutcome::Failed(
                finished
                    .message
                    .unwrap_or_else(|| "Build failed".to_string()),
            ),
        })
    }

    async fn cancel_build(&self) -> EngineResult<()> {
        self.command(Method::Get, "/Project/CancelBuild/".to_string(), None)
            .await
            .map(|_| ())
    }

    async fn set_at_area(&self, wkt: &str) -> EngineResult<()> {
        self.command(
            Method::Put,
            "/Project/ATArea/".to_string(),
            Some(json_string(wkt)?),
        )
        .await
        .map(|_| ())
    }

    async fn set_reconstruction_area(&self, wkt: &str) -> EngineResult<()> {
        self.command(
            Method::Put,
            "/Project/ReconstructionArea/".to_string(),
            Some(json_string(wkt)?),
        )
        .await
        .map(|_| ())
    }

    async fn set_reference_project(&self, path: &str) -> EngineResult<()> {
        self.command(
            Method::Get,
            format!(
                "/Project/ReferenceProject?referenceProject={}",
                urlencoding::encode(path)
            ),
            None,
        )
        .await
        .map(|_| ())
    }

    async fn import_gcp(&self, gcp_file_list: &str) -> EngineResult<()> {
        self.command(
            Method::Get,
            format!(
                "/Project/ImportGCP?gcpFileList={}",
                urlencoding::encode(gcp_file_list)
            ),
            None,
        )
        .await
        .map(|_| ())
    }

    async fn load_gcp_list(&self, path: &str, json_api: &str) -> EngineResult<()> {
        self.command(
            Method::Post,
            format!("/Project/LoadGCPList/{}", path_segment(path)),
            Some(json_api.to_string()),
        )
        .await
        .map(|_| ())
    }

    async fn load_photo_folders(&self, folders: &[PhotoFolder]) -> EngineResult<()> {
        let body = serde_json::to_string(folders).map_err(|error| {
            CoreError::invalid_input(format!("failed to encode photo folders: {error}"))
        })?;

        let mut receiver = self.events.subscribe();
        self.command(
            Method::Post,
            "/Project/LoadPhotoFolders".to_string(),
            Some(body),
        )
        .await?;
        let event =
            next_event(&mut receiver, "LoadPhotosFinished", self.config.event_timeout).await?;
        event.completion().map(|_| ())
    }

    async fn import_photos_from_video(
        &self,
        video_path: &str,
        properties: &str,
        focal_length_35: f64,
    ) -> EngineResult<()> {
        self.command(
            Method::Get,
            format!(
                "/Project/ImportPhotosFromVideo?videoFullPath={}&properties={}&focalLength35={}",
                urlencoding::encode(video_path),
                urlencoding::encode(properties),
                focal_length_35
            ),
            None,
        )
        .await
        .map(|_| ())
    }

    async fn load_photos_list(&self, path: &str) -> EngineResult<()> {
        self.command(
            Method::Get,
            format!("/Project/LoadPhotosList/{}", path_segment(path)),
            None,
        )
        .await
        .map(|_| ())
    }

    async fn load_photos_list_csv(&self, path: &str, json_api: &str) -> EngineResult<()> {
        self.command(
            Method::Post,
            format!("/Project/LoadPhotosListCSV/{}", path_segment(path)),
            Some(json_api.to_string()),
        )
        .await
        .map(|_| ())
    }
}

/// The engine decodes file-path segments twice.
fn path_segment(value: &str) -> String {
    urlencoding::encode(&urlencoding::encode(value)).into_owned()
}

fn json_string(value: &str) -> EngineResult<String> {
    serde_json::to_string(value)
        .map_err(|error| CoreError::invalid_input(format!("failed to encode request body: {error}")))
}

fn request_error(url: &str, error: ureq::Error) -> CoreError {
    match error {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            CoreError::new(
                CoreErrorKind::EngineFailure,
                format!("engine returned HTTP {code} for '{url}': {}", body.trim()),
            )
        }
        ureq::Error::Transport(transport) => CoreError::new(
            CoreErrorKind::EngineUnavailable,
            format!("engine unreachable at '{url}': {transport}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_segments_are_double_encoded() {
        assert_eq!(path_segment("C:\\Jobs\\a b"), "C%253A%255CJobs%255Ca%2520b");
    }

    #[test]
    fn base_url_drops_trailing_slash() {
        let config = HttpEngineConfig::new("http://localhost:8087/");
        assert_eq!(config.base_url, "http://localhost:8087");
    }
}
