//! Typed views over the schemaless `task_params` payload.
//!
//! Substitution turns every resolved token into a string, so numeric and boolean fields
//! also accept their textual form. Blank strings count as absent.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::models::{CoreError, CoreErrorKind, TaskRecord};

/// Decodes a task's params into `T`, naming the task in the error.
pub fn decode<T: DeserializeOwned>(task: &TaskRecord) -> Result<T, CoreError> {
    let params = match &task.task_params {
        Value::Null => Value::Object(serde_json::Map::new()),
        other => other.clone(),
    };
    serde_json::from_value(params).map_err(|error| {
        CoreError::new(
            CoreErrorKind::InvalidInput,
            format!("invalid task_params for task {}: {error}", task.label()),
        )
        .for_task(task.id)
    })
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct PhotoSource {
    #[serde(default, deserialize_with = "lenient_string")]
    pub path: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub properties: Option<String>,
    #[serde(default, alias = "focalLength35", deserialize_with = "lenient_f64")]
    pub focal35: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoMeshParams {
    #[serde(default, deserialize_with = "lenient_string")]
    pub project_path: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub inherit_build: Option<String>,

    #[serde(default, deserialize_with = "lenient_string")]
    pub preset: Option<String>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub build_from: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub build_until: Option<i64>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub working_folder: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub clear_errors: Option<bool>,

    #[serde(default, rename = "MaxLocalFusers", deserialize_with = "lenient_i64")]
    pub max_local_fusers: Option<i64>,
    #[serde(default, rename = "MaxAWSFusers", deserialize_with = "lenient_i64")]
    pub max_aws_fusers: Option<i64>,
    #[serde(
        default,
        rename = "AWSBuildConfigurationName",
        deserialize_with = "lenient_string"
    )]
    pub aws_build_configuration_name: Option<String>,
    #[serde(
        default,
        rename = "AWSBuildConfigurationJsonPath",
        deserialize_with = "lenient_string"
    )]
    pub aws_build_configuration_json_path: Option<String>,
    #[serde(
        default,
        rename = "AWSFuserStartupScript",
        deserialize_with = "lenient_string"
    )]
    pub aws_fuser_startup_script: Option<String>,

    #[serde(
        default,
        rename = "ATAreaWkt",
        alias = "AtAreaWkt",
        deserialize_with = "lenient_string"
    )]
    pub at_area_wkt: Option<String>,
    #[serde(
        default,
        rename = "ReconstructionAreaWkt",
        deserialize_with = "lenient_string"
    )]
    pub reconstruction_area_wkt: Option<String>,
    #[serde(default, rename = "ReferenceProject", deserialize_with = "lenient_string")]
    pub reference_project: Option<String>,

    #[serde(default, deserialize_with = "lenient_string")]
    pub gcp_path: Option<String>,
    #[serde(default, rename = "GcpFilePath", deserialize_with = "lenient_string")]
    pub gcp_file_path: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub file_path: Option<String>,
    #[serde(default, rename = "jsonAPI")]
    pub json_api: Option<Value>,

    #[serde(default, deserialize_with = "lenient_i64")]
    pub source_type: Option<i64>,
    #[serde(default)]
    pub source_path: Option<Vec<PhotoSource>>,
}

impl PhotoMeshParams {
    /// `jsonAPI` as request body text; strings are passed through unchanged.
    pub fn json_api_body(&self) -> String {
        match &self.json_api {
            None | Some(Value::Null) => "{}".to_string(),
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ScriptParams {
    /// Comma-separated script path followed by its arguments.
    #[serde(default, deserialize_with = "lenient_string")]
    pub path: Option<String>,
}

fn blank_to_none(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => blank_to_none(&text),
        Some(Value::Number(number)) => Some(number.to_string()),
        Some(Value::Bool(flag)) => Some(flag.to_string()),
        Some(other) => {
            return Err(serde::de::Error::custom(format!(
                "expected a string, found {other}"
            )));
        }
    })
}

pub fn lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(number)) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|value| value as i64))
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid integer {number}"))),
        Some(Value::String(text)) => match blank_to_none(&text) {
            None => Ok(None),
            Some(text) => text
                .parse::<i64>()
                .map(Some)
                .map_err(|_| serde::de::Error::custom(format!("invalid integer '{text}'"))),
        },
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected an integer, found {other}"
        ))),
    }
}

pub fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(number)) => Ok(number.as_f64()),
        Some(Value::String(text)) => match blank_to_none(&text) {
            None => Ok(None),
            Some(text) => text
                .parse::<f64>()
                .map(Some)
                .map_err(|_| serde::de::Error::custom(format!("invalid number '{text}'"))),
        },
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected a number, found {other}"
        ))),
    }
}

pub fn lenient_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(flag)) => Ok(Some(flag)),
        Some(Value::Number(number)) => Ok(Some(number.as_f64().unwrap_or(0.0) != 0.0)),
        Some(Value::String(text)) => match text.trim().to_ascii_lowercase().as_str() {
            "" => Ok(None),
            "true" | "1" | "yes" => Ok(Some(true)),
            "false" | "0" | "no" => Ok(Some(false)),
            other => Err(serde::de::Error::custom(format!("invalid boolean '{other}'"))),
        },
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected a boolean, found {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn parse(value: Value) -> PhotoMeshParams {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn numeric_strings_are_accepted() {
        let params = parse(json!({
            "buildFrom": "2",
            "buildUntil": 6,
            "MaxLocalFusers": "12",
            "clearErrors": "true",
        }));

        assert_eq!(params.build_from, Some(2));
        assert_eq!(params.build_until, Some(6));
        assert_eq!(params.max_local_fusers, Some(12));
        assert_eq!(params.clear_errors, Some(true));
    }

    #[test]
    fn blank_strings_count_as_absent() {
        let params = parse(json!({ "inheritBuild": " ", "projectPath": "" }));
        assert_eq!(params.inherit_build, None);
        assert_eq!(params.project_path, None);
    }

    #[test]
    fn at_area_accepts_both_spellings() {
        assert_eq!(
            parse(json!({ "AtAreaWkt": "POLYGON((0 0,1 0,1 1,0 0))" })).at_area_wkt,
            Some("POLYGON((0 0,1 0,1 1,0 0))".to_string())
        );
        assert!(parse(json!({ "ATAreaWkt": "POLYGON EMPTY" })).at_area_wkt.is_some());
    }

    #[test]
    fn photo_sources_read_focal_length_aliases() {
        let params = parse(json!({
            "sourceType": 1,
            "sourcePath": [{ "path": "D:/flight.mp4", "focalLength35": "28" }],
        }));
        let sources = params.source_path.unwrap();
        assert_eq!(sources[0].focal35, Some(28.0));
    }

    #[test]
    fn json_api_objects_are_serialised() {
        let params = parse(json!({ "jsonAPI": { "headersAtRow": 1 } }));
        assert_eq!(params.json_api_body(), r#"{"headersAtRow":1}"#);
    }

    #[test]
    fn non_numeric_build_stage_is_rejected() {
        let result: Result<PhotoMeshParams, _> =
            serde_json::from_value(json!({ "buildFrom": "later" }));
        assert!(result.is_err());
    }
}
