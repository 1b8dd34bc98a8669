//! Wire types of the timeline server. Everything is camelCase JSON.

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct TimelineList {
    #[serde(default)]
    pub timelines: Vec<TimelineInfo>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimelineInfo {
    pub timeline_key: String,
    pub schema: SchemaDescriptor,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub last_change_id: Option<String>,
    #[serde(default)]
    pub environment: Option<EnvironmentInfo>,
}

impl TimelineInfo {
    pub fn device_name(&self) -> Option<&str> {
        self.environment
            .as_ref()
            .and_then(|v| v.device_name.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentInfo {
    #[serde(deserialize_with = "string_or_number")]
    pub environment_id: String,
    #[serde(default)]
    pub device_name: Option<String>,
}

/// One append to a timeline's change log. The server applies it only if its cursor and
/// environment still match the expected values.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRequest {
    pub schema: SchemaDescriptor,
    pub expected_environment_id: String,
    /// Serialized as `null` for a timeline that has no changes yet.
    pub expected_last_change_id: Option<String>,
    pub changes: Vec<Change>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub change_id: Uuid,
    pub change_type: ChangeType,
    pub entity_id: i64,
    #[serde(flatten)]
    pub entity: EntityValues,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum ChangeType {
    Create,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "entityType", content = "newValues", rename_all = "lowercase")]
pub enum EntityValues {
    Group(GroupValues),
    Activity(ActivityValues),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GroupValues {
    pub name: String,
    pub key: String,
    pub color: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActivityValues {
    pub name: String,
    /// Entity id of the group created earlier in the same request.
    pub group_id: i64,
    pub time_interval: TimeInterval,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimeInterval {
    pub start: String,
    /// Whole seconds.
    pub duration: u32,
}

/// Body of a successful change submission. Servers are not required to send one.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChangeResponse {
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub last_change_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TokenReply {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    String(String),
    Number(serde_json::Number),
}

impl From<StringOrNumber> for String {
    fn from(value: StringOrNumber) -> Self {
        match value {
            StringOrNumber::String(v) => v,
            StringOrNumber::Number(v) => v.to_string(),
        }
    }
}

// Servers disagree on whether ids are strings or numbers.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    StringOrNumber::deserialize(deserializer).map(String::from)
}

fn opt_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<StringOrNumber>::deserialize(deserializer)?.map(String::from))
}
