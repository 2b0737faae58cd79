use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::EtlResult;
use crate::types::DataType;

/// Reference to another entity by id and display name.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EntityRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
}

impl EntityRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            name: name.into(),
        }
    }
}

/// Label credit of a release.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LabelRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catno: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Track {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ArtistRecord {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub real_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub name_variations: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<EntityRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<EntityRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<EntityRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_quality: Option<String>,
    /// Fields without a typed counterpart, kept verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ArtistRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LabelRecord {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_label: Option<EntityRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sublabels: Vec<EntityRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_quality: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl LabelRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MasterRecord {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_release: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artists: Vec<EntityRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub genres: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub styles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_quality: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl MasterRecord {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReleaseRecord {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artists: Vec<EntityRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<LabelRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub genres: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub styles: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tracklist: Vec<Track>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_quality: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ReleaseRecord {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            ..Default::default()
        }
    }
}

/// Attributes of a record, one strongly typed variant per data type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "attributes", rename_all = "snake_case")]
pub enum RecordPayload {
    Artist(ArtistRecord),
    Label(LabelRecord),
    Master(MasterRecord),
    Release(ReleaseRecord),
}

impl RecordPayload {
    pub fn data_type(&self) -> DataType {
        match self {
            RecordPayload::Artist(_) => DataType::Artists,
            RecordPayload::Label(_) => DataType::Labels,
            RecordPayload::Master(_) => DataType::Masters,
            RecordPayload::Release(_) => DataType::Releases,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            RecordPayload::Artist(record) => &record.id,
            RecordPayload::Label(record) => &record.id,
            RecordPayload::Master(record) => &record.id,
            RecordPayload::Release(record) => &record.id,
        }
    }

    /// Display name of the entity, the title for masters and releases.
    pub fn display_name(&self) -> &str {
        match self {
            RecordPayload::Artist(record) => &record.name,
            RecordPayload::Label(record) => &record.name,
            RecordPayload::Master(record) => &record.title,
            RecordPayload::Release(record) => &record.title,
        }
    }
}

impl From<ArtistRecord> for RecordPayload {
    fn from(value: ArtistRecord) -> Self {
        RecordPayload::Artist(value)
    }
}

impl From<LabelRecord> for RecordPayload {
    fn from(value: LabelRecord) -> Self {
        RecordPayload::Label(value)
    }
}

impl From<MasterRecord> for RecordPayload {
    fn from(value: MasterRecord) -> Self {
        RecordPayload::Master(value)
    }
}

impl From<ReleaseRecord> for RecordPayload {
    fn from(value: ReleaseRecord) -> Self {
        RecordPayload::Release(value)
    }
}

/// Hex encoded SHA-256 of the canonical JSON form of `payload`.
///
/// Object keys are emitted in sorted order so equal content always hashes equally.
pub fn content_hash(payload: &RecordPayload) -> EtlResult<String> {
    let canonical = canonicalize(serde_json::to_value(payload)?);
    let bytes = serde_json::to_vec(&canonical)?;

    Ok(hex::encode(Sha256::digest(&bytes)))
}

fn canonicalize(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<String, serde_json::Value> = map
                .into_iter()
                .map(|(key, value)| (key, canonicalize(value)))
                .collect();
            serde_json::Value::Object(sorted.into_iter().collect())
        }
        serde_json::Value::Array(values) => {
            serde_json::Value::Array(values.into_iter().map(canonicalize).collect())
        }
        other => other,
    }
}

/// A record decoded from a dump, identified by `(data_type, id)` and deduplicated by `hash`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub data_type: DataType,
    pub id: String,
    pub hash: String,
    pub payload: RecordPayload,
}

impl ExtractedRecord {
    /// Builds a record and computes its content hash.
    pub fn new(payload: impl Into<RecordPayload>) -> EtlResult<Self> {
        let payload = payload.into();
        let hash = content_hash(&payload)?;

        Ok(Self {
            data_type: payload.data_type(),
            id: payload.id().to_string(),
            hash,
            payload,
        })
    }

    /// Replaces the computed hash, for records whose hash is known upfront.
    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = hash.into();
        self
    }
}
