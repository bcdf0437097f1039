use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::UploadError;

static UID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(0|[1-9][0-9]*)(\.(0|[1-9][0-9]*))*$").expect("static UID pattern")
});

// Dot separated numeric components, no leading zeros, at most 64 characters.
pub fn validate_uid(value: &str) -> Result<&str, UploadError> {
    let trimmed = value.trim_end_matches('\0').trim();
    if trimmed.is_empty() || trimmed.len() > 64 || !UID_PATTERN.is_match(trimmed) {
        return Err(UploadError::InvalidUid(value.to_string()));
    }
    Ok(trimmed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataKind {
    RoiSet,
    Annotation,
    QualityControl,
}

impl DataKind {
    pub fn has_regions(self) -> bool {
        matches!(self, DataKind::RoiSet | DataKind::Annotation)
    }

    pub fn resource_format(self) -> &'static str {
        match self {
            DataKind::RoiSet => "RTSTRUCT",
            DataKind::Annotation => "AIM",
            DataKind::QualityControl => "QC",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataKind::RoiSet => write!(f, "roi-set"),
            DataKind::Annotation => write!(f, "annotation"),
            DataKind::QualityControl => write!(f, "quality-control"),
        }
    }
}

impl FromStr for DataKind {
    type Err = UploadError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "roi-set" | "rtstruct" => Ok(DataKind::RoiSet),
            "annotation" | "aim" => Ok(DataKind::Annotation),
            "quality-control" | "qc" => Ok(DataKind::QualityControl),
            _ => Err(UploadError::Format(format!("unknown data kind: {value}"))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySet {
    pub study_uids: BTreeSet<String>,
    pub series_uids: BTreeSet<String>,
    pub sop_instance_uids: BTreeSet<String>,
}

impl DependencySet {
    pub fn is_empty(&self) -> bool {
        self.study_uids.is_empty() && self.series_uids.is_empty() && self.sop_instance_uids.is_empty()
    }
}

/// One subject whose sessions match the referenced studies, with its
/// experiments in repository response order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AmbiguousBinding {
    pub subject_id: String,
    pub subject_label: String,
    pub experiment_ids: Vec<String>,
    pub experiment_labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedBinding {
    pub subject_id: String,
    pub experiment_id: String,
    pub scan_ids: BTreeSet<String>,
    pub file_to_instance_uid: BTreeMap<String, String>,
    pub instance_uid_to_file: BTreeMap<String, String>,
    pub file_to_scan: BTreeMap<String, String>,
}

impl ResolvedBinding {
    pub fn file_for_instance(&self, sop_instance_uid: &str) -> Option<&str> {
        self.instance_uid_to_file
            .get(sop_instance_uid)
            .map(String::as_str)
    }

    pub fn scan_for_file(&self, file_name: &str) -> Option<&str> {
        self.file_to_scan.get(file_name).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingChoice {
    pub subject_id: String,
    pub experiment_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourcePayload {
    File(PathBuf),
    Document(MetadataDocument),
    Bytes(Vec<u8>),
    /// Path of a file the repository already holds.
    Reference(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataDocument {
    pub content_type: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub payload: ResourcePayload,
    pub label: String,
    pub format: String,
    pub content: String,
    pub description: String,
    pub direction: Direction,
    pub file_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessionId(String);

impl AccessionId {
    pub fn generate() -> Self {
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S%3f");
        let random = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("ASSR_{stamp}_{}", &random[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AccessionId {
    type Err = UploadError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        let is_valid = !normalized.is_empty()
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');
        if !is_valid {
            return Err(UploadError::Format(format!("invalid accession id: {value}")));
        }
        Ok(Self(normalized.to_string()))
    }
}
