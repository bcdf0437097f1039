#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::{Value, json};

use assessor_uploader::error::UploadError;
use assessor_uploader::repository::{
    Acknowledgement, RemotePath, RepositoryClient, ResultSet, WriteBody, paths,
};

pub const PROJECT: &str = "PRJ";
pub const STUDY: &str = "1.2.3.100";
pub const SERIES: &str = "1.2.3.100.1";
pub const INSTANCES: [&str; 3] = ["1.2.3.100.1.1", "1.2.3.100.1.2", "1.2.3.100.1.3"];
pub const FRAME: &str = "1.2.3.999";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Query(String),
    Put(String),
    CreateResource(String),
    Download(String),
}

/// In-memory repository that records every request it receives.
#[derive(Default)]
pub struct FakeRepository {
    tables: HashMap<String, ResultSet>,
    documents: HashMap<String, Value>,
    /// Overrides the acknowledgement of the metadata write.
    pub metadata_ack: Option<String>,
    /// Overrides the acknowledgement of every payload write.
    pub payload_ack: Option<String>,
    /// Payload writes whose path contains this text answer with status 500.
    pub fail_payload_containing: Option<String>,
    calls: Mutex<Vec<Call>>,
}

impl FakeRepository {
    pub fn with_table<V: Into<String>>(mut self, path: RemotePath, rows: Vec<Vec<(&str, V)>>) -> Self {
        let rows = rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|(key, value)| (key.to_string(), value.into()))
                    .collect::<BTreeMap<_, _>>()
            })
            .collect();
        self.tables.insert(path.to_string(), ResultSet::new(rows));
        self
    }

    pub fn with_document(mut self, path: RemotePath, document: Value) -> Self {
        self.documents.insert(path.to_string(), document);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| !matches!(call, Call::Query(_) | Call::Download(_)))
            .collect()
    }

    pub fn downloads(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Download(_)))
            .count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl RepositoryClient for FakeRepository {
    fn query_table(&self, path: &RemotePath) -> Result<ResultSet, UploadError> {
        let path = path.to_string();
        self.record(Call::Query(path.clone()));
        Ok(self.tables.get(&path).cloned().unwrap_or_default())
    }

    fn query_document(&self, path: &RemotePath) -> Result<Value, UploadError> {
        let path = path.to_string();
        self.record(Call::Query(path.clone()));
        self.documents
            .get(&path)
            .cloned()
            .ok_or_else(|| UploadError::RepositoryStatus {
                status: 404,
                message: format!("no document at {path}"),
            })
    }

    fn put(&self, path: &RemotePath, _body: WriteBody<'_>) -> Result<Acknowledgement, UploadError> {
        let rendered = path.to_string();
        self.record(Call::Put(rendered.clone()));
        let segments = path.segments();
        let accession = segments
            .iter()
            .position(|segment| segment == "assessors")
            .and_then(|index| segments.get(index + 1))
            .cloned()
            .unwrap_or_default();
        if segments.iter().any(|segment| segment == "resources") {
            if let Some(needle) = &self.fail_payload_containing
                && rendered.contains(needle.as_str())
            {
                return Err(UploadError::RepositoryStatus {
                    status: 500,
                    message: "storage unavailable".to_string(),
                });
            }
            let ack = self.payload_ack.clone().unwrap_or(accession);
            return Ok(Acknowledgement(ack));
        }
        Ok(Acknowledgement(self.metadata_ack.clone().unwrap_or(accession)))
    }

    fn create_resource(&self, path: &RemotePath) -> Result<(), UploadError> {
        self.record(Call::CreateResource(path.to_string()));
        Ok(())
    }

    fn download(&self, path: &RemotePath, destination: &Path) -> Result<(), UploadError> {
        self.record(Call::Download(path.to_string()));
        std::fs::write(destination, b"base image").map_err(|err| UploadError::Filesystem(err.to_string()))
    }
}

/// SUBJ01 / EXP01 holding study STUDY with scan "1" cataloging all INSTANCES.
pub fn single_subject_repository() -> FakeRepository {
    FakeRepository::default()
        .with_table(
            paths::project_experiments(PROJECT),
            vec![vec![
                ("ID", "EXP01"),
                ("label", "MR_01"),
                ("subject_ID", "SUBJ01"),
                ("subject_label", "S01"),
                ("UID", STUDY),
            ]],
        )
        .with_table(
            paths::experiment_scans(PROJECT, "EXP01"),
            vec![vec![("ID", "1"), ("UID", SERIES)]],
        )
        .with_table(
            paths::scan_files(PROJECT, "EXP01", "1"),
            INSTANCES
                .iter()
                .enumerate()
                .map(|(index, uid)| {
                    vec![("Name", format!("IM{}.dcm", index + 1)), ("UID", uid.to_string())]
                })
                .collect(),
        )
        .with_document(paths::subject(PROJECT, "SUBJ01"), subject_document("S01"))
        .with_document(paths::project(PROJECT), project_document())
}

/// Adds a second subject whose session carries the same study.
pub fn two_subject_repository() -> FakeRepository {
    single_subject_repository()
        .with_table(
            paths::project_experiments(PROJECT),
            vec![
                vec![
                    ("ID", "EXP01"),
                    ("label", "MR_01"),
                    ("subject_ID", "SUBJ01"),
                    ("subject_label", "S01"),
                    ("UID", STUDY),
                ],
                vec![
                    ("ID", "EXP02"),
                    ("label", "MR_02"),
                    ("subject_ID", "SUBJ02"),
                    ("subject_label", "S02"),
                    ("UID", STUDY),
                ],
            ],
        )
        .with_table(
            paths::experiment_scans(PROJECT, "EXP02"),
            vec![vec![("ID", "7"), ("UID", SERIES)]],
        )
        .with_table(
            paths::scan_files(PROJECT, "EXP02", "7"),
            vec![
                vec![("Name", "A.dcm"), ("UID", INSTANCES[0])],
                vec![("Name", "B.dcm"), ("UID", INSTANCES[1])],
                vec![("Name", "C.dcm"), ("UID", INSTANCES[2])],
            ],
        )
        .with_document(paths::subject(PROJECT, "SUBJ02"), subject_document("S02"))
}

pub fn subject_document(label: &str) -> Value {
    json!({
        "items": [{
            "data_fields": {"label": label},
            "children": [{
                "field": "demographics",
                "items": [{"data_fields": {"gender": "female", "dob": "1970-01-01"}}]
            }]
        }]
    })
}

pub fn project_document() -> Value {
    json!({
        "items": [{
            "data_fields": {"ID": PROJECT},
            "children": [{
                "field": "PI",
                "items": [{"data_fields": {"firstname": "Ada", "lastname": "Byron"}}]
            }]
        }]
    })
}

/// Manifest referencing every fixture instance, with one square region on the first.
pub fn roi_manifest() -> Value {
    json!({
        "kind": "roi-set",
        "frame_of_reference_uid": FRAME,
        "studies": [{
            "uid": STUDY,
            "series": [{"uid": SERIES, "instances": INSTANCES}]
        }],
        "regions": [{
            "name": "lesion",
            "colour": [0, 255, 0],
            "contours": [{
                "image": INSTANCES[0],
                "points": [[1.0, 1.0, 0.0], [3.0, 1.0, 0.0], [3.0, 3.0, 0.0], [1.0, 3.0, 0.0]]
            }]
        }]
    })
}

pub fn write_manifest(dir: &Path, name: &str, manifest: &Value) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, serde_json::to_vec_pretty(manifest).unwrap()).unwrap();
    path
}
