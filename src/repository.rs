use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::path::Path;
use std::thread;
use std::time::Duration;

use reqwest::Url;
use reqwest::blocking::{Body, Client, RequestBuilder, Response};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use tracing::debug;

use crate::config::RepositorySettings;
use crate::domain::MetadataDocument;
use crate::error::UploadError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSet {
    rows: Vec<BTreeMap<String, String>>,
}

impl ResultSet {
    pub fn new(rows: Vec<BTreeMap<String, String>>) -> Self {
        Self { rows }
    }

    /// Parses `{"ResultSet": {"Result": [{...}, ...]}}`. Non-string cells are
    /// rendered with their JSON text, nulls become empty strings.
    pub fn from_json(value: &Value) -> Result<Self, UploadError> {
        let results = value
            .get("ResultSet")
            .and_then(|set| set.get("Result"))
            .and_then(|result| result.as_array())
            .ok_or_else(|| {
                UploadError::RepositoryHttp("response is not a ResultSet table".to_string())
            })?;

        let rows = results
            .iter()
            .filter_map(|row| row.as_object())
            .map(|row| {
                row.iter()
                    .map(|(key, cell)| {
                        let text = match cell {
                            Value::String(text) => text.clone(),
                            Value::Null => String::new(),
                            other => other.to_string(),
                        };
                        (key.clone(), text)
                    })
                    .collect()
            })
            .collect();
        Ok(Self { rows })
    }

    pub fn rows(&self) -> &[BTreeMap<String, String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub enum WriteBody<'a> {
    Document(&'a MetadataDocument),
    File(&'a Path),
    Bytes { data: &'a [u8], content_type: &'a str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgement(pub String);

impl Acknowledgement {
    pub fn as_str(&self) -> &str {
        self.0.trim()
    }

    pub fn echoes(&self, accession: &str) -> bool {
        self.as_str() == accession
    }

    pub fn is_error_marker(&self) -> bool {
        let text = self.as_str().to_ascii_lowercase();
        text.starts_with("<!doctype html")
            || text.starts_with("<html")
            || text.starts_with("error")
            || text.contains("<title>error")
            || text.contains("exception")
    }
}

/// A repository location: path segments below the base URL plus query pairs.
/// Segments are kept verbatim and percent-encoded only when the URL is built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemotePath {
    segments: Vec<String>,
    query: Vec<(String, String)>,
}

impl RemotePath {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
            query: Vec::new(),
        }
    }

    /// Child location. The query of `self` is not carried over.
    pub fn join<I, S>(&self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut child = Self::new(self.segments.iter().cloned());
        child.segments.extend(segments.into_iter().map(Into::into));
        child
    }

    pub fn with_query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Appends the segments to `base`. The query is left to the request builder.
    pub fn resolve(&self, base: &Url) -> Result<Url, UploadError> {
        let mut url = base.clone();
        url.path_segments_mut()
            .map_err(|()| UploadError::RepositoryHttp(format!("{base} cannot hold a path")))?
            .pop_if_empty()
            .extend(&self.segments);
        Ok(url)
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut url = Url::parse("http://repository.invalid/").map_err(|_| fmt::Error)?;
        url.path_segments_mut()
            .map_err(|()| fmt::Error)?
            .clear()
            .extend(&self.segments);
        if !self.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&self.query);
        }
        f.write_str(url.path())?;
        if let Some(query) = url.query() {
            write!(f, "?{query}")?;
        }
        Ok(())
    }
}

pub trait RepositoryClient: Send + Sync {
    fn query_table(&self, path: &RemotePath) -> Result<ResultSet, UploadError>;
    fn query_document(&self, path: &RemotePath) -> Result<Value, UploadError>;
    fn put(&self, path: &RemotePath, body: WriteBody<'_>) -> Result<Acknowledgement, UploadError>;
    /// Creates (or re-creates) a resource folder. Must precede payload writes into it.
    fn create_resource(&self, path: &RemotePath) -> Result<(), UploadError>;
    fn download(&self, path: &RemotePath, destination: &Path) -> Result<(), UploadError>;
}

pub mod paths {
    use super::RemotePath;

    fn project_root(project: &str) -> RemotePath {
        RemotePath::new(["data", "archive", "projects", project])
    }

    fn listing(path: RemotePath, columns: &str) -> RemotePath {
        path.with_query("format", "json").with_query("columns", columns)
    }

    pub fn project_experiments(project: &str) -> RemotePath {
        listing(
            project_root(project).join(["experiments"]),
            "ID,label,subject_ID,subject_label,UID",
        )
    }

    pub fn experiment_scans(project: &str, experiment: &str) -> RemotePath {
        listing(
            project_root(project).join(["experiments", experiment, "scans"]),
            "ID,UID",
        )
    }

    pub fn scan_files(project: &str, experiment: &str, scan: &str) -> RemotePath {
        listing(
            project_root(project).join(["experiments", experiment, "scans", scan, "resources", "DICOM", "files"]),
            "Name,UID",
        )
    }

    pub fn scan_file(project: &str, experiment: &str, scan: &str, name: &str) -> RemotePath {
        project_root(project).join(["experiments", experiment, "scans", scan, "resources", "DICOM", "files", name])
    }

    pub fn subject(project: &str, subject: &str) -> RemotePath {
        project_root(project)
            .join(["subjects", subject])
            .with_query("format", "json")
    }

    pub fn project(project: &str) -> RemotePath {
        project_root(project).with_query("format", "json")
    }

    pub fn assessor(project: &str, subject: &str, experiment: &str, accession: &str) -> RemotePath {
        project_root(project).join(["subjects", subject, "experiments", experiment, "assessors", accession])
    }

    pub fn assessor_document(assessor: &RemotePath) -> RemotePath {
        assessor.clone().with_query("inbody", "true")
    }

    pub fn assessor_resource(assessor: &RemotePath, label: &str) -> RemotePath {
        assessor.join(["resources", label])
    }

    pub fn assessor_resource_file(assessor: &RemotePath, label: &str, file_name: &str) -> RemotePath {
        assessor
            .join(["resources", label, "files", file_name])
            .with_query("inbody", "true")
    }
}

#[derive(Clone)]
pub struct RepositoryHttpClient {
    client: Client,
    base_url: Url,
    user: String,
    password: Option<String>,
}

impl RepositoryHttpClient {
    pub fn new(settings: &RepositorySettings) -> Result<Self, UploadError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("assessor-up/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| UploadError::RepositoryHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(settings.timeout)
            .build()
            .map_err(|err| UploadError::RepositoryHttp(err.to_string()))?;
        let base_url = Url::parse(&settings.base_url).map_err(|err| {
            UploadError::RepositoryHttp(format!("invalid repository url {}: {err}", settings.base_url))
        })?;
        Ok(Self {
            client,
            base_url,
            user: settings.user.clone(),
            password: settings.password.clone(),
        })
    }

    fn authed(&self, request: RequestBuilder, path: &RemotePath) -> RequestBuilder {
        request
            .query(path.query())
            .basic_auth(&self.user, self.password.as_deref())
    }

    fn handle_status(response: Response) -> Result<Response, UploadError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "repository request failed".to_string());
        Err(UploadError::RepositoryStatus { status, message })
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, UploadError>
    where
        F: FnMut() -> RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(UploadError::RepositoryHttp(err.to_string()));
                }
            }
        }
    }

    fn send_once(request: RequestBuilder) -> Result<Response, UploadError> {
        request
            .send()
            .map_err(|err| UploadError::RepositoryHttp(err.to_string()))
    }

    fn get(&self, path: &RemotePath) -> Result<Response, UploadError> {
        let url = path.resolve(&self.base_url)?;
        debug!(%url, "repository query");
        let response = self.send_with_retries(|| self.authed(self.client.get(url.clone()), path))?;
        Self::handle_status(response)
    }
}

impl RepositoryClient for RepositoryHttpClient {
    fn query_table(&self, path: &RemotePath) -> Result<ResultSet, UploadError> {
        let value = self.query_document(path)?;
        ResultSet::from_json(&value)
    }

    fn query_document(&self, path: &RemotePath) -> Result<Value, UploadError> {
        self.get(path)?
            .json()
            .map_err(|err| UploadError::RepositoryHttp(err.to_string()))
    }

    fn put(&self, path: &RemotePath, body: WriteBody<'_>) -> Result<Acknowledgement, UploadError> {
        let url = path.resolve(&self.base_url)?;
        debug!(%url, "repository write");
        let request = self.authed(self.client.put(url), path);
        let request = match body {
            WriteBody::Document(document) => request
                .header(CONTENT_TYPE, document.content_type.as_str())
                .body(document.body.clone()),
            WriteBody::File(file_path) => {
                let file = File::open(file_path).map_err(|err| UploadError::io(file_path, err))?;
                request
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .body(Body::from(file))
            }
            WriteBody::Bytes { data, content_type } => request
                .header(CONTENT_TYPE, content_type)
                .body(data.to_vec()),
        };
        let response = Self::handle_status(Self::send_once(request)?)?;
        let text = response
            .text()
            .map_err(|err| UploadError::RepositoryHttp(err.to_string()))?;
        Ok(Acknowledgement(text))
    }

    fn create_resource(&self, path: &RemotePath) -> Result<(), UploadError> {
        let url = path.resolve(&self.base_url)?;
        debug!(%url, "repository create resource");
        let request = self.authed(self.client.put(url), path);
        Self::handle_status(Self::send_once(request)?)?;
        Ok(())
    }

    fn download(&self, path: &RemotePath, destination: &Path) -> Result<(), UploadError> {
        let mut response = self.get(path)?;
        let mut file =
            File::create(destination).map_err(|err| UploadError::io(destination, err))?;
        std::io::copy(&mut response, &mut file).map_err(|err| UploadError::io(destination, err))?;
        Ok(())
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_result_set_rows() {
        let value = serde_json::json!({
            "ResultSet": {
                "Result": [
                    {"ID": "EXP01", "subject_ID": "SUBJ01", "UID": "1.2.3", "size": 4},
                    {"ID": "EXP02", "subject_ID": "SUBJ02", "UID": null}
                ],
                "totalRecords": "2"
            }
        });
        let table = ResultSet::from_json(&value).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows()[0]["size"], "4");
        assert_eq!(table.rows()[1]["UID"], "");
    }

    #[test]
    fn rejects_non_table_documents() {
        let value = serde_json::json!({"items": []});
        assert!(ResultSet::from_json(&value).is_err());
    }

    #[test]
    fn segments_are_encoded_individually() {
        let base = Url::parse("https://repo.example.org/xnat").unwrap();
        let path = paths::assessor_resource_file(
            &paths::assessor("PRJ", "SUBJ01", "EXP01", "ASSR_1"),
            "RTSTRUCT",
            "scan #2?.json",
        );

        let url = path.resolve(&base).unwrap();

        assert_eq!(url.path_segments().unwrap().last(), Some("scan%20%232%3F.json"));
        assert!(url.path().starts_with("/xnat/data/archive/projects/PRJ/"));
        assert_eq!(url.fragment(), None);
        assert_eq!(path.last_segment(), Some("scan #2?.json"));
        assert!(path.to_string().ends_with("/files/scan%20%232%3F.json?inbody=true"));
    }

    #[test]
    fn listing_paths_carry_their_query() {
        let path = paths::experiment_scans("PRJ", "EXP01");
        assert_eq!(
            path.query(),
            [
                ("format".to_string(), "json".to_string()),
                ("columns".to_string(), "ID,UID".to_string())
            ]
        );
        assert_eq!(
            path.to_string(),
            "/data/archive/projects/PRJ/experiments/EXP01/scans?format=json&columns=ID%2CUID"
        );
    }

    #[test]
    fn acknowledgement_markers() {
        let ack = Acknowledgement("ASSR_1\n".to_string());
        assert!(ack.echoes("ASSR_1"));
        assert!(!ack.is_error_marker());
        assert!(Acknowledgement("<html><title>Error 500</title>".to_string()).is_error_marker());
        assert!(Acknowledgement("Error: duplicate label".to_string()).is_error_marker());
    }
}
