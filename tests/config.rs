use std::time::Duration;

use assert_matches::assert_matches;

use assessor_uploader::config::{Config, ConfigLoader, CoordinateSpace, default_label_prefix};
use assessor_uploader::error::UploadError;

fn parse(json: &str) -> Config {
    serde_json::from_str(json).unwrap()
}

#[test]
fn minimal_config_uses_defaults() {
    let config = parse(
        r#"{"repository_url": "https://repo.example.org", "user": "alice", "project": "PRJ"}"#,
    );

    let resolved = ConfigLoader::resolve_config(config, None).unwrap();

    assert_eq!(resolved.project, "PRJ");
    assert_eq!(resolved.label_prefix, default_label_prefix());
    assert_eq!(resolved.repository.timeout, Duration::from_secs(60));
    assert!(resolved.repository.password.is_none());
    assert!(resolved.thumbnails.enabled);
    assert_eq!(resolved.thumbnails.coordinates, CoordinateSpace::Patient);
}

#[test]
fn sections_override_defaults() {
    let config = parse(
        r#"{
            "repository_url": "http://localhost:8080/",
            "user": "alice",
            "password": "secret",
            "project": " PRJ ",
            "timeout_secs": 5,
            "batch": {"label_prefix": "qc", "note": "nightly"},
            "thumbnails": {"enabled": false, "coordinates": "pixel"}
        }"#,
    );

    let resolved = ConfigLoader::resolve_config(config, None).unwrap();

    assert_eq!(resolved.repository.base_url, "http://localhost:8080");
    assert_eq!(resolved.repository.password.as_deref(), Some("secret"));
    assert_eq!(resolved.repository.timeout, Duration::from_secs(5));
    assert_eq!(resolved.project, "PRJ");
    assert_eq!(resolved.label_prefix, "qc");
    assert_eq!(resolved.note.as_deref(), Some("nightly"));
    assert!(!resolved.thumbnails.enabled);
    assert_eq!(resolved.thumbnails.coordinates, CoordinateSpace::Pixel);
}

#[test]
fn rejects_non_http_url() {
    let config = parse(r#"{"repository_url": "ftp://repo", "user": "a", "project": "PRJ"}"#);
    let err = ConfigLoader::resolve_config(config, None).unwrap_err();
    assert_matches!(err, UploadError::ConfigParse(_));
}

#[test]
fn rejects_url_without_host() {
    let config = parse(r#"{"repository_url": "http://", "user": "a", "project": "PRJ"}"#);
    let err = ConfigLoader::resolve_config(config, None).unwrap_err();
    assert_matches!(err, UploadError::ConfigParse(_));
}

#[test]
fn rejects_blank_project() {
    let config = parse(r#"{"repository_url": "https://repo", "user": "a", "project": "  "}"#);
    let err = ConfigLoader::resolve_config(config, None).unwrap_err();
    assert_matches!(err, UploadError::ConfigParse(_));
}

#[test]
fn explicit_missing_file_is_a_read_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("nope.json");
    let err = ConfigLoader::resolve(path.to_str()).unwrap_err();
    assert_matches!(err, UploadError::ConfigRead(_));
}

#[test]
fn loads_explicit_file() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("assessor-up.json");
    std::fs::write(
        &path,
        r#"{"repository_url": "https://repo.example.org", "user": "alice", "project": "PRJ"}"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();

    assert_eq!(resolved.repository.user, "alice");
}

#[test]
fn default_locations_start_in_the_working_directory() {
    let locations = ConfigLoader::default_locations();
    assert_eq!(locations[0], std::path::PathBuf::from("assessor-up.json"));
}
