use assert_matches::assert_matches;

use assessor_uploader::domain::{AccessionId, DataKind, validate_uid};
use assessor_uploader::error::UploadError;

#[test]
fn accepts_dicom_uids() {
    assert_eq!(validate_uid("1.2.840.10008.5.1.4.1.1.481.3").unwrap(), "1.2.840.10008.5.1.4.1.1.481.3");
    assert_eq!(validate_uid("1.2.3\0").unwrap(), "1.2.3");
    assert_eq!(validate_uid("0.1").unwrap(), "0.1");
}

#[test]
fn rejects_malformed_uids() {
    let too_long = format!("{}1", "1.".repeat(40));
    for bad in ["", "1..2", "1.02", "a.1", "1.2.", too_long.as_str()] {
        assert_matches!(validate_uid(bad), Err(UploadError::InvalidUid(_)), "{bad}");
    }
}

#[test]
fn data_kind_formats() {
    assert_eq!(DataKind::RoiSet.resource_format(), "RTSTRUCT");
    assert!(DataKind::Annotation.has_regions());
    assert!(!DataKind::QualityControl.has_regions());
    assert_eq!(DataKind::QualityControl.to_string(), "quality-control");
}

#[test]
fn accession_ids_are_trimmed_and_path_safe() {
    let id: AccessionId = "  ASSR_20260101_ab12cd34 ".parse().unwrap();
    assert_eq!(id.to_string(), "ASSR_20260101_ab12cd34");
    assert_matches!("ASSR/../x".parse::<AccessionId>(), Err(UploadError::Format(_)));
}

#[test]
fn unknown_kind_is_a_format_error() {
    assert_matches!("seg".parse::<DataKind>(), Err(UploadError::Format(_)));
}
