use std::collections::BTreeSet;
use std::path::Path;

use serde::Deserialize;

use crate::domain::{DataKind, DependencySet, validate_uid};
use crate::error::UploadError;

#[derive(Debug, Clone, PartialEq)]
pub struct Contour {
    pub region: String,
    pub referenced_sop_instance_uid: String,
    pub colour: [u8; 3],
    pub points: Vec<[f64; 3]>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatientIdentity {
    pub id: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDerivative {
    pub kind: DataKind,
    pub dependencies: DependencySet,
    pub regions: Vec<String>,
    pub contours: Vec<Contour>,
    pub frame_of_reference_uid: Option<String>,
    pub patient: PatientIdentity,
    pub label_hint: Option<String>,
    pub description: Option<String>,
}

pub trait DerivativeParser: Send + Sync {
    fn parse(&self, path: &Path, content: &[u8]) -> Result<ParsedDerivative, UploadError>;
}

#[derive(Debug, Deserialize)]
struct Manifest {
    kind: DataKind,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    patient: Option<ManifestPatient>,
    #[serde(default)]
    frame_of_reference_uid: Option<String>,
    studies: Vec<ManifestStudy>,
    #[serde(default)]
    regions: Vec<ManifestRegion>,
}

#[derive(Debug, Deserialize)]
struct ManifestPatient {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ManifestStudy {
    uid: String,
    #[serde(default)]
    series: Vec<ManifestSeries>,
}

#[derive(Debug, Deserialize)]
struct ManifestSeries {
    uid: String,
    #[serde(default)]
    instances: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ManifestRegion {
    name: String,
    #[serde(default = "default_colour")]
    colour: [u8; 3],
    #[serde(default)]
    contours: Vec<ManifestContour>,
}

#[derive(Debug, Deserialize)]
struct ManifestContour {
    image: String,
    points: Vec<[f64; 3]>,
}

fn default_colour() -> [u8; 3] {
    [255, 0, 0]
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestParser;

impl DerivativeParser for ManifestParser {
    fn parse(&self, path: &Path, content: &[u8]) -> Result<ParsedDerivative, UploadError> {
        let manifest: Manifest = serde_json::from_slice(content)
            .map_err(|err| UploadError::Format(format!("{}: {err}", path.display())))?;

        if manifest.studies.is_empty() {
            return Err(UploadError::Format(format!(
                "{}: no referenced studies",
                path.display()
            )));
        }

        let mut dependencies = DependencySet::default();
        for study in &manifest.studies {
            dependencies
                .study_uids
                .insert(validate_uid(&study.uid)?.to_string());
            for series in &study.series {
                dependencies
                    .series_uids
                    .insert(validate_uid(&series.uid)?.to_string());
                for instance in &series.instances {
                    dependencies
                        .sop_instance_uids
                        .insert(validate_uid(instance)?.to_string());
                }
            }
        }

        let frame_of_reference_uid = manifest
            .frame_of_reference_uid
            .as_deref()
            .map(validate_uid)
            .transpose()?
            .map(str::to_string);

        let mut regions = Vec::with_capacity(manifest.regions.len());
        let mut contours = Vec::new();
        let mut seen = BTreeSet::new();
        for region in manifest.regions {
            if !seen.insert(region.name.clone()) {
                return Err(UploadError::Format(format!(
                    "{}: duplicate region name {}",
                    path.display(),
                    region.name
                )));
            }
            for contour in region.contours {
                let image = validate_uid(&contour.image)?.to_string();
                if !dependencies.sop_instance_uids.contains(&image) {
                    return Err(UploadError::Format(format!(
                        "{}: region {} is drawn on unreferenced image {image}",
                        path.display(),
                        region.name
                    )));
                }
                contours.push(Contour {
                    region: region.name.clone(),
                    referenced_sop_instance_uid: image,
                    colour: region.colour,
                    points: contour.points,
                });
            }
            regions.push(region.name);
        }

        let patient = manifest
            .patient
            .map(|patient| PatientIdentity {
                id: patient.id,
                name: patient.name,
            })
            .unwrap_or_default();

        Ok(ParsedDerivative {
            kind: manifest.kind,
            dependencies,
            regions,
            contours,
            frame_of_reference_uid,
            patient,
            label_hint: manifest.label.filter(|label| !label.trim().is_empty()),
            description: manifest.description,
        })
    }
}
