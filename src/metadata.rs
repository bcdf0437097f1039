use std::path::Path;

use serde::Serialize;
use serde_json::{Value, json};

use crate::derivative::ParsedDerivative;
use crate::domain::{
    AccessionId, DataKind, Direction, MetadataDocument, ResolvedBinding, ResourceDescriptor,
    ResourcePayload,
};
use crate::error::UploadError;
use crate::repository::paths;

pub const METADATA_CONTENT_TYPE: &str = "application/json";
const INPUT_LABEL: &str = "DICOM";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubjectDemographics {
    pub label: Option<String>,
    pub gender: Option<String>,
    pub date_of_birth: Option<String>,
    pub handedness: Option<String>,
}

impl SubjectDemographics {
    // {"items": [{"data_fields": {...}, "children": [{"field": "demographics", ...}]}]}
    pub fn from_document(document: &Value) -> Result<Self, UploadError> {
        let item = first_item(document)
            .ok_or_else(|| UploadError::Format("subject document has no items".to_string()))?;
        let label = text_field(item.get("data_fields"), "label");
        let demographics = children(item, "demographics")
            .and_then(|items| items.first())
            .and_then(|child| child.get("data_fields"));
        Ok(Self {
            label,
            gender: text_field(demographics, "gender"),
            date_of_birth: text_field(demographics, "dob"),
            handedness: text_field(demographics, "handedness"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Investigator {
    pub first_name: String,
    pub last_name: String,
}

impl Investigator {
    // PI first
    pub fn list_from_project(document: &Value) -> Vec<Investigator> {
        let Some(item) = first_item(document) else {
            return Vec::new();
        };
        ["PI", "investigators/investigator"]
            .iter()
            .filter_map(|field| children(item, field))
            .flatten()
            .filter_map(|child| {
                let fields = child.get("data_fields");
                let last_name = text_field(fields, "lastname")?;
                Some(Investigator {
                    first_name: text_field(fields, "firstname").unwrap_or_default(),
                    last_name,
                })
            })
            .collect()
    }
}

fn first_item(document: &Value) -> Option<&Value> {
    document
        .get("items")
        .and_then(|items| items.as_array())
        .and_then(|items| items.first())
}

fn children<'a>(item: &'a Value, field: &str) -> Option<&'a Vec<Value>> {
    item.get("children")
        .and_then(|children| children.as_array())?
        .iter()
        .find(|child| child.get("field").and_then(|f| f.as_str()) == Some(field))
        .and_then(|child| child.get("items"))
        .and_then(|items| items.as_array())
}

fn text_field(fields: Option<&Value>, name: &str) -> Option<String> {
    fields
        .and_then(|fields| fields.get(name))
        .and_then(|value| value.as_str())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub struct MetadataRequest<'a> {
    pub project: &'a str,
    pub accession: &'a AccessionId,
    pub label: &'a str,
    pub note: Option<&'a str>,
    pub source: &'a Path,
    pub parsed: &'a ParsedDerivative,
    pub binding: &'a ResolvedBinding,
    pub demographics: &'a SubjectDemographics,
    pub investigators: &'a [Investigator],
    pub auxiliary: &'a [ResourceDescriptor],
}

#[derive(Debug, Clone)]
pub struct BuiltMetadata {
    pub document: MetadataDocument,
    pub primary: ResourceDescriptor,
    pub inputs: Vec<ResourceDescriptor>,
}

pub trait MetadataBuilder: Send + Sync {
    fn kind(&self) -> DataKind;
    fn build(&self, request: &MetadataRequest<'_>) -> Result<BuiltMetadata, UploadError>;
}

pub fn builder_for(kind: DataKind) -> Box<dyn MetadataBuilder> {
    match kind {
        DataKind::RoiSet => Box::new(RoiSetMetadata),
        DataKind::Annotation => Box::new(AnnotationMetadata),
        DataKind::QualityControl => Box::new(QualityControlMetadata),
    }
}

pub struct RoiSetMetadata;

impl MetadataBuilder for RoiSetMetadata {
    fn kind(&self) -> DataKind {
        DataKind::RoiSet
    }

    fn build(&self, request: &MetadataRequest<'_>) -> Result<BuiltMetadata, UploadError> {
        let mut draft = Draft::new(self.kind(), request)?;
        draft.document["structureSet"] = json!({
            "frameOfReferenceUid": request.parsed.frame_of_reference_uid,
            "roiCount": request.parsed.regions.len(),
            "rois": request.parsed.regions,
        });
        draft.finish()
    }
}

pub struct AnnotationMetadata;

impl MetadataBuilder for AnnotationMetadata {
    fn kind(&self) -> DataKind {
        DataKind::Annotation
    }

    fn build(&self, request: &MetadataRequest<'_>) -> Result<BuiltMetadata, UploadError> {
        let mut draft = Draft::new(self.kind(), request)?;
        draft.document["annotations"] = json!({
            "count": request.parsed.contours.len(),
            "regions": request.parsed.regions,
        });
        draft.finish()
    }
}

pub struct QualityControlMetadata;

impl MetadataBuilder for QualityControlMetadata {
    fn kind(&self) -> DataKind {
        DataKind::QualityControl
    }

    fn build(&self, request: &MetadataRequest<'_>) -> Result<BuiltMetadata, UploadError> {
        let mut draft = Draft::new(self.kind(), request)?;
        draft.document["qc"] = json!({
            "scansAssessed": request.binding.scan_ids,
        });
        draft.finish()
    }
}

struct Draft {
    document: Value,
    primary: ResourceDescriptor,
    inputs: Vec<ResourceDescriptor>,
}

impl Draft {
    fn new(kind: DataKind, request: &MetadataRequest<'_>) -> Result<Self, UploadError> {
        let primary = primary_resource(kind, request)?;
        let inputs = input_resources(request.project, request.binding);
        let document = base_document(kind, request, &primary, &inputs);
        Ok(Self {
            document,
            primary,
            inputs,
        })
    }

    fn finish(self) -> Result<BuiltMetadata, UploadError> {
        let body = serde_json::to_vec_pretty(&self.document)
            .map_err(|err| UploadError::Format(format!("metadata serialization: {err}")))?;
        Ok(BuiltMetadata {
            document: MetadataDocument {
                content_type: METADATA_CONTENT_TYPE.to_string(),
                body,
            },
            primary: self.primary,
            inputs: self.inputs,
        })
    }
}

fn base_document(
    kind: DataKind,
    request: &MetadataRequest<'_>,
    primary: &ResourceDescriptor,
    inputs: &[ResourceDescriptor],
) -> Value {
    let binding = request.binding;
    let parsed = request.parsed;
    let catalog: Vec<Value> = inputs
        .iter()
        .chain(std::iter::once(primary))
        .chain(request.auxiliary)
        .map(catalog_entry)
        .collect();
    json!({
        "id": request.accession.as_str(),
        "label": request.label,
        "project": request.project,
        "kind": kind.to_string(),
        "date": chrono::Utc::now().to_rfc3339(),
        "note": request.note,
        "description": parsed.description,
        "subject": {
            "id": binding.subject_id,
            "label": request.demographics.label,
            "gender": request.demographics.gender,
            "dob": request.demographics.date_of_birth,
            "handedness": request.demographics.handedness,
        },
        "imageSession": binding.experiment_id,
        "investigators": request.investigators,
        "patient": {
            "id": parsed.patient.id,
            "name": parsed.patient.name,
        },
        "references": {
            "studyUids": parsed.dependencies.study_uids,
            "seriesUids": parsed.dependencies.series_uids,
            "scans": binding.scan_ids,
            "files": binding.file_to_instance_uid,
        },
        "catalog": catalog,
        "tool": format!("assessor-up/{}", env!("CARGO_PKG_VERSION")),
    })
}

fn catalog_entry(descriptor: &ResourceDescriptor) -> Value {
    json!({
        "label": descriptor.label,
        "format": descriptor.format,
        "content": descriptor.content,
        "direction": descriptor.direction,
        "file": descriptor.file_name,
        "description": descriptor.description,
    })
}

fn primary_resource(
    kind: DataKind,
    request: &MetadataRequest<'_>,
) -> Result<ResourceDescriptor, UploadError> {
    let file_name = request
        .source
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| {
            UploadError::Format(format!("{} has no file name", request.source.display()))
        })?;
    Ok(ResourceDescriptor {
        payload: ResourcePayload::File(request.source.to_path_buf()),
        label: kind.resource_format().to_string(),
        format: kind.resource_format().to_string(),
        content: format!("{}_SOURCE", kind.resource_format()),
        description: format!("{kind} source file"),
        direction: Direction::Out,
        file_name,
    })
}

/// Scan files the derivative was computed from. Cataloged, never written.
pub fn input_resources(project: &str, binding: &ResolvedBinding) -> Vec<ResourceDescriptor> {
    binding
        .file_to_scan
        .iter()
        .map(|(file_name, scan)| ResourceDescriptor {
            payload: ResourcePayload::Reference(
                paths::scan_file(project, &binding.experiment_id, scan, file_name).to_string(),
            ),
            label: INPUT_LABEL.to_string(),
            format: INPUT_LABEL.to_string(),
            content: "RAW".to_string(),
            description: format!("scan {scan}"),
            direction: Direction::In,
            file_name: file_name.clone(),
        })
        .collect()
}
