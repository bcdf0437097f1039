// One context must only be driven by one worker at a time.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::cache::BaseImageDecoder;
use crate::config::ThumbnailSettings;
use crate::derivative::{DerivativeParser, ParsedDerivative};
use crate::domain::{
    AccessionId, AmbiguousBinding, BindingChoice, ResolvedBinding, ResourceDescriptor,
    ResourcePayload,
};
use crate::error::{ErrorKind, UploadError};
use crate::metadata::{
    BuiltMetadata, Investigator, MetadataRequest, SubjectDemographics, builder_for,
};
use crate::repository::{Acknowledgement, RepositoryClient, WriteBody, paths};
use crate::resolver::{DependencyResolver, ensure_candidate, is_ambiguous};
use crate::thumbnail::ThumbnailRenderer;
use crate::worker::CancelToken;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum UploadState {
    Idle,
    Reading,
    Parsing,
    DependencyResolving,
    DemographicsFetch,
    InvestigatorFetch,
    Prepared,
    MetadataBuilding,
    MetadataUpload,
    ResourceHandleCreation,
    PayloadUpload,
    Done,
    Failed { kind: ErrorKind, message: String },
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadState::Failed { kind, .. } => write!(f, "Failed({kind:?})"),
            other => write!(f, "{other:?}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone)]
pub struct PreparedItem {
    pub parsed: ParsedDerivative,
    pub candidates: Vec<AmbiguousBinding>,
    pub binding: ResolvedBinding,
    pub demographics: SubjectDemographics,
    pub investigators: Vec<Investigator>,
}

impl PreparedItem {
    pub fn is_ambiguous(&self) -> bool {
        is_ambiguous(&self.candidates)
    }
}

#[derive(Debug)]
pub struct UploadContext {
    accession: Option<AccessionId>,
    state: UploadState,
    last_error: Option<(ErrorKind, String)>,
    prepared_file: Option<PathBuf>,
    prepared: Option<PreparedItem>,
    primary: Option<ResourceDescriptor>,
    auxiliary: Vec<ResourceDescriptor>,
    inputs: Vec<ResourceDescriptor>,
    metadata_committed: bool,
}

impl UploadContext {
    pub fn new() -> Self {
        Self {
            accession: None,
            state: UploadState::Idle,
            last_error: None,
            prepared_file: None,
            prepared: None,
            primary: None,
            auxiliary: Vec::new(),
            inputs: Vec::new(),
            metadata_committed: false,
        }
    }

    // Updates an existing record instead of creating one.
    pub fn with_accession(accession: AccessionId) -> Self {
        Self {
            accession: Some(accession),
            ..Self::new()
        }
    }

    pub fn accession(&self) -> Option<&AccessionId> {
        self.accession.as_ref()
    }

    pub fn state(&self) -> &UploadState {
        &self.state
    }

    pub fn last_error(&self) -> Option<(ErrorKind, &str)> {
        self.last_error
            .as_ref()
            .map(|(kind, message)| (*kind, message.as_str()))
    }

    pub fn prepared_file(&self) -> Option<&Path> {
        self.prepared_file.as_deref()
    }

    pub fn prepared(&self) -> Option<&PreparedItem> {
        self.prepared.as_ref()
    }

    pub fn primary_resource(&self) -> Option<&ResourceDescriptor> {
        self.primary.as_ref()
    }

    pub fn auxiliary_resources(&self) -> &[ResourceDescriptor] {
        &self.auxiliary
    }

    pub fn input_resources(&self) -> &[ResourceDescriptor] {
        &self.inputs
    }

    /// Stays true when a later payload write fails.
    pub fn metadata_committed(&self) -> bool {
        self.metadata_committed
    }

    fn fail(&mut self, err: UploadError) -> UploadError {
        let message = err.to_string();
        self.last_error = Some((err.kind(), message.clone()));
        self.state = UploadState::Failed {
            kind: err.kind(),
            message,
        };
        err
    }
}

impl Default for UploadContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PrepareOptions {
    pub choice: Option<BindingChoice>,
}

#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub label: Option<String>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadReceipt {
    pub accession: String,
    pub label: String,
    pub subject_id: String,
    pub experiment_id: String,
    pub resources: Vec<String>,
    pub thumbnails: usize,
}

pub struct UploadCoordinator<R: RepositoryClient> {
    repository: R,
    project: String,
    parser: Box<dyn DerivativeParser>,
    decoder: Option<Box<dyn BaseImageDecoder>>,
    thumbnails: ThumbnailSettings,
    cancel: CancelToken,
}

impl<R: RepositoryClient> UploadCoordinator<R> {
    pub fn new(repository: R, project: impl Into<String>, parser: Box<dyn DerivativeParser>) -> Self {
        Self {
            repository,
            project: project.into(),
            parser,
            decoder: None,
            thumbnails: ThumbnailSettings::default(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_thumbnails(
        mut self,
        decoder: Box<dyn BaseImageDecoder>,
        settings: ThumbnailSettings,
    ) -> Self {
        self.decoder = Some(decoder);
        self.thumbnails = settings;
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// Re-preparing the same file is a no-op unless a different binding is
    /// chosen; then only confirmation and the subject lookups run again.
    pub fn prepare(
        &self,
        ctx: &mut UploadContext,
        file: &Path,
        options: &PrepareOptions,
        sink: &dyn ProgressSink,
    ) -> Result<(), UploadError> {
        if ctx.state == UploadState::Prepared && ctx.prepared_file.as_deref() == Some(file) {
            let rebind = match (&options.choice, &ctx.prepared) {
                (Some(choice), Some(item)) => {
                    item.binding.subject_id != choice.subject_id
                        || item.binding.experiment_id != choice.experiment_id
                }
                _ => false,
            };
            if !rebind {
                return Ok(());
            }
            return match self.rebind(ctx, options, sink) {
                Ok(()) => Ok(()),
                // An unknown choice leaves the existing preparation usable.
                Err(err @ UploadError::PreconditionFailed(_)) => {
                    ctx.last_error = Some((err.kind(), err.to_string()));
                    Err(err)
                }
                Err(err) => Err(ctx.fail(err)),
            };
        }

        ctx.prepared = None;
        ctx.prepared_file = None;
        ctx.primary = None;
        ctx.auxiliary.clear();
        ctx.inputs.clear();
        ctx.metadata_committed = false;
        match self.run_prepare(ctx, file, options, sink) {
            Ok(item) => {
                ctx.prepared = Some(item);
                ctx.prepared_file = Some(file.to_path_buf());
                ctx.last_error = None;
                self.enter(ctx, UploadState::Prepared, sink, file.display());
                Ok(())
            }
            Err(err) => {
                warn!(file = %file.display(), state = %ctx.state, error = %err, "prepare failed");
                Err(ctx.fail(err))
            }
        }
    }

    fn run_prepare(
        &self,
        ctx: &mut UploadContext,
        file: &Path,
        options: &PrepareOptions,
        sink: &dyn ProgressSink,
    ) -> Result<PreparedItem, UploadError> {
        self.enter(ctx, UploadState::Reading, sink, file.display());
        self.cancel.check()?;
        let content = fs::read(file).map_err(|err| UploadError::io(file, err))?;

        self.enter(ctx, UploadState::Parsing, sink, format_args!("{} bytes", content.len()));
        self.cancel.check()?;
        let parsed = self.parser.parse(file, &content)?;

        self.enter(ctx, UploadState::DependencyResolving, sink, parsed.kind);
        self.cancel.check()?;
        let resolver = DependencyResolver::new(&self.repository, &self.project);
        let resolution = resolver.resolve(&parsed.dependencies, options.choice.as_ref())?;
        if let Some(advisory) = resolution.ambiguity() {
            info!(file = %file.display(), "{advisory}");
        }

        let (demographics, investigators) =
            self.fetch_subject_context(ctx, &resolution.binding, sink)?;

        Ok(PreparedItem {
            parsed,
            candidates: resolution.candidates,
            binding: resolution.binding,
            demographics,
            investigators,
        })
    }

    fn rebind(
        &self,
        ctx: &mut UploadContext,
        options: &PrepareOptions,
        sink: &dyn ProgressSink,
    ) -> Result<(), UploadError> {
        let Some(choice) = options.choice.as_ref() else {
            return Ok(());
        };
        let Some(mut item) = ctx.prepared.take() else {
            return Err(UploadError::PreconditionFailed(
                "no prepared file to rebind".to_string(),
            ));
        };
        if let Err(err) = ensure_candidate(&item.candidates, choice) {
            ctx.prepared = Some(item);
            return Err(err);
        }

        self.enter(ctx, UploadState::DependencyResolving, sink, "rebinding");
        self.cancel.check()?;
        let resolver = DependencyResolver::new(&self.repository, &self.project);
        item.binding = resolver.confirm(&item.parsed.dependencies, choice)?;
        let (demographics, investigators) = self.fetch_subject_context(ctx, &item.binding, sink)?;
        item.demographics = demographics;
        item.investigators = investigators;
        ctx.prepared = Some(item);
        self.enter(ctx, UploadState::Prepared, sink, "rebound");
        Ok(())
    }

    fn fetch_subject_context(
        &self,
        ctx: &mut UploadContext,
        binding: &ResolvedBinding,
        sink: &dyn ProgressSink,
    ) -> Result<(SubjectDemographics, Vec<Investigator>), UploadError> {
        self.enter(ctx, UploadState::DemographicsFetch, sink, &binding.subject_id);
        self.cancel.check()?;
        let subject = self
            .repository
            .query_document(&paths::subject(&self.project, &binding.subject_id))?;
        let demographics = SubjectDemographics::from_document(&subject)?;

        self.enter(ctx, UploadState::InvestigatorFetch, sink, &self.project);
        self.cancel.check()?;
        let project = self
            .repository
            .query_document(&paths::project(&self.project))?;
        let investigators = Investigator::list_from_project(&project);
        Ok((demographics, investigators))
    }

    pub fn upload(
        &self,
        ctx: &mut UploadContext,
        options: &UploadOptions,
        sink: &dyn ProgressSink,
    ) -> Result<UploadReceipt, UploadError> {
        if ctx.state != UploadState::Prepared {
            let err = UploadError::PreconditionFailed(format!(
                "upload requires a prepared file, context is {}",
                ctx.state
            ));
            ctx.last_error = Some((err.kind(), err.to_string()));
            return Err(err);
        }
        let accession = ctx
            .accession
            .get_or_insert_with(AccessionId::generate)
            .clone();

        match self.run_upload(ctx, &accession, options, sink) {
            Ok(receipt) => {
                self.enter(ctx, UploadState::Done, sink, &accession);
                Ok(receipt)
            }
            Err(err) => {
                if ctx.metadata_committed {
                    warn!(
                        accession = %accession,
                        error = %err,
                        "metadata record committed but payload upload failed; manual follow-up needed"
                    );
                } else {
                    warn!(accession = %accession, state = %ctx.state, error = %err, "upload failed");
                }
                Err(ctx.fail(err))
            }
        }
    }

    fn run_upload(
        &self,
        ctx: &mut UploadContext,
        accession: &AccessionId,
        options: &UploadOptions,
        sink: &dyn ProgressSink,
    ) -> Result<UploadReceipt, UploadError> {
        let item = ctx.prepared.clone().ok_or_else(|| {
            UploadError::PreconditionFailed("context has no prepared file".to_string())
        })?;
        let source = ctx.prepared_file.clone().ok_or_else(|| {
            UploadError::PreconditionFailed("context has no prepared file".to_string())
        })?;
        let label = options
            .label
            .clone()
            .or_else(|| item.parsed.label_hint.clone())
            .unwrap_or_else(|| format!("{}_{}", item.parsed.kind, accession));

        self.enter(ctx, UploadState::MetadataBuilding, sink, &label);
        self.cancel.check()?;
        let auxiliary = self.render_thumbnails(&item);
        let BuiltMetadata {
            document,
            primary,
            inputs,
        } = builder_for(item.parsed.kind).build(&MetadataRequest {
            project: &self.project,
            accession,
            label: &label,
            note: options.note.as_deref(),
            source: &source,
            parsed: &item.parsed,
            binding: &item.binding,
            demographics: &item.demographics,
            investigators: &item.investigators,
            auxiliary: &auxiliary,
        })?;
        ctx.primary = Some(primary.clone());
        ctx.auxiliary = auxiliary.clone();
        ctx.inputs = inputs;

        let assessor = paths::assessor(
            &self.project,
            &item.binding.subject_id,
            &item.binding.experiment_id,
            accession.as_str(),
        );

        self.enter(ctx, UploadState::MetadataUpload, sink, &assessor);
        self.cancel.check()?;
        let ack = self
            .repository
            .put(&paths::assessor_document(&assessor), WriteBody::Document(&document))
            .map_err(|err| rejected("metadata", err))?;
        check_ack(&ack, accession, "metadata", "record")?;
        ctx.metadata_committed = true;

        let descriptors: Vec<&ResourceDescriptor> =
            std::iter::once(&primary).chain(auxiliary.iter()).collect();

        self.enter(ctx, UploadState::ResourceHandleCreation, sink, descriptors.len());
        let mut created = BTreeSet::new();
        for descriptor in &descriptors {
            self.cancel.check()?;
            if !created.insert(descriptor.label.clone()) {
                continue;
            }
            let path = paths::assessor_resource(&assessor, &descriptor.label)
                .with_query("format", descriptor.format.as_str())
                .with_query("content", descriptor.content.as_str())
                .with_query("description", descriptor.description.as_str());
            self.repository
                .create_resource(&path)
                .map_err(|err| rejected("resource creation", err))?;
        }

        self.enter(ctx, UploadState::PayloadUpload, sink, descriptors.len());
        for descriptor in &descriptors {
            self.cancel.check()?;
            let path =
                paths::assessor_resource_file(&assessor, &descriptor.label, &descriptor.file_name);
            let ack = match &descriptor.payload {
                ResourcePayload::File(file) => self.repository.put(&path, WriteBody::File(file)),
                ResourcePayload::Document(document) => {
                    self.repository.put(&path, WriteBody::Document(document))
                }
                ResourcePayload::Bytes(data) => self.repository.put(
                    &path,
                    WriteBody::Bytes {
                        data,
                        content_type: "application/octet-stream",
                    },
                ),
                ResourcePayload::Reference(remote) => {
                    return Err(UploadError::PreconditionFailed(format!(
                        "{remote} is an input resource and cannot be written"
                    )));
                }
            }
            .map_err(|err| rejected("payload", err))?;
            check_ack(&ack, accession, "payload", &descriptor.file_name)?;
        }

        Ok(UploadReceipt {
            accession: accession.to_string(),
            label,
            subject_id: item.binding.subject_id.clone(),
            experiment_id: item.binding.experiment_id.clone(),
            resources: created.into_iter().collect(),
            thumbnails: auxiliary.len(),
        })
    }

    fn render_thumbnails(&self, item: &PreparedItem) -> Vec<ResourceDescriptor> {
        if !self.thumbnails.enabled || !item.parsed.kind.has_regions() || item.parsed.contours.is_empty()
        {
            return Vec::new();
        }
        let Some(decoder) = self.decoder.as_deref() else {
            info!("no base image decoder configured; thumbnails skipped");
            return Vec::new();
        };
        ThumbnailRenderer::new(&self.repository, decoder, &self.project, self.thumbnails.coordinates)
            .render(&item.parsed, &item.binding)
    }

    fn enter(
        &self,
        ctx: &mut UploadContext,
        state: UploadState,
        sink: &dyn ProgressSink,
        detail: impl fmt::Display,
    ) {
        info!(state = %state, "{detail}");
        sink.event(ProgressEvent {
            message: format!("phase={state}; {detail}"),
            elapsed: None,
        });
        ctx.state = state;
    }
}

fn rejected(step: &str, err: UploadError) -> UploadError {
    match err {
        UploadError::RepositoryStatus { status, message } => UploadError::RemoteRejected {
            step: step.to_string(),
            message: format!("status {status}: {message}"),
        },
        other => other,
    }
}

// Every write must echo the accession back; anything else is a rejection.
fn check_ack(
    ack: &Acknowledgement,
    accession: &AccessionId,
    step: &str,
    target: &str,
) -> Result<(), UploadError> {
    if ack.is_error_marker() || !ack.echoes(accession.as_str()) {
        return Err(UploadError::RemoteRejected {
            step: step.to_string(),
            message: format!("{target}: unexpected acknowledgement: {}", ack.as_str()),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acknowledgements_must_echo_the_accession() {
        let accession: AccessionId = "ASSR_1".parse().unwrap();
        assert!(check_ack(&Acknowledgement("ASSR_1\n".to_string()), &accession, "payload", "a").is_ok());
        for ack in ["", "QUOTA_EXCEEDED: file discarded", "ASSR_2", "Error: ASSR_1"] {
            let err = check_ack(&Acknowledgement(ack.to_string()), &accession, "payload", "a").unwrap_err();
            assert_eq!(err.kind(), ErrorKind::RemoteRejected, "{ack}");
        }
    }

    #[test]
    fn state_display() {
        assert_eq!(UploadState::Prepared.to_string(), "Prepared");
        let failed = UploadState::Failed {
            kind: ErrorKind::RemoteRejected,
            message: "no".to_string(),
        };
        assert_eq!(failed.to_string(), "Failed(RemoteRejected)");
    }

    #[test]
    fn status_errors_on_writes_become_rejections() {
        let err = rejected(
            "metadata",
            UploadError::RepositoryStatus {
                status: 409,
                message: "conflict".to_string(),
            },
        );
        assert_eq!(err.kind(), ErrorKind::RemoteRejected);
    }
}
